//! Transfer emission for Cyphal/CAN
//!
//! Single-frame transfers carry no transfer CRC; the padding (if any) brings the data field up to
//! a DLC-representable length. Multi-frame transfers append padding and a CRC-16/CCITT-FALSE so
//! that the last frame also lands on a valid DLC; the padding sits inside the CRC scope.

use cygnet_core::crc::TransferCrc16;
use cygnet_core::transfer::payload_length;

use crate::frame::{CyphalFrame, TRANSFER_CRC_LENGTH};

const PADDING_BYTE: u8 = 0x00;

/// Split a fragmented payload into ordered CAN frames
///
/// `transfer_id` is already reduced modulo 32; `max_frame_payload` is the frame data capacity
/// minus the tail byte (7 for classic CAN, 63 for CAN FD).
pub fn serialize_transfer(
    compiled_identifier: u32,
    transfer_id: u8,
    fragmented_payload: &[Vec<u8>],
    max_frame_payload: usize,
) -> Vec<CyphalFrame> {
    debug_assert!(max_frame_payload >= 7);
    let payload_len = payload_length(fragmented_payload);

    if payload_len <= max_frame_payload {
        // Single-frame transfer
        let padding = CyphalFrame::required_padding(payload_len);
        let mut payload = Vec::with_capacity(payload_len + padding);
        for fragment in fragmented_payload {
            payload.extend_from_slice(fragment);
        }
        payload.resize(payload_len + padding, PADDING_BYTE);
        return vec![CyphalFrame {
            identifier: compiled_identifier,
            padded_payload: payload,
            transfer_id,
            start_of_transfer: true,
            end_of_transfer: true,
            toggle_bit: true,
        }];
    }

    // Multi-frame transfer. Pad so that the last frame (payload tail plus the CRC) lands on a
    // valid DLC; when the CRC would not fit the trailing space it spills into one more frame and
    // no padding is needed.
    let last_frame_payload_length = payload_len % max_frame_payload;
    let padding = if last_frame_payload_length + TRANSFER_CRC_LENGTH >= max_frame_payload {
        0
    } else {
        CyphalFrame::required_padding(last_frame_payload_length + TRANSFER_CRC_LENGTH)
    };

    let mut crc = TransferCrc16::new();
    for fragment in fragmented_payload {
        crc.add(fragment);
    }
    let padding_bytes = vec![PADDING_BYTE; padding];
    crc.add(&padding_bytes);
    let mut trailer = padding_bytes;
    trailer.extend_from_slice(&crc.value_as_bytes());

    let total = payload_len + trailer.len();
    let frame_count = total.div_ceil(max_frame_payload);
    let mut frame_payloads: Vec<Vec<u8>> = Vec::with_capacity(frame_count);
    let mut current = Vec::with_capacity(max_frame_payload);
    let chunks = fragmented_payload
        .iter()
        .map(Vec::as_slice)
        .chain(std::iter::once(trailer.as_slice()));
    for chunk in chunks {
        let mut rest = chunk;
        while !rest.is_empty() {
            let take = (max_frame_payload - current.len()).min(rest.len());
            current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if current.len() == max_frame_payload {
                let full = std::mem::replace(&mut current, Vec::with_capacity(max_frame_payload));
                frame_payloads.push(full);
            }
        }
    }
    if !current.is_empty() {
        frame_payloads.push(current);
    }

    let last = frame_payloads.len() - 1;
    frame_payloads
        .into_iter()
        .enumerate()
        .map(|(index, padded_payload)| CyphalFrame {
            identifier: compiled_identifier,
            padded_payload,
            transfer_id,
            start_of_transfer: index == 0,
            end_of_transfer: index == last,
            toggle_bit: index % 2 == 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::media::{DataFrame, FrameFormat};

    fn mkf(
        identifier: u32,
        data: &[u8],
        transfer_id: u8,
        start_of_transfer: bool,
        end_of_transfer: bool,
        toggle_bit: bool,
    ) -> DataFrame {
        let mut tail = transfer_id;
        if start_of_transfer {
            tail |= 1 << 7;
        }
        if end_of_transfer {
            tail |= 1 << 6;
        }
        if toggle_bit {
            tail |= 1 << 5;
        }
        let mut bytes = data.to_vec();
        bytes.push(tail);
        DataFrame {
            format: FrameFormat::Extended,
            identifier,
            data: bytes,
        }
    }

    fn run(
        identifier: u32,
        transfer_id: u64,
        fragments: &[&[u8]],
        max_frame_payload: usize,
    ) -> Vec<DataFrame> {
        let fragments: Vec<Vec<u8>> = fragments.iter().map(|f| f.to_vec()).collect();
        serialize_transfer(
            identifier,
            (transfer_id % 32) as u8,
            &fragments,
            max_frame_payload,
        )
        .iter()
        .map(CyphalFrame::compile)
        .collect()
    }

    #[test]
    fn test_single_frame_classic() {
        assert_eq!(
            run(0xBADC0FE, 32, &[b"Hell", b"o"], 7),
            vec![mkf(0xBADC0FE, b"Hello", 0, true, true, true)]
        );
    }

    #[test]
    fn test_single_frame_fd_padding() {
        // 60 payload bytes over CAN FD: padded up to the 64-byte DLC (63 + tail)
        let payload: Vec<u8> = (0..60).collect();
        let mut padded = payload.clone();
        padded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(
            run(0xBADC0FE, 32 + 19, &[&payload], 63),
            vec![mkf(0xBADC0FE, &padded, 19, true, true, true)]
        );
    }

    #[test]
    fn test_multi_frame_classic() {
        // 30-byte payload over classic CAN: five frames, alternating toggle, CRC 0x3554 in the
        // last frame
        let payload: Vec<u8> = (0..0x1E).collect();
        assert_eq!(TransferCrc16::of(&payload), 0x3554);
        assert_eq!(
            run(0xBADC0FE, 323219, &[&payload], 7),
            vec![
                mkf(0xBADC0FE, &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 19, true, false, true),
                mkf(0xBADC0FE, &[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D], 19, false, false, false),
                mkf(0xBADC0FE, &[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14], 19, false, false, true),
                mkf(0xBADC0FE, &[0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B], 19, false, false, false),
                mkf(0xBADC0FE, &[0x1C, 0x1D, 0x35, 0x54], 19, false, true, true),
            ]
        );
    }

    #[test]
    fn test_multi_frame_crc_spill() {
        // 29-byte payload, 15-byte frames: the CRC does not fit after the last payload byte and
        // spills into a third frame
        let payload: Vec<u8> = (0..0x1D).collect();
        assert_eq!(TransferCrc16::of(&payload), 0xC46F);
        assert_eq!(
            run(123456, 32323219, &[&payload], 15),
            vec![
                mkf(
                    123456,
                    &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E],
                    19,
                    true,
                    false,
                    true
                ),
                mkf(
                    123456,
                    &[0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0xC4],
                    19,
                    false,
                    false,
                    false
                ),
                mkf(123456, &[0x6F], 19, false, true, true),
            ]
        );
    }

    #[test]
    fn test_multi_frame_fd_padding_inside_crc() {
        // 30-byte payload, 11-byte frames: the last frame carries 8 payload bytes; one padding
        // byte aligns payload + padding + CRC + tail onto the 12-byte DLC, and the padding is
        // covered by the CRC
        let payload: Vec<u8> = (0..0x1E).collect();
        let mut padded = payload.clone();
        padded.push(0x00);
        assert_eq!(TransferCrc16::of(&padded), 0x32F6);
        assert_eq!(
            run(123456, 32323219, &[&payload], 11),
            vec![
                mkf(123456, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0A], 19, true, false, true),
                mkf(
                    123456,
                    &[0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15],
                    19,
                    false,
                    false,
                    false
                ),
                mkf(
                    123456,
                    &[0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x00, 0x32, 0xF6],
                    19,
                    false,
                    true,
                    true
                ),
            ]
        );
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(
            run(0xBADC0FE, 0, &[], 7),
            vec![mkf(0xBADC0FE, b"", 0, true, true, true)]
        );
    }
}
