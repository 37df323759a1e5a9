//! Transfer emission for the high-overhead transports
//!
//! Every transfer carries a trailing CRC-32C over the application payload. A transfer fits in a
//! single frame when the payload plus the 4-byte CRC fit in one frame payload; otherwise the
//! payload-plus-CRC byte stream is cut at frame-payload boundaries.

use cygnet_core::crc::{TRANSFER_CRC32_SIZE, TransferCrc32};
use cygnet_core::transfer::payload_length;

/// Split a fragmented payload into ordered frames
///
/// `frame_factory` receives `(index, end_of_transfer, frame_payload)` for each produced frame.
/// `max_frame_payload` is the frame payload capacity of the transport (MTU), which must exceed the
/// CRC size.
pub fn serialize_transfer<T>(
    fragmented_payload: &[Vec<u8>],
    max_frame_payload: usize,
    mut frame_factory: impl FnMut(u32, bool, Vec<u8>) -> T,
) -> Vec<T> {
    debug_assert!(max_frame_payload > TRANSFER_CRC32_SIZE);
    let payload_len = payload_length(fragmented_payload);
    let crc_bytes = TransferCrc32::of_fragments(fragmented_payload).to_le_bytes();

    if payload_len + TRANSFER_CRC32_SIZE <= max_frame_payload {
        // Single-frame transfer: payload and CRC share the one frame
        let mut payload = Vec::with_capacity(payload_len + TRANSFER_CRC32_SIZE);
        for fragment in fragmented_payload {
            payload.extend_from_slice(fragment);
        }
        payload.extend_from_slice(&crc_bytes);
        return vec![frame_factory(0, true, payload)];
    }

    // Multi-frame transfer: refragment (payload || CRC) at MTU boundaries
    let total = payload_len + TRANSFER_CRC32_SIZE;
    let frame_count = total.div_ceil(max_frame_payload);
    let mut frame_payloads: Vec<Vec<u8>> = Vec::with_capacity(frame_count);
    let mut current = Vec::with_capacity(max_frame_payload);
    let chunks = fragmented_payload
        .iter()
        .map(Vec::as_slice)
        .chain(std::iter::once(&crc_bytes[..]));
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
    debug_assert_eq!(frame_payloads.len(), frame_count);

    let last = frame_payloads.len() - 1;
    frame_payloads
        .into_iter()
        .enumerate()
        .map(|(index, payload)| frame_factory(index as u32, index == last, payload))
        .collect()
}
