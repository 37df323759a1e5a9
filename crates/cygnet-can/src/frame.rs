//! The Cyphal view of a CAN frame: data field plus the trailing tail byte
//!
//! Tail byte layout: bit 7 = start-of-transfer, bit 6 = end-of-transfer, bit 5 = toggle,
//! bits 4..0 = transfer-ID modulo 32. A single-frame transfer carries
//! start = end = toggle = 1.

use crate::media::{DataFrame, FrameFormat, round_up_data_length};

/// CAN transfer-IDs live modulo 32
pub const TRANSFER_ID_MODULO: u8 = 32;

/// Bytes of transfer CRC appended to multi-frame transfers
pub const TRANSFER_CRC_LENGTH: usize = 2;

const SOF_BIT: u8 = 1 << 7;
const EOT_BIT: u8 = 1 << 6;
const TOGGLE_BIT: u8 = 1 << 5;
const TRANSFER_ID_MASK: u8 = TRANSFER_ID_MODULO - 1;

/// A parsed Cyphal/CAN frame
///
/// `padded_payload` is everything before the tail byte, including any DLC padding; the padding is
/// indistinguishable from payload at this layer and is covered by the transfer CRC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CyphalFrame {
    pub identifier: u32,
    pub padded_payload: Vec<u8>,
    /// Transfer-ID modulo 32
    pub transfer_id: u8,
    pub start_of_transfer: bool,
    pub end_of_transfer: bool,
    pub toggle_bit: bool,
}

impl CyphalFrame {
    /// Extract the Cyphal framing from a raw CAN frame; `None` if the frame cannot carry Cyphal
    /// (wrong format or no room for a tail byte)
    #[must_use]
    pub fn parse(frame: &DataFrame) -> Option<CyphalFrame> {
        if frame.format != FrameFormat::Extended {
            return None;
        }
        let (payload, tail) = frame.data.split_last_chunk::<1>()?;
        let tail = tail[0];
        let start_of_transfer = tail & SOF_BIT != 0;
        let end_of_transfer = tail & EOT_BIT != 0;
        let toggle_bit = tail & TOGGLE_BIT != 0;
        // A single-frame transfer must carry the toggle set; anything else is not Cyphal v1
        if start_of_transfer && end_of_transfer && !toggle_bit {
            return None;
        }
        Some(CyphalFrame {
            identifier: frame.identifier,
            padded_payload: payload.to_vec(),
            transfer_id: tail & TRANSFER_ID_MASK,
            start_of_transfer,
            end_of_transfer,
            toggle_bit,
        })
    }

    /// Append the tail byte and produce the raw frame
    #[must_use]
    pub fn compile(&self) -> DataFrame {
        let mut tail = self.transfer_id & TRANSFER_ID_MASK;
        if self.start_of_transfer {
            tail |= SOF_BIT;
        }
        if self.end_of_transfer {
            tail |= EOT_BIT;
        }
        if self.toggle_bit {
            tail |= TOGGLE_BIT;
        }
        let mut data = Vec::with_capacity(self.padded_payload.len() + 1);
        data.extend_from_slice(&self.padded_payload);
        data.push(tail);
        debug_assert!(round_up_data_length(data.len()) == Some(data.len()));
        DataFrame {
            format: FrameFormat::Extended,
            identifier: self.identifier,
            data,
        }
    }

    /// Zero bytes required after `payload_length` payload bytes so that payload + padding + tail
    /// byte land on a DLC-representable length
    #[must_use]
    pub fn required_padding(payload_length: usize) -> usize {
        let data_length = payload_length + 1;
        round_up_data_length(data_length)
            .map(|rounded| rounded - data_length)
            .unwrap_or(0)
    }
}

/// Distance from `from` forward to `to` in the cyclic transfer-ID space
#[inline]
#[must_use]
pub fn transfer_id_forward_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & TRANSFER_ID_MASK
}
