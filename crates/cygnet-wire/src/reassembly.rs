//! Out-of-order-tolerant transfer reassembly for the high-overhead transports
//!
//! Frames may arrive in any order: redundant interfaces, temporal transfer redundancy, and
//! ordinary IP networks all reorder traffic. The state machine keeps one payload slot per frame
//! index and finalizes the transfer once every index up to the end-of-transfer index is populated.
//!
//! A multi-frame transfer must not contain frames with empty payload.

use std::time::Duration;

use cygnet_core::crc::{TRANSFER_CRC32_SIZE, TransferCrc32};
use cygnet_core::transfer::payload_length;
use cygnet_core::{Timestamp, TransferFrom};

use crate::header::WireFrame;

/// Reassembly error states, reported to the statistics sink and otherwise not actionable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReassemblyError {
    /// The transfer payload failed its integrity check; transfer discarded
    Integrity,
    /// The frame's transfer-ID is older than the anticipated one
    UnexpectedTransferId,
    /// A new transfer started before the old one was complete; old transfer discarded
    MultiframeMissingFrames,
    /// A frame without payload inside a multi-frame transfer
    MultiframeEmptyFrame,
    /// A frame index beyond the established end-of-transfer index; transfer discarded
    MultiframeEotMisplaced,
    /// End-of-transfer flagged at two different indices; transfer discarded
    MultiframeEotInconsistent,
}

impl ReassemblyError {
    pub const ALL: [ReassemblyError; 6] = [
        ReassemblyError::Integrity,
        ReassemblyError::UnexpectedTransferId,
        ReassemblyError::MultiframeMissingFrames,
        ReassemblyError::MultiframeEmptyFrame,
        ReassemblyError::MultiframeEotMisplaced,
        ReassemblyError::MultiframeEotInconsistent,
    ];
}

/// Per-source reassembly state machine
///
/// The extent is kept for diagnostics but the reassembled payload is not truncated to it; the
/// session contract makes no promise either way and downstream consumers ignore the excess.
pub struct TransferReassembler {
    source_node_id: u16,
    extent_bytes: usize,
    payloads: Vec<Vec<u8>>,
    max_index: Option<u32>,
    ts: Timestamp,
    transfer_id: u64,
}

impl TransferReassembler {
    pub fn new(source_node_id: u16, extent_bytes: usize) -> Self {
        Self {
            source_node_id,
            extent_bytes,
            payloads: Vec::new(),
            max_index: None,
            ts: Timestamp::default(),
            transfer_id: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn source_node_id(&self) -> u16 {
        self.source_node_id
    }

    #[inline]
    #[must_use]
    pub fn extent_bytes(&self) -> usize {
        self.extent_bytes
    }

    /// Feed one frame into the state machine
    ///
    /// Returns the completed transfer when this frame finished one. Errors are reported through
    /// `on_error`; a single frame can report an error (for the transfer it destroyed) and still
    /// advance the state machine.
    pub fn process_frame(
        &mut self,
        timestamp: Timestamp,
        frame: WireFrame,
        transfer_id_timeout: Duration,
        on_error: &mut dyn FnMut(ReassemblyError),
    ) -> Option<TransferFrom> {
        // A multi-frame transfer cannot contain frames with no payload
        if !frame.single_frame_transfer() && frame.payload.is_empty() {
            on_error(ReassemblyError::MultiframeEmptyFrame);
            return None;
        }

        // Detect new transfers: either a future transfer-ID, or an index-0 frame of a different
        // transfer after the transfer-ID timeout. Restarting on non-start frames would be
        // pointless since the first frame is then already lost; out-of-order first frames are
        // covered by the future-TID condition.
        let is_future_transfer_id = frame.transfer_id > self.transfer_id;
        let is_tid_timeout = frame.index == 0
            && frame.transfer_id != self.transfer_id
            && timestamp.monotonic_since(self.ts) > transfer_id_timeout;
        if is_future_transfer_id || is_tid_timeout {
            let error = (!self.payloads.is_empty()).then_some(ReassemblyError::MultiframeMissingFrames);
            self.restart(frame.transfer_id, error, on_error);
        }
        if frame.transfer_id != self.transfer_id {
            on_error(ReassemblyError::UnexpectedTransferId);
            return None;
        }

        // Establish the max frame index; two EOT frames at different indices are inconsistent
        if frame.end_of_transfer {
            if let Some(max_index) = self.max_index
                && max_index != frame.index
            {
                self.restart(
                    frame.transfer_id.wrapping_add(1),
                    Some(ReassemblyError::MultiframeEotInconsistent),
                    on_error,
                );
                return None;
            }
            self.max_index = Some(frame.index);
        }

        // Frames past the established end of transfer invalidate the whole transfer
        if let Some(max_index) = self.max_index {
            let highest_stored = self.payloads.len().saturating_sub(1) as u32;
            if frame.index.max(highest_stored) > max_index {
                self.restart(
                    frame.transfer_id.wrapping_add(1),
                    Some(ReassemblyError::MultiframeEotMisplaced),
                    on_error,
                );
                return None;
            }
        }

        // The transfer timestamp is the timestamp of the frame at index 0
        if frame.index == 0 {
            self.ts = timestamp;
        }

        // Store the payload; duplicates overwrite their slot with identical content
        let slot = frame.index as usize;
        while self.payloads.len() <= slot {
            self.payloads.push(Vec::new());
        }
        self.payloads[slot] = frame.payload;

        // Complete only when the EOT index is known and every slot is populated
        let max_index = self.max_index?;
        if max_index > 0 && self.payloads.iter().any(Vec::is_empty) {
            return None;
        }
        debug_assert_eq!(self.payloads.len() as u32, max_index + 1);

        let payloads = std::mem::take(&mut self.payloads);
        let result = validate_and_finalize_transfer(
            self.ts,
            frame.priority,
            frame.transfer_id,
            payloads,
            self.source_node_id,
        );
        let error = result.is_none().then_some(ReassemblyError::Integrity);
        self.restart(frame.transfer_id.wrapping_add(1), error, on_error);
        result
    }

    fn restart(
        &mut self,
        transfer_id: u64,
        error: Option<ReassemblyError>,
        on_error: &mut dyn FnMut(ReassemblyError),
    ) {
        if let Some(error) = error {
            on_error(error);
            tracing::debug!(
                "Reassembly restart for node {}: {error:?} tid: {} max_idx: {:?} fragments: {}",
                self.source_node_id,
                self.transfer_id,
                self.max_index,
                self.payloads.len(),
            );
        }
        self.transfer_id = transfer_id;
        self.max_index = None;
        self.payloads.clear();
    }
}

/// Validate a single anonymous frame and construct its transfer
///
/// Anonymous transfers are stateless: only a single frame with `index = 0`, the end-of-transfer
/// flag, and a valid CRC constitutes one.
#[must_use]
pub fn construct_anonymous_transfer(timestamp: Timestamp, frame: WireFrame) -> Option<TransferFrom> {
    if !frame.single_frame_transfer() {
        return None;
    }
    if frame.payload.len() <= TRANSFER_CRC32_SIZE {
        return None;
    }
    let mut crc = TransferCrc32::new();
    crc.add(&frame.payload);
    if !crc.check_residue() {
        return None;
    }
    Some(TransferFrom {
        timestamp,
        priority: frame.priority,
        transfer_id: frame.transfer_id,
        fragmented_payload: drop_crc(vec![frame.payload]),
        source_node_id: None,
    })
}

fn validate_and_finalize_transfer(
    timestamp: Timestamp,
    priority: cygnet_core::Priority,
    transfer_id: u64,
    frame_payloads: Vec<Vec<u8>>,
    source_node_id: u16,
) -> Option<TransferFrom> {
    debug_assert!(!frame_payloads.is_empty());
    let size_ok = if frame_payloads.len() > 1 {
        payload_length(&frame_payloads) > TRANSFER_CRC32_SIZE
    } else {
        // A single frame of exactly CRC size is an empty transfer, which is legal
        frame_payloads[0].len() >= TRANSFER_CRC32_SIZE
    };
    let mut crc = TransferCrc32::new();
    for payload in &frame_payloads {
        crc.add(payload);
    }
    if !(size_ok && crc.check_residue()) {
        return None;
    }
    Some(TransferFrom {
        timestamp,
        priority,
        transfer_id,
        fragmented_payload: drop_crc(frame_payloads),
        source_node_id: Some(source_node_id),
    })
}

/// Remove the trailing transfer CRC, which may straddle fragment boundaries
fn drop_crc(mut fragments: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut remaining = TRANSFER_CRC32_SIZE;
    while let Some(last) = fragments.last_mut() {
        if remaining == 0 {
            break;
        }
        if last.len() <= remaining {
            remaining -= last.len();
            fragments.pop();
        } else {
            last.truncate(last.len() - remaining);
            remaining = 0;
        }
    }
    fragments
}
