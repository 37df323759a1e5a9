//! Strict in-order transfer reassembly for Cyphal/CAN
//!
//! CAN delivers frames in order within a priority level, so the state machine is a straight
//! accumulator guarded by the transfer-ID and the toggle bit (a properly functioning bus may
//! still occasionally replicate frames). Restarts are driven by start-of-transfer frames
//! combined with either the transfer-ID timeout or a transfer-ID jump greater than one.

use std::time::Duration;

use cygnet_core::crc::TransferCrc16;
use cygnet_core::{Priority, Timestamp, TransferFrom};

use crate::frame::{
    CyphalFrame, TRANSFER_CRC_LENGTH, TRANSFER_ID_MODULO, transfer_id_forward_distance,
};

/// Reassembly error states, reported through the session's extended statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReassemblyError {
    /// A non-start frame arrived while no transfer was in progress
    MissedStartOfTransfer,
    /// The toggle bit does not alternate; duplicated or replayed frame
    UnexpectedToggleBit,
    /// The frame's transfer-ID disagrees with the expected one
    UnexpectedTransferId,
    /// A completed multi-frame transfer failed its CRC check
    TransferCrcMismatch,
}

impl ReassemblyError {
    pub const ALL: [ReassemblyError; 4] = [
        ReassemblyError::MissedStartOfTransfer,
        ReassemblyError::UnexpectedToggleBit,
        ReassemblyError::UnexpectedTransferId,
        ReassemblyError::TransferCrcMismatch,
    ];
}

/// The result of feeding one frame into a [TransferReassembler]
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// More frames are needed
    Incomplete,
    Transfer(TransferFrom),
    Error(ReassemblyError),
}

struct State {
    crc: TransferCrc16,
    truncated: bool,
    payload: Vec<Vec<u8>>,
}

impl State {
    fn new() -> Self {
        Self {
            crc: TransferCrc16::new(),
            truncated: false,
            payload: Vec::new(),
        }
    }

    fn payload_size(&self) -> usize {
        self.payload.iter().map(Vec::len).sum()
    }
}

/// Per-source reassembly state machine
pub struct TransferReassembler {
    source_node_id: u8,
    transfer_id: u8,
    toggle_bit: bool,
    /// Implicit truncation threshold: extent plus room for the transfer CRC
    max_payload_size_with_crc: usize,
    state: Option<State>,
    ts: Option<Timestamp>,
}

impl TransferReassembler {
    pub fn new(source_node_id: u8, extent_bytes: usize) -> Self {
        Self {
            source_node_id,
            transfer_id: 0,
            toggle_bit: false,
            max_payload_size_with_crc: extent_bytes + TRANSFER_CRC_LENGTH,
            state: None,
            ts: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn source_node_id(&self) -> u8 {
        self.source_node_id
    }

    /// Feed one frame into the state machine
    ///
    /// Timestamps need not be monotonic across the frames of one transfer (time recovery may
    /// correct backwards); the delivered transfer carries the earliest timestamp of its frames.
    pub fn process_frame(
        &mut self,
        timestamp: Timestamp,
        priority: Priority,
        frame: CyphalFrame,
        transfer_id_timeout: Duration,
    ) -> Outcome {
        let tid_timed_out = match self.ts {
            None => true,
            Some(ts) => {
                frame.transfer_id != self.transfer_id
                    && timestamp.monotonic_since(ts) > transfer_id_timeout
            }
        };
        let not_previous_tid =
            transfer_id_forward_distance(frame.transfer_id, self.transfer_id) > 1;
        // Restarting only makes sense on a start-of-transfer frame; otherwise the first frame of
        // the new transfer is already lost and reassembly is impossible anyway
        if frame.start_of_transfer && (tid_timed_out || not_previous_tid) {
            self.state = None;
            self.transfer_id = frame.transfer_id;
            self.toggle_bit = frame.toggle_bit;
        }
        if frame.transfer_id != self.transfer_id {
            return Outcome::Error(ReassemblyError::UnexpectedTransferId);
        }
        if frame.toggle_bit != self.toggle_bit {
            return Outcome::Error(ReassemblyError::UnexpectedToggleBit);
        }
        if frame.start_of_transfer {
            self.ts = Some(timestamp);
            self.state = Some(State::new());
        }
        // A lingering end-of-transfer frame can accidentally match a freshly reset expectation
        // (same transfer-ID and toggle). Without a start-of-transfer frame there is no transfer
        // to finish, so such frames must be rejected here rather than delivered.
        let Some(state) = self.state.as_mut() else {
            return Outcome::Error(ReassemblyError::MissedStartOfTransfer);
        };

        let ts = self
            .ts
            .expect("timestamp is set whenever a transfer is in progress")
            .combine_earliest(timestamp);
        self.ts = Some(ts);
        self.toggle_bit = !self.toggle_bit;

        // Implicit truncation: stop storing payload past the limit but keep the CRC going
        state.crc.add(&frame.padded_payload);
        if state.payload_size() < self.max_payload_size_with_crc {
            state.payload.push(frame.padded_payload);
        } else {
            state.truncated = true;
        }

        if !frame.end_of_transfer {
            return Outcome::Incomplete;
        }

        let mut fin = self.state.take().expect("state checked above");
        self.transfer_id = (self.transfer_id + 1) % TRANSFER_ID_MODULO;
        self.toggle_bit = true;

        if frame.start_of_transfer {
            debug_assert_eq!(fin.payload.len(), 1); // Single-frame transfer carries no CRC
        } else {
            if !fin.crc.check_residue() {
                return Outcome::Error(ReassemblyError::TransferCrcMismatch);
            }
            // Cut the CRC off the tail, unless implicit truncation already removed it
            if !fin.truncated {
                strip_crc(&mut fin.payload);
            }
        }
        Outcome::Transfer(TransferFrom {
            timestamp: ts,
            priority,
            transfer_id: frame.transfer_id as u64,
            fragmented_payload: fin.payload,
            source_node_id: Some(self.source_node_id as u16),
        })
    }
}

/// Remove the trailing transfer CRC, which may straddle fragment boundaries
fn strip_crc(payload: &mut Vec<Vec<u8>>) {
    debug_assert!(payload.len() >= 2);
    let mut remaining = TRANSFER_CRC_LENGTH;
    while let Some(last) = payload.last_mut() {
        if remaining == 0 {
            break;
        }
        if last.len() <= remaining {
            remaining -= last.len();
            payload.pop();
        } else {
            last.truncate(last.len() - remaining);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PRIORITY: Priority = Priority::Immediate;
    const SOURCE_NODE_ID: u8 = 123;
    const TIMEOUT: Duration = Duration::from_nanos(900);

    fn frm(
        padded_payload: &[u8],
        transfer_id: u8,
        start_of_transfer: bool,
        end_of_transfer: bool,
        toggle_bit: bool,
    ) -> CyphalFrame {
        CyphalFrame {
            identifier: 0xBADC0FE,
            padded_payload: padded_payload.to_vec(),
            transfer_id,
            start_of_transfer,
            end_of_transfer,
            toggle_bit,
        }
    }

    fn trn(monotonic_ns: u64, transfer_id: u64, fragments: &[&[u8]]) -> Outcome {
        Outcome::Transfer(TransferFrom {
            timestamp: Timestamp::new(0, monotonic_ns),
            priority: PRIORITY,
            transfer_id,
            fragmented_payload: fragments.iter().map(|f| f.to_vec()).collect(),
            source_node_id: Some(SOURCE_NODE_ID as u16),
        })
    }

    struct Harness {
        rx: TransferReassembler,
    }

    impl Harness {
        fn new(extent: usize) -> Self {
            Self {
                rx: TransferReassembler::new(SOURCE_NODE_ID, extent),
            }
        }

        fn proc(&mut self, monotonic_ns: u64, frame: CyphalFrame) -> Outcome {
            self.rx
                .process_frame(Timestamp::new(0, monotonic_ns), PRIORITY, frame, TIMEOUT)
        }
    }

    #[test]
    fn test_reassembly_state_machine() {
        use Outcome::{Error, Incomplete};
        use ReassemblyError as E;
        let mut h = Harness::new(50);

        // Correct single-frame transfers
        assert_eq!(h.proc(1000, frm(b"Hello", 0, true, true, true)), trn(1000, 0, &[b"Hello"]));
        assert_eq!(h.proc(1000, frm(b"Hello", 0, true, true, true)), Error(E::UnexpectedTransferId));
        assert_eq!(h.proc(1000, frm(b"Hello", 0, true, true, true)), Error(E::UnexpectedTransferId));
        // Transfer-ID timeout makes the repeat acceptable again
        assert_eq!(h.proc(2000, frm(b"Hello", 0, true, true, true)), trn(2000, 0, &[b"Hello"]));

        // Correct multi-frame transfer; CRC 0x3554 trails the payload
        assert_eq!(h.proc(2000, frm(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 1, true, false, true)), Incomplete);
        assert_eq!(h.proc(2001, frm(&[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D], 1, false, false, false)), Incomplete);
        assert_eq!(h.proc(2002, frm(&[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14], 1, false, false, true)), Incomplete);
        assert_eq!(h.proc(2003, frm(&[0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B], 1, false, false, false)), Incomplete);
        assert_eq!(
            h.proc(2004, frm(&[0x1C, 0x1D, 0x35, 0x54], 1, false, true, true)),
            trn(
                2000,
                1,
                &[
                    &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
                    &[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D],
                    &[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14],
                    &[0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B],
                    &[0x1C, 0x1D],
                ]
            )
        );

        // A replay with the now-old transfer-ID is rejected frame by frame
        assert_eq!(h.proc(2010, frm(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 1, true, false, true)), Error(E::UnexpectedTransferId));
        assert_eq!(h.proc(2014, frm(&[0x1C, 0x1D, 0x35, 0x54], 1, false, true, true)), Error(E::UnexpectedTransferId));

        // CRC spilling over into a dedicated last frame
        assert_eq!(
            h.proc(2100, frm(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E], 9, true, false, true)),
            Incomplete
        );
        assert_eq!(
            h.proc(2101, frm(&[0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0xC4], 9, false, false, false)),
            Incomplete
        );
        assert_eq!(
            h.proc(2102, frm(&[0x6F], 9, false, true, true)),
            trn(
                2100,
                9,
                &[
                    &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E],
                    // The last fragment disappeared entirely; it only carried CRC bytes
                    &[0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C],
                ]
            )
        );

        // Transfer-ID rolled backwards by one: accepted as a restart, but the CRC fails
        assert_eq!(
            h.proc(2200, frm(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E], 8, true, false, true)),
            Incomplete
        );
        assert_eq!(
            h.proc(2201, frm(&[0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0xC4], 8, false, false, false)),
            Incomplete
        );
        assert_eq!(h.proc(2202, frm(&[0x00], 8, false, true, true)), Error(E::TransferCrcMismatch));

        // Timeout does not apply to non-start frames
        assert_eq!(h.proc(4000, frm(b"123456", 8, false, false, true)), Error(E::UnexpectedTransferId));
        assert_eq!(h.proc(4000, frm(b"123456", 9, false, false, false)), Error(E::UnexpectedToggleBit));

        // Same TID accepted due to the timeout condition; duplicated frames trip the toggle
        assert_eq!(h.proc(4000, frm(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 8, true, false, true)), Incomplete);
        assert_eq!(h.proc(4010, frm(b"123456", 8, true, false, true)), Error(E::UnexpectedToggleBit));
        // A frame with an earlier timestamp updates the transfer timestamp downwards
        assert_eq!(h.proc(3500, frm(&[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D], 8, false, false, false)), Incomplete);
        assert_eq!(h.proc(3000, frm(b"", 8, false, false, false)), Error(E::UnexpectedToggleBit));
        assert_eq!(h.proc(4022, frm(&[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14], 8, false, false, true)), Incomplete);
        assert_eq!(h.proc(4002, frm(&[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14], 8, false, false, true)), Error(E::UnexpectedToggleBit));
        assert_eq!(h.proc(4013, frm(&[0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B], 8, false, false, false)), Incomplete);
        assert_eq!(
            h.proc(4004, frm(&[0x1C, 0x1D, 0x35, 0x54], 8, false, true, true)),
            trn(
                3500,
                8,
                &[
                    &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
                    &[0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D],
                    &[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14],
                    &[0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B],
                    &[0x1C, 0x1D],
                ]
            )
        );
        assert_eq!(h.proc(4004, frm(&[0x1C, 0x1D, 0x35, 0x54], 8, false, true, true)), Error(E::UnexpectedTransferId));
    }

    #[test]
    fn test_implicit_truncation() {
        use Outcome::Incomplete;
        let mut h = Harness::new(50);
        // 5 x 19-byte frames; the accumulator stops storing at extent + CRC size but the CRC
        // still verifies
        assert_eq!(h.proc(1000, frm(b"0123456789abcdefghi", 0, true, false, true)), Incomplete);
        assert_eq!(h.proc(1001, frm(b"0123456789abcdefghi", 0, false, false, false)), Incomplete);
        assert_eq!(h.proc(1001, frm(b"0123456789abcdefghi", 0, false, false, true)), Incomplete);
        assert_eq!(h.proc(1001, frm(b"0123456789abcdefghi", 0, false, false, false)), Incomplete);
        assert_eq!(
            h.proc(1001, frm(b":B", 0, false, true, true)),
            trn(
                1000,
                0,
                &[b"0123456789abcdefghi", b"0123456789abcdefghi", b"0123456789abcdefghi"]
            )
        );

        // Overflow induced by the very last frame is not truncated
        assert_eq!(h.proc(1000, frm(b"0123456789abcdefghi", 31, true, false, true)), Incomplete);
        assert_eq!(h.proc(1001, frm(b"0123456789abcdefghi", 31, false, false, false)), Incomplete);
        assert_eq!(
            h.proc(1001, frm(b"0123456789abcdefghi\xa9\x72", 31, false, true, true)),
            trn(
                1000,
                31,
                &[b"0123456789abcdefghi", b"0123456789abcdefghi", b"0123456789abcdefghi"]
            )
        );
    }

    #[test]
    fn test_lingering_eot_frame_after_reset() {
        use Outcome::Error;
        let mut h = Harness::new(50);
        // Initialize the reassembler with one valid transfer; it now expects TID 1, toggle true
        assert_eq!(h.proc(1000, frm(b"123", 0, true, true, true)), trn(1000, 0, &[b"123"]));
        // The last frame of another transfer matches those expectations exactly. It must be
        // rejected as a missed start, not delivered as a spurious transfer.
        assert_eq!(
            h.proc(1000, frm(b"456", 1, false, true, true)),
            Error(ReassemblyError::MissedStartOfTransfer)
        );
    }

    #[test]
    fn test_transfer_id_rollover() {
        let mut h = Harness::new(50);
        assert_eq!(h.proc(10, frm(b"a", 31, true, true, true)), trn(10, 31, &[b"a"]));
        // 31 wraps to 0; the next transfer is accepted as consecutive
        assert_eq!(h.proc(11, frm(b"b", 0, true, true, true)), trn(11, 0, &[b"b"]));
        // A jump greater than one restarts reassembly (accepted as a new transfer)
        assert_eq!(h.proc(12, frm(b"c", 5, true, true, true)), trn(12, 5, &[b"c"]));
    }
}
