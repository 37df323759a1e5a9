//! Transfer deduplication for redundant reception
//!
//! Each inferior transport delivers its own copy of every transfer; the merged stream must
//! contain each transfer exactly once. Two regimes exist:
//!
//! - Wide transfer-ID spaces (the high-overhead transports) never wrap in practice, so a strictly
//!   monotonic per-source watermark suffices.
//! - Cyclic spaces (CAN, modulo 32) need the transfer-ID timeout: within the window a transfer is
//!   accepted only if its ID moved forward by at most half the modulo; after the window the
//!   session is presumed restarted and anything goes.
//!
//! Anonymous transfers cannot be deduplicated at all (no session to anchor a watermark to) and
//! are passed through, accepting occasional duplication as the lesser evil.

use std::collections::HashMap;
use std::time::Duration;

use cygnet_core::{Timestamp, TransferFrom};

struct SourceState {
    last_transfer_id: u64,
    last_timestamp: Timestamp,
}

pub struct Deduplicator {
    transfer_id_modulo: u64,
    states: HashMap<u16, SourceState>,
}

impl Deduplicator {
    pub fn new(transfer_id_modulo: u64) -> Self {
        Self {
            transfer_id_modulo,
            states: HashMap::new(),
        }
    }

    fn wide(&self) -> bool {
        self.transfer_id_modulo >= 1 << 48
    }

    /// True when the transfer is new and should be delivered
    pub fn accept(&mut self, transfer: &TransferFrom, transfer_id_timeout: Duration) -> bool {
        let Some(source) = transfer.source_node_id else {
            return true;
        };
        let wide = self.wide();
        let Some(state) = self.states.get_mut(&source) else {
            self.states.insert(
                source,
                SourceState {
                    last_transfer_id: transfer.transfer_id,
                    last_timestamp: transfer.timestamp,
                },
            );
            return true;
        };

        let accept = if wide {
            transfer.transfer_id > state.last_transfer_id
        } else if transfer.timestamp.monotonic_since(state.last_timestamp) > transfer_id_timeout {
            // The session went quiet long enough that the ID may legitimately repeat
            true
        } else {
            let forward = transfer
                .transfer_id
                .wrapping_sub(state.last_transfer_id)
                % self.transfer_id_modulo;
            forward != 0 && forward <= self.transfer_id_modulo / 2
        };
        if accept {
            state.last_transfer_id = transfer.transfer_id;
            state.last_timestamp = transfer.timestamp;
        }
        accept
    }
}
