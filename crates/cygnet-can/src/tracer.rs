//! Transfer reconstruction from captured CAN traffic
//!
//! The tracer consumes raw frame captures (either direction) and reconstructs transfers between
//! arbitrary nodes on the bus. It is pure compute: no I/O, no resources; discard the instance to
//! reset the state.

use std::any::Any;
use std::collections::HashMap;

use cygnet_core::tracer::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Capture, ErrorTrace, Trace,
    Tracer, TransferIdTimeoutEstimator, TransferTrace,
};
use cygnet_core::{Timestamp, TransferFrom};

use crate::frame::CyphalFrame;
use crate::identifier::CanId;
use crate::media::DataFrame;
use crate::reassembly::{Outcome, TransferReassembler};

/// One captured CAN frame
#[derive(Clone, Debug)]
pub struct CanCapture {
    pub timestamp: Timestamp,
    pub frame: DataFrame,
    /// True when the frame was transmitted by the capturing node itself (loopback echo)
    pub own: bool,
}

impl Capture for CanCapture {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct AlienSession {
    reassembler: TransferReassembler,
    estimator: TransferIdTimeoutEstimator,
}

/// Reconstructs transfers between arbitrary nodes from [CanCapture] events
#[derive(Default)]
pub struct CanTracer {
    sessions: HashMap<AlienSessionSpecifier, AlienSession>,
}

/// Alien reassembly buffers have no subscription to size them, so they use a permissive bound
const ALIEN_EXTENT: usize = 1024 * 1024;

impl CanTracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn trace_transfer(
        specifier: AlienSessionSpecifier,
        transfer: TransferFrom,
        transfer_id_timeout: std::time::Duration,
    ) -> Trace {
        Trace::Transfer(TransferTrace {
            timestamp: transfer.timestamp,
            transfer: AlienTransfer {
                metadata: AlienTransferMetadata {
                    priority: transfer.priority,
                    transfer_id: transfer.transfer_id,
                    session_specifier: specifier,
                },
                fragmented_payload: transfer.fragmented_payload,
            },
            transfer_id_timeout,
        })
    }
}

impl Tracer for CanTracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<Trace> {
        let capture = capture.as_any().downcast_ref::<CanCapture>()?;
        // Unparseable frames are not Cyphal traffic; the bus is shared with other protocols
        let frame = CyphalFrame::parse(&capture.frame)?;
        let can_id = CanId::parse(capture.frame.identifier)?;
        let specifier = AlienSessionSpecifier {
            source_node_id: can_id.source_node_id().map(u16::from),
            destination_node_id: can_id.destination_node_id().map(u16::from),
            data_specifier: can_id.data_specifier(),
        };

        // Anonymous transfers are stateless single frames
        let Some(source_node_id) = can_id.source_node_id() else {
            if frame.start_of_transfer && frame.end_of_transfer && frame.toggle_bit {
                let transfer = TransferFrom {
                    timestamp: capture.timestamp,
                    priority: can_id.priority(),
                    transfer_id: frame.transfer_id as u64,
                    fragmented_payload: vec![frame.padded_payload],
                    source_node_id: None,
                };
                return Some(Self::trace_transfer(
                    specifier,
                    transfer,
                    TransferIdTimeoutEstimator::MAX,
                ));
            }
            return Some(Trace::Error(ErrorTrace {
                timestamp: capture.timestamp,
                error: "anonymous multi-frame transfer".into(),
            }));
        };

        let session = self.sessions.entry(specifier).or_insert_with(|| AlienSession {
            reassembler: TransferReassembler::new(source_node_id, ALIEN_EXTENT),
            estimator: TransferIdTimeoutEstimator::new(),
        });
        let timeout = session.estimator.current();
        match session.reassembler.process_frame(
            capture.timestamp,
            can_id.priority(),
            frame,
            timeout,
        ) {
            Outcome::Incomplete => None,
            Outcome::Error(error) => Some(Trace::Error(ErrorTrace {
                timestamp: capture.timestamp,
                error: format!("{error:?}"),
            })),
            Outcome::Transfer(transfer) => {
                let timeout = session.estimator.update(transfer.timestamp);
                Some(Self::trace_transfer(specifier, transfer, timeout))
            }
        }
    }
}
