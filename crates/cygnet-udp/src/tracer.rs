//! Transfer reconstruction from captured UDP datagrams
//!
//! Captures carry raw Cyphal datagrams (header plus payload). Session attribution comes from the
//! frame header itself, so the tracer reconstructs transfers between arbitrary nodes without any
//! knowledge of the local addressing plan.

use std::any::Any;
use std::collections::HashMap;

use cygnet_core::tracer::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Capture, ErrorTrace,
    OutOfBandTrace, Trace, Tracer, TransferIdTimeoutEstimator, TransferTrace,
};
use cygnet_core::{Timestamp, TransferFrom};
use cygnet_wire::{TransferReassembler, WireFrame, construct_anonymous_transfer};

/// One captured UDP datagram carrying (or failing to carry) a Cyphal frame
#[derive(Clone, Debug)]
pub struct UdpCapture {
    pub timestamp: Timestamp,
    /// True when the datagram was transmitted by the capturing node
    pub own: bool,
    /// Source node-ID recovered from the sender's address, if any
    pub source_node_id: Option<u16>,
    /// The raw Cyphal datagram: header plus payload
    pub datagram: Vec<u8>,
}

impl Capture for UdpCapture {
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

/// Alien reassembly buffers have no subscription to size them, so they use a permissive bound
const ALIEN_EXTENT: usize = 1024 * 1024;

/// Reconstructs transfers between arbitrary nodes from [UdpCapture] events
#[derive(Default)]
pub struct UdpTracer {
    sessions: HashMap<AlienSessionSpecifier, AlienSession>,
}

impl UdpTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for UdpTracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<Trace> {
        let capture = capture.as_any().downcast_ref::<UdpCapture>()?;
        let Some(frame) = WireFrame::parse(&capture.datagram) else {
            // Not a Cyphal datagram; report it out-of-band for diagnostics
            return Some(Trace::OutOfBand(OutOfBandTrace {
                timestamp: capture.timestamp,
                data: capture.datagram.clone(),
            }));
        };
        let specifier = AlienSessionSpecifier {
            source_node_id: frame.source_node_id,
            destination_node_id: frame.destination_node_id,
            data_specifier: frame.data_specifier,
        };

        let Some(source_node_id) = frame.source_node_id else {
            return match construct_anonymous_transfer(capture.timestamp, frame) {
                Some(transfer) => Some(trace_transfer(
                    specifier,
                    transfer,
                    TransferIdTimeoutEstimator::MAX,
                )),
                None => Some(Trace::Error(ErrorTrace {
                    timestamp: capture.timestamp,
                    error: "invalid anonymous transfer".into(),
                })),
            };
        };

        let session = self
            .sessions
            .entry(specifier)
            .or_insert_with(|| AlienSession {
                reassembler: TransferReassembler::new(source_node_id, ALIEN_EXTENT),
                estimator: TransferIdTimeoutEstimator::new(),
            });
        let timeout = session.estimator.current();
        let mut errors = Vec::new();
        let transfer =
            session
                .reassembler
                .process_frame(capture.timestamp, frame, timeout, &mut |e| errors.push(e));
        if let Some(transfer) = transfer {
            let timeout = session.estimator.update(transfer.timestamp);
            return Some(trace_transfer(specifier, transfer, timeout));
        }
        errors.first().map(|error| {
            Trace::Error(ErrorTrace {
                timestamp: capture.timestamp,
                error: format!("{error:?}"),
            })
        })
    }
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cygnet_core::{DataSpecifier, Priority, ServiceRole};
    use pretty_assertions::assert_eq;

    use super::*;

    fn capture(monotonic_ns: u64, datagram: Vec<u8>) -> UdpCapture {
        UdpCapture {
            timestamp: Timestamp::new(monotonic_ns, monotonic_ns),
            own: false,
            source_node_id: Some(42),
            datagram,
        }
    }

    #[test]
    fn test_single_frame_service_response_trace() {
        // The seed scenario: node 42 responds to node 63 on service 11
        let mut tracer = UdpTracer::new();
        let frames = cygnet_wire::serialize_transfer(
            &[b"Hello world!".to_vec()],
            1200,
            |index, end_of_transfer, payload| WireFrame {
                priority: Priority::Nominal,
                source_node_id: Some(42),
                destination_node_id: Some(63),
                data_specifier: DataSpecifier::Service {
                    service_id: 11,
                    role: ServiceRole::Response,
                },
                transfer_id: 1234567890,
                index,
                end_of_transfer,
                user_data: 0,
                payload,
            },
        );
        assert_eq!(frames.len(), 1);

        let trace = tracer.update(&capture(5, frames[0].compile())).unwrap();
        let Trace::Transfer(trace) = trace else {
            panic!("expected a transfer trace, got {trace:?}");
        };
        assert_eq!(trace.transfer_id_timeout, Duration::from_secs(2));
        assert_eq!(trace.transfer.metadata.transfer_id, 1234567890);
        assert_eq!(
            trace.transfer.metadata.session_specifier,
            AlienSessionSpecifier {
                source_node_id: Some(42),
                destination_node_id: Some(63),
                data_specifier: DataSpecifier::Service {
                    service_id: 11,
                    role: ServiceRole::Response
                },
            }
        );
        assert_eq!(
            cygnet_core::transfer::concatenate(&trace.transfer.fragmented_payload),
            b"Hello world!"
        );
    }

    #[test]
    fn test_out_of_order_frames_trace_with_first_index_timestamp() {
        let mut tracer = UdpTracer::new();
        let frames = cygnet_wire::serialize_transfer(
            &[vec![7u8; 100]],
            40,
            |index, end_of_transfer, payload| WireFrame {
                priority: Priority::Low,
                source_node_id: Some(8),
                destination_node_id: None,
                data_specifier: DataSpecifier::Message { subject_id: 33 },
                transfer_id: 2,
                index,
                end_of_transfer,
                user_data: 0,
                payload,
            },
        );
        assert_eq!(frames.len(), 3);
        // Indices arrive 2, 1, 0
        assert!(tracer.update(&capture(1002, frames[2].compile())).is_none());
        assert!(tracer.update(&capture(1001, frames[1].compile())).is_none());
        let trace = tracer.update(&capture(1000, frames[0].compile())).unwrap();
        let Trace::Transfer(trace) = trace else {
            panic!("expected a transfer trace, got {trace:?}");
        };
        // First-index wins
        assert_eq!(trace.timestamp, Timestamp::new(1000, 1000));
    }

    #[test]
    fn test_junk_is_out_of_band() {
        let mut tracer = UdpTracer::new();
        let trace = tracer.update(&capture(1, b"not a cyphal datagram".to_vec())).unwrap();
        assert_eq!(
            trace,
            Trace::OutOfBand(OutOfBandTrace {
                timestamp: Timestamp::new(1, 1),
                data: b"not a cyphal datagram".to_vec(),
            })
        );
    }
}
