//! Transfer reconstruction from captured serial stream fragments
//!
//! Serial captures are raw slices of the byte stream, one per read or write, with no framing of
//! their own. The tracer runs an independent stream parser per direction and feeds the extracted
//! frames through alien-session reassembly; junk between frames surfaces as out-of-band traces.

use std::any::Any;
use std::collections::HashMap;

use cygnet_core::tracer::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Capture, ErrorTrace,
    OutOfBandTrace, Trace, Tracer, TransferIdTimeoutEstimator, TransferTrace,
};
use cygnet_core::{Timestamp, TransferFrom};
use cygnet_wire::{TransferReassembler, WireFrame, construct_anonymous_transfer};

use crate::stream::{StreamEvent, StreamParser};

/// One captured fragment of the serial byte stream
#[derive(Clone, Debug)]
pub struct SerialCapture {
    pub timestamp: Timestamp,
    /// True when the fragment was written by the capturing node
    pub own: bool,
    pub fragment: Vec<u8>,
}

impl Capture for SerialCapture {
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

/// Reconstructs transfers between arbitrary nodes from [SerialCapture] events
#[derive(Default)]
pub struct SerialTracer {
    rx_parser: StreamParser,
    tx_parser: StreamParser,
    sessions: HashMap<AlienSessionSpecifier, AlienSession>,
}

impl SerialTracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_frame(&mut self, timestamp: Timestamp, frame: WireFrame) -> Option<Trace> {
        let specifier = AlienSessionSpecifier {
            source_node_id: frame.source_node_id,
            destination_node_id: frame.destination_node_id,
            data_specifier: frame.data_specifier,
        };
        let Some(source_node_id) = frame.source_node_id else {
            return match construct_anonymous_transfer(timestamp, frame) {
                Some(transfer) => Some(trace_transfer(
                    specifier,
                    transfer,
                    TransferIdTimeoutEstimator::MAX,
                )),
                None => Some(Trace::Error(ErrorTrace {
                    timestamp,
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
        let transfer = session
            .reassembler
            .process_frame(timestamp, frame, timeout, &mut |e| errors.push(e));
        if let Some(transfer) = transfer {
            let timeout = session.estimator.update(transfer.timestamp);
            return Some(trace_transfer(specifier, transfer, timeout));
        }
        errors.first().map(|error| {
            Trace::Error(ErrorTrace {
                timestamp,
                error: format!("{error:?}"),
            })
        })
    }
}

impl Tracer for SerialTracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<Trace> {
        let capture = capture.as_any().downcast_ref::<SerialCapture>()?;
        // One capture may complete several events; per the capture contract only the first one is
        // returned, the rest degrade to the log. In practice captures are single frames.
        let mut parser = if capture.own {
            std::mem::take(&mut self.tx_parser)
        } else {
            std::mem::take(&mut self.rx_parser)
        };
        let mut events = Vec::new();
        parser.push(&capture.fragment, |event| events.push(event));
        if capture.own {
            self.tx_parser = parser;
        } else {
            self.rx_parser = parser;
        }

        let mut traces = events.into_iter().filter_map(|event| match event {
            StreamEvent::Frame(frame) => self.process_frame(capture.timestamp, frame),
            StreamEvent::OutOfBand(data) => Some(Trace::OutOfBand(OutOfBandTrace {
                timestamp: capture.timestamp,
                data,
            })),
        });
        let first = traces.next();
        for extra in traces {
            tracing::debug!("Capture completed more than one trace; dropping {extra:?}");
        }
        first
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
