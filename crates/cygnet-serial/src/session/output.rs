use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cygnet_core::session::{
    Feedback, FeedbackHandler, OutputSession, Session, SessionStatistics,
    SessionStatisticsCounters,
};
use cygnet_core::tracer::CaptureHandler;
use cygnet_core::transfer::payload_length;
use cygnet_core::{
    OutputSessionSpecifier, PayloadMetadata, Result, Timestamp, Transfer, TransportError,
};
use cygnet_wire::{WireFrame, serialize_transfer};

use super::SessionFinalizer;
use crate::port::SerialPort;
use crate::stream::encode_frame;
use crate::tracer::SerialCapture;

/// A broadcast or unicast Cyphal/serial output session
///
/// All sessions of one transport share the link; writes are serialized through the port mutex.
/// Like the UDP variant, a transfer multiplier greater than one retransmits every transfer
/// back-to-back for temporal redundancy; errors in the redundant copies are suppressed.
pub struct SerialOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    local_node_id: Option<u16>,
    mtu: usize,
    multiplier: u8,
    feedback_handler: Mutex<Option<FeedbackHandler>>,
    counters: SessionStatisticsCounters,
    closed: AtomicBool,
    finalizer: Mutex<Option<SessionFinalizer>>,
    capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
    capture_active: Arc<AtomicBool>,
}

impl SerialOutputSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        port: Arc<Mutex<Box<dyn SerialPort>>>,
        local_node_id: Option<u16>,
        mtu: usize,
        multiplier: u8,
        finalizer: SessionFinalizer,
        capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
        capture_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            specifier,
            payload_metadata,
            port,
            local_node_id,
            mtu,
            multiplier: multiplier.max(1),
            feedback_handler: Mutex::new(None),
            counters: SessionStatisticsCounters::new(),
            closed: AtomicBool::new(false),
            finalizer: Mutex::new(Some(finalizer)),
            capture_handlers,
            capture_active,
        }
    }

    #[inline]
    #[must_use]
    pub fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    fn emit_capture(&self, timestamp: Timestamp, fragment: &[u8]) {
        if !self.capture_active.load(Ordering::Relaxed) {
            return;
        }
        let capture = SerialCapture {
            timestamp,
            own: true,
            fragment: fragment.to_vec(),
        };
        for handler in self.capture_handlers.lock().expect("poisoned").iter() {
            handler.as_ref()(&capture);
        }
    }
}

impl Session for SerialOutputSession {
    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    fn sample_statistics(&self) -> SessionStatistics {
        self.counters.sample()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(finalizer) = self.finalizer.lock().expect("poisoned").take() {
            finalizer();
        }
    }
}

impl OutputSession for SerialOutputSession {
    fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    fn send(&self, transfer: Transfer, deadline: Instant) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed(format!(
                "output session {:?}",
                self.specifier
            )));
        }

        let frames = serialize_transfer(
            &transfer.fragmented_payload,
            self.mtu,
            |index, end_of_transfer, payload| WireFrame {
                priority: transfer.priority,
                source_node_id: self.local_node_id,
                destination_node_id: self.specifier.remote_node_id,
                data_specifier: self.specifier.data_specifier,
                transfer_id: transfer.transfer_id,
                index,
                end_of_transfer,
                user_data: 0,
                payload,
            },
        );
        if self.local_node_id.is_none() && frames.len() > 1 {
            self.counters.add_error();
            return Err(TransportError::OperationNotDefinedForAnonymousNode(format!(
                "anonymous nodes cannot emit multi-frame transfers ({} frames)",
                frames.len()
            )));
        }

        let images: Vec<Vec<u8>> = frames.iter().map(encode_frame).collect();
        let mut first_frame_timestamp = None;
        {
            let mut port = self.port.lock().expect("poisoned");
            for (i, image) in images.iter().enumerate() {
                if i > 0 && Instant::now() > deadline {
                    self.counters.add_drops((images.len() - i) as u64);
                    return Ok(false);
                }
                port.write_all(image).map_err(|e| {
                    self.counters.add_error();
                    TransportError::InvalidMediaConfiguration(format!(
                        "serial write on {} failed: {e}",
                        port.name()
                    ))
                })?;
                let timestamp = Timestamp::now();
                if i == 0 {
                    first_frame_timestamp = Some(timestamp);
                }
                self.emit_capture(timestamp, image);
            }

            for _ in 1..self.multiplier {
                for image in &images {
                    if let Err(e) = port.write_all(image) {
                        self.counters.add_error();
                        tracing::debug!("Redundant copy write failed, suppressed: {e}");
                        break;
                    }
                    self.emit_capture(Timestamp::now(), image);
                }
            }
        }

        self.counters.add_transfer(
            images.len() as u64,
            payload_length(&transfer.fragmented_payload) as u64,
        );
        if let Some(first_frame_transmission_timestamp) = first_frame_timestamp
            && let Some(handler) = self.feedback_handler.lock().expect("poisoned").as_ref()
        {
            handler(Feedback {
                original_transfer_timestamp: transfer.timestamp,
                first_frame_transmission_timestamp,
            });
        }
        Ok(true)
    }

    fn enable_feedback(&self, handler: FeedbackHandler) {
        *self.feedback_handler.lock().expect("poisoned") = Some(handler);
    }

    fn disable_feedback(&self) {
        *self.feedback_handler.lock().expect("poisoned") = None;
    }
}
