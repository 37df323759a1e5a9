use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use cygnet_core::session::{
    Feedback, FeedbackHandler, OutputSession, Session, SessionStatistics,
    SessionStatisticsCounters,
};
use cygnet_core::transfer::payload_length;
use cygnet_core::{
    OutputSessionSpecifier, PayloadMetadata, Result, Timestamp, Transfer, TransportError,
};

use super::SessionFinalizer;
use crate::frame::{CyphalFrame, TRANSFER_ID_MODULO};
use crate::identifier::CanId;
use crate::media::Envelope;
use crate::serialize::serialize_transfer;

/// Hands serialized frames to the media; `Ok(true)` when every frame was accepted before the
/// deadline
pub type SendHandler = Box<dyn Fn(&[Envelope], Instant) -> Result<bool> + Send + Sync>;

/// A broadcast or unicast Cyphal/CAN output session
pub struct CanOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    local_node_id: Option<u8>,
    max_frame_payload: usize,
    send_handler: SendHandler,
    feedback_handler: Mutex<Option<FeedbackHandler>>,
    /// Keyed by (compiled identifier, transfer-ID modulus); at most one outstanding first-frame
    /// per key
    pending_feedback: Mutex<HashMap<(u32, u8), Timestamp>>,
    counters: SessionStatisticsCounters,
    closed: AtomicBool,
    finalizer: Mutex<Option<SessionFinalizer>>,
}

impl CanOutputSession {
    pub fn new(
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        local_node_id: Option<u8>,
        max_frame_payload: usize,
        send_handler: SendHandler,
        finalizer: SessionFinalizer,
    ) -> Self {
        Self {
            specifier,
            payload_metadata,
            local_node_id,
            max_frame_payload,
            send_handler,
            feedback_handler: Mutex::new(None),
            pending_feedback: Mutex::new(HashMap::new()),
            counters: SessionStatisticsCounters::new(),
            closed: AtomicBool::new(false),
            finalizer: Mutex::new(Some(finalizer)),
        }
    }

    #[inline]
    #[must_use]
    pub fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    /// Route a looped-back frame of this session's identifier; resolves pending feedback entries
    ///
    /// Unattended loopback frames are expected: packet capture mode loops everything back.
    pub fn handle_loopback_frame(&self, timestamp: Timestamp, frame: &CyphalFrame) {
        if !frame.start_of_transfer {
            return;
        }
        let original = self
            .pending_feedback
            .lock()
            .expect("poisoned")
            .remove(&(frame.identifier, frame.transfer_id));
        let Some(original_transfer_timestamp) = original else {
            return;
        };
        if let Some(handler) = self.feedback_handler.lock().expect("poisoned").as_ref() {
            handler(Feedback {
                original_transfer_timestamp,
                first_frame_transmission_timestamp: timestamp,
            });
        }
    }

    fn can_id(&self, transfer: &Transfer) -> CanId {
        match self.specifier.data_specifier {
            cygnet_core::DataSpecifier::Message { subject_id } => CanId::Message {
                priority: transfer.priority,
                subject_id,
                source_node_id: self.local_node_id,
            },
            cygnet_core::DataSpecifier::Service { service_id, role } => CanId::Service {
                priority: transfer.priority,
                service_id,
                request_not_response: role == cygnet_core::ServiceRole::Request,
                // Validated unicast at session construction
                destination_node_id: self.specifier.remote_node_id.unwrap_or(0) as u8,
                // Anonymous nodes cannot construct service output sessions
                source_node_id: self.local_node_id.unwrap_or(0),
            },
        }
    }
}

impl Session for CanOutputSession {
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
        self.pending_feedback.lock().expect("poisoned").clear();
        if let Some(finalizer) = self.finalizer.lock().expect("poisoned").take() {
            finalizer();
        }
    }
}

impl OutputSession for CanOutputSession {
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

        let first_fragment = transfer
            .fragmented_payload
            .first()
            .map(Vec::as_slice)
            .unwrap_or(b"");
        let identifier = self.can_id(&transfer).compile(first_fragment);
        let transfer_id_mod = (transfer.transfer_id % TRANSFER_ID_MODULO as u64) as u8;
        let frames = serialize_transfer(
            identifier,
            transfer_id_mod,
            &transfer.fragmented_payload,
            self.max_frame_payload,
        );
        if self.local_node_id.is_none() && frames.len() > 1 {
            self.counters.add_error();
            return Err(TransportError::OperationNotDefinedForAnonymousNode(format!(
                "anonymous nodes cannot emit multi-frame transfers ({} frames)",
                frames.len()
            )));
        }

        // Loopback is requested for the first frame only; that is sufficient for transmission
        // timestamping
        let feedback_enabled = self.feedback_handler.lock().expect("poisoned").is_some();
        if feedback_enabled {
            let mut pending = self.pending_feedback.lock().expect("poisoned");
            let key = (identifier, transfer_id_mod);
            if let Some(stale) = pending.insert(key, transfer.timestamp) {
                // Bounded replacement: evict the stale entry and count it against the session,
                // never against the application
                self.counters.add_error();
                tracing::warn!(
                    "Overriding stale feedback entry {stale:?} at identifier {identifier:#X} \
                     transfer-ID {transfer_id_mod}"
                );
            }
        }

        let envelopes: Vec<Envelope> = frames
            .iter()
            .enumerate()
            .map(|(i, frame)| Envelope {
                frame: frame.compile(),
                loopback: feedback_enabled && i == 0,
            })
            .collect();

        match (self.send_handler)(&envelopes, deadline) {
            Ok(true) => {
                self.counters.add_transfer(
                    envelopes.len() as u64,
                    payload_length(&transfer.fragmented_payload) as u64,
                );
                Ok(true)
            }
            Ok(false) => {
                // Deadline expired mid-transfer; the receiver will see an incomplete transfer
                self.counters.add_drops(envelopes.len() as u64);
                Ok(false)
            }
            Err(error) => {
                self.counters.add_error();
                Err(error)
            }
        }
    }

    fn enable_feedback(&self, handler: FeedbackHandler) {
        *self.feedback_handler.lock().expect("poisoned") = Some(handler);
    }

    fn disable_feedback(&self) {
        *self.feedback_handler.lock().expect("poisoned") = None;
        self.pending_feedback.lock().expect("poisoned").clear();
    }
}
