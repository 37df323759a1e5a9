//! An in-process transport that connects its own output sessions to its matching input sessions
//!
//! There is no wire and no serialization; transfers are delivered as-is. Useful for testing the
//! layers above the transport and as the `loopback` option of the configuration-driven factory.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use cygnet_core::session::{
    DEFAULT_TRANSFER_ID_TIMEOUT, Feedback, FeedbackHandler, InputSession, OutputSession, Session,
    SessionStatistics, SessionStatisticsCounters,
};
use cygnet_core::tracer::{Capture, CaptureHandler};
use cygnet_core::transport::{ProtocolParameters, Transport};
use cygnet_core::{
    InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Result, Timestamp, Transfer,
    TransferFrom, TransportError,
};

/// One locally looped-back transfer
#[derive(Clone, Debug)]
pub struct LoopbackCapture {
    pub timestamp: Timestamp,
    pub transfer: TransferFrom,
}

impl Capture for LoopbackCapture {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Inner {
    local_node_id: Option<u16>,
    mtu: usize,
    inputs: Mutex<HashMap<InputSessionSpecifier, Arc<LoopbackInputSession>>>,
    outputs: Mutex<HashMap<OutputSessionSpecifier, Arc<LoopbackOutputSession>>>,
    capture_handlers: Mutex<Vec<CaptureHandler>>,
    capture_active: AtomicBool,
    closed: AtomicBool,
}

pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new(local_node_id: Option<u16>) -> LoopbackTransport {
        LoopbackTransport {
            inner: Arc::new(Inner {
                local_node_id,
                mtu: 1024,
                inputs: Mutex::new(HashMap::new()),
                outputs: Mutex::new(HashMap::new()),
                capture_handlers: Mutex::new(Vec::new()),
                capture_active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("loopback transport".into()));
        }
        Ok(())
    }

    fn deliver(&self, transfer: TransferFrom, data_specifier: cygnet_core::DataSpecifier) {
        if self.capture_active.load(Ordering::Relaxed) {
            let capture = LoopbackCapture {
                timestamp: transfer.timestamp,
                transfer: transfer.clone(),
            };
            for handler in self.capture_handlers.lock().expect("poisoned").iter() {
                handler.as_ref()(&capture);
            }
        }
        let inputs = self.inputs.lock().expect("poisoned");
        let selective = transfer
            .source_node_id
            .and_then(|source| {
                inputs.get(&InputSessionSpecifier::new(data_specifier, Some(source)))
            })
            .cloned();
        let promiscuous = inputs
            .get(&InputSessionSpecifier::new(data_specifier, None))
            .cloned();
        drop(inputs);
        if let Some(session) = selective {
            session.push(transfer.clone());
        }
        if let Some(session) = promiscuous {
            session.push(transfer);
        }
    }
}

impl Transport for LoopbackTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: u64::MAX,
            max_nodes: 0xFFFF,
            mtu: self.inner.mtu,
        }
    }

    fn local_node_id(&self) -> Option<u16> {
        self.inner.local_node_id
    }

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>> {
        self.inner.check_open()?;
        let mut inputs = self.inner.inputs.lock().expect("poisoned");
        if let Some(existing) = inputs.get(&specifier) {
            return Ok(Arc::clone(existing) as Arc<dyn InputSession>);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let session = Arc::new(LoopbackInputSession {
            specifier,
            payload_metadata,
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: Mutex::new(None),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            transfer_id_timeout: Mutex::new(DEFAULT_TRANSFER_ID_TIMEOUT),
            counters: SessionStatisticsCounters::new(),
            finalizer: Mutex::new(Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.inputs.lock().expect("poisoned").remove(&specifier);
                }
            }))),
        });
        inputs.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>> {
        self.inner.check_open()?;
        if specifier.data_specifier.is_service() && self.inner.local_node_id.is_none() {
            return Err(TransportError::OperationNotDefinedForAnonymousNode(
                "anonymous nodes cannot emit service transfers".into(),
            ));
        }
        let mut outputs = self.inner.outputs.lock().expect("poisoned");
        if let Some(existing) = outputs.get(&specifier) {
            return Ok(Arc::clone(existing) as Arc<dyn OutputSession>);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer_weak = Weak::clone(&weak);
        let session = Arc::new(LoopbackOutputSession {
            specifier,
            payload_metadata,
            transport: weak,
            feedback_handler: Mutex::new(None),
            counters: SessionStatisticsCounters::new(),
            closed: AtomicBool::new(false),
            finalizer: Mutex::new(Some(Box::new(move || {
                if let Some(inner) = finalizer_weak.upgrade() {
                    inner.outputs.lock().expect("poisoned").remove(&specifier);
                }
            }))),
        });
        outputs.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn input_sessions(&self) -> Vec<InputSessionSpecifier> {
        self.inner.inputs.lock().expect("poisoned").keys().copied().collect()
    }

    fn output_sessions(&self) -> Vec<OutputSessionSpecifier> {
        self.inner.outputs.lock().expect("poisoned").keys().copied().collect()
    }

    fn begin_capture(&self, handler: CaptureHandler) -> Result<()> {
        self.inner.check_open()?;
        self.inner
            .capture_handlers
            .lock()
            .expect("poisoned")
            .push(handler);
        self.inner.capture_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inputs: Vec<Arc<LoopbackInputSession>> = self
            .inner
            .inputs
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for session in inputs {
            session.close();
        }
        let outputs: Vec<Arc<LoopbackOutputSession>> = self
            .inner
            .outputs
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for session in outputs {
            session.close();
        }
    }
}

struct LoopbackInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    queue: Mutex<VecDeque<TransferFrom>>,
    queue_capacity: Mutex<Option<usize>>,
    available: Condvar,
    closed: AtomicBool,
    transfer_id_timeout: Mutex<Duration>,
    counters: SessionStatisticsCounters,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl LoopbackInputSession {
    fn push(&self, transfer: TransferFrom) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let payload_bytes = transfer.payload_length() as u64;
        let mut queue = self.queue.lock().expect("poisoned");
        let capacity = *self.queue_capacity.lock().expect("poisoned");
        if capacity.is_some_and(|cap| queue.len() >= cap) {
            self.counters
                .add_drops(transfer.fragmented_payload.len().max(1) as u64);
            return;
        }
        self.counters.add_transfer(1, payload_bytes);
        queue.push_back(transfer);
        drop(queue);
        self.available.notify_one();
    }
}

impl Session for LoopbackInputSession {
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
        self.available.notify_all();
        if let Some(finalizer) = self.finalizer.lock().expect("poisoned").take() {
            finalizer();
        }
    }
}

impl InputSession for LoopbackInputSession {
    fn specifier(&self) -> InputSessionSpecifier {
        self.specifier
    }

    fn receive(&self, deadline: Instant) -> Result<Option<TransferFrom>> {
        let mut queue = self.queue.lock().expect("poisoned");
        loop {
            if let Some(transfer) = queue.pop_front() {
                return Ok(Some(transfer));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ResourceClosed(format!(
                    "input session {:?}",
                    self.specifier
                )));
            }
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Ok(None);
            };
            let (guard, _timeout) = self
                .available
                .wait_timeout(queue, remaining)
                .expect("poisoned");
            queue = guard;
        }
    }

    fn transfer_id_timeout(&self) -> Duration {
        *self.transfer_id_timeout.lock().expect("poisoned")
    }

    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(TransportError::InvalidTransportConfiguration(
                "transfer-ID timeout must be positive".into(),
            ));
        }
        *self.transfer_id_timeout.lock().expect("poisoned") = value;
        Ok(())
    }

    fn set_queue_capacity(&self, capacity: Option<usize>) {
        *self.queue_capacity.lock().expect("poisoned") = capacity;
    }
}

struct LoopbackOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    transport: Weak<Inner>,
    feedback_handler: Mutex<Option<FeedbackHandler>>,
    counters: SessionStatisticsCounters,
    closed: AtomicBool,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Session for LoopbackOutputSession {
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

impl OutputSession for LoopbackOutputSession {
    fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    fn send(&self, transfer: Transfer, _deadline: Instant) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed(format!(
                "output session {:?}",
                self.specifier
            )));
        }
        let Some(inner) = self.transport.upgrade() else {
            return Err(TransportError::ResourceClosed("loopback transport".into()));
        };
        let timestamp = Timestamp::now();
        let payload_bytes = cygnet_core::transfer::payload_length(&transfer.fragmented_payload);
        let delivered = TransferFrom {
            timestamp,
            priority: transfer.priority,
            transfer_id: transfer.transfer_id,
            fragmented_payload: transfer.fragmented_payload,
            source_node_id: inner.local_node_id,
        };
        inner.deliver(delivered, self.specifier.data_specifier);
        self.counters.add_transfer(1, payload_bytes as u64);
        if let Some(handler) = self.feedback_handler.lock().expect("poisoned").as_ref() {
            handler(Feedback {
                original_transfer_timestamp: transfer.timestamp,
                first_frame_transmission_timestamp: timestamp,
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
