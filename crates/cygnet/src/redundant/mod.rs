//! Redundant transport aggregation
//!
//! A redundant transport presents N inferior transports as one: every outgoing transfer is
//! emitted through all of them, and incoming transfers are merged with per-source
//! deduplication, so a healthy network delivers each transfer exactly once no matter how many
//! interfaces carried it. The inferior set is fixed at construction.

mod deduplicator;

pub use deduplicator::Deduplicator;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cygnet_core::session::{
    DEFAULT_TRANSFER_ID_TIMEOUT, FeedbackHandler, InputSession, OutputSession, Session,
    SessionStatistics, SessionStatisticsCounters,
};
use cygnet_core::tracer::CaptureHandler;
use cygnet_core::transport::{ProtocolParameters, Transport};
use cygnet_core::{
    InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Result, Transfer,
    TransferFrom, TransportError,
};

/// How long each merge thread blocks in one inferior receive call
const PUMP_INTERVAL: Duration = Duration::from_millis(500);

struct Inner {
    inferiors: Vec<Arc<dyn Transport>>,
    parameters: ProtocolParameters,
    local_node_id: Option<u16>,
    inputs: Mutex<HashMap<InputSessionSpecifier, Arc<RedundantInputSession>>>,
    outputs: Mutex<HashMap<OutputSessionSpecifier, Arc<RedundantOutputSession>>>,
    closed: AtomicBool,
}

pub struct RedundantTransport {
    inner: Arc<Inner>,
}

impl RedundantTransport {
    /// Aggregate the given transports; they must agree on the local node-ID and on the
    /// transfer-ID regime (all cyclic with the same modulo, or all effectively unlimited)
    pub fn new(inferiors: Vec<Arc<dyn Transport>>) -> Result<RedundantTransport> {
        let Some(first) = inferiors.first() else {
            return Err(TransportError::InvalidTransportConfiguration(
                "a redundant transport needs at least one inferior".into(),
            ));
        };
        let local_node_id = first.local_node_id();
        let mut parameters = first.protocol_parameters();
        for inferior in &inferiors[1..] {
            if inferior.local_node_id() != local_node_id {
                return Err(TransportError::InvalidTransportConfiguration(format!(
                    "inferior transports disagree on the local node-ID: {:?} vs {:?}",
                    local_node_id,
                    inferior.local_node_id()
                )));
            }
            let other = inferior.protocol_parameters();
            if other.has_wide_transfer_id() != parameters.has_wide_transfer_id()
                || (!other.has_wide_transfer_id()
                    && other.transfer_id_modulo != parameters.transfer_id_modulo)
            {
                return Err(TransportError::InvalidTransportConfiguration(format!(
                    "incompatible transfer-ID moduli: {} vs {}",
                    parameters.transfer_id_modulo, other.transfer_id_modulo
                )));
            }
            parameters = ProtocolParameters {
                transfer_id_modulo: parameters.transfer_id_modulo.min(other.transfer_id_modulo),
                max_nodes: parameters.max_nodes.min(other.max_nodes),
                mtu: parameters.mtu.min(other.mtu),
            };
        }
        Ok(RedundantTransport {
            inner: Arc::new(Inner {
                inferiors,
                parameters,
                local_node_id,
                inputs: Mutex::new(HashMap::new()),
                outputs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn inferiors(&self) -> &[Arc<dyn Transport>] {
        &self.inner.inferiors
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("redundant transport".into()));
        }
        Ok(())
    }
}

impl Transport for RedundantTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        self.inner.parameters
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
        let mut inferior_sessions = Vec::with_capacity(self.inner.inferiors.len());
        for inferior in &self.inner.inferiors {
            inferior_sessions.push(inferior.input_session(specifier, payload_metadata)?);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let session = RedundantInputSession::start(
            specifier,
            payload_metadata,
            inferior_sessions,
            self.inner.parameters.transfer_id_modulo,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.inputs.lock().expect("poisoned").remove(&specifier);
                }
            }),
        );
        inputs.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>> {
        self.inner.check_open()?;
        let mut outputs = self.inner.outputs.lock().expect("poisoned");
        if let Some(existing) = outputs.get(&specifier) {
            return Ok(Arc::clone(existing) as Arc<dyn OutputSession>);
        }
        let mut inferior_sessions = Vec::with_capacity(self.inner.inferiors.len());
        for inferior in &self.inner.inferiors {
            inferior_sessions.push(inferior.output_session(specifier, payload_metadata)?);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let session = Arc::new(RedundantOutputSession {
            specifier,
            payload_metadata,
            inferior_sessions,
            counters: SessionStatisticsCounters::new(),
            closed: AtomicBool::new(false),
            finalizer: Mutex::new(Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
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
        // Captures remain transport-specific; register on every inferior
        for inferior in &self.inner.inferiors {
            inferior.begin_capture(Arc::clone(&handler))?;
        }
        Ok(())
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inputs: Vec<Arc<RedundantInputSession>> = self
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
        let outputs: Vec<Arc<RedundantOutputSession>> = self
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
        for inferior in &self.inner.inferiors {
            inferior.close();
        }
    }
}

impl Drop for RedundantTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Merges the inferior sessions' deliveries through a shared deduplicator
struct RedundantInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    inferior_sessions: Vec<Arc<dyn InputSession>>,
    queue: Mutex<VecDeque<TransferFrom>>,
    queue_capacity: Mutex<Option<usize>>,
    available: Condvar,
    closed: AtomicBool,
    transfer_id_timeout: Mutex<Duration>,
    deduplicator: Mutex<Deduplicator>,
    counters: SessionStatisticsCounters,
    threads: Mutex<Vec<JoinHandle<()>>>,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RedundantInputSession {
    fn start(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        inferior_sessions: Vec<Arc<dyn InputSession>>,
        transfer_id_modulo: u64,
        finalizer: Box<dyn FnOnce() + Send>,
    ) -> Arc<RedundantInputSession> {
        let session = Arc::new(RedundantInputSession {
            specifier,
            payload_metadata,
            inferior_sessions: inferior_sessions.clone(),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: Mutex::new(None),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            transfer_id_timeout: Mutex::new(DEFAULT_TRANSFER_ID_TIMEOUT),
            deduplicator: Mutex::new(Deduplicator::new(transfer_id_modulo)),
            counters: SessionStatisticsCounters::new(),
            threads: Mutex::new(Vec::new()),
            finalizer: Mutex::new(Some(finalizer)),
        });
        let mut threads = session.threads.lock().expect("poisoned");
        for (index, inferior) in inferior_sessions.into_iter().enumerate() {
            let weak = Arc::downgrade(&session);
            let thread = std::thread::Builder::new()
                .name(format!("redundant_rx_{index}"))
                .spawn(move || pump(weak, inferior))
                .expect("failed to spawn a merge thread");
            threads.push(thread);
        }
        drop(threads);
        session
    }

    fn merge(&self, transfer: TransferFrom) {
        let timeout = *self.transfer_id_timeout.lock().expect("poisoned");
        if !self
            .deduplicator
            .lock()
            .expect("poisoned")
            .accept(&transfer, timeout)
        {
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
        self.counters.add_transfer(0, payload_bytes);
        queue.push_back(transfer);
        drop(queue);
        self.available.notify_one();
    }
}

/// One merge thread per inferior session; exits when either side closes
fn pump(weak: Weak<RedundantInputSession>, inferior: Arc<dyn InputSession>) {
    loop {
        let deadline = Instant::now() + PUMP_INTERVAL;
        match inferior.receive(deadline) {
            Ok(Some(transfer)) => {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.merge(transfer);
            }
            Ok(None) => {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.closed.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

impl Session for RedundantInputSession {
    fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    /// Transfer counters are the merged session's own; frame and error counters aggregate over
    /// the inferiors
    fn sample_statistics(&self) -> SessionStatistics {
        let mut stats = self.counters.sample();
        for inferior in &self.inferior_sessions {
            let inferior_stats = inferior.sample_statistics();
            stats.frames += inferior_stats.frames;
            stats.errors += inferior_stats.errors;
        }
        stats
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for inferior in &self.inferior_sessions {
            inferior.close();
        }
        self.available.notify_all();
        if let Some(finalizer) = self.finalizer.lock().expect("poisoned").take() {
            finalizer();
        }
        // The pump threads observe the inferior closure (or the closed flag) and exit
        let threads = std::mem::take(&mut *self.threads.lock().expect("poisoned"));
        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl InputSession for RedundantInputSession {
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
        for inferior in &self.inferior_sessions {
            inferior.set_transfer_id_timeout(value)?;
        }
        Ok(())
    }

    fn set_queue_capacity(&self, capacity: Option<usize>) {
        *self.queue_capacity.lock().expect("poisoned") = capacity;
    }
}

/// Fans every transfer out to all inferior sessions
struct RedundantOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    inferior_sessions: Vec<Arc<dyn OutputSession>>,
    counters: SessionStatisticsCounters,
    closed: AtomicBool,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Session for RedundantOutputSession {
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
        for inferior in &self.inferior_sessions {
            inferior.close();
        }
        if let Some(finalizer) = self.finalizer.lock().expect("poisoned").take() {
            finalizer();
        }
    }
}

impl OutputSession for RedundantOutputSession {
    fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    /// Success when at least one inferior delivered before the deadline; failures of the rest
    /// are logged and counted, not raised
    fn send(&self, transfer: Transfer, deadline: Instant) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed(format!(
                "output session {:?}",
                self.specifier
            )));
        }
        let mut delivered = false;
        let mut first_error = None;
        for inferior in &self.inferior_sessions {
            match inferior.send(transfer.clone(), deadline) {
                Ok(true) => delivered = true,
                Ok(false) => self.counters.add_drops(1),
                Err(e) => {
                    self.counters.add_error();
                    tracing::warn!("Inferior transport send failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        if delivered {
            self.counters.add_transfer(
                0,
                cygnet_core::transfer::payload_length(&transfer.fragmented_payload) as u64,
            );
            Ok(true)
        } else if let Some(error) = first_error {
            Err(error)
        } else {
            Ok(false)
        }
    }

    fn enable_feedback(&self, handler: FeedbackHandler) {
        // The handler must be shareable across the inferiors
        let shared: Arc<dyn Fn(cygnet_core::session::Feedback) + Send + Sync> = Arc::from(handler);
        for inferior in &self.inferior_sessions {
            let shared = Arc::clone(&shared);
            inferior.enable_feedback(Box::new(move |feedback| shared.as_ref()(feedback)));
        }
    }

    fn disable_feedback(&self) {
        for inferior in &self.inferior_sessions {
            inferior.disable_feedback();
        }
    }
}
