use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use cygnet_core::session::{
    DEFAULT_TRANSFER_ID_TIMEOUT, InputSession, Session, SessionStatistics,
    SessionStatisticsCounters,
};
use cygnet_core::{
    InputSessionSpecifier, PayloadMetadata, Priority, Result, Timestamp, TransportError,
    TransferFrom,
};

use super::SessionFinalizer;
use crate::frame::CyphalFrame;
use crate::reassembly::{Outcome, ReassemblyError, TransferReassembler};

/// [SessionStatistics] plus the reassembly error breakdown
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CanInputSessionStatistics {
    pub base: SessionStatistics,
    /// Reassembly errors by kind, summed over all sources
    pub reassembly_errors: HashMap<ReassemblyError, u64>,
    /// Reassembly errors by source node-ID
    pub reassembly_errors_per_source: HashMap<u8, u64>,
}

/// A promiscuous or selective Cyphal/CAN input session
///
/// The owning transport pushes parsed frames in from the media thread; the application thread
/// blocks in [InputSession::receive]. Each source node gets its own lazily created reassembler;
/// reassemblers are never shared between sessions because their timeout settings may differ.
pub struct CanInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    queue: Mutex<VecDeque<TransferFrom>>,
    queue_capacity: Mutex<Option<usize>>,
    available: Condvar,
    closed: AtomicBool,
    transfer_id_timeout_ns: AtomicU64,
    reassemblers: Mutex<HashMap<u8, TransferReassembler>>,
    counters: SessionStatisticsCounters,
    reassembly_errors: Mutex<(HashMap<ReassemblyError, u64>, HashMap<u8, u64>)>,
    finalizer: Mutex<Option<SessionFinalizer>>,
}

impl CanInputSession {
    pub fn new(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        finalizer: SessionFinalizer,
    ) -> Self {
        Self {
            specifier,
            payload_metadata,
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: Mutex::new(None),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            transfer_id_timeout_ns: AtomicU64::new(DEFAULT_TRANSFER_ID_TIMEOUT.as_nanos() as u64),
            reassemblers: Mutex::new(HashMap::new()),
            counters: SessionStatisticsCounters::new(),
            reassembly_errors: Mutex::new((HashMap::new(), HashMap::new())),
            finalizer: Mutex::new(Some(finalizer)),
        }
    }

    #[inline]
    #[must_use]
    pub fn specifier(&self) -> InputSessionSpecifier {
        self.specifier
    }

    /// Statistics including the reassembly error breakdown
    #[must_use]
    pub fn sample_statistics_extended(&self) -> CanInputSessionStatistics {
        let (by_kind, by_source) = self.reassembly_errors.lock().expect("poisoned").clone();
        CanInputSessionStatistics {
            base: self.counters.sample(),
            reassembly_errors: by_kind,
            reassembly_errors_per_source: by_source,
        }
    }

    /// Feed one frame from the media thread
    ///
    /// `source_node_id` is `None` for anonymous frames, which can only be single-frame transfers
    /// and are accepted statelessly.
    pub fn push_frame(
        &self,
        timestamp: Timestamp,
        priority: Priority,
        source_node_id: Option<u8>,
        frame: CyphalFrame,
    ) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        self.counters.add_frames(1);
        match source_node_id {
            None => {
                // Anonymous transfers are stateless; anything but a single-frame transfer is a
                // protocol violation by the sender
                if frame.start_of_transfer && frame.end_of_transfer && frame.toggle_bit {
                    let payload_len = frame.padded_payload.len();
                    self.enqueue(
                        TransferFrom {
                            timestamp,
                            priority,
                            transfer_id: frame.transfer_id as u64,
                            fragmented_payload: vec![frame.padded_payload],
                            source_node_id: None,
                        },
                        payload_len,
                    );
                } else {
                    self.counters.add_error();
                }
            }
            Some(source) => {
                let timeout =
                    Duration::from_nanos(self.transfer_id_timeout_ns.load(Ordering::Relaxed));
                let mut reassemblers = self.reassemblers.lock().expect("poisoned");
                let reassembler = reassemblers.entry(source).or_insert_with(|| {
                    TransferReassembler::new(source, self.payload_metadata.extent())
                });
                match reassembler.process_frame(timestamp, priority, frame, timeout) {
                    Outcome::Incomplete => {}
                    Outcome::Error(error) => {
                        drop(reassemblers);
                        self.counters.add_error();
                        let mut errors = self.reassembly_errors.lock().expect("poisoned");
                        *errors.0.entry(error).or_insert(0) += 1;
                        *errors.1.entry(source).or_insert(0) += 1;
                        tracing::debug!(
                            "Reassembly error from node {source} on {:?}: {error:?}",
                            self.specifier.data_specifier
                        );
                    }
                    Outcome::Transfer(transfer) => {
                        drop(reassemblers);
                        let payload_len = transfer.payload_length();
                        self.enqueue(transfer, payload_len);
                    }
                }
            }
        }
    }

    /// Frames are counted as they arrive, so only the transfer and payload counters move here
    fn enqueue(&self, transfer: TransferFrom, payload_bytes: usize) {
        let fragments = transfer.fragmented_payload.len().max(1) as u64;
        let mut queue = self.queue.lock().expect("poisoned");
        let capacity = *self.queue_capacity.lock().expect("poisoned");
        if capacity.is_some_and(|cap| queue.len() >= cap) {
            // Backpressure: the consumer is not keeping up
            self.counters.add_drops(fragments);
            tracing::debug!(
                "Input queue full ({} transfers), dropping a transfer on {:?}",
                queue.len(),
                self.specifier.data_specifier
            );
            return;
        }
        self.counters.add_transfer(0, payload_bytes as u64);
        queue.push_back(transfer);
        drop(queue);
        self.available.notify_one();
    }
}

impl Session for CanInputSession {
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

impl InputSession for CanInputSession {
    fn specifier(&self) -> InputSessionSpecifier {
        self.specifier
    }

    fn receive(&self, deadline: Instant) -> Result<Option<TransferFrom>> {
        let mut queue = self.queue.lock().expect("poisoned");
        loop {
            // Queued transfers remain readable after closure until drained
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
                // Deadline reached (or in the past: the queue was polled once above)
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
        Duration::from_nanos(self.transfer_id_timeout_ns.load(Ordering::Relaxed))
    }

    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(TransportError::InvalidTransportConfiguration(
                "transfer-ID timeout must be positive".into(),
            ));
        }
        self.transfer_id_timeout_ns
            .store(value.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn set_queue_capacity(&self, capacity: Option<usize>) {
        *self.queue_capacity.lock().expect("poisoned") = capacity;
    }
}
