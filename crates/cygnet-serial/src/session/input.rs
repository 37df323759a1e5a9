use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use cygnet_core::session::{
    DEFAULT_TRANSFER_ID_TIMEOUT, InputSession, Session, SessionStatistics,
    SessionStatisticsCounters,
};
use cygnet_core::{
    InputSessionSpecifier, PayloadMetadata, Result, Timestamp, TransferFrom, TransportError,
};
use cygnet_wire::{
    ReassemblyError, TransferReassembler, WireFrame, construct_anonymous_transfer,
};

use super::SessionFinalizer;

/// [SessionStatistics] plus the reassembly error breakdown
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialInputSessionStatistics {
    pub base: SessionStatistics,
    pub reassembly_errors: HashMap<ReassemblyError, u64>,
    pub reassembly_errors_per_source: HashMap<u16, u64>,
}

/// A promiscuous or selective Cyphal/serial input session
///
/// Unlike UDP there is no addressing below the frame header, so the source node-ID comes from
/// the header itself. Anonymous frames are accepted statelessly.
pub struct SerialInputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    queue: Mutex<VecDeque<TransferFrom>>,
    queue_capacity: Mutex<Option<usize>>,
    available: Condvar,
    closed: AtomicBool,
    transfer_id_timeout_ns: AtomicU64,
    reassemblers: Mutex<HashMap<u16, TransferReassembler>>,
    counters: SessionStatisticsCounters,
    reassembly_errors: Mutex<(HashMap<ReassemblyError, u64>, HashMap<u16, u64>)>,
    finalizer: Mutex<Option<SessionFinalizer>>,
}

impl SerialInputSession {
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

    #[must_use]
    pub fn sample_statistics_extended(&self) -> SerialInputSessionStatistics {
        let (by_kind, by_source) = self.reassembly_errors.lock().expect("poisoned").clone();
        SerialInputSessionStatistics {
            base: self.counters.sample(),
            reassembly_errors: by_kind,
            reassembly_errors_per_source: by_source,
        }
    }

    /// Feed one frame from the link's receive thread; the transport has already verified that
    /// the frame matches this session's data specifier and source selection
    pub fn process_frame(&self, timestamp: Timestamp, frame: WireFrame) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        self.counters.add_frames(1);

        let Some(source_node_id) = frame.source_node_id else {
            match construct_anonymous_transfer(timestamp, frame) {
                Some(transfer) => {
                    let payload_len = transfer.payload_length();
                    self.enqueue(transfer, payload_len);
                }
                None => self.counters.add_error(),
            }
            return;
        };

        let timeout = Duration::from_nanos(self.transfer_id_timeout_ns.load(Ordering::Relaxed));
        let mut errors: Vec<ReassemblyError> = Vec::new();
        let transfer = {
            let mut reassemblers = self.reassemblers.lock().expect("poisoned");
            let reassembler = reassemblers.entry(source_node_id).or_insert_with(|| {
                TransferReassembler::new(source_node_id, self.payload_metadata.extent())
            });
            reassembler.process_frame(timestamp, frame, timeout, &mut |e| errors.push(e))
        };
        if !errors.is_empty() {
            let mut breakdown = self.reassembly_errors.lock().expect("poisoned");
            for error in errors {
                self.counters.add_error();
                *breakdown.0.entry(error).or_insert(0) += 1;
                *breakdown.1.entry(source_node_id).or_insert(0) += 1;
                tracing::debug!(
                    "Reassembly error from node {source_node_id} on {:?}: {error:?}",
                    self.specifier.data_specifier
                );
            }
        }
        if let Some(transfer) = transfer {
            let payload_len = transfer.payload_length();
            self.enqueue(transfer, payload_len);
        }
    }

    fn enqueue(&self, transfer: TransferFrom, payload_bytes: usize) {
        let fragments = transfer.fragmented_payload.len().max(1) as u64;
        let mut queue = self.queue.lock().expect("poisoned");
        let capacity = *self.queue_capacity.lock().expect("poisoned");
        if capacity.is_some_and(|cap| queue.len() >= cap) {
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

impl Session for SerialInputSession {
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

impl InputSession for SerialInputSession {
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
