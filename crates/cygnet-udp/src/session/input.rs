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
pub struct UdpInputSessionStatistics {
    pub base: SessionStatistics,
    pub reassembly_errors: HashMap<ReassemblyError, u64>,
    pub reassembly_errors_per_source: HashMap<u16, u64>,
}

/// A promiscuous or selective Cyphal/UDP input session
///
/// The socket reader pushes parsed frames in from its thread; each source node gets its own
/// lazily created out-of-order-tolerant reassembler. Frames whose header declares an anonymous
/// source are accepted statelessly.
pub struct UdpInputSession {
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

impl UdpInputSession {
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

    #[must_use]
    pub fn sample_statistics_extended(&self) -> UdpInputSessionStatistics {
        let (by_kind, by_source) = self.reassembly_errors.lock().expect("poisoned").clone();
        UdpInputSessionStatistics {
            base: self.counters.sample(),
            reassembly_errors: by_kind,
            reassembly_errors_per_source: by_source,
        }
    }

    /// Feed one datagram's worth of frame from the socket reader
    ///
    /// `frame = None` means the datagram failed to parse; it is counted and dropped.
    pub fn process_frame(
        &self,
        timestamp: Timestamp,
        source_node_id: u16,
        frame: Option<&WireFrame>,
    ) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let Some(frame) = frame else {
            self.counters.add_error();
            return;
        };
        self.counters.add_frames(1);

        // An anonymous header overrides the address-derived source: such transfers are
        // stateless single frames
        if frame.source_node_id.is_none() {
            match construct_anonymous_transfer(timestamp, frame.clone()) {
                Some(transfer) => {
                    let payload_len = transfer.payload_length();
                    self.enqueue(transfer, payload_len);
                }
                None => self.counters.add_error(),
            }
            return;
        }

        let timeout = Duration::from_nanos(self.transfer_id_timeout_ns.load(Ordering::Relaxed));
        let mut errors: Vec<ReassemblyError> = Vec::new();
        let transfer = {
            let mut reassemblers = self.reassemblers.lock().expect("poisoned");
            let reassembler = reassemblers.entry(source_node_id).or_insert_with(|| {
                TransferReassembler::new(source_node_id, self.payload_metadata.extent())
            });
            reassembler.process_frame(timestamp, frame.clone(), timeout, &mut |e| errors.push(e))
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

impl Session for UdpInputSession {
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

impl InputSession for UdpInputSession {
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

#[cfg(test)]
mod tests {
    use cygnet_core::{DataSpecifier, Priority};
    use pretty_assertions::assert_eq;

    use super::*;

    fn session() -> UdpInputSession {
        UdpInputSession::new(
            InputSessionSpecifier::new(DataSpecifier::Message { subject_id: 7 }, None),
            PayloadMetadata::new(1024),
            Box::new(|| {}),
        )
    }

    fn mk_frame(source: Option<u16>, transfer_id: u64, index: u32, eot: bool, payload: Vec<u8>) -> WireFrame {
        WireFrame {
            priority: Priority::Nominal,
            source_node_id: source,
            destination_node_id: None,
            data_specifier: DataSpecifier::Message { subject_id: 7 },
            transfer_id,
            index,
            end_of_transfer: eot,
            user_data: 0,
            payload,
        }
    }

    fn with_crc(payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        out.extend_from_slice(
            &cygnet_core::crc::TransferCrc32::of(payload).to_le_bytes(),
        );
        out
    }

    #[test]
    fn test_out_of_order_reassembly_and_receive() {
        let session = session();
        let frames = cygnet_wire::serialize_transfer(
            &[b"0123456789".repeat(10)],
            40,
            |index, eot, payload| mk_frame(Some(5), 77, index, eot, payload),
        );
        // Deliver in reverse order; the transfer timestamp must be that of frame index 0
        let n = frames.len();
        assert!(n >= 3);
        for (i, frame) in frames.into_iter().enumerate().rev() {
            session.process_frame(Timestamp::new(0, 1000 + i as u64), 5, Some(&frame));
        }
        let transfer = session
            .receive(Instant::now() + Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(transfer.timestamp, Timestamp::new(0, 1000));
        assert_eq!(transfer.transfer_id, 77);
        assert_eq!(transfer.source_node_id, Some(5));
        assert_eq!(
            cygnet_core::transfer::concatenate(&transfer.fragmented_payload),
            b"0123456789".repeat(10)
        );
        let stats = session.sample_statistics();
        assert_eq!(stats.transfers, 1);
        assert_eq!(stats.frames, n as u64);
    }

    #[test]
    fn test_parse_failures_count_errors() {
        let session = session();
        session.process_frame(Timestamp::now(), 5, None);
        session.process_frame(Timestamp::now(), 5, None);
        let stats = session.sample_statistics();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn test_anonymous_header_overrides_source() {
        let session = session();
        let frame = mk_frame(None, 3, 0, true, with_crc(b"anon"));
        session.process_frame(Timestamp::new(0, 10), 5, Some(&frame));
        let transfer = session.receive(Instant::now()).unwrap().unwrap();
        assert_eq!(transfer.source_node_id, None);
        assert_eq!(transfer.fragmented_payload, vec![b"anon".to_vec()]);

        // An anonymous multi-frame frame is a protocol violation
        let bad = mk_frame(None, 4, 1, true, with_crc(b"anon"));
        session.process_frame(Timestamp::new(0, 20), 5, Some(&bad));
        assert!(session.receive(Instant::now()).unwrap().is_none());
        assert_eq!(session.sample_statistics().errors, 1);
    }

    #[test]
    fn test_deadline_in_past_polls_once() {
        let session = session();
        let before = Instant::now() - Duration::from_secs(1);
        assert!(session.receive(before).unwrap().is_none());
        let frame = mk_frame(Some(9), 0, 0, true, with_crc(b"queued"));
        session.process_frame(Timestamp::now(), 9, Some(&frame));
        // Past deadline still drains an already-queued transfer
        assert!(session.receive(before).unwrap().is_some());
    }

    #[test]
    fn test_close_then_drain() {
        let session = session();
        let frame = mk_frame(Some(9), 0, 0, true, with_crc(b"queued"));
        session.process_frame(Timestamp::now(), 9, Some(&frame));
        session.close();
        session.close();
        // The queued transfer is still readable, then closure surfaces
        assert!(session.receive(Instant::now()).unwrap().is_some());
        assert!(matches!(
            session.receive(Instant::now()),
            Err(TransportError::ResourceClosed(_))
        ));
    }

    #[test]
    fn test_timeout_setter_validation() {
        let session = session();
        assert!(session.set_transfer_id_timeout(Duration::ZERO).is_err());
        session
            .set_transfer_id_timeout(Duration::from_millis(250))
            .unwrap();
        assert_eq!(session.transfer_id_timeout(), Duration::from_millis(250));
        assert_eq!(
            UdpInputSession::new(
                InputSessionSpecifier::new(DataSpecifier::Message { subject_id: 7 }, None),
                PayloadMetadata::new(16),
                Box::new(|| {}),
            )
            .transfer_id_timeout(),
            Duration::from_secs(2)
        );
    }
}
