use std::net::{SocketAddrV4, UdpSocket};
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
use crate::tracer::UdpCapture;

/// A broadcast or unicast Cyphal/UDP output session
///
/// Owns its transmit socket. For unreliable networks the session supports a transfer multiplier:
/// after the first (timestamped) copy the same frames are retransmitted back-to-back; the first
/// success counts as transfer success and errors in the redundant copies are suppressed.
pub struct UdpOutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    socket: UdpSocket,
    destination: SocketAddrV4,
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

impl UdpOutputSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        socket: UdpSocket,
        destination: SocketAddrV4,
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
            socket,
            destination,
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

    fn emit_capture(&self, timestamp: Timestamp, datagram: &[u8]) {
        if !self.capture_active.load(Ordering::Relaxed) {
            return;
        }
        let capture = UdpCapture {
            timestamp,
            own: true,
            source_node_id: self.local_node_id,
            datagram: datagram.to_vec(),
        };
        for handler in self.capture_handlers.lock().expect("poisoned").iter() {
            handler.as_ref()(&capture);
        }
    }
}

impl Session for UdpOutputSession {
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

impl OutputSession for UdpOutputSession {
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

        let datagrams: Vec<Vec<u8>> = frames.iter().map(WireFrame::compile).collect();
        let mut first_frame_timestamp = None;
        for (i, datagram) in datagrams.iter().enumerate() {
            // Frames after the first yield to the deadline; a partial transfer on the wire is
            // the receiver's problem by design
            if i > 0 && Instant::now() > deadline {
                self.counters.add_drops((datagrams.len() - i) as u64);
                return Ok(false);
            }
            self.socket
                .send_to(datagram, self.destination)
                .map_err(|e| {
                    self.counters.add_error();
                    TransportError::InvalidMediaConfiguration(format!(
                        "UDP send to {} failed: {e}",
                        self.destination
                    ))
                })?;
            let timestamp = Timestamp::now();
            if i == 0 {
                first_frame_timestamp = Some(timestamp);
            }
            self.emit_capture(timestamp, datagram);
        }

        // Temporal redundancy: retransmit the whole transfer back-to-back; failures here are
        // logged, counted, and otherwise suppressed
        for _ in 1..self.multiplier {
            for datagram in &datagrams {
                if let Err(e) = self.socket.send_to(datagram, self.destination) {
                    self.counters.add_error();
                    tracing::debug!("Redundant copy send failed, suppressed: {e}");
                    break;
                }
                self.emit_capture(Timestamp::now(), datagram);
            }
        }

        self.counters.add_transfer(
            datagrams.len() as u64,
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

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use cygnet_core::{DataSpecifier, Priority, ServiceRole};
    use pretty_assertions::assert_eq;

    use super::*;

    /// A session aimed at a plain localhost socket; the session does not care that the
    /// destination is unicast
    fn session_to_local_sink(multiplier: u8) -> (UdpOutputSession, UdpSocket) {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let destination = match sink.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let specifier = OutputSessionSpecifier::new(
            DataSpecifier::Service {
                service_id: 11,
                role: ServiceRole::Response,
            },
            Some(63),
        )
        .unwrap();
        let session = UdpOutputSession::new(
            specifier,
            PayloadMetadata::new(1024),
            socket,
            destination,
            Some(42),
            1200,
            multiplier,
            Box::new(|| {}),
            Arc::default(),
            Arc::default(),
        );
        (session, sink)
    }

    fn recv(sink: &UdpSocket) -> Vec<u8> {
        let mut buffer = vec![0u8; 0xFFFF];
        let (size, _) = sink.recv_from(&mut buffer).unwrap();
        buffer.truncate(size);
        buffer
    }

    #[test]
    fn test_single_frame_service_response() {
        let (session, sink) = session_to_local_sink(1);
        let sent = session
            .send(
                Transfer {
                    timestamp: Timestamp::now(),
                    priority: Priority::Nominal,
                    transfer_id: 1234567890,
                    fragmented_payload: vec![b"Hello world!".to_vec()],
                },
                Instant::now() + Duration::from_secs(1),
            )
            .unwrap();
        assert!(sent);

        let datagram = recv(&sink);
        let frame = WireFrame::parse(&datagram).unwrap();
        assert_eq!(frame.source_node_id, Some(42));
        assert_eq!(frame.destination_node_id, Some(63));
        assert_eq!(frame.transfer_id, 1234567890);
        assert!(frame.single_frame_transfer());
        assert_eq!(
            frame.data_specifier,
            DataSpecifier::Service {
                service_id: 11,
                role: ServiceRole::Response
            }
        );
        // Trailing 4 bytes are the transfer CRC
        assert_eq!(&frame.payload[..frame.payload.len() - 4], b"Hello world!");

        let stats = session.sample_statistics();
        assert_eq!(stats.transfers, 1);
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.payload_bytes, 12);
    }

    #[test]
    fn test_transfer_multiplier_duplicates_frames() {
        let (session, sink) = session_to_local_sink(2);
        assert!(
            session
                .send(
                    Transfer {
                        timestamp: Timestamp::now(),
                        priority: Priority::Nominal,
                        transfer_id: 5,
                        fragmented_payload: vec![b"dup".to_vec()],
                    },
                    Instant::now() + Duration::from_secs(1),
                )
                .unwrap()
        );
        let first = recv(&sink);
        let second = recv(&sink);
        assert_eq!(first, second);
        // One transfer, despite two copies on the wire
        assert_eq!(session.sample_statistics().transfers, 1);
    }

    #[test]
    fn test_feedback_reports_first_frame_timestamp() {
        let (session, _sink) = session_to_local_sink(1);
        let feedback: Arc<Mutex<Vec<Feedback>>> = Arc::default();
        let sink = Arc::clone(&feedback);
        session.enable_feedback(Box::new(move |f| sink.lock().unwrap().push(f)));

        let original = Timestamp::now();
        session
            .send(
                Transfer {
                    timestamp: original,
                    priority: Priority::Nominal,
                    transfer_id: 6,
                    fragmented_payload: vec![vec![0; 3000]],
                },
                Instant::now() + Duration::from_secs(1),
            )
            .unwrap();
        let feedback = feedback.lock().unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].original_transfer_timestamp, original);
        assert!(
            feedback[0].first_frame_transmission_timestamp.monotonic_ns()
                >= original.monotonic_ns()
        );
    }

    #[test]
    fn test_closed_session_rejects_send() {
        let (session, _sink) = session_to_local_sink(1);
        session.close();
        session.close();
        let err = session
            .send(
                Transfer {
                    timestamp: Timestamp::now(),
                    priority: Priority::Nominal,
                    transfer_id: 0,
                    fragmented_payload: vec![],
                },
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::ResourceClosed(_)));
    }
}
