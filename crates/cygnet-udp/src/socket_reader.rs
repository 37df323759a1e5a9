//! The UDP demultiplexing problem
//!
//! One socket serves one data specifier, and one reader thread serves one socket: there is no
//! portable way to ask the operating system to demultiplex by source for us. Each datagram is
//! timestamped, filtered against the local address (a node cannot tell its own looped-back
//! traffic from a node-ID conflict, so local-origin datagrams are silently dropped), mapped from
//! source IP to source node-ID, parsed, and handed to at most two listeners: the promiscuous one
//! and the selective one for that source.
//!
//! Closure is delicate: the socket must never be released while a read may still be blocked on
//! it, otherwise the file descriptor can be reused by a fresh socket and the stale thread would
//! consume datagrams destined for the new owner. The reader therefore signals the thread, joins
//! it, and only then drops the socket.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cygnet_core::tracer::CaptureHandler;
use cygnet_core::{Result, Timestamp, TransportError};
use cygnet_wire::WireFrame;

use crate::endpoint::unicast_ip_to_node_id;
use crate::tracer::UdpCapture;

/// How often the reader thread re-checks the shutdown flag while idle
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per libpcap wisdom, always sufficient for one datagram
const READ_SIZE: usize = 0xFFFF;

/// Datagram origins that could not be attributed to a live listener
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectedOrigin {
    /// Sender outside the local subnet; no node-ID mapping exists
    ForeignAddress(Ipv4Addr),
    /// Mapped node-ID, but nobody listens for it
    UnattendedNode(u16),
}

/// Incoming datagram statistics for one input socket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketReaderStatistics {
    /// Datagrams per source node-ID, regardless of frame validity
    pub accepted_datagrams: HashMap<u16, u64>,
    /// Datagrams that no listener consumed, keyed by origin
    pub dropped_datagrams: HashMap<RejectedOrigin, u64>,
}

/// Invoked with the timestamp, mapped source node-ID, and the parsed frame; `None` when the
/// datagram did not contain a valid frame, so the listener can count the error
pub type Listener = Box<dyn Fn(Timestamp, u16, Option<&WireFrame>) + Send + Sync>;

struct Shared {
    listeners: Mutex<HashMap<Option<u16>, Listener>>,
    statistics: Mutex<SocketReaderStatistics>,
    running: AtomicBool,
    local_ip: Ipv4Addr,
    /// When the local node is anonymous it cannot receive its own traffic, so local-origin
    /// datagrams are kept
    anonymous: bool,
    capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
    capture_active: Arc<AtomicBool>,
}

pub struct SocketReader {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    thread: Option<JoinHandle<()>>,
}

impl SocketReader {
    /// Takes unique ownership of the socket until [SocketReader::close]
    pub fn new(
        socket: UdpSocket,
        local_ip: Ipv4Addr,
        anonymous: bool,
        capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
        capture_active: Arc<AtomicBool>,
    ) -> std::io::Result<SocketReader> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let shared = Arc::new(Shared {
            listeners: Mutex::new(HashMap::new()),
            statistics: Mutex::new(SocketReaderStatistics::default()),
            running: AtomicBool::new(true),
            local_ip,
            anonymous,
            capture_handlers,
            capture_active,
        });
        let socket = Arc::new(socket);
        let thread_shared = Arc::clone(&shared);
        let thread_socket = Arc::clone(&socket);
        let thread = std::thread::Builder::new()
            .name(format!("socket_reader_{local_ip}"))
            .spawn(move || reader_thread(thread_shared, thread_socket))?;
        Ok(SocketReader {
            shared,
            socket,
            thread: Some(thread),
        })
    }

    /// At most one listener per source (and one promiscuous listener with `source = None`)
    pub fn add_listener(&self, source: Option<u16>, listener: Listener) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("socket reader".into()));
        }
        let mut listeners = self.shared.listeners.lock().expect("poisoned");
        if listeners.contains_key(&source) {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "a listener for source {source:?} is already registered"
            )));
        }
        listeners.insert(source, listener);
        Ok(())
    }

    pub fn remove_listener(&self, source: Option<u16>) {
        self.shared.listeners.lock().expect("poisoned").remove(&source);
    }

    /// When no listeners remain the reader can be closed and destroyed
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.shared.listeners.lock().expect("poisoned").is_empty()
    }

    #[must_use]
    pub fn sample_statistics(&self) -> SocketReaderStatistics {
        self.shared.statistics.lock().expect("poisoned").clone()
    }

    /// Stop the thread, join it, and only then release the socket
    pub fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // The socket drops here (or when the struct does), strictly after the join
    }
}

impl Drop for SocketReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_thread(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; READ_SIZE];
    while shared.running.load(Ordering::SeqCst) {
        let (size, origin) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::error!("Socket reader failed, ceasing delivery: {e}");
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        };
        let timestamp = Timestamp::now();
        let SocketAddr::V4(origin) = origin else {
            continue;
        };
        dispatch_datagram(&shared, timestamp, *origin.ip(), &buffer[..size]);
    }
}

fn dispatch_datagram(shared: &Shared, timestamp: Timestamp, source_ip: Ipv4Addr, datagram: &[u8]) {
    // Datagrams emitted by the local node itself are indistinguishable from a node-ID conflict;
    // they are dropped without any statistics update
    if !shared.anonymous && source_ip == shared.local_ip {
        return;
    }

    let source_node_id = unicast_ip_to_node_id(shared.local_ip, source_ip);
    let frame = WireFrame::parse(datagram);

    if shared.capture_active.load(Ordering::Relaxed) {
        let capture = UdpCapture {
            timestamp,
            own: false,
            source_node_id,
            datagram: datagram.to_vec(),
        };
        for handler in shared.capture_handlers.lock().expect("poisoned").iter() {
            handler.as_ref()(&capture);
        }
    }

    let mut statistics = shared.statistics.lock().expect("poisoned");
    let Some(source_node_id) = source_node_id else {
        *statistics
            .dropped_datagrams
            .entry(RejectedOrigin::ForeignAddress(source_ip))
            .or_insert(0) += 1;
        return;
    };

    // Each datagram goes to the promiscuous listener and to the selective listener for its
    // source; parse failures are delivered as None so the listeners can count them
    let listeners = shared.listeners.lock().expect("poisoned");
    let mut handled = false;
    for key in [None, Some(source_node_id)] {
        if let Some(listener) = listeners.get(&key) {
            handled = true;
            listener(timestamp, source_node_id, frame.as_ref());
        }
    }
    if handled {
        *statistics
            .accepted_datagrams
            .entry(source_node_id)
            .or_insert(0) += 1;
    } else {
        *statistics
            .dropped_datagrams
            .entry(RejectedOrigin::UnattendedNode(source_node_id))
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use cygnet_core::{DataSpecifier, Priority};

    fn reader_pair() -> (SocketReader, UdpSocket) {
        // Plain localhost unicast sockets; the dispatch logic does not care how the datagram
        // arrived
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = rx.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.connect(addr).unwrap();
        let reader = SocketReader::new(
            rx,
            // A local IP in the same /16 as the sender but a different host, so the sender maps
            // to a node-ID and is not mistaken for local traffic
            Ipv4Addr::new(127, 0, 255, 254),
            false,
            Arc::default(),
            Arc::default(),
        )
        .unwrap();
        (reader, tx)
    }

    fn frame() -> WireFrame {
        WireFrame {
            priority: Priority::Nominal,
            source_node_id: Some(1),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message { subject_id: 9 },
            transfer_id: 4,
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_dispatches_to_promiscuous_and_selective() {
        let (reader, tx) = reader_pair();
        let local_node_id = unicast_ip_to_node_id(
            Ipv4Addr::new(127, 0, 255, 254),
            match tx.local_addr().unwrap() {
                SocketAddr::V4(a) => *a.ip(),
                _ => unreachable!(),
            },
        )
        .unwrap();

        let (sender, receiver) = std::sync::mpsc::channel::<(Option<u16>, u16, bool)>();
        for key in [None, Some(local_node_id)] {
            let sender = sender.clone();
            reader
                .add_listener(
                    key,
                    Box::new(move |_ts, source, frame| {
                        sender.send((key, source, frame.is_some())).unwrap();
                    }),
                )
                .unwrap();
        }
        // A second promiscuous listener is rejected
        assert!(reader.add_listener(None, Box::new(|_, _, _| {})).is_err());

        tx.send(&frame().compile()).unwrap();
        let mut received = [
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        received.sort();
        assert_eq!(
            received,
            [
                (None, local_node_id, true),
                (Some(local_node_id), local_node_id, true)
            ]
        );

        // Garbage datagrams still reach the listeners, as None
        tx.send(b"garbage").unwrap();
        let (_key, source, valid) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(source, local_node_id);
        assert!(!valid);

        let stats = reader.sample_statistics();
        assert_eq!(stats.accepted_datagrams.get(&local_node_id), Some(&2));
        assert!(stats.dropped_datagrams.is_empty());
    }

    #[test]
    fn test_unattended_datagrams_are_counted() {
        let (reader, tx) = reader_pair();
        tx.send(&frame().compile()).unwrap();
        // No listeners: the datagram lands in the dropped map keyed by node-ID
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = reader.sample_statistics();
            if !stats.dropped_datagrams.is_empty() {
                assert!(
                    stats
                        .dropped_datagrams
                        .keys()
                        .all(|k| matches!(k, RejectedOrigin::UnattendedNode(_)))
                );
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never counted");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_close_is_idempotent_and_joins() {
        let (mut reader, _tx) = reader_pair();
        reader.close();
        reader.close();
        assert!(reader.add_listener(None, Box::new(|_, _, _| {})).is_err());
    }
}
