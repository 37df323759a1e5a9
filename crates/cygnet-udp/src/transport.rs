use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, Socket, Type};

use cygnet_core::session::{InputSession, OutputSession};
use cygnet_core::tracer::CaptureHandler;
use cygnet_core::transport::{ProtocolParameters, Transport};
use cygnet_core::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Result,
    TransportError,
};

use crate::endpoint::{
    DEFAULT_TTL, MAX_DOMAIN_ID, SUBJECT_PORT, message_multicast_group, service_multicast_group,
    service_port,
};
use crate::session::{UdpInputSession, UdpOutputSession};
use crate::socket_reader::SocketReader;

/// Valid `mtu` range for [UdpTransportOptions]
pub const MTU_RANGE: std::ops::RangeInclusive<usize> = 1200..=9000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpTransportOptions {
    /// Cyphal/UDP domain-ID (0..=31); isolates independent networks on one IP network
    pub domain_id: u8,
    /// Maximum frame payload per datagram
    pub mtu: usize,
    /// Transfer multiplier for service output sessions; 2 enables deterministic data loss
    /// mitigation
    pub service_transfer_multiplier: u8,
}

impl Default for UdpTransportOptions {
    fn default() -> Self {
        Self {
            domain_id: 0,
            mtu: 1200,
            service_transfer_multiplier: 1,
        }
    }
}

struct Inner {
    local_ip: Ipv4Addr,
    local_node_id: Option<u16>,
    options: UdpTransportOptions,
    readers: Mutex<HashMap<DataSpecifier, SocketReader>>,
    inputs: Mutex<HashMap<InputSessionSpecifier, Arc<UdpInputSession>>>,
    outputs: Mutex<HashMap<OutputSessionSpecifier, Arc<UdpOutputSession>>>,
    capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
    capture_active: Arc<AtomicBool>,
    closed: AtomicBool,
}

/// A Cyphal/UDP transport bound to one local IP address
///
/// The local node-ID, when configured, is encoded in the 16 least significant bits of the local
/// address; peers recover it from the source address of received datagrams.
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    pub fn new(
        local_ip: Ipv4Addr,
        local_node_id: Option<u16>,
        options: UdpTransportOptions,
    ) -> Result<UdpTransport> {
        if !MTU_RANGE.contains(&options.mtu) {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "UDP MTU {} is outside {:?}",
                options.mtu, MTU_RANGE
            )));
        }
        if options.domain_id > MAX_DOMAIN_ID {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "domain-ID {} exceeds the maximum of {MAX_DOMAIN_ID}",
                options.domain_id
            )));
        }
        if options.service_transfer_multiplier == 0 {
            return Err(TransportError::InvalidTransportConfiguration(
                "the service transfer multiplier must be at least 1".into(),
            ));
        }
        Ok(UdpTransport {
            inner: Arc::new(Inner {
                local_ip,
                local_node_id,
                options,
                readers: Mutex::new(HashMap::new()),
                inputs: Mutex::new(HashMap::new()),
                outputs: Mutex::new(HashMap::new()),
                capture_handlers: Arc::default(),
                capture_active: Arc::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.inner.local_ip
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("UDP transport".into()));
        }
        Ok(())
    }

    /// The multicast group and port this data specifier is received on
    fn input_endpoint(&self, data_specifier: DataSpecifier) -> Result<SocketAddrV4> {
        match data_specifier {
            DataSpecifier::Message { subject_id } => Ok(SocketAddrV4::new(
                message_multicast_group(self.options.domain_id, subject_id),
                SUBJECT_PORT,
            )),
            DataSpecifier::Service { service_id, role } => {
                let Some(local_node_id) = self.local_node_id else {
                    return Err(TransportError::OperationNotDefinedForAnonymousNode(
                        "anonymous nodes cannot receive service transfers".into(),
                    ));
                };
                Ok(SocketAddrV4::new(
                    service_multicast_group(self.options.domain_id, local_node_id),
                    service_port(service_id, role),
                ))
            }
        }
    }

    /// Bind a multicast receive socket for one data specifier
    fn make_input_socket(&self, endpoint: SocketAddrV4) -> Result<UdpSocket> {
        let map_err = |e: std::io::Error| {
            TransportError::InvalidMediaConfiguration(format!(
                "failed to set up the input socket for {endpoint}: {e}"
            ))
        };
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        // Multiple sockets on one host may listen on the same service/subject port
        socket.set_reuse_address(true).map_err(map_err)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, endpoint.port()).into())
            .map_err(map_err)?;
        socket
            .join_multicast_v4(endpoint.ip(), &self.local_ip)
            .map_err(map_err)?;
        Ok(socket.into())
    }

    /// Bind a multicast transmit socket
    fn make_output_socket(&self) -> Result<UdpSocket> {
        let map_err = |e: std::io::Error| {
            TransportError::InvalidMediaConfiguration(format!(
                "failed to set up an output socket on {}: {e}",
                self.local_ip
            ))
        };
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        socket
            .bind(&SocketAddrV4::new(self.local_ip, 0).into())
            .map_err(map_err)?;
        socket.set_multicast_if_v4(&self.local_ip).map_err(map_err)?;
        socket
            .set_multicast_ttl_v4(DEFAULT_TTL)
            .map_err(map_err)?;
        socket.set_multicast_loop_v4(true).map_err(map_err)?;
        Ok(socket.into())
    }
}

impl Transport for UdpTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: u64::MAX,
            max_nodes: 0xFFFF,
            mtu: self.inner.options.mtu,
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

        let endpoint = self.inner.input_endpoint(specifier.data_specifier)?;
        let mut readers = self.inner.readers.lock().expect("poisoned");
        if !readers.contains_key(&specifier.data_specifier) {
            let socket = self.inner.make_input_socket(endpoint)?;
            let reader = SocketReader::new(
                socket,
                self.inner.local_ip,
                self.inner.local_node_id.is_none(),
                Arc::clone(&self.inner.capture_handlers),
                Arc::clone(&self.inner.capture_active),
            )
            .map_err(|e| {
                TransportError::InvalidMediaConfiguration(format!(
                    "failed to start the socket reader for {endpoint}: {e}"
                ))
            })?;
            readers.insert(specifier.data_specifier, reader);
        }
        let reader = readers
            .get(&specifier.data_specifier)
            .expect("just inserted");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.inputs.lock().expect("poisoned").remove(&specifier);
                let mut readers = inner.readers.lock().expect("poisoned");
                if let Some(reader) = readers.get(&specifier.data_specifier) {
                    reader.remove_listener(specifier.remote_node_id);
                    if !reader.has_listeners() {
                        // Closing joins the reader thread before the socket is released
                        readers.remove(&specifier.data_specifier);
                    }
                }
            }
        });
        let session = Arc::new(UdpInputSession::new(specifier, payload_metadata, finalizer));

        let listener_session = Arc::clone(&session);
        reader.add_listener(
            specifier.remote_node_id,
            Box::new(move |timestamp, source, frame| {
                listener_session.process_frame(timestamp, source, frame);
            }),
        )?;
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

        let destination = match specifier.data_specifier {
            DataSpecifier::Message { subject_id } => SocketAddrV4::new(
                message_multicast_group(self.inner.options.domain_id, subject_id),
                SUBJECT_PORT,
            ),
            DataSpecifier::Service { service_id, role } => {
                if self.inner.local_node_id.is_none() {
                    return Err(TransportError::OperationNotDefinedForAnonymousNode(
                        "anonymous nodes cannot emit service transfers".into(),
                    ));
                }
                let destination_node_id = specifier
                    .remote_node_id
                    .expect("service output sessions are unicast by construction");
                SocketAddrV4::new(
                    service_multicast_group(self.inner.options.domain_id, destination_node_id),
                    service_port(service_id, role),
                )
            }
        };
        let multiplier = if specifier.data_specifier.is_service() {
            self.inner.options.service_transfer_multiplier
        } else {
            1
        };

        let socket = self.inner.make_output_socket()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.outputs.lock().expect("poisoned").remove(&specifier);
            }
        });
        let session = Arc::new(UdpOutputSession::new(
            specifier,
            payload_metadata,
            socket,
            destination,
            self.inner.local_node_id,
            self.inner.options.mtu,
            multiplier,
            finalizer,
            Arc::clone(&self.inner.capture_handlers),
            Arc::clone(&self.inner.capture_active),
        ));
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
        let inputs: Vec<Arc<UdpInputSession>> = self
            .inner
            .inputs
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for session in inputs {
            cygnet_core::session::Session::close(&*session);
        }
        let outputs: Vec<Arc<UdpOutputSession>> = self
            .inner
            .outputs
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for session in outputs {
            cygnet_core::session::Session::close(&*session);
        }
        // Any readers left (their sessions closed above should have removed them) are shut down
        // here; SocketReader::close joins before releasing the socket
        self.inner.readers.lock().expect("poisoned").clear();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_option_validation() {
        let ip = Ipv4Addr::new(127, 0, 0, 99);
        for mtu in [0, 1199, 9001] {
            let options = UdpTransportOptions {
                mtu,
                ..Default::default()
            };
            assert!(matches!(
                UdpTransport::new(ip, Some(1), options),
                Err(TransportError::InvalidTransportConfiguration(_))
            ));
        }
        let options = UdpTransportOptions {
            domain_id: 32,
            ..Default::default()
        };
        assert!(UdpTransport::new(ip, Some(1), options).is_err());

        let transport = UdpTransport::new(ip, Some(1), UdpTransportOptions::default()).unwrap();
        let parameters = transport.protocol_parameters();
        assert_eq!(parameters.mtu, 1200);
        assert!(parameters.has_wide_transfer_id());
    }

    #[test]
    fn test_anonymous_service_sessions_rejected() {
        let transport = UdpTransport::new(
            Ipv4Addr::new(127, 0, 0, 99),
            None,
            UdpTransportOptions::default(),
        )
        .unwrap();
        let specifier = OutputSessionSpecifier::new(
            DataSpecifier::Service {
                service_id: 1,
                role: cygnet_core::ServiceRole::Request,
            },
            Some(2),
        )
        .unwrap();
        assert!(matches!(
            transport.output_session(specifier, PayloadMetadata::new(16)),
            Err(TransportError::OperationNotDefinedForAnonymousNode(_))
        ));
        let input = InputSessionSpecifier::new(
            DataSpecifier::Service {
                service_id: 1,
                role: cygnet_core::ServiceRole::Request,
            },
            None,
        );
        assert!(matches!(
            transport.input_session(input, PayloadMetadata::new(16)),
            Err(TransportError::OperationNotDefinedForAnonymousNode(_))
        ));
    }

    #[test]
    fn test_closed_transport_rejects_sessions() {
        let transport = UdpTransport::new(
            Ipv4Addr::new(127, 0, 0, 99),
            Some(1),
            UdpTransportOptions::default(),
        )
        .unwrap();
        transport.close();
        transport.close();
        let specifier =
            InputSessionSpecifier::new(DataSpecifier::Message { subject_id: 1 }, None);
        assert!(matches!(
            transport.input_session(specifier, PayloadMetadata::new(16)),
            Err(TransportError::ResourceClosed(_))
        ));
    }
}
