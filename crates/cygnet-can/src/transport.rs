use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cygnet_core::session::{InputSession, OutputSession};
use cygnet_core::tracer::CaptureHandler;
use cygnet_core::transport::{ProtocolParameters, Transport};
use cygnet_core::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Result,
    ServiceRole, TransportError,
};

use crate::MAX_NODE_ID;
use crate::dispatch::InputDispatchTable;
use crate::frame::{CyphalFrame, TRANSFER_ID_MODULO};
use crate::identifier::CanId;
use crate::media::{
    Envelope, FilterConfiguration, FrameFormat, Media, MediaEvent, VALID_DATA_LENGTHS,
    optimize_filter_configurations,
};
use crate::session::{CanInputSession, CanOutputSession};
use crate::tracer::CanCapture;

const SERVICE_NOT_MESSAGE_BIT: u32 = 1 << 25;
const REQUEST_NOT_RESPONSE_BIT: u32 = 1 << 24;

struct SessionRegistry {
    inputs: InputDispatchTable,
    outputs: HashMap<OutputSessionSpecifier, Arc<CanOutputSession>>,
}

struct Inner {
    local_node_id: Option<u8>,
    /// Media data field capacity (8 or 64); frame payload capacity is one less (tail byte)
    mtu: usize,
    media: Mutex<Box<dyn Media>>,
    sessions: Mutex<SessionRegistry>,
    capture_handlers: Mutex<Vec<CaptureHandler>>,
    capture_active: AtomicBool,
    closed: AtomicBool,
}

/// A Cyphal/CAN transport bound to one CAN bus attachment
pub struct CanTransport {
    inner: Arc<Inner>,
}

impl CanTransport {
    /// Take ownership of the media and begin reception
    pub fn new(media: Box<dyn Media>, local_node_id: Option<u8>) -> Result<CanTransport> {
        if let Some(node_id) = local_node_id
            && node_id > MAX_NODE_ID
        {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "node-ID {node_id} exceeds the CAN limit of {MAX_NODE_ID}"
            )));
        }
        let mtu = media.mtu();
        if !VALID_DATA_LENGTHS.contains(&mtu) || mtu < 8 {
            return Err(TransportError::InvalidMediaConfiguration(format!(
                "media MTU {mtu} is not a valid CAN data length"
            )));
        }
        let inner = Arc::new(Inner {
            local_node_id,
            mtu,
            media: Mutex::new(media),
            sessions: Mutex::new(SessionRegistry {
                inputs: InputDispatchTable::new(),
                outputs: HashMap::new(),
            }),
            capture_handlers: Mutex::new(Vec::new()),
            capture_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .media
            .lock()
            .expect("poisoned")
            .start(Box::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.process_media_event(event);
                }
            }))
            .map_err(|e| TransportError::InvalidMediaConfiguration(e.to_string()))?;

        Ok(CanTransport { inner })
    }

    /// The name of the underlying media interface
    pub fn interface_name(&self) -> String {
        self.inner
            .media
            .lock()
            .expect("poisoned")
            .interface_name()
            .to_string()
    }
}

impl Inner {
    fn process_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::Closed => {
                // The media will deliver nothing further (e.g. a replay log ran out). Close the
                // input sessions so pending receive calls drain their queues and then report
                // closure.
                self.closed.store(true, Ordering::SeqCst);
                let inputs: Vec<Arc<CanInputSession>> = {
                    let registry = self.sessions.lock().expect("poisoned");
                    registry.inputs.items().cloned().collect()
                };
                for session in inputs {
                    cygnet_core::session::Session::close(&*session);
                }
            }
            MediaEvent::Frames(batch) => {
                for (timestamp, envelope) in batch {
                    self.process_frame(timestamp, envelope);
                }
            }
        }
    }

    fn process_frame(self: &Arc<Self>, timestamp: cygnet_core::Timestamp, envelope: Envelope) {
        if self.capture_active.load(Ordering::Relaxed) {
            let capture = CanCapture {
                timestamp,
                frame: envelope.frame.clone(),
                own: envelope.loopback,
            };
            for handler in self.capture_handlers.lock().expect("poisoned").iter() {
                handler.as_ref()(&capture);
            }
        }

        // Non-Cyphal frames are dropped without note; the bus may be shared with other protocols
        let Some(frame) = CyphalFrame::parse(&envelope.frame) else {
            return;
        };
        let Some(can_id) = CanId::parse(envelope.frame.identifier) else {
            return;
        };

        if envelope.loopback {
            let outputs: Vec<Arc<CanOutputSession>> = {
                let registry = self.sessions.lock().expect("poisoned");
                registry.outputs.values().cloned().collect()
            };
            for session in outputs {
                session.handle_loopback_frame(timestamp, &frame);
            }
            return;
        }

        // Service transfers not addressed to this node are not ours to reassemble
        if let Some(destination) = can_id.destination_node_id()
            && Some(destination) != self.local_node_id
        {
            return;
        }

        let data_specifier = can_id.data_specifier();
        let source_node_id = can_id.source_node_id();
        let (selective, promiscuous) = {
            let registry = self.sessions.lock().expect("poisoned");
            let selective = source_node_id.and_then(|source| {
                registry
                    .inputs
                    .get(&InputSessionSpecifier::new(
                        data_specifier,
                        Some(source as u16),
                    ))
                    .cloned()
            });
            let promiscuous = registry
                .inputs
                .get(&InputSessionSpecifier::new(data_specifier, None))
                .cloned();
            (selective, promiscuous)
        };

        // When both a selective and a promiscuous session match, both receive the transfer
        let priority = can_id.priority();
        match (selective, promiscuous) {
            (Some(a), Some(b)) => {
                a.push_frame(timestamp, priority, source_node_id, frame.clone());
                b.push_frame(timestamp, priority, source_node_id, frame);
            }
            (Some(a), None) => a.push_frame(timestamp, priority, source_node_id, frame),
            (None, Some(b)) => b.push_frame(timestamp, priority, source_node_id, frame),
            (None, None) => {}
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("CAN transport".into()));
        }
        Ok(())
    }

    /// Validate that the specifier's IDs are representable in the 29-bit identifier
    fn check_ids(
        &self,
        data_specifier: DataSpecifier,
        remote_node_id: Option<u16>,
    ) -> Result<()> {
        match data_specifier {
            DataSpecifier::Message { subject_id } => {
                if subject_id > cygnet_core::specifier::SUBJECT_ID_MASK {
                    return Err(TransportError::UnsupportedSessionConfiguration(format!(
                        "subject-ID {subject_id} does not fit the CAN identifier"
                    )));
                }
            }
            DataSpecifier::Service { service_id, .. } => {
                if service_id > cygnet_core::specifier::SERVICE_ID_MASK {
                    return Err(TransportError::UnsupportedSessionConfiguration(format!(
                        "service-ID {service_id} does not fit the CAN identifier"
                    )));
                }
            }
        }
        if let Some(remote) = remote_node_id
            && remote > MAX_NODE_ID as u16
        {
            return Err(TransportError::UnsupportedSessionConfiguration(format!(
                "remote node-ID {remote} exceeds the CAN limit of {MAX_NODE_ID}"
            )));
        }
        Ok(())
    }

    /// Regenerate the acceptance filter configuration from the set of live input sessions
    fn refresh_acceptance_filters(&self) {
        // A closing transport holds the media lock while joining the receive thread; do not
        // contend for it from session finalizers at that point
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let specifiers = {
            let registry = self.sessions.lock().expect("poisoned");
            registry.inputs.specifiers()
        };
        let mut filters: Vec<FilterConfiguration> = Vec::new();
        for specifier in specifiers {
            let filter = match specifier.data_specifier {
                DataSpecifier::Message { subject_id } => FilterConfiguration {
                    identifier: (subject_id as u32) << 9,
                    mask: SERVICE_NOT_MESSAGE_BIT | (0x1FFF << 9),
                    format: Some(FrameFormat::Extended),
                },
                DataSpecifier::Service { service_id, role } => {
                    let Some(local) = self.local_node_id else {
                        // Anonymous nodes cannot be addressed by service transfers
                        continue;
                    };
                    let rnr = match role {
                        ServiceRole::Request => REQUEST_NOT_RESPONSE_BIT,
                        ServiceRole::Response => 0,
                    };
                    FilterConfiguration {
                        identifier: SERVICE_NOT_MESSAGE_BIT
                            | rnr
                            | (service_id as u32) << 14
                            | (local as u32) << 7,
                        mask: SERVICE_NOT_MESSAGE_BIT
                            | REQUEST_NOT_RESPONSE_BIT
                            | (0x1FF << 14)
                            | (0x7F << 7),
                        format: Some(FrameFormat::Extended),
                    }
                }
            };
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }
        let mut media = self.media.lock().expect("poisoned");
        let filters = optimize_filter_configurations(&filters, media.number_of_acceptance_filters());
        if let Err(e) = media.configure_acceptance_filters(&filters) {
            tracing::warn!("Failed to configure acceptance filters: {e}");
        }
    }
}

impl Transport for CanTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TRANSFER_ID_MODULO as u64,
            max_nodes: MAX_NODE_ID as u32 + 1,
            mtu: self.inner.mtu - 1,
        }
    }

    fn local_node_id(&self) -> Option<u16> {
        self.inner.local_node_id.map(u16::from)
    }

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>> {
        self.inner.check_open()?;
        self.inner
            .check_ids(specifier.data_specifier, specifier.remote_node_id)?;
        let session = {
            let mut registry = self.inner.sessions.lock().expect("poisoned");
            if let Some(existing) = registry.inputs.get(&specifier) {
                return Ok(Arc::clone(existing) as Arc<dyn InputSession>);
            }
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let finalizer = Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .sessions
                        .lock()
                        .expect("poisoned")
                        .inputs
                        .remove(&specifier);
                    inner.refresh_acceptance_filters();
                }
            });
            let session = Arc::new(CanInputSession::new(specifier, payload_metadata, finalizer));
            registry.inputs.add(Arc::clone(&session));
            session
        };
        self.inner.refresh_acceptance_filters();
        Ok(session)
    }

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>> {
        self.inner.check_open()?;
        self.inner
            .check_ids(specifier.data_specifier, specifier.remote_node_id)?;
        match specifier.data_specifier {
            DataSpecifier::Message { .. } if specifier.remote_node_id.is_some() => {
                return Err(TransportError::UnsupportedSessionConfiguration(
                    "unicast message transfers are not defined on CAN".into(),
                ));
            }
            DataSpecifier::Service { .. } if self.inner.local_node_id.is_none() => {
                return Err(TransportError::OperationNotDefinedForAnonymousNode(
                    "anonymous nodes cannot participate in service transfers".into(),
                ));
            }
            _ => {}
        }

        let mut registry = self.inner.sessions.lock().expect("poisoned");
        if let Some(existing) = registry.outputs.get(&specifier) {
            return Ok(Arc::clone(existing) as Arc<dyn OutputSession>);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .sessions
                    .lock()
                    .expect("poisoned")
                    .outputs
                    .remove(&specifier);
            }
        });
        let send_weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let send_handler = Box::new(move |envelopes: &[Envelope], deadline| {
            let Some(inner) = send_weak.upgrade() else {
                return Err(TransportError::ResourceClosed("CAN transport".into()));
            };
            inner.check_open()?;
            // Capture mode loops every transmitted frame back so the sniffer sees its own
            // traffic with transmission timestamps
            let envelopes: Vec<Envelope> = if inner.capture_active.load(Ordering::Relaxed) {
                envelopes
                    .iter()
                    .map(|e| Envelope {
                        frame: e.frame.clone(),
                        loopback: true,
                    })
                    .collect()
            } else {
                envelopes.to_vec()
            };
            let mut media = inner.media.lock().expect("poisoned");
            let sent = media
                .send(&envelopes, deadline)
                .map_err(|e| TransportError::InvalidMediaConfiguration(e.to_string()))?;
            Ok(sent == envelopes.len())
        });
        let session = Arc::new(CanOutputSession::new(
            specifier,
            payload_metadata,
            self.inner.local_node_id,
            self.inner.mtu - 1,
            send_handler,
            finalizer,
        ));
        registry.outputs.insert(specifier, Arc::clone(&session));
        Ok(session)
    }

    fn input_sessions(&self) -> Vec<InputSessionSpecifier> {
        self.inner
            .sessions
            .lock()
            .expect("poisoned")
            .inputs
            .specifiers()
    }

    fn output_sessions(&self) -> Vec<OutputSessionSpecifier> {
        self.inner
            .sessions
            .lock()
            .expect("poisoned")
            .outputs
            .keys()
            .copied()
            .collect()
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
        let (inputs, outputs) = {
            let registry = self.inner.sessions.lock().expect("poisoned");
            (
                registry.inputs.items().cloned().collect::<Vec<_>>(),
                registry.outputs.values().cloned().collect::<Vec<_>>(),
            )
        };
        for session in inputs {
            cygnet_core::session::Session::close(&*session);
        }
        for session in outputs {
            cygnet_core::session::Session::close(&*session);
        }
        self.inner.media.lock().expect("poisoned").close();
    }
}

impl Drop for CanTransport {
    fn drop(&mut self) {
        self.close();
    }
}
