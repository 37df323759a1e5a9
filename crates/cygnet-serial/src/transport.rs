use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use cygnet_core::session::{InputSession, OutputSession};
use cygnet_core::tracer::CaptureHandler;
use cygnet_core::transport::{ProtocolParameters, Transport};
use cygnet_core::{
    InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Result, Timestamp,
    TransportError,
};
use cygnet_wire::WireFrame;

use crate::port::{ReadOutcome, SerialPort};
use crate::session::{SerialInputSession, SerialOutputSession};
use crate::stream::{StreamEvent, StreamParser};
use crate::tracer::SerialCapture;

const READ_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerialTransportOptions {
    /// Maximum frame payload per serial frame
    pub mtu: usize,
    /// Transfer multiplier for service output sessions
    pub service_transfer_multiplier: u8,
}

impl Default for SerialTransportOptions {
    fn default() -> Self {
        Self {
            mtu: 1024,
            service_transfer_multiplier: 1,
        }
    }
}

struct Inner {
    local_node_id: Option<u16>,
    options: SerialTransportOptions,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    port_name: String,
    inputs: Mutex<HashMap<InputSessionSpecifier, Arc<SerialInputSession>>>,
    outputs: Mutex<HashMap<OutputSessionSpecifier, Arc<SerialOutputSession>>>,
    capture_handlers: Arc<Mutex<Vec<CaptureHandler>>>,
    capture_active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
}

/// A Cyphal/serial transport bound to one byte-stream link
///
/// The link is shared by all nodes reachable through it; frames are routed by the node-IDs in
/// their headers.
pub struct SerialTransport {
    inner: Arc<Inner>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(
        port: Box<dyn SerialPort>,
        local_node_id: Option<u16>,
        options: SerialTransportOptions,
    ) -> Result<SerialTransport> {
        if options.mtu < 16 {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "serial MTU {} is too small to be useful",
                options.mtu
            )));
        }
        if options.service_transfer_multiplier == 0 {
            return Err(TransportError::InvalidTransportConfiguration(
                "the service transfer multiplier must be at least 1".into(),
            ));
        }
        let reader = port.try_clone().map_err(|e| {
            TransportError::InvalidMediaConfiguration(format!(
                "failed to clone the serial port: {e}"
            ))
        })?;
        let port_name = port.name().to_string();
        let inner = Arc::new(Inner {
            local_node_id,
            options,
            port: Arc::new(Mutex::new(port)),
            port_name: port_name.clone(),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            capture_handlers: Arc::default(),
            capture_active: Arc::default(),
            running: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let running = Arc::clone(&inner.running);
        let rx_thread = std::thread::Builder::new()
            .name(format!("serial_rx_{port_name}"))
            .spawn(move || receive_loop(weak, running, reader))
            .map_err(|e| {
                TransportError::InvalidMediaConfiguration(format!(
                    "failed to spawn the serial receive thread: {e}"
                ))
            })?;

        Ok(SerialTransport {
            inner,
            rx_thread: Mutex::new(Some(rx_thread)),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    /// Apply a link bit rate; zero keeps the current rate
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        if baud_rate == 0 {
            return Ok(());
        }
        self.inner
            .port
            .lock()
            .expect("poisoned")
            .set_baud_rate(baud_rate)
            .map_err(|e| TransportError::InvalidMediaConfiguration(e.to_string()))
    }
}

fn receive_loop(weak: Weak<Inner>, running: Arc<AtomicBool>, mut reader: Box<dyn SerialPort>) {
    let mut parser = StreamParser::new();
    let mut buffer = vec![0u8; READ_CHUNK];
    while running.load(Ordering::SeqCst) {
        let outcome = match reader.read(&mut buffer) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Serial receive failed, ceasing delivery: {e}");
                if let Some(inner) = weak.upgrade() {
                    inner.handle_link_loss();
                }
                return;
            }
        };
        match outcome {
            ReadOutcome::TimedOut => continue,
            ReadOutcome::Closed => {
                tracing::info!("Serial link closed, ceasing delivery");
                if let Some(inner) = weak.upgrade() {
                    inner.handle_link_loss();
                }
                return;
            }
            ReadOutcome::Data(size) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let timestamp = Timestamp::now();
                inner.emit_capture(timestamp, &buffer[..size]);
                let inner_for_frames = &inner;
                parser.push(&buffer[..size], |event| match event {
                    StreamEvent::Frame(frame) => inner_for_frames.route_frame(timestamp, frame),
                    StreamEvent::OutOfBand(junk) => {
                        tracing::trace!("Out-of-band stream data: {} bytes", junk.len());
                    }
                });
            }
        }
    }
}

impl Inner {
    fn emit_capture(&self, timestamp: Timestamp, fragment: &[u8]) {
        if !self.capture_active.load(Ordering::Relaxed) {
            return;
        }
        let capture = SerialCapture {
            timestamp,
            own: false,
            fragment: fragment.to_vec(),
        };
        for handler in self.capture_handlers.lock().expect("poisoned").iter() {
            handler.as_ref()(&capture);
        }
    }

    fn route_frame(&self, timestamp: Timestamp, frame: WireFrame) {
        // Frames addressed to another node are none of our business (broadcast has no
        // destination)
        if let Some(destination) = frame.destination_node_id
            && Some(destination) != self.local_node_id
        {
            return;
        }
        let specifier = |remote| InputSessionSpecifier::new(frame.data_specifier, remote);
        let (selective, promiscuous) = {
            let inputs = self.inputs.lock().expect("poisoned");
            (
                frame
                    .source_node_id
                    .and_then(|source| inputs.get(&specifier(Some(source))).cloned()),
                inputs.get(&specifier(None)).cloned(),
            )
        };
        match (selective, promiscuous) {
            (Some(a), Some(b)) => {
                a.process_frame(timestamp, frame.clone());
                b.process_frame(timestamp, frame);
            }
            (Some(a), None) => a.process_frame(timestamp, frame),
            (None, Some(b)) => b.process_frame(timestamp, frame),
            (None, None) => {}
        }
    }

    /// The link is gone: no more data will arrive, so let the input sessions drain and close
    fn handle_link_loss(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let inputs: Vec<Arc<SerialInputSession>> = self
            .inputs
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for session in inputs {
            cygnet_core::session::Session::close(&*session);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed("serial transport".into()));
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
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
        if specifier.data_specifier.is_service() && self.inner.local_node_id.is_none() {
            return Err(TransportError::OperationNotDefinedForAnonymousNode(
                "anonymous nodes cannot receive service transfers".into(),
            ));
        }
        let mut inputs = self.inner.inputs.lock().expect("poisoned");
        if let Some(existing) = inputs.get(&specifier) {
            return Ok(Arc::clone(existing) as Arc<dyn InputSession>);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.inputs.lock().expect("poisoned").remove(&specifier);
            }
        });
        let session = Arc::new(SerialInputSession::new(
            specifier,
            payload_metadata,
            finalizer,
        ));
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
        let multiplier = if specifier.data_specifier.is_service() {
            self.inner.options.service_transfer_multiplier
        } else {
            1
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let finalizer = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.outputs.lock().expect("poisoned").remove(&specifier);
            }
        });
        let session = Arc::new(SerialOutputSession::new(
            specifier,
            payload_metadata,
            Arc::clone(&self.inner.port),
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
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.rx_thread.lock().expect("poisoned").take() {
            let _ = thread.join();
        }
        let inputs: Vec<Arc<SerialInputSession>> = self
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
        let outputs: Vec<Arc<SerialOutputSession>> = self
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
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
