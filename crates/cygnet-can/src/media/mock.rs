//! In-memory CAN bus for tests
//!
//! Every media attached to a [MockBus] sees the frames sent by every other attachment,
//! timestamped at the moment of transmission. Loopback-flagged frames are additionally echoed
//! back to their sender, as a real driver would for transmission timestamping.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use cygnet_core::Timestamp;

use super::{Envelope, FilterConfiguration, Media, MediaEvent, RxHandler};

#[derive(Default)]
struct BusState {
    handlers: Vec<(usize, RxHandler)>,
}

/// A shared in-memory bus; attach any number of [MockMedia] endpoints
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
    mtu: usize,
}

impl MockBus {
    pub fn new(mtu: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            mtu,
        }
    }

    pub fn attach(&self, name: &str) -> MockMedia {
        static NEXT_ENDPOINT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        MockMedia {
            name: name.to_string(),
            endpoint: NEXT_ENDPOINT.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            bus: self.state.clone(),
            mtu: self.mtu,
            filters: Mutex::new(Vec::new()),
            closed: false,
        }
    }
}

pub struct MockMedia {
    name: String,
    endpoint: usize,
    bus: Arc<Mutex<BusState>>,
    mtu: usize,
    filters: Mutex<Vec<FilterConfiguration>>,
    closed: bool,
}

impl MockMedia {
    /// The most recently configured acceptance filters, for assertions
    pub fn acceptance_filters(&self) -> Vec<FilterConfiguration> {
        self.filters.lock().expect("poisoned").clone()
    }
}

impl Media for MockMedia {
    fn interface_name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn number_of_acceptance_filters(&self) -> usize {
        4
    }

    fn start(&mut self, handler: RxHandler) -> eyre::Result<()> {
        let mut state = self.bus.lock().expect("poisoned");
        if state.handlers.iter().any(|(id, _)| *id == self.endpoint) {
            eyre::bail!("{}: receive already started", self.name);
        }
        state.handlers.push((self.endpoint, handler));
        Ok(())
    }

    fn configure_acceptance_filters(&mut self, filters: &[FilterConfiguration]) -> eyre::Result<()> {
        *self.filters.lock().expect("poisoned") = filters.to_vec();
        Ok(())
    }

    fn send(&mut self, envelopes: &[Envelope], _deadline: Instant) -> eyre::Result<usize> {
        if self.closed {
            eyre::bail!("{}: media is closed", self.name);
        }
        let timestamp = Timestamp::now();
        let mut state = self.bus.lock().expect("poisoned");
        for (endpoint, handler) in state.handlers.iter_mut() {
            let local = *endpoint == self.endpoint;
            let delivery: Vec<(Timestamp, Envelope)> = envelopes
                .iter()
                .filter(|e| if local { e.loopback } else { true })
                .map(|e| {
                    (
                        timestamp,
                        Envelope {
                            frame: e.frame.clone(),
                            // The loopback flag survives only on the echo to the sender
                            loopback: local,
                        },
                    )
                })
                .collect();
            if !delivery.is_empty() {
                handler(MediaEvent::Frames(delivery));
            }
        }
        Ok(envelopes.len())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.bus.lock().expect("poisoned");
        if let Some(position) = state.handlers.iter().position(|(id, _)| *id == self.endpoint) {
            let (_, mut handler) = state.handlers.remove(position);
            handler(MediaEvent::Closed);
        }
    }
}
