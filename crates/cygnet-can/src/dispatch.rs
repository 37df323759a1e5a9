//! O(1) input session dispatch
//!
//! Received frames must be routed in bounded time even when thousands of sessions coexist, so the
//! table trades memory for latency: one dense slot per (data specifier, source node-ID or any)
//! combination, roughly 1.2 million slots. A parallel map provides constant-complexity session
//! enumeration; traversing the dense table takes forever.

use std::collections::HashMap;
use std::sync::Arc;

use cygnet_core::{DataSpecifier, InputSessionSpecifier, ServiceRole};

use crate::session::CanInputSession;

const NUM_SUBJECTS: usize = 8192;
const NUM_SERVICES: usize = 512;
const NUM_NODE_IDS: usize = 128;

/// Source node-ID axis, with one extra slot for promiscuous ("any source") sessions
const DIM2_CARDINALITY: usize = NUM_NODE_IDS + 1;

/// Subjects, then service requests, then service responses
const TABLE_SIZE: usize = (NUM_SUBJECTS + NUM_SERVICES * 2) * DIM2_CARDINALITY;

pub struct InputDispatchTable {
    table: Vec<Option<Arc<CanInputSession>>>,
    index: HashMap<InputSessionSpecifier, Arc<CanInputSession>>,
}

impl InputDispatchTable {
    pub fn new() -> Self {
        Self {
            table: vec![None; TABLE_SIZE],
            index: HashMap::new(),
        }
    }

    /// Constant-time lookup; invoked for every received frame
    #[inline]
    #[must_use]
    pub fn get(&self, specifier: &InputSessionSpecifier) -> Option<&Arc<CanInputSession>> {
        self.table[compute_index(specifier)].as_ref()
    }

    /// Used only when a session is created; performance is not a priority here
    pub fn add(&mut self, session: Arc<CanInputSession>) {
        let specifier = session.specifier();
        self.table[compute_index(&specifier)] = Some(Arc::clone(&session));
        self.index.insert(specifier, session);
    }

    /// Used only when a session is destroyed
    pub fn remove(&mut self, specifier: &InputSessionSpecifier) {
        self.table[compute_index(specifier)] = None;
        self.index.remove(specifier);
    }

    pub fn items(&self) -> impl Iterator<Item = &Arc<CanInputSession>> {
        self.index.values()
    }

    #[must_use]
    pub fn specifiers(&self) -> Vec<InputSessionSpecifier> {
        self.index.keys().copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for InputDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bijective mapping from session specifier to table slot
///
/// The caller guarantees in-range IDs (13-bit subject, 9-bit service, 7-bit node-ID); the CAN
/// transport validates them at session creation and frame identifiers cannot encode more bits.
fn compute_index(specifier: &InputSessionSpecifier) -> usize {
    let dim1 = match specifier.data_specifier {
        DataSpecifier::Message { subject_id } => subject_id as usize,
        DataSpecifier::Service { service_id, role } => match role {
            ServiceRole::Request => NUM_SUBJECTS + service_id as usize,
            ServiceRole::Response => NUM_SUBJECTS + NUM_SERVICES + service_id as usize,
        },
    };
    let dim2 = match specifier.remote_node_id {
        Some(node_id) => node_id as usize,
        None => NUM_NODE_IDS,
    };
    let point = dim1 * DIM2_CARDINALITY + dim2;
    debug_assert!(point < TABLE_SIZE);
    point
}
