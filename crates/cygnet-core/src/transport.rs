use std::sync::Arc;

use crate::error::Result;
use crate::session::{InputSession, OutputSession};
use crate::specifier::{InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata};
use crate::tracer::CaptureHandler;

/// Transport capabilities relevant to the upper layers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolParameters {
    /// Transfer-IDs are reduced modulo this value on the wire. 32 for CAN; 2^64 for the
    /// high-overhead transports (represented as `u64::MAX` wrapping, i.e. effectively unlimited).
    pub transfer_id_modulo: u64,
    /// Number of addressable nodes
    pub max_nodes: u32,
    /// Maximum payload bytes per frame
    pub mtu: usize,
}

impl ProtocolParameters {
    /// True when the transfer-ID space is wide enough that wraparound never matters in practice
    #[inline]
    #[must_use]
    pub fn has_wide_transfer_id(&self) -> bool {
        self.transfer_id_modulo >= 1 << 48
    }
}

/// A Cyphal transport instance: a session factory bound to one or more media interfaces
///
/// For any given session specifier the transport returns the same session object on repeated
/// requests until that session is explicitly closed.
pub trait Transport: Send + Sync {
    fn protocol_parameters(&self) -> ProtocolParameters;

    /// `None` when the local node is anonymous (it can only receive and emit single-frame
    /// messages)
    fn local_node_id(&self) -> Option<u16>;

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn InputSession>>;

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<Arc<dyn OutputSession>>;

    /// Specifiers of the currently open input sessions
    fn input_sessions(&self) -> Vec<InputSessionSpecifier>;

    /// Specifiers of the currently open output sessions
    fn output_sessions(&self) -> Vec<OutputSessionSpecifier>;

    /// Register a capture handler invoked for every transmitted and received link-layer event
    ///
    /// Multiple handlers may be registered; there is no way to unregister short of closing the
    /// transport. Enabling capture may reduce throughput.
    fn begin_capture(&self, handler: CaptureHandler) -> Result<()>;

    /// Idempotent. Closes all sessions and releases the media.
    fn close(&self);
}
