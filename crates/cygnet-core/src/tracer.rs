//! Network capture and trace reconstruction model
//!
//! Transports optionally report every link-layer event through a capture hook. A [Tracer] is a
//! pure compute object (no I/O, no resources) that consumes those captures and reconstructs
//! transfers exchanged between arbitrary nodes on the network, including transfers the local node
//! is not a party to.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::priority::Priority;
use crate::specifier::DataSpecifier;
use crate::time::Timestamp;
use crate::transfer::{FragmentedPayload, payload_equals};

/// A transport-specific link-layer event
///
/// Opaque to everything but the matching tracer, which recovers the concrete type via
/// [Capture::as_any].
pub trait Capture: Send + Sync + std::fmt::Debug {
    fn timestamp(&self) -> Timestamp;

    fn as_any(&self) -> &dyn Any;
}

pub type CaptureHandler = Arc<dyn Fn(&dyn Capture) + Send + Sync>;

/// Session specifier of a captured transfer; unlike a local session specifier, both endpoints may
/// be remote nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AlienSessionSpecifier {
    /// `None` represents an anonymous transfer
    pub source_node_id: Option<u16>,
    /// `None` represents a broadcast transfer
    pub destination_node_id: Option<u16>,
    pub data_specifier: DataSpecifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlienTransferMetadata {
    pub priority: Priority,
    pub transfer_id: u64,
    pub session_specifier: AlienSessionSpecifier,
}

/// A transfer reconstructed from captured traffic
#[derive(Clone, Debug)]
pub struct AlienTransfer {
    pub metadata: AlienTransferMetadata,
    pub fragmented_payload: FragmentedPayload,
}

impl PartialEq for AlienTransfer {
    /// Payloads compare content-wise, ignoring fragmentation
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && payload_equals(&self.fragmented_payload, &other.fragmented_payload)
    }
}

impl Eq for AlienTransfer {}

/// High-level event reconstructed by a [Tracer]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    Transfer(TransferTrace),
    Error(ErrorTrace),
    OutOfBand(OutOfBandTrace),
}

/// A fully reassembled transfer, timestamped with its earliest frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferTrace {
    pub timestamp: Timestamp,
    pub transfer: AlienTransfer,
    /// The auto-deduced transfer-ID timeout in force for this session when the transfer
    /// completed; usable for downstream deduplication of redundant captures.
    pub transfer_id_timeout: Duration,
}

/// The tracer determined that a transfer cannot be reconstructed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorTrace {
    pub timestamp: Timestamp,
    pub error: String,
}

/// Stream-level junk or a malformed frame, reported verbatim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutOfBandTrace {
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

/// Reconstructs [Trace]s from [Capture]s
///
/// Tracers hold internal state only; to start over (e.g. for a new log file) discard the instance
/// and create a new one. Captures of a foreign transport type are ignored and yield `None`.
pub trait Tracer {
    fn update(&mut self, capture: &dyn Capture) -> Option<Trace>;
}

/// Heuristic transfer-ID timeout deduction from observed inter-transfer intervals
///
/// The timeout tracks twice the most recent inter-transfer interval, clamped to a sane range, so
/// that fast periodic sessions recover from transfer-ID reuse quickly while slow sessions are not
/// broken apart. Until two transfers have been observed the protocol default is reported.
#[derive(Debug)]
pub struct TransferIdTimeoutEstimator {
    last_transfer: Option<Timestamp>,
    current: Duration,
}

impl TransferIdTimeoutEstimator {
    pub const MIN: Duration = Duration::from_millis(1);
    pub const MAX: Duration = crate::session::DEFAULT_TRANSFER_ID_TIMEOUT;

    pub fn new() -> Self {
        Self {
            last_transfer: None,
            current: Self::MAX,
        }
    }

    /// The timeout currently in force
    #[inline]
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a completed transfer and return the updated timeout
    pub fn update(&mut self, timestamp: Timestamp) -> Duration {
        if let Some(last) = self.last_transfer {
            let interval = timestamp.monotonic_since(last);
            self.current = (interval * 2).clamp(Self::MIN, Self::MAX);
        }
        self.last_transfer = Some(timestamp);
        self.current
    }
}

impl Default for TransferIdTimeoutEstimator {
    fn default() -> Self {
        Self::new()
    }
}
