/// Transport-layer error taxonomy
///
/// Parsing failures and reassembly errors are deliberately absent: they are recovered locally and
/// surface only through session statistics, never through this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Transport-level configuration is unusable (MTU out of range, malformed interface string,
    /// conflicting redundancy)
    #[error("invalid transport configuration: {0}")]
    InvalidTransportConfiguration(String),

    /// Media-specific failure (bind failure, interface down, missing driver)
    #[error("invalid media configuration: {0}")]
    InvalidMediaConfiguration(String),

    /// The requested session kind is not representable on this transport, e.g. a broadcast service
    /// or a unicast message on CAN
    #[error("unsupported session configuration: {0}")]
    UnsupportedSessionConfiguration(String),

    /// Anonymous nodes cannot emit service transfers or multi-frame transfers
    #[error("operation not defined for anonymous node: {0}")]
    OperationNotDefinedForAnonymousNode(String),

    /// Use after close. `close()` itself is always idempotent.
    #[error("resource closed: {0}")]
    ResourceClosed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
