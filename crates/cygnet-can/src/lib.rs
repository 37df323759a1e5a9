pub mod dispatch;
pub mod frame;
pub mod identifier;
pub mod media;
pub mod reassembly;
pub mod serialize;
pub mod session;
pub mod tracer;
pub mod transport;

pub use frame::{CyphalFrame, TRANSFER_ID_MODULO, transfer_id_forward_distance};
pub use identifier::CanId;
pub use tracer::{CanCapture, CanTracer};
pub use transport::CanTransport;

/// Node-IDs on CAN are 7 bits wide
pub const MAX_NODE_ID: u8 = 127;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
