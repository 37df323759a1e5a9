pub mod crc;
pub mod error;
pub mod session;
pub mod specifier;
pub mod time;
pub mod tracer;
pub mod transfer;
pub mod transport;

mod priority;

pub use error::{Result, TransportError};
pub use priority::Priority;
pub use specifier::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, ServiceRole,
};
pub use time::Timestamp;
pub use transfer::{FragmentedPayload, Transfer, TransferFrom};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
