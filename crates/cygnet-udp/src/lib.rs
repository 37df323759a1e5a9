pub mod endpoint;
pub mod session;
pub mod socket_reader;
pub mod tracer;
pub mod transport;

pub use tracer::{UdpCapture, UdpTracer};
pub use transport::{UdpTransport, UdpTransportOptions};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
