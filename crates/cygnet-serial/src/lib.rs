pub mod cobs;
pub mod port;
pub mod session;
pub mod stream;
pub mod tracer;
pub mod transport;

pub use port::{PipePort, ReadOutcome, SerialPort, TcpPort, pipe_pair};
pub use tracer::{SerialCapture, SerialTracer};
pub use transport::{SerialTransport, SerialTransportOptions};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
