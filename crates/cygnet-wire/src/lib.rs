pub mod header;
pub mod reassembly;
pub mod serialize;

pub use header::{HEADER_SIZE, WireFrame};
pub use reassembly::{ReassemblyError, TransferReassembler, construct_anonymous_transfer};
pub use serialize::serialize_transfer;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
