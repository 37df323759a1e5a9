pub mod factory;
pub mod loopback;
pub mod redundant;
pub mod stdio;

pub use factory::{ConfigMap, ConfigValue, make_transport};
pub use loopback::LoopbackTransport;
pub use redundant::RedundantTransport;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
