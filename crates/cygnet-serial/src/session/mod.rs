mod input;
mod output;

pub use input::{SerialInputSession, SerialInputSessionStatistics};
pub use output::SerialOutputSession;

/// Invoked exactly once when a session is closed so the owning transport can drop its references
pub type SessionFinalizer = Box<dyn FnOnce() + Send>;
