use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::specifier::{InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata};
use crate::time::Timestamp;
use crate::transfer::{Transfer, TransferFrom};

/// The default transfer-ID timeout
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// Transmission feedback delivered once per sent transfer when feedback is enabled
///
/// The application matches a feedback entry with its transfer by the original transfer timestamp;
/// priority and transfer-ID are unfit for matching (the former is rarely unique, the latter may be
/// reduced modulo the transport's limit).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Feedback {
    pub original_transfer_timestamp: Timestamp,
    pub first_frame_transmission_timestamp: Timestamp,
}

/// Feedback handlers may be invoked from any thread, including media I/O threads.
pub type FeedbackHandler = Box<dyn Fn(Feedback) + Send + Sync>;

/// Transport-agnostic session statistics snapshot
///
/// Sampling is eventually consistent: the counters are updated from both the application and the
/// media threads, and a snapshot is not required to be atomic across fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Successful transfer count
    pub transfers: u64,
    /// Transport frame count (CAN frames, UDP datagrams, serial packets)
    pub frames: u64,
    /// Payload bytes of successful transfers, excluding transport metadata and padding
    pub payload_bytes: u64,
    /// Failures of any kind, excluding drops
    pub errors: u64,
    /// Frames or transfers lost to queue overruns and expired deadlines
    pub drops: u64,
}

/// Lock-free counter block behind [SessionStatistics]
///
/// Relaxed ordering everywhere: the statistics contract is eventually-consistent sampling, not a
/// synchronization primitive.
#[derive(Debug, Default)]
pub struct SessionStatisticsCounters {
    transfers: AtomicU64,
    frames: AtomicU64,
    payload_bytes: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
}

impl SessionStatisticsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transfer(&self, frames: u64, payload_bytes: u64) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(frames, Ordering::Relaxed);
        self.payload_bytes.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn add_frames(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_drops(&self, drops: u64) {
        self.drops.fetch_add(drops, Ordering::Relaxed);
    }

    pub fn sample(&self) -> SessionStatistics {
        SessionStatistics {
            transfers: self.transfers.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// Behavior common to input and output sessions
pub trait Session: Send + Sync {
    fn payload_metadata(&self) -> PayloadMetadata;

    fn sample_statistics(&self) -> SessionStatistics;

    /// Idempotent. Unblocks pending calls; subsequent non-drain operations fail with
    /// [ResourceClosed](crate::TransportError::ResourceClosed).
    fn close(&self);
}

/// A promiscuous or selective input session
pub trait InputSession: Session {
    fn specifier(&self) -> InputSessionSpecifier;

    /// Block until a transfer completes, the deadline elapses (`Ok(None)`), or the session closes
    /// with an empty queue (`Err(ResourceClosed)`)
    ///
    /// A deadline in the past polls the queue once without yielding. Transfers queued before
    /// closure remain readable until drained.
    fn receive(&self, deadline: Instant) -> Result<Option<TransferFrom>>;

    fn transfer_id_timeout(&self) -> Duration;

    /// Rejects non-positive values
    fn set_transfer_id_timeout(&self, value: Duration) -> Result<()>;

    /// Bound the completed-transfer FIFO; `None` (the default) is unbounded. When the queue is
    /// full, newly completed transfers are dropped and counted.
    fn set_queue_capacity(&self, capacity: Option<usize>);
}

/// A broadcast or unicast output session
pub trait OutputSession: Session {
    fn specifier(&self) -> OutputSessionSpecifier;

    /// Send the transfer; `Ok(true)` when fully handed to the media before the deadline,
    /// `Ok(false)` on timeout (a multi-frame transfer may have been emitted partially)
    ///
    /// A deadline in the past attempts transmission without yielding.
    fn send(&self, transfer: Transfer, deadline: Instant) -> Result<bool>;

    /// Install a feedback handler, replacing any previous one
    fn enable_feedback(&self, handler: FeedbackHandler);

    fn disable_feedback(&self);
}

impl std::fmt::Debug for dyn OutputSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSession")
            .field("specifier", &self.specifier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_counters() {
        let counters = SessionStatisticsCounters::new();
        counters.add_transfer(3, 21);
        counters.add_transfer(1, 6);
        counters.add_frames(2);
        counters.add_error();
        counters.add_drops(4);
        assert_eq!(
            counters.sample(),
            SessionStatistics {
                transfers: 2,
                frames: 6,
                payload_bytes: 27,
                errors: 1,
                drops: 4,
            }
        );
    }
}
