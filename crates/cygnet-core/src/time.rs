use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A paired (wall-clock, monotonic) timestamp with nanosecond resolution
///
/// The wall-clock half is for humans and logs; the monotonic half is what all protocol timing
/// decisions (transfer-ID timeouts, deadlines) are made against. Both halves are sampled from the
/// same instant when a [Timestamp] is taken with [Timestamp::now].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    system_ns: u64,
    monotonic_ns: u64,
}

/// Anchor for the process-wide monotonic clock. The absolute monotonic values are meaningless on
/// their own; only differences between them are.
fn monotonic_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

impl Timestamp {
    pub fn new(system_ns: u64, monotonic_ns: u64) -> Self {
        Self {
            system_ns,
            monotonic_ns,
        }
    }

    /// Sample both clocks now
    pub fn now() -> Self {
        let monotonic_ns = monotonic_anchor().elapsed().as_nanos() as u64;
        let system_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        Self {
            system_ns,
            monotonic_ns,
        }
    }

    /// Nanoseconds since the Unix epoch
    #[inline]
    #[must_use]
    pub fn system_ns(&self) -> u64 {
        self.system_ns
    }

    /// Nanoseconds on the process-local monotonic clock
    #[inline]
    #[must_use]
    pub fn monotonic_ns(&self) -> u64 {
        self.monotonic_ns
    }

    /// Pick whichever of the two timestamps is older on the monotonic clock
    ///
    /// Reassembly uses this to correct for timestamping jitter: a later frame of the same transfer
    /// may carry a slightly earlier timestamp, and the transfer timestamp must be the earliest of
    /// its frames.
    #[must_use]
    pub fn combine_earliest(self, other: Timestamp) -> Timestamp {
        if other.monotonic_ns < self.monotonic_ns {
            other
        } else {
            self
        }
    }

    /// Monotonic time elapsed from `earlier` to `self`, saturating at zero
    #[must_use]
    pub fn monotonic_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.monotonic_ns.saturating_sub(earlier.monotonic_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b.monotonic_ns() >= a.monotonic_ns());
    }

    #[test]
    fn test_combine_earliest() {
        let a = Timestamp::new(100, 2_000);
        let b = Timestamp::new(50, 1_000);
        assert_eq!(a.combine_earliest(b), b);
        assert_eq!(b.combine_earliest(a), b);
        assert_eq!(a.combine_earliest(a), a);
    }

    #[test]
    fn test_monotonic_since() {
        let a = Timestamp::new(0, 1_000);
        let b = Timestamp::new(0, 4_500);
        assert_eq!(b.monotonic_since(a), Duration::from_nanos(3_500));
        assert_eq!(a.monotonic_since(b), Duration::ZERO);
    }
}
