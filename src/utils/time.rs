use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// A measurement of a monotonically nondecreasing clock, in nanoseconds
/// since the first observation made by this process.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    #[inline]
    pub fn from_nanos(nanos: u64) -> Timestamp {
        Timestamp(nanos)
    }

    #[inline]
    pub fn now() -> Timestamp {
        let elapsed = EPOCH.elapsed();
        Timestamp(elapsed.as_secs() * 1_000_000_000 + u64::from(elapsed.subsec_nanos()))
    }

    #[inline]
    pub fn nanos(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn elapsed(self) -> Duration {
        Timestamp::now() - self
    }
}

impl std::ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
        assert!(a.elapsed() >= Duration::from_nanos(0));
    }
}
