//! Wall-clock time for the engine.

use harbor_engine::{Clock, Timestamp};

/// Reads the system clock through `chrono`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }
}
