use std::time::Instant;

use chrono::{DateTime, Utc};

/// Time source for the broker. Production code uses `SystemClock`; tests
/// drive `tokio::time::{pause, advance}` against the same `Instant` axis, so
/// no fake-clock plumbing is needed beyond swapping the wall-clock half.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Session id generation: random-plus-time, per spec's clock/ID source leaf.
pub fn generate_session_id(clock: &dyn Clock) -> vp_control::SessionId {
    vp_control::SessionId::generate(clock.utc_now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
