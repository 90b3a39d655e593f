use std::time::{Instant, SystemTime};

/// Monotonic clock handed out by the runtime. All engine timestamps are
/// fractional seconds elapsed since the clock was created.
#[derive(Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    #[inline]
    pub fn new() -> Clock {
        Clock {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn now(&self) -> f64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9
    }
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();

        let first = clock.now();
        let second = clock.now();

        assert!(first >= 0.0);
        assert!(second >= first);
    }
}
