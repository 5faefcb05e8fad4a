use std::time::{Duration, Instant};

/// A bounded wait on a hardware condition.
///
/// Callers poll their condition and call [Timeout::run] between polls until either the condition
/// holds or the timeout reports expiry.
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Self::new(Duration::from_micros(micros))
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    /// Yields the CPU once, or fails when the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            return Err(());
        }
        std::thread::yield_now();
        Ok(())
    }
}
