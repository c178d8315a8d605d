//! Response timeout bookkeeping
use std::time::{Duration, Instant};

/// Holds the long lived default timeout and the one currently in force
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutController {
    current: Duration,
    default: Duration,
}

impl TimeoutController {
    pub fn new(default: Duration) -> Self {
        Self {
            current: default,
            default,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    /// With `persist` the default changes too, otherwise the value holds until
    /// [`TimeoutController::restore`]
    pub fn set(&mut self, value: Duration, persist: bool) {
        self.current = value;
        if persist {
            self.default = value;
        }
    }

    pub fn restore(&mut self) {
        self.current = self.default;
    }

    /// Starts a deadline using the timeout currently in force
    pub fn start(&self) -> Deadline {
        Deadline::after(self.current)
    }
}

/// Point in time a blocking primitive gives up at
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Already expired deadline, used for non-blocking polls
    pub fn immediate() -> Self {
        Self::after(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_override() {
        let mut t = TimeoutController::new(Duration::from_millis(1000));
        t.set(Duration::from_millis(5000), false);
        assert_eq!(t.current(), Duration::from_millis(5000));
        assert_eq!(t.default_timeout(), Duration::from_millis(1000));
        t.restore();
        assert_eq!(t.current(), Duration::from_millis(1000));
    }

    #[test]
    fn test_persisted_value() {
        let mut t = TimeoutController::new(Duration::from_millis(1000));
        t.set(Duration::from_millis(300), true);
        t.restore();
        assert_eq!(t.current(), Duration::from_millis(300));
        assert_eq!(t.default_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_restore_without_override_keeps_default() {
        let mut t = TimeoutController::new(Duration::from_millis(1000));
        t.restore();
        t.restore();
        assert_eq!(t, TimeoutController::new(Duration::from_millis(1000)));
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::immediate().expired());
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining() > Duration::from_secs(59));
    }
}
