use std::time::{Duration, Instant};

/// Deterministic exponential retry-interval calculator.
///
/// The interval doubles each time a delay is consumed, up to a hard ceiling,
/// and never decreases except through [`reset`](Backoff::reset). No jitter is
/// applied at this layer; callers add their own if they need it.
///
/// ```
/// use avocet_broker::backoff::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    last_attempt: Instant,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            last_attempt: Instant::now(),
        }
    }

    /// True once the time elapsed since the last attempt, plus `addl_delay`,
    /// has reached the current interval. Gates whether a retry is due yet.
    pub fn should_backoff(&self, now: Instant, addl_delay: Duration) -> bool {
        now.saturating_duration_since(self.last_attempt) + addl_delay >= self.current
    }

    /// Consume the current interval: returns it, doubles the interval (capped
    /// at the ceiling) and records now as the last attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.max, |doubled| doubled.min(self.max));
        self.last_attempt = Instant::now();
        delay
    }

    /// Drop back to the initial interval. The last-attempt timestamp is kept.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current_interval(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(700));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        // 800ms would exceed the ceiling; the interval pins at 700ms.
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));
    }

    #[test]
    fn interval_never_decreases_except_via_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(3), Duration::from_secs(1));
        let mut previous = Duration::ZERO;
        for _ in 0..32 {
            let current = backoff.current_interval();
            assert!(current >= previous);
            assert!(current <= Duration::from_secs(1));
            previous = current;
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current_interval(), Duration::from_millis(3));
    }

    #[test]
    fn should_backoff_gates_on_elapsed_time() {
        let backoff = Backoff::new(Duration::from_micros(100), Duration::from_secs(10));
        // Immediately after construction nothing has elapsed yet.
        assert!(!backoff.should_backoff(Instant::now(), Duration::ZERO));
        // Supplying the full interval as additional delay opens the gate.
        assert!(backoff.should_backoff(Instant::now(), Duration::from_micros(100)));
    }

    #[test]
    fn should_backoff_tolerates_clock_from_before_last_attempt() {
        let earlier = Instant::now();
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        // A caller-supplied instant predating the last attempt must not panic.
        assert!(!backoff.should_backoff(earlier, Duration::ZERO));
    }

    #[test]
    fn reset_does_not_touch_last_attempt() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        backoff.next_delay();
        let before = backoff.should_backoff(Instant::now(), Duration::from_secs(1));
        backoff.reset();
        // Resetting shrinks the interval, so the same probe can only get closer
        // to being due, never further away.
        let after = backoff.should_backoff(Instant::now(), Duration::from_secs(1));
        assert!(after || !before);
        assert_eq!(backoff.current_interval(), Duration::from_secs(1));
    }

    #[test]
    fn max_below_initial_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.current_interval(), Duration::from_secs(2));
    }
}
