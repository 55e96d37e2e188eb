use std::time::Duration;

use backoff::backoff::Backoff;

/// A backoff policy which always returns a constant duration, optionally
/// bounded by a maximum attempt count.
///
/// Chain reads use the unbounded form: a bridge relayer must eventually
/// recover from transient RPC hiccups rather than give up, so "retry every
/// 3 seconds, forever" is the default for everything that performs no state
/// mutation. The bound exists for operators who prefer a crash over an
/// endlessly stalled node.
#[derive(Debug)]
pub struct FixedInterval {
    interval: Duration,
    max_attempts: Option<usize>,
    count: usize,
}

impl FixedInterval {
    /// Creates an unbounded constant backoff with the given `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            count: 0,
        }
    }

    /// Bounds the policy to at most `max_attempts` retries.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Backoff for FixedInterval {
    fn next_backoff(&mut self) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if self.count >= max => None,
            _ => {
                self.count += 1;
                Some(self.interval)
            }
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_exhausts() {
        let mut backoff = FixedInterval::new(Duration::from_secs(3));
        for _ in 0..10_000 {
            assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(3)));
        }
    }

    #[test]
    fn bounded_exhausts_after_max_attempts() {
        let mut backoff =
            FixedInterval::new(Duration::from_millis(10)).with_max_attempts(3);
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert_eq!(backoff.next_backoff(), None);
        backoff.reset();
        assert!(backoff.next_backoff().is_some());
    }
}
