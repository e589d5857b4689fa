//! Per-machine retry backoff for reconcile errors
//!
//! Delays follow the Fibonacci sequence in whole minutes (1, 1, 2, 3, 5, 8)
//! and stop growing at a cap. Each machine has its own sequence, which is
//! rewound after a successful reconcile.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fibonacci sequence of retry delays, measured in minutes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    first_minutes: u64,
    cap_minutes: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(first_minutes: u64, cap_minutes: u64) -> Self {
        Self {
            first_minutes,
            cap_minutes,
            previous: 0,
            current: first_minutes,
        }
    }

    /// Current delay; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current * 60);
        let following = (self.previous + self.current).min(self.cap_minutes);
        self.previous = self.current;
        self.current = following;
        delay
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = self.first_minutes;
    }
}

#[derive(Debug, Clone)]
struct RetryState {
    backoff: FibonacciBackoff,
    failures: u32,
}

/// Backoff sequences keyed by `namespace/name`
#[derive(Debug)]
pub struct BackoffTracker {
    first_minutes: u64,
    cap_minutes: u64,
    states: Mutex<HashMap<String, RetryState>>,
}

impl Default for BackoffTracker {
    /// 1 minute first delay, 10 minute cap
    fn default() -> Self {
        Self::new(1, 10)
    }
}

impl BackoffTracker {
    pub fn new(first_minutes: u64, cap_minutes: u64) -> Self {
        Self {
            first_minutes,
            cap_minutes,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure for `key` and return the delay before the next attempt
    /// together with the number of consecutive failures so far
    pub fn record_failure(&self, key: &str) -> (Duration, u32) {
        let mut states = self.states();
        let state = states.entry(key.to_string()).or_insert_with(|| RetryState {
            backoff: FibonacciBackoff::new(self.first_minutes, self.cap_minutes),
            failures: 0,
        });
        state.failures += 1;
        (state.backoff.next_delay(), state.failures)
    }

    /// Forget the failure history of `key`
    pub fn record_success(&self, key: &str) {
        if let Some(state) = self.states().get_mut(key) {
            state.failures = 0;
            state.backoff.reset();
        }
    }

    /// Drop all state for a deleted machine
    pub fn forget(&self, key: &str) {
        self.states().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(backoff: &mut FibonacciBackoff, n: usize) -> Vec<u64> {
        (0..n).map(|_| backoff.next_delay().as_secs() / 60).collect()
    }

    #[test]
    fn sequence_is_fibonacci_until_cap() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        assert_eq!(minutes(&mut backoff, 9), vec![1, 1, 2, 3, 5, 8, 10, 10, 10]);
    }

    #[test]
    fn reset_rewinds_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        minutes(&mut backoff, 4);
        backoff.reset();
        assert_eq!(minutes(&mut backoff, 3), vec![1, 1, 2]);
    }

    #[test]
    fn tracker_keeps_machines_independent() {
        let tracker = BackoffTracker::default();
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(60), 1));
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(60), 2));
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(120), 3));
        assert_eq!(tracker.record_failure("ns/b"), (Duration::from_secs(60), 1));

        tracker.record_success("ns/a");
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(60), 1));
    }
}
