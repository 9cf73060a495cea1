//! Per-item exponential backoff for repeated failures

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Base delay for the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound for any retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Delay doubles with each failure of the same item, up to `max_delay`
pub struct ItemExponentialBackoff<T> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Hash + Eq> Default for ItemExponentialBackoff<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T: Hash + Eq> ItemExponentialBackoff<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<T, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure and return how long to wait before retrying
    pub fn when(&self, item: T) -> Duration {
        let mut failures = self.lock();
        let count = failures.entry(item).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);
        drop(failures);

        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().get(item).copied().unwrap_or(0)
    }

    /// Forget the item's failure history, returning the removed entry
    pub fn forget(&self, item: &T) -> Option<(T, u32)> {
        self.lock().remove_entry(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        assert_eq!(limiter.when("a"), Duration::from_millis(40));
        assert_eq!(limiter.when("a"), Duration::from_millis(50));
        assert_eq!(limiter.num_requeues(&"a"), 4);

        assert_eq!(limiter.when("b"), Duration::from_millis(10));
    }

    #[test]
    fn test_forget_resets_history() {
        let limiter = ItemExponentialBackoff::default();
        limiter.when("a");
        limiter.when("a");
        assert!(limiter.forget(&"a").is_some());
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when("a"), DEFAULT_BASE_DELAY);
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let limiter = ItemExponentialBackoff::default();
        for _ in 0..100 {
            limiter.when("a");
        }
        assert_eq!(limiter.when("a"), DEFAULT_MAX_DELAY);
    }
}
