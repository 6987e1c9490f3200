use std::{collections::HashMap, hash::Hash, time::Duration};

use parking_lot::Mutex;

/// Per-key exponential backoff for the controller's error policy: `base`,
/// `2·base`, `4·base`, ... capped at `max`. There is no retry limit.
pub struct Backoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash> Backoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_delay(&self, key: K) -> Duration {
        let mut failures = self.failures.lock();
        let attempt = failures.entry(key).or_insert(0);
        *attempt = attempt.saturating_add(1);
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn attempts(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
