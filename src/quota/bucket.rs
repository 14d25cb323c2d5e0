use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{QuotaStatus, QuotaTracker};

/// Token bucket per key, refilled continuously at `limit / window`.
pub struct TokenBucketQuota {
    buckets: Mutex<HashMap<String, Bucket>>,
    max_keys: usize,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    per_second: f64,
    last_update: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.capacity);
        self.last_update = now;
    }

    /// A full bucket behaves exactly like a fresh one.
    fn is_full(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * self.per_second >= self.capacity
    }
}

impl TokenBucketQuota {
    pub fn new(max_keys: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_keys: max_keys.max(1),
        }
    }

    /// Number of keys kept after a prune, leaving headroom so the next
    /// prune is not triggered by the very next new key.
    fn low_water_mark(&self) -> usize {
        (self.max_keys - self.max_keys / 10).min(self.max_keys - 1)
    }

    /// Called when the map is at capacity. Drops full buckets first, then
    /// the least recently used ones down to the low water mark.
    fn prune_locked(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) {
        buckets.retain(|_, bucket| !bucket.is_full(now));

        let target = self.low_water_mark();
        if buckets.len() <= target {
            return;
        }

        let mut by_age: Vec<_> = buckets
            .iter()
            .map(|(key, bucket)| (bucket.last_update, key.clone()))
            .collect();
        let overflow = by_age.len() - target;
        by_age.select_nth_unstable_by_key(overflow - 1, |(updated, _)| *updated);

        for (_, key) in by_age.into_iter().take(overflow) {
            buckets.remove(&key);
        }
    }
}

impl QuotaTracker for TokenBucketQuota {
    fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check(&self, key: &str, limit: u32, window: Duration) -> QuotaStatus {
        let window = if window.is_zero() {
            Duration::from_secs(1)
        } else {
            window
        };

        if limit == 0 {
            return QuotaStatus {
                limit,
                remaining: 0,
                limited: true,
                retry_after: window,
            };
        }

        let capacity = limit as f64;
        let per_second = capacity / window.as_secs_f64();
        let now = Instant::now();

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.len() >= self.max_keys && !buckets.contains_key(key) {
            self.prune_locked(&mut buckets, now);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            capacity,
            per_second,
            last_update: now,
        });

        // Limits come from rule parameters and may change between calls.
        if (bucket.capacity - capacity).abs() > f64::EPSILON {
            bucket.capacity = capacity;
            bucket.tokens = bucket.tokens.min(capacity);
        }
        bucket.refill(now);
        bucket.per_second = per_second;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            QuotaStatus {
                limit,
                remaining: bucket.tokens.floor() as u32,
                limited: false,
                retry_after: Duration::ZERO,
            }
        } else {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / per_second);
            QuotaStatus {
                limit,
                remaining: 0,
                limited: true,
                retry_after: wait,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_allows_limit_then_blocks() {
        let quota = TokenBucketQuota::new(100);
        let window = Duration::from_secs(60);

        for expected_remaining in (0..5).rev() {
            let status = quota.check("203.0.113.10", 5, window);
            assert!(!status.limited);
            assert_eq!(status.remaining, expected_remaining);
        }

        let status = quota.check("203.0.113.10", 5, window);
        assert!(status.limited);
        assert_eq!(status.remaining, 0);
        assert!(status.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_keys_are_independent() {
        let quota = TokenBucketQuota::new(100);
        let window = Duration::from_secs(60);

        assert!(!quota.check("a", 1, window).limited);
        assert!(quota.check("a", 1, window).limited);
        assert!(!quota.check("b", 1, window).limited);
    }

    #[test]
    fn test_bucket_replenishes() {
        let quota = TokenBucketQuota::new(100);
        let window = Duration::from_millis(100);

        assert!(!quota.check("k", 10, window).limited);
        for _ in 0..9 {
            quota.check("k", 10, window);
        }
        assert!(quota.check("k", 10, window).limited);

        std::thread::sleep(Duration::from_millis(30));
        assert!(!quota.check("k", 10, window).limited);
    }

    #[test]
    fn test_zero_limit_is_always_limited() {
        let quota = TokenBucketQuota::new(10);
        let status = quota.check("k", 0, Duration::from_secs(5));
        assert!(status.limited);
        assert_eq!(status.retry_after, Duration::from_secs(5));
    }

    #[test]
    fn test_tracked_keys_are_capped() {
        let quota = TokenBucketQuota::new(3);
        for i in 0..10 {
            quota.check(&format!("client-{}", i), 5, Duration::from_secs(1));
        }
        assert!(quota.tracked_keys() <= 3);
    }

    #[test]
    fn test_eviction_frees_a_batch_of_keys() {
        let quota = TokenBucketQuota::new(100);
        let window = Duration::from_secs(60);

        for i in 0..100 {
            quota.check(&format!("client-{}", i), 5, window);
        }
        assert_eq!(quota.tracked_keys(), 100);

        // One prune drops to 90, then the new key is added.
        quota.check("client-100", 5, window);
        assert_eq!(quota.tracked_keys(), 91);

        // Room remains, so further new keys do not prune again.
        for i in 101..110 {
            quota.check(&format!("client-{}", i), 5, window);
        }
        assert_eq!(quota.tracked_keys(), 100);

        quota.check("client-110", 5, window);
        assert_eq!(quota.tracked_keys(), 91);
        assert!(quota.tracked_keys() <= 100);
    }

    #[test]
    fn test_full_buckets_are_evicted_before_active_ones() {
        let quota = TokenBucketQuota::new(10);

        for i in 0..5 {
            quota.check(&format!("idle-{}", i), 1, Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        for i in 0..5 {
            assert!(!quota.check(&format!("busy-{}", i), 1, Duration::from_secs(60)).limited);
        }
        assert_eq!(quota.tracked_keys(), 10);

        quota.check("newcomer", 1, Duration::from_secs(60));
        assert_eq!(quota.tracked_keys(), 6);

        // The busy buckets kept their spent budget.
        for i in 0..5 {
            assert!(quota.check(&format!("busy-{}", i), 1, Duration::from_secs(60)).limited);
        }
    }
}
