//! Per-user, per-message-type token-bucket rate limiting with bucket GC
//! (C4, spec §4.4).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Clone, Debug)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    fn refill_rate(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds.max(1) as f64
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

/// `RATE_LIMIT_EXCEEDED` carries how long the caller should wait.
#[derive(Debug, PartialEq)]
pub struct RateLimitExceeded {
    pub retry_after_ms: u64,
}

/// Token buckets keyed by `(userId, messageType)`. One instance is a
/// process-wide singleton shared across connections (spec §5, §9).
pub struct RateLimiter {
    rules: DashMap<String, RateLimitRule>,
    buckets: DashMap<(String, String), Mutex<Bucket>>,
    bucket_max_age: Duration,
}

impl RateLimiter {
    pub fn new(rules: Vec<(String, RateLimitRule)>, bucket_max_age: Duration) -> Self {
        let rules_map = DashMap::new();
        for (message_type, rule) in rules {
            rules_map.insert(message_type, rule);
        }
        Self {
            rules: rules_map,
            buckets: DashMap::new(),
            bucket_max_age,
        }
    }

    /// `None` if the message type has no configured bucket (bypasses the
    /// limiter per spec §4.4).
    pub fn check(&self, user_id: &str, message_type: &str) -> Option<Result<(), RateLimitExceeded>> {
        let rule = self.rules.get(message_type)?.clone();
        let key = (user_id.to_string(), message_type.to_string());
        let now = Instant::now();

        let entry = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: rule.max_requests as f64,
                last_refill: now,
                last_touched: now,
            })
        });

        let mut bucket = entry.lock().unwrap();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rule.refill_rate()).min(rule.max_requests as f64);
        bucket.last_refill = now;
        bucket.last_touched = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Some(Ok(()))
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = (deficit / rule.refill_rate() * 1000.0).ceil() as u64;
            Some(Err(RateLimitExceeded { retry_after_ms }))
        }
    }

    /// Evicts buckets untouched for longer than `bucket_max_age`. Not required
    /// for correctness; run periodically by a background sweep task owned by
    /// the connection manager.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<_> = self
            .buckets
            .iter()
            .filter(|entry| {
                now.duration_since(entry.value().lock().unwrap().last_touched) > self.bucket_max_age
            })
            .map(|entry| entry.key().clone())
            .collect();
        let removed = stale.len();
        for key in stale {
            self.buckets.remove(&key);
        }
        removed
    }

    /// Spawns a background task that runs [`Self::gc`] on an interval until
    /// the returned handle is dropped or aborted.
    pub fn spawn_gc_task(self: std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.gc();
                if removed > 0 {
                    tracing::debug!(removed, "rate limiter GC swept stale buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            vec![(
                "data.message.send".to_string(),
                RateLimitRule {
                    max_requests: 3,
                    window_seconds: 60,
                },
            )],
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = limiter();
        for _ in 0..3 {
            assert!(limiter.check("u1", "data.message.send").unwrap().is_ok());
        }
        let rejected = limiter.check("u1", "data.message.send").unwrap();
        assert!(rejected.is_err());
        assert!(rejected.unwrap_err().retry_after_ms > 0);
    }

    #[test]
    fn unconfigured_type_bypasses() {
        let limiter = limiter();
        assert!(limiter.check("u1", "data.unconfigured").is_none());
    }

    #[test]
    fn buckets_are_independent_per_user_and_type() {
        let limiter = limiter();
        for _ in 0..3 {
            assert!(limiter.check("u1", "data.message.send").unwrap().is_ok());
        }
        assert!(limiter.check("u2", "data.message.send").unwrap().is_ok());
    }

    #[test]
    fn gc_evicts_only_stale_buckets() {
        let limiter = RateLimiter::new(
            vec![(
                "data.message.send".to_string(),
                RateLimitRule {
                    max_requests: 3,
                    window_seconds: 60,
                },
            )],
            Duration::from_millis(1),
        );
        limiter.check("u1", "data.message.send");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(limiter.gc(), 1);
    }
}
