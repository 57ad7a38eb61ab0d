//! Per-contact leaky-bucket rate limiting.
//!
//! Only requests count; responses are free. An over-limit sender receives a
//! synthetic error response and its request never reaches a handler.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use storj_core::NodeId;

struct Bucket {
    level: f64,
    updated: Instant,
}

/// Leaky bucket per contact: `capacity` requests per `window`.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<NodeId, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `capacity` requests per `window` per
    /// contact.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn drain_rate(&self) -> f64 {
        self.capacity as f64 / self.window.as_secs_f64()
    }

    /// Counts one request from the contact.
    ///
    /// Returns how long the contact must wait when over budget.
    pub fn try_request(&self, node_id: &NodeId) -> Result<(), Duration> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(*node_id).or_insert(Bucket {
            level: 0.0,
            updated: now,
        });

        // Drain since the last request.
        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.level = (bucket.level - elapsed * self.drain_rate()).max(0.0);
        bucket.updated = now;

        if bucket.level + 1.0 > self.capacity as f64 {
            let excess = bucket.level + 1.0 - self.capacity as f64;
            let wait = excess / self.drain_rate();
            return Err(Duration::from_secs_f64(wait.max(0.001)));
        }

        bucket.level += 1.0;
        Ok(())
    }

    /// Forgets idle buckets older than the window.
    pub fn reap(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, b| now.duration_since(b.updated) < self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storj_core::KeyPair;

    #[test]
    fn test_allows_until_capacity() {
        let limiter = RateLimiter::new(5, Duration::from_secs(3600));
        let id = *KeyPair::generate().node_id();

        for _ in 0..5 {
            assert!(limiter.try_request(&id).is_ok());
        }
        let wait = limiter.try_request(&id).unwrap_err();
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn test_contacts_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));
        let a = *KeyPair::generate().node_id();
        let b = *KeyPair::generate().node_id();

        assert!(limiter.try_request(&a).is_ok());
        assert!(limiter.try_request(&a).is_err());
        assert!(limiter.try_request(&b).is_ok());
    }

    #[test]
    fn test_drains_over_time() {
        // 1000 requests per second drain rate.
        let limiter = RateLimiter::new(1000, Duration::from_secs(1));
        let id = *KeyPair::generate().node_id();

        for _ in 0..1000 {
            assert!(limiter.try_request(&id).is_ok());
        }
        assert!(limiter.try_request(&id).is_err());

        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.try_request(&id).is_ok());
    }

    #[test]
    fn test_reap_forgets_idle() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let id = *KeyPair::generate().node_id();
        limiter.try_request(&id).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        limiter.reap();
        assert!(limiter.buckets.lock().is_empty());
    }
}
