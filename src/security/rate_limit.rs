//! Token-bucket rate limiting per client address
//!
//! Each address gets a bucket of `burst` tokens refilled at `rate` per
//! second. Idle buckets expire after three full refill periods, and the
//! number of tracked addresses is capped so a flood of distinct clients
//! cannot grow the table without bound.

use super::RateLimitPolicy;
use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn try_acquire(&mut self, now: Instant, capacity: f64, refill_rate: f64, max_elapsed: Duration) -> bool {
        let elapsed = now
            .saturating_duration_since(self.last_update)
            .min(max_elapsed)
            .as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct State {
    buckets: HashMap<IpAddr, TokenBucket>,
    last_cleanup: Instant,
}

/// Shared limiter; one mutex guards every bucket
pub struct RateLimiter {
    state: Mutex<State>,
    rate: f64,
    burst: f64,
    max_entries: usize,
    cleanup_interval: Duration,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::from_config(&RateLimitConfig {
            rate,
            burst,
            ..RateLimitConfig::default()
        })
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        RateLimiter {
            state: Mutex::new(State {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            rate: config.rate,
            burst: config.burst as f64,
            max_entries: config.max_entries,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
        }
    }

    /// Addresses currently tracked
    pub fn tracked(&self) -> usize {
        self.lock().buckets.len()
    }

    /// Take one token for `addr` as of `now`
    pub fn check_at(&self, addr: IpAddr, now: Instant) -> bool {
        let mut state = self.lock();

        if now.saturating_duration_since(state.last_cleanup) > self.cleanup_interval {
            self.cleanup(&mut state, now);
        }

        if !state.buckets.contains_key(&addr) && state.buckets.len() >= self.max_entries {
            self.cleanup(&mut state, now);
            if state.buckets.len() >= self.max_entries {
                tracing::warn!(client = %addr, "rate limiter table full");
                return false;
            }
        }

        let burst = self.burst;
        state
            .buckets
            .entry(addr)
            .or_insert_with(|| TokenBucket::new(burst, now))
            .try_acquire(now, burst, self.rate, self.cleanup_interval)
    }

    /// Drop idle buckets, then the oldest ones while over the cap
    fn cleanup(&self, state: &mut State, now: Instant) {
        let expiry = Duration::from_secs_f64(3.0 * self.burst / self.rate);
        state
            .buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) <= expiry);

        if state.buckets.len() > self.max_entries {
            let mut by_age: Vec<(IpAddr, Instant)> = state
                .buckets
                .iter()
                .map(|(addr, bucket)| (*addr, bucket.last_update))
                .collect();
            by_age.sort_by_key(|(_, last_update)| *last_update);

            let excess = state.buckets.len() - self.max_entries;
            for (addr, _) in by_age.into_iter().take(excess) {
                state.buckets.remove(&addr);
            }
        }
        state.last_cleanup = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateLimitPolicy for RateLimiter {
    fn is_allowed(&self, addr: IpAddr) -> bool {
        self.check_at(addr, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(2.0, 3);
        let client = ip("10.0.0.1");
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(client, start));
        }
        assert!(!limiter.check_at(client, start));

        // 2 tokens per second
        assert!(limiter.check_at(client, start + Duration::from_millis(500)));
        assert!(!limiter.check_at(client, start + Duration::from_millis(500)));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        let now = Instant::now();
        assert!(limiter.check_at(ip("10.0.0.1"), now));
        assert!(!limiter.check_at(ip("10.0.0.1"), now));
        assert!(limiter.check_at(ip("10.0.0.2"), now));
    }

    #[test]
    fn test_table_cap_rejects_new_clients() {
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            rate: 1.0,
            burst: 5,
            max_entries: 2,
            cleanup_interval_secs: 3600,
        });
        let now = Instant::now();

        assert!(limiter.check_at(ip("10.0.0.1"), now));
        assert!(limiter.check_at(ip("10.0.0.2"), now));
        assert!(!limiter.check_at(ip("10.0.0.3"), now));
        assert!(limiter.check_at(ip("10.0.0.1"), now));
    }

    #[test]
    fn test_idle_entries_expire() {
        let limiter = RateLimiter::from_config(&RateLimitConfig {
            rate: 10.0,
            burst: 10,
            max_entries: 1,
            cleanup_interval_secs: 3600,
        });
        let now = Instant::now();
        assert!(limiter.check_at(ip("10.0.0.1"), now));

        // expiry is 3 * burst / rate = 3s
        let later = now + Duration::from_secs(4);
        assert!(limiter.check_at(ip("10.0.0.2"), later));
        assert_eq!(limiter.tracked(), 1);
    }
}
