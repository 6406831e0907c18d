/// Sliding-window rate limiter over the shared Redis store.
///
/// Each limiter key owns a sorted set of request timestamps. An acquisition
/// runs a single server-side script that trims entries older than the
/// window, counts the survivors, and appends the new timestamp only when
/// the count is under the limit. No client-side read-modify-write exists,
/// so concurrent instances cannot over-admit.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::cache::keys;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Key namespace for per-IP login throttling.
pub const NS_IP: &str = "auth-sw:ip:";
/// Key namespace for per-account login throttling.
pub const NS_USER: &str = "auth-sw:user:";
/// Global CAPTCHA verification budget.
pub const NS_CAPTCHA: &str = "captcha:";

// KEYS[1] sorted set; ARGV = cutoff_us, limit, now_us, member, ttl_ms.
// Returns {admitted, remaining-after-decision}.
const ACQUIRE_SCRIPT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local limit = tonumber(ARGV[2])
if count < limit then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    return {1, limit - count - 1}
end
return {0, 0}
";

#[derive(Debug, Clone, Copy)]
struct WindowPolicy {
    limit: u64,
    window: Duration,
}

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    conn: ConnectionManager,
    config: RateLimitConfig,
    metrics: Metrics,
    script: redis::Script,
}

impl SlidingWindowLimiter {
    pub fn new(conn: ConnectionManager, config: RateLimitConfig, metrics: Metrics) -> Self {
        Self {
            conn,
            config,
            metrics,
            script: redis::Script::new(ACQUIRE_SCRIPT),
        }
    }

    /// Attempt to admit one request for `key`.
    ///
    /// Returns `Ok(false)` when the window is full. A store failure is
    /// governed by the deployment-wide fail-open flag: open logs and admits,
    /// closed surfaces `RateLimiterUnavailable` for the caller to deny.
    pub async fn try_acquire(&self, key: &str) -> Result<bool> {
        let policy = self.policy_for(key);
        let ns = namespace_label(key);
        let timer = self
            .metrics
            .ratelimit_acquire_duration_seconds
            .with_label_values(&[ns])
            .start_timer();

        let outcome = tokio::time::timeout(self.config.call_timeout, self.run_acquire(key, policy))
            .await
            .map_err(|_| Error::DependencyTimeout("rate limit store".to_string()))
            .and_then(|inner| inner);

        timer.observe_duration();

        match outcome {
            Ok((admitted, remaining)) => {
                if admitted {
                    self.metrics
                        .ratelimit_admitted_total
                        .with_label_values(&[ns])
                        .inc();
                } else {
                    self.metrics
                        .ratelimit_denied_total
                        .with_label_values(&[ns])
                        .inc();
                }
                self.metrics
                    .ratelimit_remaining
                    .with_label_values(&[key])
                    .set(remaining as f64);
                Ok(admitted)
            }
            Err(e) => {
                self.metrics.ratelimit_check_errors_total.inc();

                if self.config.fail_open {
                    tracing::warn!(key = %key, error = %e, "Rate limit store unavailable; failing open");
                    Ok(true)
                } else {
                    tracing::error!(key = %key, error = %e, "Rate limit store unavailable; failing closed");
                    Err(Error::RateLimiterUnavailable)
                }
            }
        }
    }

    /// Approximate remaining capacity; `-1` when the store cannot answer.
    pub async fn remaining(&self, key: &str) -> i64 {
        let policy = self.policy_for(key);
        let redis_key = keys::rate_limit(key);
        let cutoff = now_micros().saturating_sub(policy.window.as_micros() as u64);
        let mut conn = self.conn.clone();

        let count: std::result::Result<u64, redis::RedisError> = async {
            let _: () = redis::cmd("ZREMRANGEBYSCORE")
                .arg(&redis_key)
                .arg(0)
                .arg(cutoff)
                .query_async(&mut conn)
                .await?;
            redis::cmd("ZCARD").arg(&redis_key).query_async(&mut conn).await
        }
        .await;

        match count {
            Ok(live) => policy.limit.saturating_sub(live) as i64,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Remaining-capacity probe failed");
                -1
            }
        }
    }

    /// The retry hint surfaced with `RateLimitExceeded` for this key.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        self.policy_for(key).window.as_secs().max(1)
    }

    /// Drop limiter keys whose windows have fully drained. Correctness never
    /// depends on this; it only reclaims space between opportunistic trims.
    pub async fn sweep(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = keys::rate_limit("*");
        let mut removed = 0u64;
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for redis_key in batch {
                let plain = redis_key.trim_start_matches("warden:rl:");
                let cutoff =
                    now_micros().saturating_sub(self.policy_for(plain).window.as_micros() as u64);
                let _: () = redis::cmd("ZREMRANGEBYSCORE")
                    .arg(&redis_key)
                    .arg(0)
                    .arg(cutoff)
                    .query_async(&mut conn)
                    .await?;
                let live: u64 = redis::cmd("ZCARD")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await?;
                if live == 0 {
                    let _: () = redis::cmd("DEL").arg(&redis_key).query_async(&mut conn).await?;
                    removed += 1;
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if removed > 0 {
            tracing::debug!(removed = removed, "Rate limiter sweep reclaimed empty windows");
        }

        Ok(removed)
    }

    async fn run_acquire(&self, key: &str, policy: WindowPolicy) -> Result<(bool, u64)> {
        let now = now_micros();
        let cutoff = now.saturating_sub(policy.window.as_micros() as u64);
        // Unique member so two requests in the same microsecond both count.
        let member = format!("{}-{}", now, Uuid::new_v4());
        let ttl_ms = policy.window.as_millis() as u64 + 60_000;

        let mut conn = self.conn.clone();
        let (admitted, remaining): (u8, u64) = self
            .script
            .key(keys::rate_limit(key))
            .arg(cutoff)
            .arg(policy.limit)
            .arg(now)
            .arg(member)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;

        Ok((admitted == 1, remaining))
    }

    fn policy_for(&self, key: &str) -> WindowPolicy {
        if key.starts_with(NS_IP) {
            WindowPolicy {
                limit: self.config.ip_limit,
                window: self.config.ip_window,
            }
        } else if key.starts_with(NS_USER) {
            WindowPolicy {
                limit: self.config.user_limit,
                window: self.config.user_window,
            }
        } else if key.starts_with(NS_CAPTCHA) {
            WindowPolicy {
                limit: self.config.captcha_limit,
                window: self.config.captcha_window,
            }
        } else {
            // Unknown namespaces get the stricter per-user policy.
            WindowPolicy {
                limit: self.config.user_limit,
                window: self.config.user_window,
            }
        }
    }
}

fn namespace_label(key: &str) -> &'static str {
    if key.starts_with(NS_IP) {
        "ip"
    } else if key.starts_with(NS_USER) {
        "user"
    } else if key.starts_with(NS_CAPTCHA) {
        "captcha"
    } else {
        "other"
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use std::time::Duration;

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            ip_limit: 100,
            ip_window: Duration::from_secs(60),
            user_limit: 20,
            user_window: Duration::from_secs(60),
            captcha_limit: 1000,
            captcha_window: Duration::from_secs(60),
            fail_open: false,
            cleanup_interval: Duration::from_secs(3600),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_namespace_labels() {
        assert_eq!(namespace_label("auth-sw:ip:198.51.100.7"), "ip");
        assert_eq!(namespace_label("auth-sw:user:abcdef"), "user");
        assert_eq!(namespace_label("captcha:global"), "captcha");
        assert_eq!(namespace_label("something:else"), "other");
    }

    #[test]
    fn test_now_micros_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
        // Sanity: we are in the right order of magnitude (year > 2020)
        assert!(a > 1_577_836_800_000_000);
    }

    // The suites below require Redis.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    async fn redis_limiter(fail_open: bool) -> SlidingWindowLimiter {
        let cache = CacheManager::new("redis://127.0.0.1:6379").await.unwrap();
        let mut config = test_config();
        config.fail_open = fail_open;
        SlidingWindowLimiter::new(cache.connection(), config, Metrics::new().unwrap())
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_window_admits_up_to_limit() {
        let limiter = redis_limiter(false).await;
        let key = format!("auth-sw:user:{}", Uuid::new_v4());

        // user namespace: limit 20
        for i in 1..=20 {
            assert!(
                limiter.try_acquire(&key).await.unwrap(),
                "attempt {} should be admitted",
                i
            );
        }
        assert!(!limiter.try_acquire(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_remaining_tracks_admissions() {
        let limiter = redis_limiter(false).await;
        let key = format!("auth-sw:user:{}", Uuid::new_v4());

        assert_eq!(limiter.remaining(&key).await, 20);
        limiter.try_acquire(&key).await.unwrap();
        limiter.try_acquire(&key).await.unwrap();
        assert_eq!(limiter.remaining(&key).await, 18);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_sweep_reclaims_empty_keys() {
        let limiter = redis_limiter(false).await;
        let key = format!("auth-sw:user:{}", Uuid::new_v4());
        limiter.try_acquire(&key).await.unwrap();

        // Nothing has expired yet, so the key survives
        limiter.sweep().await.unwrap();
        assert!(limiter.remaining(&key).await < 20);
    }
}
