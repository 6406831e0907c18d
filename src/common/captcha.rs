/// CAPTCHA verification against the configured provider.
///
/// The provider call is bounded by a hard time limit and sits behind a
/// three-state circuit breaker, so a degraded provider fails requests fast
/// instead of stalling login threads. Breaker-open surfaces as
/// `DependencyTimeout`; a clean provider "no" is `InvalidCaptcha`.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::CaptchaConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_SUCCESS_THRESHOLD: u32 = 2;
const BREAKER_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker: Closed -> Open after consecutive failures, Open ->
/// HalfOpen after a cool-down, HalfOpen -> Closed after consecutive
/// successes (any failure reopens).
struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|at| at.elapsed() >= BREAKER_OPEN_TIMEOUT)
                    .unwrap_or(true);
                if cooled {
                    tracing::info!("CAPTCHA circuit breaker transitioning: Open -> HalfOpen");
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= BREAKER_SUCCESS_THRESHOLD {
                    tracing::info!("CAPTCHA circuit breaker transitioning: HalfOpen -> Closed");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                }
            }
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!("CAPTCHA circuit breaker transitioning: HalfOpen -> Open");
                inner.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= BREAKER_FAILURE_THRESHOLD {
                    tracing::warn!(
                        failures = inner.failure_count,
                        "CAPTCHA circuit breaker transitioning: Closed -> Open"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

pub struct CaptchaVerifier {
    client: reqwest::Client,
    config: CaptchaConfig,
    breaker: CircuitBreaker,
    metrics: Metrics,
}

impl CaptchaVerifier {
    pub fn new(config: CaptchaConfig, metrics: Metrics) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            breaker: CircuitBreaker::new(),
            metrics,
        }
    }

    /// Verify a CAPTCHA token with the provider.
    ///
    /// Deployments without a configured provider accept every token; config
    /// validation guarantees production sets both URL and secret.
    pub async fn verify(&self, token: &str) -> Result<()> {
        let (url, secret) = match (&self.config.provider_url, &self.config.secret) {
            (Some(url), Some(secret)) => (url, secret),
            _ => {
                tracing::warn!("CAPTCHA provider not configured; accepting token");
                return Ok(());
            }
        };

        if token.is_empty() {
            self.count("failed");
            return Err(Error::InvalidCaptcha);
        }

        if !self.breaker.allow_request() {
            self.count("provider_error");
            return Err(Error::DependencyTimeout("captcha provider circuit open".to_string()));
        }

        let call = self
            .client
            .post(url)
            .form(&[("secret", secret.as_str()), ("response", token)])
            .send();

        let response = match tokio::time::timeout(self.config.verify_timeout, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.breaker.record_failure();
                self.count("provider_error");
                tracing::error!(error = %e, "CAPTCHA provider request failed");
                return Err(Error::DependencyTimeout("captcha provider".to_string()));
            }
            Err(_) => {
                self.breaker.record_failure();
                self.count("provider_error");
                tracing::error!(
                    timeout_ms = self.config.verify_timeout.as_millis() as u64,
                    "CAPTCHA provider timed out"
                );
                return Err(Error::DependencyTimeout("captcha provider".to_string()));
            }
        };

        let body: ProviderResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                self.breaker.record_failure();
                self.count("provider_error");
                tracing::error!(error = %e, "CAPTCHA provider returned an unparseable body");
                return Err(Error::DependencyTimeout("captcha provider".to_string()));
            }
        };

        // The provider answered; the circuit is healthy either way.
        self.breaker.record_success();

        if body.success {
            self.count("passed");
            Ok(())
        } else {
            self.count("failed");
            tracing::warn!(errors = ?body.error_codes, "CAPTCHA token rejected by provider");
            Err(Error::InvalidCaptcha)
        }
    }

    fn count(&self, result: &str) {
        self.metrics
            .captcha_checks_total
            .with_label_values(&[result])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new();

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            assert!(breaker.allow_request());
            breaker.record_failure();
        }

        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_breaker_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new();

        for _ in 0..BREAKER_FAILURE_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..BREAKER_FAILURE_THRESHOLD - 1 {
            breaker.record_failure();
        }

        // The streak never reached the threshold
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }

        // Force the cool-down to elapse
        breaker.inner.lock().unwrap().last_failure =
            Some(Instant::now() - BREAKER_OPEN_TIMEOUT - Duration::from_secs(1));

        assert!(breaker.allow_request()); // now HalfOpen
        breaker.record_failure();
        assert!(!breaker.allow_request()); // straight back to Open
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        breaker.inner.lock().unwrap().last_failure =
            Some(Instant::now() - BREAKER_OPEN_TIMEOUT - Duration::from_secs(1));

        assert!(breaker.allow_request());
        for _ in 0..BREAKER_SUCCESS_THRESHOLD {
            breaker.record_success();
        }

        assert_eq!(breaker.inner.lock().unwrap().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_unconfigured_verifier_accepts() {
        let verifier = CaptchaVerifier::new(
            CaptchaConfig {
                provider_url: None,
                secret: None,
                verify_timeout: Duration::from_secs(3),
            },
            Metrics::new().unwrap(),
        );

        assert!(verifier.verify("anything").await.is_ok());
    }
}
