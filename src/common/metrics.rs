use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Application metrics registry.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // HTTP metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // Rate limiter metrics (component contract: admitted/denied/errored,
    // acquisition latency, approximate remaining per well-known key)
    pub ratelimit_admitted_total: IntCounterVec,
    pub ratelimit_denied_total: IntCounterVec,
    pub ratelimit_check_errors_total: IntCounter,
    pub ratelimit_acquire_duration_seconds: HistogramVec,
    pub ratelimit_remaining: GaugeVec,

    // Authentication pipeline metrics
    pub login_attempts_total: IntCounterVec,
    pub accounts_locked_total: IntCounter,
    pub captcha_checks_total: IntCounterVec,
    pub risk_verdicts_total: IntCounterVec,
    pub passkey_ceremonies_total: IntCounterVec,

    // Token issuer metrics
    pub tokens_issued_total: IntCounterVec,
    pub tokens_revoked_total: IntCounterVec,
    pub revocation_lookups_total: IntCounterVec,

    // Cache metrics
    pub cache_requests_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests")
                .namespace("warden")
                .subsystem("api"),
            &["method", "endpoint", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .namespace("warden")
            .subsystem("api")
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "endpoint"],
        )?;

        let ratelimit_admitted_total = IntCounterVec::new(
            Opts::new("ratelimit_admitted_total", "Acquisitions admitted by the sliding window")
                .namespace("warden")
                .subsystem("auth"),
            &["namespace"],
        )?;

        let ratelimit_denied_total = IntCounterVec::new(
            Opts::new("ratelimit_denied_total", "Acquisitions denied by the sliding window")
                .namespace("warden")
                .subsystem("auth"),
            &["namespace"],
        )?;

        let ratelimit_check_errors_total = IntCounter::new(
            "warden_auth_ratelimit_check_errors_total",
            "Rate limit checks that failed against the shared store",
        )?;

        let ratelimit_acquire_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_acquire_duration_seconds",
                "Sliding-window acquisition latency in seconds",
            )
            .namespace("warden")
            .subsystem("auth")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.2]),
            &["namespace"],
        )?;

        let ratelimit_remaining = GaugeVec::new(
            Opts::new(
                "ratelimit_remaining",
                "Approximate remaining capacity for well-known limiter keys",
            )
            .namespace("warden")
            .subsystem("auth"),
            &["key"],
        )?;

        let login_attempts_total = IntCounterVec::new(
            Opts::new("login_attempts_total", "Login attempts by method and outcome")
                .namespace("warden")
                .subsystem("auth"),
            &["method", "outcome"], // password|passkey|mfa, success|invalid|locked|...
        )?;

        let accounts_locked_total = IntCounter::new(
            "warden_auth_accounts_locked_total",
            "Accounts moved into the lockout window",
        )?;

        let captcha_checks_total = IntCounterVec::new(
            Opts::new("captcha_checks_total", "CAPTCHA validations by result")
                .namespace("warden")
                .subsystem("auth"),
            &["result"], // passed, failed, required, provider_error
        )?;

        let risk_verdicts_total = IntCounterVec::new(
            Opts::new("risk_verdicts_total", "Risk engine recommendations")
                .namespace("warden")
                .subsystem("auth"),
            &["recommendation"], // allow, challenge, deny
        )?;

        let passkey_ceremonies_total = IntCounterVec::new(
            Opts::new("passkey_ceremonies_total", "WebAuthn ceremonies by kind and outcome")
                .namespace("warden")
                .subsystem("auth"),
            &["ceremony", "outcome"], // registration|authentication, success|failed
        )?;

        let tokens_issued_total = IntCounterVec::new(
            Opts::new("tokens_issued_total", "Tokens issued by type")
                .namespace("warden")
                .subsystem("token"),
            &["type"], // access, refresh, mfa
        )?;

        let tokens_revoked_total = IntCounterVec::new(
            Opts::new("tokens_revoked_total", "Tokens revoked by reason")
                .namespace("warden")
                .subsystem("token"),
            &["reason"], // logout, password_change, risk, replay, validation_failure
        )?;

        let revocation_lookups_total = IntCounterVec::new(
            Opts::new("revocation_lookups_total", "Revocation lookups by resolving tier")
                .namespace("warden")
                .subsystem("token"),
            &["tier"], // local, shared, database
        )?;

        let cache_requests_total = IntCounterVec::new(
            Opts::new("cache_requests_total", "Cache requests by tier and result")
                .namespace("warden")
                .subsystem("cache"),
            &["cache", "result"], // permissions|role_graph, hit|miss
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(ratelimit_admitted_total.clone()))?;
        registry.register(Box::new(ratelimit_denied_total.clone()))?;
        registry.register(Box::new(ratelimit_check_errors_total.clone()))?;
        registry.register(Box::new(ratelimit_acquire_duration_seconds.clone()))?;
        registry.register(Box::new(ratelimit_remaining.clone()))?;
        registry.register(Box::new(login_attempts_total.clone()))?;
        registry.register(Box::new(accounts_locked_total.clone()))?;
        registry.register(Box::new(captcha_checks_total.clone()))?;
        registry.register(Box::new(risk_verdicts_total.clone()))?;
        registry.register(Box::new(passkey_ceremonies_total.clone()))?;
        registry.register(Box::new(tokens_issued_total.clone()))?;
        registry.register(Box::new(tokens_revoked_total.clone()))?;
        registry.register(Box::new(revocation_lookups_total.clone()))?;
        registry.register(Box::new(cache_requests_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            http_requests_total,
            http_request_duration_seconds,
            ratelimit_admitted_total,
            ratelimit_denied_total,
            ratelimit_check_errors_total,
            ratelimit_acquire_duration_seconds,
            ratelimit_remaining,
            login_attempts_total,
            accounts_locked_total,
            captcha_checks_total,
            risk_verdicts_total,
            passkey_ceremonies_total,
            tokens_issued_total,
            tokens_revoked_total,
            revocation_lookups_total,
            cache_requests_total,
        })
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e)))
    }

    /// Normalize endpoint path for metrics (collapse IDs).
    pub fn normalize_path(path: &str) -> String {
        let path = path.split('?').next().unwrap_or(path);

        let segments: Vec<&str> = path.split('/').collect();

        let normalized: Vec<String> = segments
            .iter()
            .map(|segment| {
                if segment.is_empty() {
                    return segment.to_string();
                }

                // UUIDs, numeric ids, and base64url credential ids
                if (segment.len() == 36 && segment.contains('-'))
                    || segment.chars().all(|c| c.is_ascii_digit())
                    || (segment.len() > 20
                        && segment
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                {
                    ":id".to_string()
                } else {
                    segment.to_string()
                }
            })
            .collect();

        normalized.join("/")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics
            .login_attempts_total
            .with_label_values(&["password", "success"])
            .inc();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(
            Metrics::normalize_path("/api/profile/passkeys/550e8400-e29b-41d4-a716-446655440000"),
            "/api/profile/passkeys/:id"
        );

        assert_eq!(
            Metrics::normalize_path("/api/profile/passkeys/dGhpcy1pcy1hLWNyZWQtaWQtMTIzNA"),
            "/api/profile/passkeys/:id"
        );

        assert_eq!(Metrics::normalize_path("/api/v1/health"), "/api/v1/health");
        assert_eq!(
            Metrics::normalize_path("/api/admin/roles/at-depth/2"),
            "/api/admin/roles/at-depth/:id"
        );
    }

    #[test]
    fn test_metrics_render() {
        let metrics = Metrics::new().unwrap();

        metrics
            .ratelimit_admitted_total
            .with_label_values(&["ip"])
            .inc();

        let output = metrics.render().unwrap();
        assert!(output.contains("warden_auth_ratelimit_admitted_total"));
    }
}
