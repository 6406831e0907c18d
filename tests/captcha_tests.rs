//! CAPTCHA gate behaviour against a mocked provider.

use std::time::Duration;

use warden::config::CaptchaConfig;
use warden::{CaptchaVerifier, Error, Metrics};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn verifier_for(server_url: &str, timeout: Duration) -> CaptchaVerifier {
    CaptchaVerifier::new(
        CaptchaConfig {
            provider_url: Some(format!("{}/siteverify", server_url)),
            secret: Some("test-secret".to_string()),
            verify_timeout: timeout,
        },
        Metrics::new().unwrap(),
    )
}

#[tokio::test]
async fn test_valid_token_passes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/siteverify"))
        .and(body_string_contains("secret=test-secret"))
        .and(body_string_contains("response=good-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true
        })))
        .mount(&server)
        .await;

    let verifier = verifier_for(&server.uri(), Duration::from_secs(3));
    assert!(verifier.verify("good-token").await.is_ok());
}

#[tokio::test]
async fn test_rejected_token_is_invalid_captcha() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/siteverify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error-codes": ["invalid-input-response"]
        })))
        .mount(&server)
        .await;

    let verifier = verifier_for(&server.uri(), Duration::from_secs(3));
    let err = verifier.verify("bad-token").await.unwrap_err();
    assert!(matches!(err, Error::InvalidCaptcha));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/siteverify"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_json(serde_json::json!({ "success": true })),
        )
        .mount(&server)
        .await;

    // Time limit far below the provider's delay
    let verifier = verifier_for(&server.uri(), Duration::from_millis(50));
    let err = verifier.verify("any-token").await.unwrap_err();
    assert!(matches!(err, Error::DependencyTimeout(_)));
}

#[tokio::test]
async fn test_repeated_failures_open_the_circuit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/siteverify"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let verifier = verifier_for(&server.uri(), Duration::from_secs(1));

    // Burn through the failure threshold. A 500 body fails JSON parsing
    // and counts as a provider failure.
    for _ in 0..5 {
        let _ = verifier.verify("any-token").await;
    }

    // The breaker is now open: the request fails fast without reaching
    // the provider at all.
    let before = server.received_requests().await.unwrap().len();
    let err = verifier.verify("any-token").await.unwrap_err();
    let after = server.received_requests().await.unwrap().len();

    assert!(matches!(err, Error::DependencyTimeout(_)));
    assert_eq!(before, after, "no request should reach a tripped provider");
}

#[tokio::test]
async fn test_empty_token_fails_without_provider_call() {
    let server = MockServer::start().await;
    let verifier = verifier_for(&server.uri(), Duration::from_secs(1));

    let err = verifier.verify("").await.unwrap_err();
    assert!(matches!(err, Error::InvalidCaptcha));
    assert!(server.received_requests().await.unwrap().is_empty());
}
