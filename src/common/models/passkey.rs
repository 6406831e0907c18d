use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PasskeyCredential {
    pub id: Uuid,
    /// Back-reference to the owning user; ownership is parent-owns-children,
    /// the credential never holds the user record itself.
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    /// Serialized `webauthn_rs::prelude::Passkey` (COSE key and policy).
    pub passkey_data: serde_json::Value,
    /// Authenticator signature counter; monotonic, never regresses.
    pub sign_count: i64,
    pub transports: Vec<String>,
    pub friendly_name: String,
    pub attestation_format: String,
    /// Set when a counter regression marked this credential as cloned.
    pub compromised: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FinishPasskeyRegistrationRequest {
    pub friendly_name: Option<String>,
    /// Raw `RegisterPublicKeyCredential` from the browser.
    pub credential: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct PasskeyAssertionRequest {
    /// Challenge handle returned by the authentication-options endpoint.
    pub challenge_id: String,
    /// Raw `PublicKeyCredential` from the browser.
    pub credential: serde_json::Value,
    /// Present when finishing an MFA challenge instead of a first-factor login.
    pub mfa_token: Option<String>,
    pub captcha_token: Option<String>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PasskeyResponse {
    pub credential_id: String,
    pub friendly_name: String,
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<PasskeyCredential> for PasskeyResponse {
    fn from(c: PasskeyCredential) -> Self {
        use base64::{Engine as _, engine::general_purpose};
        Self {
            credential_id: general_purpose::URL_SAFE_NO_PAD.encode(&c.credential_id),
            friendly_name: c.friendly_name,
            transports: c.transports,
            created_at: c.created_at,
            last_used_at: c.last_used_at,
        }
    }
}
