use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::validation::{validate_mobile_number, validate_new_password, validate_person_name};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    /// Opaque immutable handle, also the WebAuthn user handle.
    pub external_id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub recovery_email_enc: Option<String>,
    #[serde(skip_serializing)]
    pub recovery_email_idx: Option<String>,
    #[serde(skip_serializing)]
    pub mobile_number_enc: Option<String>,
    /// None for passkey-only accounts.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub given_name: String,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub nickname: Option<String>,
    pub email_verified: bool,
    pub enabled: bool,
    pub account_non_expired: bool,
    pub credentials_non_expired: bool,
    pub failed_login_attempts: i32,
    pub lockout_expires_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_password_change_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version; bumped by every status mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether the lockout window is currently active.
    pub fn locked_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lockout_expires_at.filter(|until| *until > now)
    }

    /// A lockout that has expired but whose counter is still at max; the
    /// pipeline resets it on the next attempt.
    pub fn lockout_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> bool {
        matches!(self.lockout_expires_at, Some(until) if until <= now)
            && self.failed_login_attempts >= max_attempts
    }
}

// DTOs

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(custom(function = validate_person_name))]
    pub given_name: String,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub nickname: Option<String>,
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(custom(function = validate_new_password))]
    pub password: String,
    #[validate(custom(function = validate_mobile_number))]
    pub mobile_number: Option<String>,
    #[validate(email(message = "must be a valid email address"))]
    pub recovery_email: Option<String>,
    pub captcha_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    pub password: String,
    pub captcha_token: Option<String>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    #[validate(custom(function = validate_new_password))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(custom(function = validate_person_name))]
    pub given_name: Option<String>,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub nickname: Option<String>,
    #[validate(custom(function = validate_mobile_number))]
    pub mobile_number: Option<String>,
    #[validate(email(message = "must be a valid email address"))]
    pub recovery_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub external_id: String,
    pub email: String,
    pub given_name: String,
    pub middle_name: Option<String>,
    pub surname: Option<String>,
    pub nickname: Option<String>,
    pub email_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            external_id: u.external_id,
            email: u.email,
            given_name: u.given_name,
            middle_name: u.middle_name,
            surname: u.surname,
            nickname: u.nickname,
            email_verified: u.email_verified,
            last_login_at: u.last_login_at,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}
