use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event types recorded by the authentication pipeline and its
/// collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    FailedLogin,
    SuccessfulLogin,
    SuccessfulLoginBlocked,
    AccountLocked,
    AccountUnlocked,
    Registration,
    PasswordChanged,
    MfaChallengeIssued,
    MfaChallengeCompleted,
    MfaChallengeFailed,
    PasskeyRegistered,
    PasskeyRemoved,
    PasskeyCounterRegression,
    RiskDenied,
    RoleAssignment,
    RoleAssignmentDenied,
    TokenRevoked,
    CacheCleared,
    RequestTimeout,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedLogin => "FAILED_LOGIN",
            Self::SuccessfulLogin => "SUCCESSFUL_LOGIN",
            Self::SuccessfulLoginBlocked => "SUCCESSFUL_LOGIN_BLOCKED",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountUnlocked => "ACCOUNT_UNLOCKED",
            Self::Registration => "REGISTRATION",
            Self::PasswordChanged => "PASSWORD_CHANGED",
            Self::MfaChallengeIssued => "MFA_CHALLENGE_ISSUED",
            Self::MfaChallengeCompleted => "MFA_CHALLENGE_COMPLETED",
            Self::MfaChallengeFailed => "MFA_CHALLENGE_FAILED",
            Self::PasskeyRegistered => "PASSKEY_REGISTERED",
            Self::PasskeyRemoved => "PASSKEY_REMOVED",
            Self::PasskeyCounterRegression => "PASSKEY_COUNTER_REGRESSION",
            Self::RiskDenied => "RISK_DENIED",
            Self::RoleAssignment => "ROLE_ASSIGNMENT",
            Self::RoleAssignmentDenied => "ROLE_ASSIGNMENT_DENIED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::CacheCleared => "CACHE_CLEARED",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub ip_address: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            email: None,
            ip_address: None,
            details: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details[key] = value.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = SecurityEvent::new(SecurityEventType::FailedLogin)
            .email("user@example.com")
            .ip("198.51.100.7")
            .detail("attempts", 3);

        assert_eq!(event.event_type.as_str(), "FAILED_LOGIN");
        assert_eq!(event.email.as_deref(), Some("user@example.com"));
        assert_eq!(event.details["attempts"], 3);
        assert!(event.user_id.is_none());
    }
}
