use actix_web::{HttpResponse, ResponseError};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    // Client errors
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),

    // Authentication outcomes
    /// Timing-equalised; never discloses whether the account exists.
    InvalidCredentials,
    AccountLocked { retry_after_secs: u64 },
    AccountDisabled,
    AccountExpired,
    CredentialsExpired,
    /// Risk verdict was CHALLENGE; carries the MFA challenge token.
    MfaRequired { challenge: String },
    RiskDenied,
    PasskeyValidationFailed(String),
    RoleAssignmentForbidden(String),

    // Anti-abuse gates
    RateLimitExceeded { retry_after_secs: u64 },
    RateLimiterUnavailable,
    CaptchaRequired,
    InvalidCaptcha,

    // Server errors
    Internal(String),
    Database(String),
    DependencyTimeout(String),
    DeadlineExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Error::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::InvalidCredentials => write!(f, "Invalid email or password"),
            Error::AccountLocked { retry_after_secs } => {
                write!(f, "Account locked; retry in {}s", retry_after_secs)
            }
            Error::AccountDisabled => write!(f, "Account is disabled"),
            Error::AccountExpired => write!(f, "Account has expired"),
            Error::CredentialsExpired => write!(f, "Credentials have expired"),
            Error::MfaRequired { .. } => write!(f, "Additional verification required"),
            Error::RiskDenied => write!(f, "Sign-in blocked by security policy"),
            Error::PasskeyValidationFailed(msg) => write!(f, "Passkey validation failed: {}", msg),
            Error::RoleAssignmentForbidden(msg) => write!(f, "Role assignment forbidden: {}", msg),
            Error::RateLimitExceeded { retry_after_secs } => {
                write!(f, "Rate limit exceeded; retry in {}s", retry_after_secs)
            }
            Error::RateLimiterUnavailable => write!(f, "Rate limiter unavailable"),
            Error::CaptchaRequired => write!(f, "CAPTCHA verification required"),
            Error::InvalidCaptcha => write!(f, "CAPTCHA verification failed"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Database(msg) => write!(f, "Database error: {}", msg),
            Error::DependencyTimeout(msg) => write!(f, "Dependency timeout: {}", msg),
            Error::DeadlineExceeded => write!(f, "Request deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Stable machine-readable discriminator used in the JSON error envelope
    /// and as the `status` label on error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::BadRequest(_) => "bad_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Conflict(_) => "conflict",
            Error::InvalidCredentials => "invalid_credentials",
            Error::AccountLocked { .. } => "account_locked",
            Error::AccountDisabled => "account_disabled",
            Error::AccountExpired => "account_expired",
            Error::CredentialsExpired => "credentials_expired",
            Error::MfaRequired { .. } => "mfa_required",
            Error::RiskDenied => "risk_denied",
            Error::PasskeyValidationFailed(_) => "passkey_validation_failed",
            Error::RoleAssignmentForbidden(_) => "role_assignment_forbidden",
            Error::RateLimitExceeded { .. } => "rate_limited",
            Error::RateLimiterUnavailable => "rate_limiter_unavailable",
            Error::CaptchaRequired => "captcha_required",
            Error::InvalidCaptcha => "invalid_captcha",
            Error::Internal(_) => "internal_error",
            Error::Database(_) => "database_error",
            Error::DependencyTimeout(_) => "dependency_timeout",
            Error::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let status = match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) | Error::InvalidCaptcha | Error::PasskeyValidationFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unauthorized(_) | Error::InvalidCredentials | Error::MfaRequired { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Error::Forbidden(_)
            | Error::AccountLocked { .. }
            | Error::AccountDisabled
            | Error::AccountExpired
            | Error::CredentialsExpired
            | Error::RiskDenied
            | Error::RoleAssignmentForbidden(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::CaptchaRequired => StatusCode::PRECONDITION_REQUIRED,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::RateLimiterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) | Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::DependencyTimeout(_) | Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        };

        let mut builder = HttpResponse::build(status);

        // Retry-After hints for throttled callers
        match self {
            Error::RateLimitExceeded { retry_after_secs }
            | Error::AccountLocked { retry_after_secs } => {
                builder.insert_header(("Retry-After", retry_after_secs.to_string()));
            }
            _ => {}
        }

        let mut body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string()
            }
        });

        if let Error::MfaRequired { challenge } = self {
            body["error"]["challenge"] = serde_json::Value::String(challenge.clone());
        }

        builder.json(body)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("Record not found".to_string()),
            sqlx::Error::Database(e) if e.is_unique_violation() => {
                Error::Conflict("Record already exists".to_string())
            }
            sqlx::Error::Database(e) => Error::Database(e.to_string()),
            _ => Error::Database(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Internal(format!("Shared store error: {}", err))
    }
}

impl From<argon2::password_hash::Error> for Error {
    fn from(err: argon2::password_hash::Error) -> Self {
        Error::Internal(format!("Password hashing error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::RateLimitExceeded { retry_after_secs: 30 }
                .error_response()
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::RateLimiterUnavailable.error_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::CaptchaRequired.error_response().status(),
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(
            Error::InvalidCredentials.error_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::AccountLocked { retry_after_secs: 900 }
                .error_response()
                .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::DeadlineExceeded.error_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_retry_after_header() {
        let resp = Error::RateLimitExceeded { retry_after_secs: 42 }.error_response();
        assert_eq!(
            resp.headers().get("Retry-After").unwrap().to_str().unwrap(),
            "42"
        );
    }

    #[test]
    fn test_invalid_credentials_hides_detail() {
        let msg = Error::InvalidCredentials.to_string();
        assert!(!msg.contains("user"));
        assert!(!msg.contains("exist"));
    }
}
