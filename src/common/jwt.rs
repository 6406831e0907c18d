use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{Error, Result};

/// Token kinds issued by this service. The kind is carried in the `type`
/// claim and checked against the expectation at every validation site, so
/// a refresh token can never pass where an access token is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    /// Short-lived handle binding a risk CHALLENGE verdict to its user.
    Mfa,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Mfa => "mfa",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user's external id.
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Unique token id, tracked by the revocation store.
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub scope: String,
}

impl Claims {
    pub fn user_external_id(&self) -> &str {
        &self.sub
    }
}

/// Issues and validates the service's JWTs.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: TokenConfig,
}

impl TokenIssuer {
    pub fn new(config: TokenConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            config,
        }
    }

    fn issue(&self, external_id: &str, token_type: TokenType, scope: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let ttl = match token_type {
            TokenType::Access => self.config.access_ttl,
            TokenType::Refresh => self.config.refresh_ttl,
            TokenType::Mfa => self.config.mfa_ttl,
        };

        let claims = Claims {
            sub: external_id.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs() as i64,
            jti: Uuid::new_v4().to_string(),
            token_type,
            scope: scope.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign token");
            Error::Internal("Failed to create authentication token".to_string())
        })
    }

    pub fn issue_access_token(&self, external_id: &str, scope: &str) -> Result<String> {
        self.issue(external_id, TokenType::Access, scope)
    }

    pub fn issue_refresh_token(&self, external_id: &str) -> Result<String> {
        self.issue(external_id, TokenType::Refresh, "refresh")
    }

    pub fn issue_mfa_challenge(&self, external_id: &str) -> Result<String> {
        self.issue(external_id, TokenType::Mfa, "mfa")
    }

    /// Validate signature and claims; the revocation check is the caller's
    /// next step so this layer stays free of IO.
    ///
    /// Checks performed: signature, required claims present, `exp` in the
    /// future and `nbf` in the past (both within clock skew), `iat` not in
    /// the future, issuer, audience, and token type.
    pub fn validate(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let skew = self.config.clock_skew.as_secs();

        let mut validation = Validation::default();
        validation.leeway = skew;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iat", "nbf", "sub", "iss", "aud", "jti"]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            tracing::warn!(error = %e, "Token validation failed");
            Error::Unauthorized("Invalid or expired token".to_string())
        })?;

        let claims = token_data.claims;
        let now = Utc::now().timestamp();

        if claims.iat > now + skew as i64 {
            return Err(Error::Unauthorized("Token issued in the future".to_string()));
        }

        if claims.token_type != expected {
            return Err(Error::Unauthorized(format!(
                "Expected a {} token",
                expected.as_str()
            )));
        }

        if claims.sub.is_empty() || claims.jti.is_empty() {
            return Err(Error::Unauthorized("Token is missing identity claims".to_string()));
        }

        Ok(claims)
    }

    /// Remaining lifetime of a validated token, used to size revocation TTLs.
    pub fn remaining_lifetime_secs(&self, claims: &Claims) -> u64 {
        let skew = self.config.clock_skew.as_secs() as i64;
        (claims.exp + skew - Utc::now().timestamp()).max(1) as u64
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.config.access_ttl.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(TokenConfig {
            secret: "test_secret_key_minimum_32_chars!!".to_string(),
            issuer: "warden".to_string(),
            audience: "warden-api".to_string(),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            mfa_ttl: Duration::from_secs(300),
            clock_skew: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_issue_and_validate_access_token() {
        let issuer = issuer();
        let token = issuer.issue_access_token("ext-id-123", "profile").unwrap();
        let claims = issuer.validate(&token, TokenType::Access).unwrap();

        assert_eq!(claims.sub, "ext-id-123");
        assert_eq!(claims.iss, "warden");
        assert_eq!(claims.aud, "warden-api");
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.scope, "profile");
        assert!(!claims.jti.is_empty());
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_type_confusion_rejected() {
        let issuer = issuer();
        let refresh = issuer.issue_refresh_token("ext-id-123").unwrap();

        assert!(issuer.validate(&refresh, TokenType::Access).is_err());
        assert!(issuer.validate(&refresh, TokenType::Refresh).is_ok());

        let mfa = issuer.issue_mfa_challenge("ext-id-123").unwrap();
        assert!(issuer.validate(&mfa, TokenType::Access).is_err());
        assert!(issuer.validate(&mfa, TokenType::Mfa).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer1 = issuer();
        let issuer2 = TokenIssuer::new(TokenConfig {
            secret: "another_secret_key_minimum_32_ch!!".to_string(),
            issuer: "warden".to_string(),
            audience: "warden-api".to_string(),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            mfa_ttl: Duration::from_secs(300),
            clock_skew: Duration::from_secs(10),
        });

        let token = issuer1.issue_access_token("ext-id-123", "profile").unwrap();
        assert!(issuer2.validate(&token, TokenType::Access).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(issuer().validate("not.a.token", TokenType::Access).is_err());
    }

    #[test]
    fn test_remaining_lifetime_positive() {
        let issuer = issuer();
        let token = issuer.issue_access_token("ext-id-123", "profile").unwrap();
        let claims = issuer.validate(&token, TokenType::Access).unwrap();

        let remaining = issuer.remaining_lifetime_secs(&claims);
        assert!(remaining > 800 && remaining <= 920);
    }
}
