/// The authentication pipeline: the ordered chain of checks wrapped around
/// every credential-bearing request.
///
/// Password login order (each step fails closed and short-circuits):
/// client IP -> per-IP window -> per-account window -> CAPTCHA gate ->
/// account lookup (timing-equalised when absent) -> account status ->
/// credential verification -> risk consultation -> token issuance, with
/// failure accounting and lockout arming on the way out. Passkey login
/// swaps the credential step for the WebAuthn ceremony. This module is also
/// the single place that maps component errors to audit events; handlers
/// above it only translate to HTTP.
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use crate::captcha::CaptchaVerifier;
use crate::config::{LockoutConfig, RiskConfig};
use crate::db::{Database, NewUser};
use crate::encryption::{EncryptionManager, blind_index, normalise_email};
use crate::error::{Error, Result};
use crate::events::EventRecorder;
use crate::geo::GeoResolver;
use crate::jwt::{Claims, TokenIssuer, TokenType};
use crate::metrics::Metrics;
use crate::models::*;
use crate::passkeys::PasskeyService;
use crate::password::PasswordService;
use crate::rate_limit::{NS_IP, NS_USER, SlidingWindowLimiter};
use crate::revocation::RevocationStore;
use crate::risk::{Recommendation, RiskEngine, RiskVerdict};

pub struct LoginSuccess {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

pub struct AuthPipeline {
    pub db: Database,
    pub limiter: SlidingWindowLimiter,
    pub captcha: CaptchaVerifier,
    pub passwords: PasswordService,
    pub passkeys: Arc<PasskeyService>,
    pub risk: RiskEngine,
    pub geo: Arc<dyn GeoResolver>,
    pub tokens: TokenIssuer,
    pub revocation: Arc<RevocationStore>,
    pub events: EventRecorder,
    pub metrics: Metrics,
    pub encryption: EncryptionManager,
    pub lockout: LockoutConfig,
    pub risk_config: RiskConfig,
}

impl AuthPipeline {
    // ==================== Shared gate steps ====================

    /// Steps 2-3: the per-IP and (when known) per-account sliding windows.
    /// Store failures propagate as `RateLimiterUnavailable` under the
    /// fail-closed default; no user state is touched.
    async fn admit(&self, ip: &str, email: Option<&str>) -> Result<()> {
        let ip_key = format!("{}{}", NS_IP, ip);
        if !self.limiter.try_acquire(&ip_key).await? {
            tracing::warn!(ip = %ip, "Per-IP rate limit exceeded");
            return Err(Error::RateLimitExceeded {
                retry_after_secs: self.limiter.retry_after_secs(&ip_key),
            });
        }

        if let Some(email) = email {
            // The account key hashes the normalised address so credentials
            // never appear in store keys.
            let user_key = format!("{}{}", NS_USER, blind_index(&normalise_email(email)));
            if !self.limiter.try_acquire(&user_key).await? {
                tracing::warn!("Per-account rate limit exceeded");
                return Err(Error::RateLimitExceeded {
                    retry_after_secs: self.limiter.retry_after_secs(&user_key),
                });
            }
        }

        Ok(())
    }

    /// Step 4: the CAPTCHA gate. Required when the address has a suspicious
    /// history or the account has recent failures; the provider call runs
    /// under its own time limit and circuit breaker.
    async fn captcha_gate(&self, ip: &str, email: Option<&str>, token: Option<&str>) -> Result<()> {
        let suspicious_ip = match self.db.get_ip_metadata(ip).await? {
            Some(meta) => meta.suspicious_count >= self.risk_config.suspicious_ip_threshold,
            None => false,
        };

        let failing_account = match email {
            Some(email) => {
                self.db
                    .recent_failed_logins(email, self.lockout.failure_window)
                    .await?
                    >= self.lockout.captcha_after_failures
            }
            None => false,
        };

        if !suspicious_ip && !failing_account {
            return Ok(());
        }

        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => {
                self.metrics
                    .captcha_checks_total
                    .with_label_values(&["required"])
                    .inc();
                return Err(Error::CaptchaRequired);
            }
        };

        if !self.limiter.try_acquire("captcha:global").await? {
            return Err(Error::RateLimitExceeded {
                retry_after_secs: self.limiter.retry_after_secs("captcha:global"),
            });
        }

        self.captcha.verify(token).await
    }

    // ==================== Password login ====================

    pub async fn password_login(&self, ip: &str, request: &LoginRequest) -> Result<LoginSuccess> {
        let email = normalise_email(&request.email);

        self.admit(ip, Some(&email)).await?;
        self.captcha_gate(ip, Some(&email), request.captcha_token.as_deref())
            .await?;

        // Step 5: account lookup, timing-equalised when absent.
        let user = match self.db.find_by_email(&email).await? {
            Some(user) => user,
            None => {
                self.passwords.dummy_verify(&request.password);
                self.events
                    .record(
                        SecurityEvent::new(SecurityEventType::FailedLogin)
                            .email(&email)
                            .ip(ip)
                            .detail("reason", "unknown_account"),
                    )
                    .await?;
                self.count_login("password", "invalid");
                return Err(Error::InvalidCredentials);
            }
        };

        // Step 6: account status.
        let mut version = self.check_account_status(&user, ip).await?;

        // Step 7: credential verification.
        let stored_hash = match &user.password_hash {
            Some(hash) => hash.clone(),
            None => {
                // Passkey-only account probed over the password path: burn
                // the same CPU and account it as a failure.
                self.passwords.dummy_verify(&request.password);
                self.account_failure(&user, version, ip).await?;
                self.count_login("password", "invalid");
                return Err(Error::InvalidCredentials);
            }
        };

        let outcome = self.passwords.verify(&request.password, &stored_hash)?;
        if !outcome.matches {
            self.account_failure(&user, version, ip).await?;
            self.count_login("password", "invalid");
            return Err(Error::InvalidCredentials);
        }

        // Step 8: success housekeeping before any token leaves the building.
        if outcome.needs_rehash {
            let new_hash = self.passwords.hash(&request.password)?;
            if self.db.rehash_password(user.id, version, &new_hash).await? {
                version += 1;
                tracing::info!(user_id = %user.id, "Stored hash upgraded to argon2id");
            }
        }

        self.finish_login(user, version, ip, request.device_fingerprint.as_deref(), "password")
            .await
    }

    // ==================== Passkey login ====================

    /// Finish a passkey assertion begun with `begin_authentication`.
    /// The WebAuthn ceremony replaces the password steps; the CAPTCHA gate
    /// is bypassed when the authenticator verified the user.
    pub async fn passkey_assert(
        &self,
        ip: &str,
        challenge_id: &str,
        request: &PasskeyAssertionRequest,
    ) -> Result<LoginSuccess> {
        self.admit(ip, None).await?;

        let credential: PublicKeyCredential = serde_json::from_value(request.credential.clone())
            .map_err(|e| Error::PasskeyValidationFailed(format!("malformed assertion: {}", e)))?;

        let assertion = match self
            .passkeys
            .finish_authentication(&self.db, &self.events, challenge_id, &credential)
            .await
        {
            Ok(assertion) => assertion,
            Err(e) => {
                self.metrics
                    .passkey_ceremonies_total
                    .with_label_values(&["authentication", "failed"])
                    .inc();
                self.events
                    .record_best_effort(
                        SecurityEvent::new(SecurityEventType::FailedLogin)
                            .ip(ip)
                            .detail("reason", "passkey_assertion_failed"),
                    )
                    .await;
                return Err(e);
            }
        };

        self.metrics
            .passkey_ceremonies_total
            .with_label_values(&["authentication", "success"])
            .inc();

        let user = self.db.get_user(assertion.user_id).await?;

        // Per-account window now that the account is known.
        let user_key = format!("{}{}", NS_USER, blind_index(&user.email));
        if !self.limiter.try_acquire(&user_key).await? {
            return Err(Error::RateLimitExceeded {
                retry_after_secs: self.limiter.retry_after_secs(&user_key),
            });
        }

        let version = self.check_account_status(&user, ip).await?;

        // UV=true stands in for the CAPTCHA gate; without it the same
        // suspicion rules apply as on the password path.
        if !assertion.user_verified {
            self.captcha_gate(ip, Some(&user.email), request.captcha_token.as_deref())
                .await?;
        }

        self.finish_login(
            user,
            version,
            ip,
            request.device_fingerprint.as_deref(),
            "passkey",
        )
        .await
    }

    /// Complete a risk CHALLENGE verdict: the short-lived MFA token binds
    /// the user, and a passkey assertion proves them.
    pub async fn complete_mfa(
        &self,
        ip: &str,
        mfa_token: &str,
        challenge_id: &str,
        request: &PasskeyAssertionRequest,
    ) -> Result<LoginSuccess> {
        self.admit(ip, None).await?;

        let claims = self.tokens.validate(mfa_token, TokenType::Mfa)?;
        if self.revocation.is_revoked(&claims.jti).await? {
            return Err(Error::Unauthorized("Challenge already used".to_string()));
        }

        let user = self
            .db
            .find_by_external_id(&claims.sub)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        let credential: PublicKeyCredential = serde_json::from_value(request.credential.clone())
            .map_err(|e| Error::PasskeyValidationFailed(format!("malformed assertion: {}", e)))?;

        let assertion = match self
            .passkeys
            .finish_authentication(&self.db, &self.events, challenge_id, &credential)
            .await
        {
            Ok(assertion) => assertion,
            Err(e) => {
                self.events
                    .record_best_effort(
                        SecurityEvent::new(SecurityEventType::MfaChallengeFailed)
                            .user(user.id)
                            .ip(ip),
                    )
                    .await;
                self.count_login("mfa", "invalid");
                return Err(e);
            }
        };

        if assertion.user_id != user.id {
            self.count_login("mfa", "invalid");
            return Err(Error::PasskeyValidationFailed(
                "credential does not belong to the challenged user".to_string(),
            ));
        }

        // Single use: consume the challenge token before issuing anything.
        let expires_at = Utc::now()
            + ChronoDuration::seconds(self.tokens.remaining_lifetime_secs(&claims) as i64);
        self.revocation
            .revoke(&claims.jti, Some(user.id), expires_at, "mfa_consumed")
            .await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::MfaChallengeCompleted)
                    .user(user.id)
                    .ip(ip),
            )
            .await?;

        let version = self.check_account_status(&user, ip).await?;
        self.finish_login(user, version, ip, request.device_fingerprint.as_deref(), "mfa")
            .await
    }

    // ==================== Registration ====================

    /// Registration re-uses the gate steps; no tokens are issued.
    pub async fn register(&self, ip: &str, request: &RegisterRequest) -> Result<User> {
        let email = normalise_email(&request.email);

        self.admit(ip, Some(&email)).await?;
        self.captcha_gate(ip, None, request.captcha_token.as_deref())
            .await?;

        self.passwords.check_complexity(&request.password)?;

        if let Some(recovery) = &request.recovery_email {
            let idx = blind_index(&normalise_email(recovery));
            if self.db.exists_by_recovery_email_blind_index(&idx).await? {
                return Err(Error::Conflict("Recovery email already in use".to_string()));
            }
        }

        let password_hash = self.passwords.hash(&request.password)?;

        let user = self
            .db
            .create_user(
                NewUser {
                    email: &email,
                    password_hash: Some(password_hash),
                    given_name: &request.given_name,
                    middle_name: request.middle_name.as_deref(),
                    surname: request.surname.as_deref(),
                    nickname: request.nickname.as_deref(),
                    mobile_number: request.mobile_number.as_deref(),
                    recovery_email: request.recovery_email.as_deref(),
                },
                &self.encryption,
            )
            .await?;

        tracing::info!(user_id = %user.id, "User registered");

        Ok(user)
    }

    // ==================== Tokens ====================

    /// Full inbound access-token validation: claims, revocation, and a
    /// subject that still resolves to a live, enabled account. Any failure
    /// after the signature check best-effort revokes the presented token.
    pub async fn authenticate_access(&self, token: &str) -> Result<(User, Claims)> {
        let claims = self.tokens.validate(token, TokenType::Access)?;

        if self.revocation.is_revoked(&claims.jti).await? {
            tracing::warn!(jti = %claims.jti, "Attempt to use revoked token");
            return Err(Error::Unauthorized("Invalid or expired token".to_string()));
        }

        let user = match self.db.find_by_external_id(&claims.sub).await? {
            Some(user) if user.enabled => user,
            _ => {
                self.revoke_best_effort(&claims, "validation_failure").await;
                return Err(Error::Unauthorized("Invalid or expired token".to_string()));
            }
        };

        // Tokens issued before the last password change are dead: this is
        // how revoke-all-on-password-change reaches already-issued tokens.
        if let Some(changed_at) = user.last_password_change_at {
            if claims.iat < changed_at.timestamp() {
                self.revoke_best_effort(&claims, "password_change").await;
                return Err(Error::Unauthorized("Invalid or expired token".to_string()));
            }
        }

        Ok((user, claims))
    }

    /// Refresh rotation: the presented refresh token is consumed and a new
    /// pair is issued. Reuse of a rotated token is replay and fails here.
    pub async fn refresh(&self, refresh_token: &str) -> Result<LoginSuccess> {
        let claims = self.tokens.validate(refresh_token, TokenType::Refresh)?;

        if self.revocation.is_revoked(&claims.jti).await? {
            tracing::warn!(jti = %claims.jti, "Replay of a rotated refresh token");
            return Err(Error::Unauthorized("Invalid or expired token".to_string()));
        }

        let user = match self.db.find_by_external_id(&claims.sub).await? {
            Some(user) if user.enabled => user,
            _ => {
                self.revoke_best_effort(&claims, "validation_failure").await;
                return Err(Error::Unauthorized("Invalid or expired token".to_string()));
            }
        };

        if let Some(changed_at) = user.last_password_change_at {
            if claims.iat < changed_at.timestamp() {
                self.revoke_best_effort(&claims, "password_change").await;
                return Err(Error::Unauthorized("Invalid or expired token".to_string()));
            }
        }

        let expires_at = Utc::now()
            + ChronoDuration::seconds(self.tokens.remaining_lifetime_secs(&claims) as i64);
        self.revocation
            .revoke(&claims.jti, Some(user.id), expires_at, "rotation")
            .await?;

        self.issue_pair(user).await
    }

    /// Logout: the token's jti joins the revoked set for its remaining
    /// lifetime plus skew.
    pub async fn logout(&self, claims: &Claims, user_id: Option<uuid::Uuid>) -> Result<()> {
        let expires_at = Utc::now()
            + ChronoDuration::seconds(self.tokens.remaining_lifetime_secs(claims) as i64);
        self.revocation
            .revoke(&claims.jti, user_id, expires_at, "logout")
            .await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::TokenRevoked)
                    .detail("jti", claims.jti.clone())
                    .detail("reason", "logout"),
            )
            .await?;

        Ok(())
    }

    /// Password change: verify the old secret, enforce complexity on the
    /// new one, and shift the revoke-all watermark so every outstanding
    /// token dies.
    pub async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let stored = user
            .password_hash
            .as_ref()
            .ok_or_else(|| Error::BadRequest("Account has no password credential".to_string()))?;

        if !self.passwords.verify(old_password, stored)?.matches {
            return Err(Error::InvalidCredentials);
        }

        self.passwords.check_complexity(new_password)?;

        let new_hash = self.passwords.hash(new_password)?;
        self.db.update_password(user.id, &new_hash).await?;

        self.metrics
            .tokens_revoked_total
            .with_label_values(&["password_change"])
            .inc();

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::PasswordChanged)
                    .user(user.id)
                    .email(&user.email),
            )
            .await?;

        Ok(())
    }

    // ==================== Internal steps ====================

    /// Step 6. Returns the version to CAS subsequent mutations against.
    async fn check_account_status(&self, user: &User, ip: &str) -> Result<i64> {
        let now = Utc::now();

        if !user.enabled {
            return Err(Error::AccountDisabled);
        }
        if !user.account_non_expired {
            return Err(Error::AccountExpired);
        }
        if !user.credentials_non_expired {
            return Err(Error::CredentialsExpired);
        }

        if let Some(until) = user.locked_until(now) {
            let retry_after_secs = (until - now).num_seconds().max(1) as u64;
            tracing::warn!(user_id = %user.id, "Login attempt against locked account");
            return Err(Error::AccountLocked { retry_after_secs });
        }

        // Expired lockout with the counter still at max: auto-unlock.
        if user.lockout_expired(now, self.lockout.max_login_attempts) {
            if !self.db.reset_lockout(user.id, user.version).await? {
                return Err(Error::Internal(
                    "Concurrent account status update".to_string(),
                ));
            }
            self.events
                .record(
                    SecurityEvent::new(SecurityEventType::AccountUnlocked)
                        .user(user.id)
                        .ip(ip),
                )
                .await?;
            return Ok(user.version + 1);
        }

        Ok(user.version)
    }

    /// Step 9: failure accounting. The increment and the conditional
    /// lockout arm ride in one compare-and-set statement.
    async fn account_failure(&self, user: &User, version: i64, ip: &str) -> Result<()> {
        let lockout_until =
            Utc::now() + ChronoDuration::seconds(self.lockout.lockout_duration.as_secs() as i64);

        let result = self
            .db
            .record_login_failure(user.id, version, self.lockout.max_login_attempts, lockout_until)
            .await?;

        let mut event = SecurityEvent::new(SecurityEventType::FailedLogin)
            .user(user.id)
            .email(&user.email)
            .ip(ip);

        match result {
            Some((attempts, Some(locked_until))) if attempts >= self.lockout.max_login_attempts => {
                event = event.detail("attempts", attempts);
                self.events.record(event).await?;

                self.metrics.accounts_locked_total.inc();
                self.events
                    .record(
                        SecurityEvent::new(SecurityEventType::AccountLocked)
                            .user(user.id)
                            .email(&user.email)
                            .ip(ip)
                            .detail("locked_until", locked_until.to_rfc3339()),
                    )
                    .await?;

                tracing::warn!(
                    user_id = %user.id,
                    attempts = attempts,
                    "Account locked after repeated failures"
                );
            }
            Some((attempts, _)) => {
                event = event.detail("attempts", attempts);
                self.events.record(event).await?;
            }
            None => {
                // Lost the CAS to a concurrent attempt; that attempt did the
                // accounting. Still record the failure itself.
                self.events.record(event).await?;
            }
        }

        Ok(())
    }

    /// Step 8 tail shared by every successful credential check: reset
    /// counters, record the observation, consult the risk engine, and only
    /// then issue tokens.
    async fn finish_login(
        &self,
        user: User,
        version: i64,
        ip: &str,
        device_fingerprint: Option<&str>,
        method: &str,
    ) -> Result<LoginSuccess> {
        // The credential checked out, so the failure counter resets and the
        // login is stamped here, whatever the risk verdict decides next. A
        // denied or challenged attempt must not carry stale failures into
        // the next one.
        if !self.db.record_login_success(user.id, version).await? {
            return Err(Error::Internal(
                "Concurrent account status update".to_string(),
            ));
        }

        // Risk is consulted against the *previous* observation history.
        let (verdict, location, asn) = self
            .risk
            .assess(
                &self.db,
                self.geo.as_ref(),
                &self.metrics,
                Some(&user),
                ip,
                device_fingerprint,
            )
            .await?;

        let suspicious = verdict.recommendation != Recommendation::Allow;
        self.db
            .record_ip_observation(ip, &location, asn, suspicious)
            .await?;

        match verdict.recommendation {
            Recommendation::Deny => {
                self.audit_risk_denial(&user, ip, &verdict).await?;
                self.count_login(method, "risk_denied");
                Err(Error::RiskDenied)
            }
            Recommendation::Challenge if method == "password" => {
                let challenge = self.tokens.issue_mfa_challenge(&user.external_id)?;
                self.metrics
                    .tokens_issued_total
                    .with_label_values(&["mfa"])
                    .inc();
                self.events
                    .record(
                        SecurityEvent::new(SecurityEventType::MfaChallengeIssued)
                            .user(user.id)
                            .ip(ip)
                            .detail("score", verdict.score),
                    )
                    .await?;
                self.count_login(method, "mfa_required");
                Err(Error::MfaRequired { challenge })
            }
            // A verified passkey (or a completed challenge) already is the
            // second factor; CHALLENGE collapses to ALLOW on those paths.
            _ => {
                let mut event = SecurityEvent::new(SecurityEventType::SuccessfulLogin)
                    .user(user.id)
                    .email(&user.email)
                    .ip(ip)
                    .detail("method", method);
                if let Some(country) = &location.country_code {
                    event = event.detail("country", country.clone());
                }
                if let Some(fingerprint) = device_fingerprint {
                    event = event.detail("device_fingerprint", fingerprint);
                }
                self.events.record(event).await?;

                self.count_login(method, "success");
                self.issue_pair(user).await
            }
        }
    }

    async fn issue_pair(&self, user: User) -> Result<LoginSuccess> {
        let access_token = self.tokens.issue_access_token(&user.external_id, "profile")?;
        let refresh_token = self.tokens.issue_refresh_token(&user.external_id)?;

        self.metrics
            .tokens_issued_total
            .with_label_values(&["access"])
            .inc();
        self.metrics
            .tokens_issued_total
            .with_label_values(&["refresh"])
            .inc();

        Ok(LoginSuccess {
            expires_in: self.tokens.access_ttl_secs(),
            user,
            access_token,
            refresh_token,
        })
    }

    async fn audit_risk_denial(&self, user: &User, ip: &str, verdict: &RiskVerdict) -> Result<()> {
        self.events
            .record(
                SecurityEvent::new(SecurityEventType::SuccessfulLoginBlocked)
                    .user(user.id)
                    .email(&user.email)
                    .ip(ip)
                    .detail("score", verdict.score),
            )
            .await?;
        self.events
            .record(
                SecurityEvent::new(SecurityEventType::RiskDenied)
                    .user(user.id)
                    .ip(ip)
                    .detail("score", verdict.score)
                    .detail("signals", serde_json::json!(verdict.signals)),
            )
            .await?;

        tracing::warn!(
            user_id = %user.id,
            score = verdict.score,
            signals = ?verdict.signals,
            "Login blocked by risk verdict"
        );

        Ok(())
    }

    async fn revoke_best_effort(&self, claims: &Claims, reason: &str) {
        let expires_at = Utc::now()
            + ChronoDuration::seconds(self.tokens.remaining_lifetime_secs(claims) as i64);
        if let Err(e) = self
            .revocation
            .revoke(&claims.jti, None, expires_at, reason)
            .await
        {
            tracing::warn!(jti = %claims.jti, error = %e, "Best-effort revocation failed");
        }
    }

    /// Registration of a new passkey for an authenticated user.
    pub async fn register_passkey(
        &self,
        user: &User,
        response: &RegisterPublicKeyCredential,
        friendly_name: &str,
    ) -> Result<PasskeyCredential> {
        let result = self
            .passkeys
            .finish_registration(&self.db, user, response, friendly_name)
            .await;

        match &result {
            Ok(credential) => {
                self.metrics
                    .passkey_ceremonies_total
                    .with_label_values(&["registration", "success"])
                    .inc();
                self.events
                    .record_best_effort(
                        SecurityEvent::new(SecurityEventType::PasskeyRegistered)
                            .user(user.id)
                            .detail("friendly_name", credential.friendly_name.clone()),
                    )
                    .await;
            }
            Err(_) => {
                self.metrics
                    .passkey_ceremonies_total
                    .with_label_values(&["registration", "failed"])
                    .inc();
            }
        }

        result
    }

    fn count_login(&self, method: &str, outcome: &str) {
        self.metrics
            .login_attempts_total
            .with_label_values(&[method, outcome])
            .inc();
    }
}

/// Resolve the client address: the left-most untrusted hop of
/// X-Forwarded-For when the peer is a configured proxy, the socket peer
/// otherwise. `None` (no peer, or an unparseable header from a trusted
/// proxy) must be treated as a deny by the caller.
pub fn client_ip(
    peer: Option<std::net::IpAddr>,
    forwarded_for: Option<&str>,
    trusted_proxies: &[ipnet::IpNet],
) -> Option<String> {
    let peer = peer?;

    let peer_is_trusted = trusted_proxies.iter().any(|net| net.contains(&peer));
    if !peer_is_trusted {
        return Some(peer.to_string());
    }

    let header = forwarded_for?;

    // Walk right to left: drop trusted proxies, take the first real client.
    let hops: Vec<std::net::IpAddr> = header
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();

    if hops.len() != header.split(',').count() {
        tracing::warn!(header = %header, "Malformed X-Forwarded-For from trusted proxy");
        return None;
    }

    for hop in hops.iter().rev() {
        if !trusted_proxies.iter().any(|net| net.contains(hop)) {
            return Some(hop.to_string());
        }
    }

    // Every hop was a trusted proxy; fall back to the left-most entry.
    hops.first().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn net(s: &str) -> ipnet::IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_untrusted_peer_wins_over_header() {
        // Spoofed X-Forwarded-For from a direct client is ignored
        let got = client_ip(
            Some(ip("203.0.113.9")),
            Some("10.0.0.1, 198.51.100.7"),
            &[net("10.0.0.0/8")],
        );
        assert_eq!(got.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_trusted_proxy_unwraps_header() {
        let got = client_ip(
            Some(ip("10.0.0.1")),
            Some("203.0.113.9"),
            &[net("10.0.0.0/8")],
        );
        assert_eq!(got.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_left_most_untrusted_hop() {
        // client -> corporate proxy -> our LB; the LB and an internal hop
        // are trusted, the corporate proxy is the client-facing address.
        let got = client_ip(
            Some(ip("10.0.0.1")),
            Some("203.0.113.9, 198.51.100.7, 10.0.0.2"),
            &[net("10.0.0.0/8")],
        );
        assert_eq!(got.as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn test_missing_peer_denies() {
        assert_eq!(client_ip(None, Some("203.0.113.9"), &[]), None);
    }

    #[test]
    fn test_malformed_header_from_proxy_denies() {
        let got = client_ip(
            Some(ip("10.0.0.1")),
            Some("203.0.113.9, not-an-ip"),
            &[net("10.0.0.0/8")],
        );
        assert_eq!(got, None);
    }

    #[test]
    fn test_trusted_peer_without_header_denies() {
        // A proxy that strips the forwarding header leaves us with no
        // client identity at all.
        let got = client_ip(Some(ip("10.0.0.1")), None, &[net("10.0.0.0/8")]);
        assert_eq!(got, None);
    }

    #[test]
    fn test_all_hops_trusted_falls_back() {
        let got = client_ip(
            Some(ip("10.0.0.1")),
            Some("10.0.0.3, 10.0.0.2"),
            &[net("10.0.0.0/8")],
        );
        assert_eq!(got.as_deref(), Some("10.0.0.3"));
    }
}
