/// WebAuthn passkey ceremonies.
///
/// Wraps `webauthn-rs` and keeps in-flight challenge state in process with
/// a five-minute TTL. A challenge is consumed by removal before validation,
/// so a second finish call with the same payload always fails. Credential
/// persistence and the signature-counter policy live here too: the counter
/// must advance strictly (a fresh credential may present zero once), and a
/// regression marks the credential compromised and rejects the assertion.
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose};
use dashmap::DashMap;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

use crate::config::WebAuthnConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::EventRecorder;
use crate::models::{PasskeyCredential, SecurityEvent, SecurityEventType, User};

const CHALLENGE_TTL: Duration = Duration::from_secs(300);

struct PendingRegistration {
    state: PasskeyRegistration,
    created_at: Instant,
}

enum AuthenticationState {
    /// Credentials were scoped to a known user at begin time.
    Scoped {
        state: PasskeyAuthentication,
        user_id: Uuid,
    },
    /// Resident-key discovery; the authenticator names the user handle.
    Discoverable { state: DiscoverableAuthentication },
}

struct PendingAuthentication {
    state: AuthenticationState,
    created_at: Instant,
}

/// Outcome of a verified assertion, handed to the pipeline for risk
/// scoring and token issuance.
pub struct VerifiedAssertion {
    pub user_id: Uuid,
    pub credential_id: Vec<u8>,
    pub user_verified: bool,
}

pub struct PasskeyService {
    webauthn: Webauthn,
    pending_registrations: DashMap<Uuid, PendingRegistration>,
    pending_authentications: DashMap<String, PendingAuthentication>,
}

/// The WebAuthn user handle is the account's external id: URL-safe base64
/// of 16 bytes, which maps 1:1 onto the Uuid `webauthn-rs` expects.
fn user_handle_uuid(external_id: &str) -> Result<Uuid> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(external_id)
        .map_err(|_| Error::Internal("Malformed external id".to_string()))?;
    let array: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::Internal("External id is not 16 bytes".to_string()))?;
    Ok(Uuid::from_bytes(array))
}

fn stored_passkey(credential: &PasskeyCredential) -> Result<Passkey> {
    serde_json::from_value(credential.passkey_data.clone())
        .map_err(|e| Error::Internal(format!("Corrupt stored passkey: {}", e)))
}

impl PasskeyService {
    pub fn new(config: &WebAuthnConfig) -> Result<Self> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| Error::Internal(format!("Invalid WebAuthn origin: {}", e)))?;

        let webauthn = WebauthnBuilder::new(&config.rp_id, &origin)
            .map_err(|e| Error::Internal(format!("WebAuthn builder error: {}", e)))?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|e| Error::Internal(format!("WebAuthn build error: {}", e)))?;

        Ok(Self {
            webauthn,
            pending_registrations: DashMap::new(),
            pending_authentications: DashMap::new(),
        })
    }

    /// Begin registration for an authenticated user. Existing credentials
    /// are excluded so an authenticator cannot double-register.
    pub fn begin_registration(
        &self,
        user: &User,
        existing: &[PasskeyCredential],
    ) -> Result<CreationChallengeResponse> {
        self.cleanup_expired();

        let handle = user_handle_uuid(&user.external_id)?;

        let exclude: Vec<CredentialID> = existing
            .iter()
            .map(|c| CredentialID::from(c.credential_id.clone()))
            .collect();
        let exclude_opt = if exclude.is_empty() { None } else { Some(exclude) };

        let display_name = user.nickname.clone().unwrap_or_else(|| user.given_name.clone());

        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(handle, &user.email, &display_name, exclude_opt)
            .map_err(|e| Error::PasskeyValidationFailed(format!("start registration: {}", e)))?;

        self.pending_registrations.insert(
            user.id,
            PendingRegistration {
                state: reg_state,
                created_at: Instant::now(),
            },
        );

        Ok(ccr)
    }

    /// Finish registration and persist the credential with counter zero.
    /// Any validation failure has already consumed the challenge.
    pub async fn finish_registration(
        &self,
        db: &Database,
        user: &User,
        response: &RegisterPublicKeyCredential,
        friendly_name: &str,
    ) -> Result<PasskeyCredential> {
        let (_, pending) = self
            .pending_registrations
            .remove(&user.id)
            .ok_or_else(|| {
                Error::PasskeyValidationFailed("no pending registration challenge".to_string())
            })?;

        if pending.created_at.elapsed() > CHALLENGE_TTL {
            return Err(Error::PasskeyValidationFailed(
                "registration challenge expired".to_string(),
            ));
        }

        let passkey = self
            .webauthn
            .finish_passkey_registration(response, &pending.state)
            .map_err(|e| Error::PasskeyValidationFailed(e.to_string()))?;

        let credential_id: Vec<u8> = passkey.cred_id().to_vec();

        if db.find_passkey_by_credential_id(&credential_id).await?.is_some() {
            return Err(Error::PasskeyValidationFailed(
                "credential id already registered".to_string(),
            ));
        }

        let passkey_data = serde_json::to_value(&passkey)
            .map_err(|e| Error::Internal(format!("Failed to serialize passkey: {}", e)))?;

        let transports: Vec<String> = response
            .response
            .transports
            .as_ref()
            .map(|list| list.iter().map(|t| format!("{:?}", t).to_lowercase()).collect())
            .unwrap_or_default();

        db.add_passkey(
            user.id,
            &credential_id,
            &passkey_data,
            &transports,
            friendly_name,
            "none",
        )
        .await
    }

    /// Begin authentication. With a known user the allow-list is scoped to
    /// their credentials; without one the ceremony relies on resident-key
    /// discovery. Returns an opaque challenge id the client echoes back.
    pub fn begin_authentication(
        &self,
        user: Option<(&User, &[PasskeyCredential])>,
    ) -> Result<(String, RequestChallengeResponse)> {
        self.cleanup_expired();

        let (rcr, state) = match user {
            Some((user, credentials)) => {
                let passkeys: Vec<Passkey> = credentials
                    .iter()
                    .filter(|c| !c.compromised)
                    .map(stored_passkey)
                    .collect::<Result<_>>()?;

                if passkeys.is_empty() {
                    return Err(Error::PasskeyValidationFailed(
                        "no usable passkeys registered".to_string(),
                    ));
                }

                let (rcr, auth_state) = self
                    .webauthn
                    .start_passkey_authentication(&passkeys)
                    .map_err(|e| {
                        Error::PasskeyValidationFailed(format!("start authentication: {}", e))
                    })?;

                (
                    rcr,
                    AuthenticationState::Scoped {
                        state: auth_state,
                        user_id: user.id,
                    },
                )
            }
            None => {
                let (rcr, auth_state) = self
                    .webauthn
                    .start_discoverable_authentication()
                    .map_err(|e| {
                        Error::PasskeyValidationFailed(format!("start authentication: {}", e))
                    })?;

                (rcr, AuthenticationState::Discoverable { state: auth_state })
            }
        };

        let challenge_id = Uuid::new_v4().to_string();
        self.pending_authentications.insert(
            challenge_id.clone(),
            PendingAuthentication {
                state,
                created_at: Instant::now(),
            },
        );

        Ok((challenge_id, rcr))
    }

    /// Finish authentication: verify the assertion, enforce presence and
    /// the counter policy, and persist the advanced counter atomically.
    pub async fn finish_authentication(
        &self,
        db: &Database,
        events: &EventRecorder,
        challenge_id: &str,
        response: &PublicKeyCredential,
    ) -> Result<VerifiedAssertion> {
        let (_, pending) = self
            .pending_authentications
            .remove(challenge_id)
            .ok_or_else(|| {
                Error::PasskeyValidationFailed("no pending authentication challenge".to_string())
            })?;

        if pending.created_at.elapsed() > CHALLENGE_TTL {
            return Err(Error::PasskeyValidationFailed(
                "authentication challenge expired".to_string(),
            ));
        }

        let (result, user_id) = match pending.state {
            AuthenticationState::Scoped { state, user_id } => {
                let result = self
                    .webauthn
                    .finish_passkey_authentication(response, &state)
                    .map_err(|e| Error::PasskeyValidationFailed(e.to_string()))?;
                (result, user_id)
            }
            AuthenticationState::Discoverable { state } => {
                let (handle, _cred_id) = self
                    .webauthn
                    .identify_discoverable_authentication(response)
                    .map_err(|e| Error::PasskeyValidationFailed(e.to_string()))?;

                let external_id = general_purpose::URL_SAFE_NO_PAD.encode(handle.as_bytes());
                let user = db
                    .find_by_external_id(&external_id)
                    .await?
                    .ok_or_else(|| {
                        Error::PasskeyValidationFailed("unknown user handle".to_string())
                    })?;

                let credentials = db.list_passkeys(user.id).await?;
                let discoverable: Vec<DiscoverableKey> = credentials
                    .iter()
                    .filter(|c| !c.compromised)
                    .map(stored_passkey)
                    .collect::<Result<Vec<Passkey>>>()?
                    .into_iter()
                    .map(DiscoverableKey::from)
                    .collect();

                let result = self
                    .webauthn
                    .finish_discoverable_authentication(response, state, &discoverable)
                    .map_err(|e| Error::PasskeyValidationFailed(e.to_string()))?;
                (result, user.id)
            }
        };

        let credential_id: Vec<u8> = result.cred_id().to_vec();

        let stored = db
            .find_passkey_by_credential_id(&credential_id)
            .await?
            .ok_or_else(|| Error::PasskeyValidationFailed("unknown credential".to_string()))?;

        if stored.user_id != user_id {
            return Err(Error::PasskeyValidationFailed(
                "credential does not belong to this user".to_string(),
            ));
        }

        if stored.compromised {
            return Err(Error::PasskeyValidationFailed(
                "credential has been marked compromised".to_string(),
            ));
        }

        let new_counter = result.counter() as i64;

        // Strictly increasing, with one allowance: authenticators without a
        // counter report zero forever, which is fine only while the stored
        // value is also zero.
        let acceptable = new_counter > stored.sign_count || (new_counter == 0 && stored.sign_count == 0);
        if !acceptable {
            db.mark_passkey_compromised(&credential_id).await?;
            events
                .record_best_effort(
                    SecurityEvent::new(SecurityEventType::PasskeyCounterRegression)
                        .user(user_id)
                        .detail("stored_counter", stored.sign_count)
                        .detail("presented_counter", new_counter),
                )
                .await;

            tracing::error!(
                user_id = %user_id,
                stored = stored.sign_count,
                presented = new_counter,
                "Passkey signature counter regression; credential marked compromised"
            );

            return Err(Error::PasskeyValidationFailed(
                "signature counter regression".to_string(),
            ));
        }

        // Refresh the serialized credential state alongside the counter.
        let mut passkey = stored_passkey(&stored)?;
        passkey.update_credential(&result);
        let passkey_data = serde_json::to_value(&passkey)
            .map_err(|e| Error::Internal(format!("Failed to serialize passkey: {}", e)))?;

        let advanced = db
            .advance_passkey_counter(&credential_id, stored.sign_count, new_counter, &passkey_data)
            .await?;

        if !advanced {
            // A concurrent assertion moved the counter first; replaying this
            // one would mean accepting the same counter value twice.
            return Err(Error::PasskeyValidationFailed(
                "assertion superseded by a concurrent authentication".to_string(),
            ));
        }

        Ok(VerifiedAssertion {
            user_id,
            credential_id,
            user_verified: result.user_verified(),
        })
    }

    fn cleanup_expired(&self) {
        self.pending_registrations
            .retain(|_, v| v.created_at.elapsed() < CHALLENGE_TTL);
        self.pending_authentications
            .retain(|_, v| v.created_at.elapsed() < CHALLENGE_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_handle_roundtrip() {
        let bytes: [u8; 16] = [7; 16];
        let external_id = general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        let handle = user_handle_uuid(&external_id).unwrap();
        assert_eq!(handle.as_bytes(), &bytes);
        assert_eq!(
            general_purpose::URL_SAFE_NO_PAD.encode(handle.as_bytes()),
            external_id
        );
    }

    #[test]
    fn test_user_handle_rejects_bad_input() {
        assert!(user_handle_uuid("!!!not-base64!!!").is_err());
        // Valid base64 of the wrong length
        assert!(user_handle_uuid(&general_purpose::URL_SAFE_NO_PAD.encode([1u8; 8])).is_err());
    }

    #[test]
    fn test_service_builds_from_config() {
        let service = PasskeyService::new(&WebAuthnConfig {
            rp_id: "localhost".to_string(),
            rp_name: "Warden".to_string(),
            origin: "http://localhost:8080".to_string(),
        });
        assert!(service.is_ok());

        let bad = PasskeyService::new(&WebAuthnConfig {
            rp_id: "localhost".to_string(),
            rp_name: "Warden".to_string(),
            origin: "not a url".to_string(),
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_begin_authentication_unscoped_issues_challenge() {
        let service = PasskeyService::new(&WebAuthnConfig {
            rp_id: "localhost".to_string(),
            rp_name: "Warden".to_string(),
            origin: "http://localhost:8080".to_string(),
        })
        .unwrap();

        let (challenge_id, rcr) = service.begin_authentication(None).unwrap();
        assert!(!challenge_id.is_empty());
        // Discovery ceremonies carry an empty allow-list
        assert!(rcr.public_key.allow_credentials.is_empty());
    }
}
