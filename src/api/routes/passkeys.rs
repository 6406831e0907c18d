use crate::AppState;
use crate::routes::auth::{get_auth_context, request_id, require_client_ip, with_deadline};
use actix_web::{HttpRequest, HttpResponse, web};
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::sync::Arc;
use warden::Error;
use warden::models::{
    FinishPasskeyRegistrationRequest, PasskeyAssertionRequest, PasskeyResponse, SecurityEvent,
    SecurityEventType, TokenPairResponse,
};
use webauthn_rs::prelude::RegisterPublicKeyCredential;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/profile/passkeys")
            .route("/registration-options", web::post().to(registration_options))
            .route("", web::post().to(finish_registration))
            .route("", web::get().to(list_passkeys))
            .route("/{credential_id}", web::delete().to(delete_passkey)),
    )
    .service(
        web::scope("/api/passkeys")
            .route(
                "/authentication-options",
                web::post().to(authentication_options),
            )
            .route("/assert", web::post().to(assert_passkey)),
    );
}

/// Creation options for the authenticated caller. The pending challenge
/// lives server-side for five minutes.
async fn registration_options(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;

    let existing = state.pipeline.db.list_passkeys(user.id).await?;
    let options = state.pipeline.passkeys.begin_registration(&user, &existing)?;

    Ok(HttpResponse::Ok().json(options))
}

async fn finish_registration(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<FinishPasskeyRegistrationRequest>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;

    let credential: RegisterPublicKeyCredential = serde_json::from_value(body.credential.clone())
        .map_err(|e| Error::PasskeyValidationFailed(format!("malformed attestation: {}", e)))?;

    let friendly_name = body.friendly_name.as_deref().unwrap_or("Passkey");

    let stored = state
        .pipeline
        .register_passkey(&user, &credential, friendly_name)
        .await?;

    Ok(HttpResponse::Created().json(PasskeyResponse::from(stored)))
}

async fn list_passkeys(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;

    let credentials = state.pipeline.db.list_passkeys(user.id).await?;
    let out: Vec<PasskeyResponse> = credentials.into_iter().map(PasskeyResponse::from).collect();

    Ok(HttpResponse::Ok().json(out))
}

async fn delete_passkey(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;

    let credential_id = general_purpose::URL_SAFE_NO_PAD
        .decode(path.as_str())
        .map_err(|_| Error::BadRequest("Malformed credential id".to_string()))?;

    // The ownership check is part of the delete itself; a foreign
    // credential simply does not match and reads as absent.
    if !state.pipeline.db.remove_passkey(user.id, &credential_id).await? {
        return Err(Error::NotFound("Passkey not found".to_string()));
    }

    let mut event = SecurityEvent::new(SecurityEventType::PasskeyRemoved)
        .user(user.id)
        .detail("credential_id", path.as_str());
    if let Some(request_id) = request_id(&req) {
        event = event.detail("request_id", request_id);
    }
    state.pipeline.events.record(event).await?;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct AuthenticationOptionsRequest {
    /// Scope the allow-list to this account; omit for resident-key discovery.
    email: Option<String>,
}

async fn authentication_options(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<AuthenticationOptionsRequest>,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;

    // An unknown address gets a discovery challenge, the same shape a real
    // account would see; never an enumeration signal.
    let user = match &body.email {
        Some(email) => state.pipeline.db.find_by_email(email).await?,
        None => None,
    };
    let credentials = match &user {
        Some(user) => state.pipeline.db.list_passkeys(user.id).await?,
        None => Vec::new(),
    };
    // No usable credentials degrades to discovery too, for the same reason.
    let scoped = match (&user, credentials.is_empty()) {
        (Some(user), false) => Some((user, credentials.as_slice())),
        _ => None,
    };

    let (challenge_id, options) = state.pipeline.passkeys.begin_authentication(scoped)?;

    tracing::debug!(ip = %ip, "Issued passkey authentication challenge");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "challenge_id": challenge_id,
        "options": options,
    })))
}

/// First-factor passkey login.
async fn assert_passkey(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<PasskeyAssertionRequest>,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;

    let success = with_deadline(
        &state,
        &req,
        &ip,
        state.pipeline.passkey_assert(&ip, &body.challenge_id, &body),
    )
    .await?;

    tracing::info!(user_id = %success.user.id, "Passkey login");

    Ok(HttpResponse::Ok().json(TokenPairResponse {
        access_token: success.access_token,
        refresh_token: success.refresh_token,
        token_type: "Bearer",
        expires_in: success.expires_in,
    }))
}
