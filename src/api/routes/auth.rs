use crate::AppState;
use crate::app_middleware::RequestId;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{HttpMessage, HttpRequest, HttpResponse, web};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use warden::models::{
    LoginRequest, PasskeyAssertionRequest, RegisterRequest, TokenPairResponse, UserResponse,
};
use warden::validation::validate_request;
use warden::{Claims, Error, models::SecurityEvent, models::SecurityEventType, pipeline::client_ip};

const REGISTER_RATE_LIMIT_PER_HOUR: u64 = 3;
const LOGIN_RATE_LIMIT_BURST: u32 = 5;
const LOGIN_SECONDS_PER_REQUEST: u64 = 15 * 60 / LOGIN_RATE_LIMIT_BURST as u64;

/// Upper bound on one credential-bearing request, covering every outbound
/// call the pipeline makes. Expiry maps to 504 and must not leave
/// half-updated counters behind; all pipeline mutations are single
/// compare-and-set statements, so cancellation between them is safe.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

pub fn configure(cfg: &mut web::ServiceConfig) {
    // Edge throttles in front of the pipeline's own sliding windows; these
    // shed load cheaply before any Redis round-trip happens.
    let register_rate_conf = GovernorConfigBuilder::default()
        .requests_per_hour(REGISTER_RATE_LIMIT_PER_HOUR)
        .burst_size(REGISTER_RATE_LIMIT_PER_HOUR as u32)
        .finish()
        .expect("valid register rate limit configuration");

    let login_rate_conf = GovernorConfigBuilder::default()
        .seconds_per_request(LOGIN_SECONDS_PER_REQUEST)
        .burst_size(LOGIN_RATE_LIMIT_BURST)
        .finish()
        .expect("valid login rate limit configuration");

    cfg.service(
        web::scope("/api")
            .service(
                web::resource("/register")
                    .wrap(Governor::new(&register_rate_conf))
                    .route(web::post().to(register)),
            )
            .service(
                web::resource("/login")
                    .wrap(Governor::new(&login_rate_conf))
                    .route(web::post().to(login)),
            )
            .route("/login/mfa", web::post().to(login_mfa))
            .route("/logout", web::post().to(logout))
            .route("/token/refresh", web::post().to(refresh_token)),
    );
}

/// Extract token from Authorization header
pub fn extract_token(req: &HttpRequest) -> Result<String, Error> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .ok_or_else(|| Error::Unauthorized("Missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| Error::Unauthorized("Invalid authorization header".to_string()))?;

    if !auth_header.starts_with("Bearer ") {
        return Err(Error::Unauthorized(
            "Invalid authorization format. Use: Bearer <token>".to_string(),
        ));
    }

    Ok(auth_header[7..].to_string())
}

/// Step 1 of the pipeline: the client address. Only the configured proxy
/// ranges may speak for a client; a request with no resolvable address is
/// denied outright.
pub fn require_client_ip(state: &AppState, req: &HttpRequest) -> Result<String, Error> {
    let peer = req.peer_addr().map(|addr| addr.ip());
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok());

    client_ip(peer, forwarded, &state.trusted_proxies)
        .ok_or_else(|| Error::BadRequest("Client address could not be determined".to_string()))
}

/// Authenticated caller context for resource endpoints.
pub async fn get_auth_context(
    state: &AppState,
    req: &HttpRequest,
) -> Result<(warden::models::User, Claims), Error> {
    let token = extract_token(req)?;
    state.pipeline.authenticate_access(&token).await
}

/// The request id minted (or echoed) by the logging middleware, for
/// stamping audit events recorded at the route layer.
pub fn request_id(req: &HttpRequest) -> Option<String> {
    req.extensions().get::<RequestId>().map(|id| id.0.clone())
}

/// Run a pipeline future under the request deadline. Expiry records a
/// timeout event and surfaces `DeadlineExceeded`.
pub async fn with_deadline<T>(
    state: &AppState,
    req: &HttpRequest,
    ip: &str,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match tokio::time::timeout(REQUEST_DEADLINE, fut).await {
        Ok(result) => result,
        Err(_) => {
            let mut event = SecurityEvent::new(SecurityEventType::RequestTimeout).ip(ip);
            if let Some(request_id) = request_id(req) {
                event = event.detail("request_id", request_id);
            }
            state.pipeline.events.record_best_effort(event).await;
            tracing::error!(ip = %ip, "Request deadline exceeded in authentication pipeline");
            Err(Error::DeadlineExceeded)
        }
    }
}

async fn register(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;
    validate_request(&*body)?;

    let user = with_deadline(&state, &req, &ip, state.pipeline.register(&ip, &body)).await?;

    // 201 with the profile; no tokens on registration.
    Ok(HttpResponse::Created().json(UserResponse::from(user)))
}

async fn login(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;
    validate_request(&*body)?;

    let success =
        with_deadline(&state, &req, &ip, state.pipeline.password_login(&ip, &body)).await?;

    tracing::info!(user_id = %success.user.id, "User logged in");

    Ok(HttpResponse::Ok().json(TokenPairResponse {
        access_token: success.access_token,
        refresh_token: success.refresh_token,
        token_type: "Bearer",
        expires_in: success.expires_in,
    }))
}

async fn login_mfa(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<PasskeyAssertionRequest>,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;

    let mfa_token = body
        .mfa_token
        .as_deref()
        .ok_or_else(|| Error::BadRequest("mfa_token is required".to_string()))?;

    let success = with_deadline(
        &state,
        &req,
        &ip,
        state
            .pipeline
            .complete_mfa(&ip, mfa_token, &body.challenge_id, &body),
    )
    .await?;

    tracing::info!(user_id = %success.user.id, "MFA challenge completed");

    Ok(HttpResponse::Ok().json(TokenPairResponse {
        access_token: success.access_token,
        refresh_token: success.refresh_token,
        token_type: "Bearer",
        expires_in: success.expires_in,
    }))
}

async fn logout(state: web::Data<Arc<AppState>>, req: HttpRequest) -> Result<HttpResponse, Error> {
    let (user, claims) = get_auth_context(&state, &req).await?;
    state.pipeline.logout(&claims, Some(user.id)).await?;

    tracing::info!(user_id = %user.id, jti = %claims.jti, "Token revoked via logout");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Logged out successfully"
    })))
}

async fn refresh_token(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let ip = require_client_ip(&state, &req)?;
    let token = extract_token(&req)?;

    let success = with_deadline(&state, &req, &ip, state.pipeline.refresh(&token)).await?;

    tracing::info!(user_id = %success.user.id, "Token refreshed");

    Ok(HttpResponse::Ok().json(TokenPairResponse {
        access_token: success.access_token,
        refresh_token: success.refresh_token,
        token_type: "Bearer",
        expires_in: success.expires_in,
    }))
}
