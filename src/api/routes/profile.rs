use crate::AppState;
use crate::routes::auth::get_auth_context;
use actix_web::{HttpRequest, HttpResponse, web};
use std::sync::Arc;
use warden::Error;
use warden::models::{ChangePasswordRequest, UpdateProfileRequest, UserResponse};
use warden::validation::validate_request;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/profile")
            .route("", web::get().to(get_profile))
            .route("", web::put().to(update_profile))
            .route("", web::delete().to(delete_profile))
            .route("/change-password", web::post().to(change_password)),
    );
}

async fn get_profile(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;

    Ok(HttpResponse::Ok().json(UserResponse::from(user)))
}

async fn update_profile(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    validate_request(&*body)?;

    let updated = state
        .pipeline
        .db
        .update_profile(user.id, &body, &state.pipeline.encryption)
        .await?;

    tracing::info!(user_id = %user.id, "Profile updated");

    Ok(HttpResponse::Ok().json(UserResponse::from(updated)))
}

/// Soft delete: the account disappears from live lookups and the caller's
/// token is revoked with it.
async fn delete_profile(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
) -> Result<HttpResponse, Error> {
    let (user, claims) = get_auth_context(&state, &req).await?;

    state.pipeline.db.soft_delete_user(user.id).await?;
    state.pipeline.logout(&claims, Some(user.id)).await?;

    tracing::info!(user_id = %user.id, "Account soft-deleted");

    Ok(HttpResponse::NoContent().finish())
}

async fn change_password(
    state: web::Data<Arc<AppState>>,
    req: HttpRequest,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, Error> {
    let (user, _) = get_auth_context(&state, &req).await?;
    validate_request(&*body)?;

    state
        .pipeline
        .change_password(&user, &body.old_password, &body.password)
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Password changed. All sessions have been signed out."
    })))
}
