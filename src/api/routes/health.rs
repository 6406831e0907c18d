use crate::AppState;
use actix_web::{HttpResponse, web};
use std::sync::Arc;
use warden::Error;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/health", web::get().to(health));
}

async fn health(state: web::Data<Arc<AppState>>) -> Result<HttpResponse, Error> {
    state.pipeline.db.health_check().await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
