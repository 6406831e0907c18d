use actix_web::{HttpResponse, web};
use std::sync::Arc;
use warden::{Error, Metrics};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(render_metrics));
}

async fn render_metrics(metrics: web::Data<Arc<Metrics>>) -> Result<HttpResponse, Error> {
    let body = metrics
        .render()
        .map_err(|e| Error::Internal(format!("Failed to render metrics: {}", e)))?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(body))
}
