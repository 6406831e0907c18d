use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};
use std::sync::Arc;
use std::time::Instant;
use warden::Metrics;

/// Middleware for collecting Prometheus metrics
pub struct MetricsMiddleware {
    pub metrics: Arc<Metrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service,
            metrics: self.metrics.clone(),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
    metrics: Arc<Metrics>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();

        // Normalize the path so credential-id and uuid segments collapse
        let endpoint = Metrics::normalize_path(req.path());

        let metrics = self.metrics.clone();
        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration = start_time.elapsed();

            match &result {
                Ok(res) => {
                    let status = res.status().as_u16().to_string();

                    metrics
                        .http_requests_total
                        .with_label_values(&[&method, &endpoint, &status])
                        .inc();
                }
                Err(_err) => {
                    metrics
                        .http_requests_total
                        .with_label_values(&[&method, &endpoint, "500"])
                        .inc();
                }
            }

            metrics
                .http_request_duration_seconds
                .with_label_values(&[&method, &endpoint])
                .observe(duration.as_secs_f64());

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, test, web};

    #[actix_web::test]
    async fn test_metrics_middleware_records_requests() {
        let metrics = Arc::new(Metrics::new().unwrap());

        let app = test::init_service(
            App::new()
                .wrap(MetricsMiddleware::new(metrics.clone()))
                .route("/test", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let req = test::TestRequest::get().uri("/test").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());

        let output = metrics.render().unwrap();
        assert!(output.contains("warden_api_http_requests_total"));
        assert!(output.contains("status=\"200\""));
    }

    #[actix_web::test]
    async fn test_metrics_middleware_normalizes_ids() {
        let metrics = Arc::new(Metrics::new().unwrap());

        let app = test::init_service(
            App::new()
                .wrap(MetricsMiddleware::new(metrics.clone()))
                .route(
                    "/api/profile/passkeys/{id}",
                    web::delete().to(|| async { HttpResponse::NoContent().finish() }),
                ),
        )
        .await;

        let req = test::TestRequest::delete()
            .uri("/api/profile/passkeys/550e8400-e29b-41d4-a716-446655440000")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());

        let output = metrics.render().unwrap();
        assert!(output.contains("endpoint=\"/api/profile/passkeys/:id\""));
    }
}
