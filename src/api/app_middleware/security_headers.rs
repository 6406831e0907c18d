use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header,
};
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};

/// Security headers for every response.
///
/// This service is a JSON API with no first-party frontend, so the CSP is
/// a flat deny: nothing loads, nothing frames us. Auth responses carry
/// credentials and are never cacheable; only the health endpoint may be
/// cached briefly. HSTS is opt-in via `ENABLE_HSTS` because preloading an
/// HTTP-only dev deployment bricks it.
pub struct SecurityHeaders;

impl<S, B> Transform<S, ServiceRequest> for SecurityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SecurityHeadersMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityHeadersMiddleware { service }))
    }
}

pub struct SecurityHeadersMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for SecurityHeadersMiddleware<S>
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
        let path = req.path().to_string();
        let fut = self.service.call(req);

        let enable_hsts = std::env::var("ENABLE_HSTS")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        Box::pin(async move {
            let mut res = fut.await?;
            let headers = res.headers_mut();

            if path == "/api/v1/health" {
                headers.insert(
                    header::CACHE_CONTROL,
                    header::HeaderValue::from_static("public, max-age=60"),
                );
            } else {
                headers.insert(
                    header::CACHE_CONTROL,
                    header::HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
                );
                headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));
            }

            headers.insert(
                header::HeaderName::from_static("x-frame-options"),
                header::HeaderValue::from_static("DENY"),
            );
            headers.insert(
                header::HeaderName::from_static("x-content-type-options"),
                header::HeaderValue::from_static("nosniff"),
            );
            headers.insert(
                header::HeaderName::from_static("referrer-policy"),
                header::HeaderValue::from_static("no-referrer"),
            );
            headers.insert(
                header::HeaderName::from_static("content-security-policy"),
                header::HeaderValue::from_static(
                    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'",
                ),
            );
            headers.insert(
                header::HeaderName::from_static("permissions-policy"),
                header::HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
            );

            if enable_hsts {
                headers.insert(
                    header::HeaderName::from_static("strict-transport-security"),
                    header::HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
                );
            }

            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, test, web};

    #[actix_web::test]
    async fn test_security_headers_present() {
        let app = test::init_service(App::new().wrap(SecurityHeaders).route(
            "/test",
            web::get().to(|| async { HttpResponse::Ok().body("test") }),
        ))
        .await;

        let req = test::TestRequest::get().uri("/test").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.headers().contains_key("x-frame-options"));
        assert!(resp.headers().contains_key("x-content-type-options"));
        assert!(resp.headers().contains_key("content-security-policy"));
        assert!(resp.headers().contains_key("referrer-policy"));
        assert_eq!(
            resp.headers().get("cache-control").unwrap().to_str().unwrap(),
            "no-store, no-cache, must-revalidate, private"
        );
    }

    #[actix_web::test]
    async fn test_health_endpoint_is_cacheable() {
        let app = test::init_service(App::new().wrap(SecurityHeaders).route(
            "/api/v1/health",
            web::get().to(|| async { HttpResponse::Ok().body("ok") }),
        ))
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(
            resp.headers().get("cache-control").unwrap().to_str().unwrap(),
            "public, max-age=60"
        );
    }
}
