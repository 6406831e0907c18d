use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderName, HeaderValue},
};
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id for one credential-bearing request, accepted from the
/// inbound `x-request-id` header or minted here. Route handlers read it
/// from the request extensions to stamp audit events, so a security event
/// row can be joined back to the exact log lines of the request that
/// produced it.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Structured request logging. Owns the request-id lifecycle and wraps the
/// rest of the request in a tracing span carrying it, so every log line
/// the pipeline emits underneath (rate-limit denials, lockouts, risk
/// verdicts) correlates without each call site threading the id through.
///
/// Query strings are deliberately not logged on this service: login and
/// token endpoints must never leak credentials or tokens into log storage.
pub struct RequestLogger;

impl<S, B> Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggerMiddleware { service }))
    }
}

pub struct RequestLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
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
        let path = req.path().to_string();

        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty() && s.len() <= 64)
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        req.extensions_mut().insert(RequestId(request_id.clone()));

        let span = tracing::info_span!("http_request", request_id = %request_id);
        let fut = self.service.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                let duration_ms = start_time.elapsed().as_millis();

                match &result {
                    Ok(res) => {
                        let status = res.status().as_u16();

                        if status >= 500 {
                            tracing::error!(
                                method = %method,
                                path = %path,
                                status = status,
                                duration_ms = duration_ms,
                                "Request completed with server error"
                            );
                        } else if status >= 400 {
                            tracing::warn!(
                                method = %method,
                                path = %path,
                                status = status,
                                duration_ms = duration_ms,
                                "Request completed with client error"
                            );
                        } else {
                            tracing::info!(
                                method = %method,
                                path = %path,
                                status = status,
                                duration_ms = duration_ms,
                                "Request completed"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            method = %method,
                            path = %path,
                            error = %err,
                            duration_ms = duration_ms,
                            "Request failed with error"
                        );
                    }
                }

                result.map(|mut res| {
                    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
                        res.headers_mut()
                            .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);
                    }
                    res
                })
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, test, web};

    #[actix_web::test]
    async fn test_mints_request_id() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogger)
                .route("/test", web::get().to(|| async { HttpResponse::Ok().body("ok") })),
        )
        .await;

        let req = test::TestRequest::get().uri("/test").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
        let id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[actix_web::test]
    async fn test_echoes_caller_request_id() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogger)
                .route("/test", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/test")
            .insert_header((REQUEST_ID_HEADER, "caller-supplied-id-123"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        let id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert_eq!(id, "caller-supplied-id-123");
    }

    #[actix_web::test]
    async fn test_oversized_caller_id_is_replaced() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogger)
                .route("/test", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        // A header long enough to be junk (or log-stuffing) gets a fresh id
        let req = test::TestRequest::get()
            .uri("/test")
            .insert_header((REQUEST_ID_HEADER, "x".repeat(200)))
            .to_request();
        let resp = test::call_service(&app, req).await;

        let id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[actix_web::test]
    async fn test_handlers_see_request_id_extension() {
        let app = test::init_service(
            App::new().wrap(RequestLogger).route(
                "/test",
                web::get().to(|req: actix_web::HttpRequest| async move {
                    let id = req
                        .extensions()
                        .get::<RequestId>()
                        .map(|r| r.0.clone())
                        .unwrap_or_default();
                    HttpResponse::Ok().body(id)
                }),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/test")
            .insert_header((REQUEST_ID_HEADER, "abc-123"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        let body = test::read_body(resp).await;
        assert_eq!(std::str::from_utf8(&body).unwrap(), "abc-123");
    }
}
