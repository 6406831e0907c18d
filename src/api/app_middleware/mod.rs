pub mod metrics_middleware;
pub mod request_logger;
pub mod security_headers;

pub use metrics_middleware::MetricsMiddleware;
pub use request_logger::{RequestId, RequestLogger};
pub use security_headers::SecurityHeaders;
