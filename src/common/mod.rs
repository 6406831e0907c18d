pub mod cache;
pub mod captcha;
pub mod config;
pub mod db;
pub mod encryption;
pub mod error;
pub mod events;
pub mod geo;
pub mod jwt;
pub mod metrics;
pub mod models;
pub mod passkeys;
pub mod password;
pub mod pipeline;
pub mod rate_limit;
pub mod revocation;
pub mod risk;
pub mod roles;
pub mod validation;

pub use cache::CacheManager;
pub use captcha::CaptchaVerifier;
pub use config::{Config, init_tracing, load_env};
pub use db::{Database, NewUser, PoolConfig};
pub use encryption::{EncryptionManager, blind_index, normalise_email};
pub use error::{Error, Result};
pub use events::EventRecorder;
pub use geo::{GeoResolver, MaxMindResolver, NullResolver, haversine_km};
pub use jwt::{Claims, TokenIssuer, TokenType};
pub use metrics::Metrics;
pub use passkeys::PasskeyService;
pub use password::{CompromisedPasswordOracle, PasswordService, StaticDenyList};
pub use pipeline::{AuthPipeline, LoginSuccess, client_ip};
pub use rate_limit::SlidingWindowLimiter;
pub use revocation::RevocationStore;
pub use risk::{Recommendation, RiskContext, RiskEngine, RiskVerdict};
pub use roles::{RoleGraph, RoleHierarchyValidator, RoleResolver};
pub use validation::{
    validate_mobile_number, validate_new_password, validate_person_name, validate_request,
};
