pub mod auth;
pub mod health;
pub mod metrics;
pub mod passkeys;
pub mod profile;
pub mod roles;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    auth::configure(cfg);
    passkeys::configure(cfg);
    profile::configure(cfg);
    roles::configure(cfg);
    health::configure(cfg);
    metrics::configure(cfg);
}
