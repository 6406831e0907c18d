mod app_middleware;
mod routes;

use actix_cors::Cors;
use actix_governor::GovernorConfigBuilder;
use actix_web::{App, HttpServer, web};
use app_middleware::{MetricsMiddleware, RequestLogger, SecurityHeaders};
use futures_util::StreamExt;
use std::sync::Arc;
use warden::cache::INVALIDATION_CHANNEL;
use warden::pipeline::AuthPipeline;
use warden::{
    CacheManager, CaptchaVerifier, Config, Database, EncryptionManager, EventRecorder, GeoResolver,
    MaxMindResolver, Metrics, NullResolver, PasskeyService, PasswordService, RevocationStore,
    RiskEngine, RoleResolver, SlidingWindowLimiter, StaticDenyList, TokenIssuer, load_env,
};

/// Exit codes: configuration errors, unavailable boot dependencies, and
/// everything else.
const EXIT_CONFIG: i32 = 64;
const EXIT_UNAVAILABLE: i32 = 69;
const EXIT_INTERNAL: i32 = 70;

pub struct AppState {
    pub pipeline: AuthPipeline,
    pub roles: RoleResolver,
    pub trusted_proxies: Vec<ipnet::IpNet>,
}

fn fail(code: i32, message: String) -> ! {
    // Tracing may not be initialized yet; write to both.
    eprintln!("{}", message);
    tracing::error!("{}", message);
    std::process::exit(code);
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    load_env();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => fail(EXIT_CONFIG, format!("Configuration error: {}", e)),
    };
    if let Err(e) = config.validate() {
        fail(EXIT_CONFIG, format!("Configuration error: {}", e));
    }

    warden::init_tracing(&config.observability);

    let _sentry_guard = init_sentry(&config);

    tracing::info!("Connecting to database...");
    let db = match Database::connect(&config.database.url).await {
        Ok(db) => db,
        Err(e) => fail(EXIT_UNAVAILABLE, format!("Database unavailable at boot: {}", e)),
    };

    tracing::info!("Running migrations...");
    if let Err(e) = db.run_migrations().await {
        fail(EXIT_UNAVAILABLE, format!("Migrations failed: {}", e));
    }

    let cache = match CacheManager::new(&config.redis.url).await {
        Ok(cache) => cache,
        Err(e) => fail(EXIT_UNAVAILABLE, format!("Redis unavailable at boot: {}", e)),
    };

    let encryption = match EncryptionManager::new(&config.encryption_key) {
        Ok(encryption) => encryption,
        Err(e) => fail(EXIT_CONFIG, format!("Configuration error: {}", e)),
    };

    let passkeys = match PasskeyService::new(&config.webauthn) {
        Ok(passkeys) => Arc::new(passkeys),
        Err(e) => fail(EXIT_CONFIG, format!("Configuration error: {}", e)),
    };

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => fail(EXIT_INTERNAL, format!("Failed to create metrics registry: {}", e)),
    };

    let geo: Arc<dyn GeoResolver> = if config.geo.city_db_path.is_some()
        || config.geo.country_db_path.is_some()
        || config.geo.asn_db_path.is_some()
    {
        Arc::new(MaxMindResolver::open(&config.geo))
    } else {
        tracing::warn!("No geo databases configured; risk engine runs without location signals");
        Arc::new(NullResolver)
    };

    let limiter = SlidingWindowLimiter::new(
        cache.connection(),
        config.rate_limit.clone(),
        metrics.as_ref().clone(),
    );
    let revocation = Arc::new(RevocationStore::new(
        db.pool.clone(),
        cache.clone(),
        metrics.as_ref().clone(),
    ));
    let events = EventRecorder::new(db.clone());

    let pipeline = AuthPipeline {
        db: db.clone(),
        limiter: limiter.clone(),
        captcha: CaptchaVerifier::new(config.captcha.clone(), metrics.as_ref().clone()),
        passwords: PasswordService::new(Arc::new(StaticDenyList)),
        passkeys,
        risk: RiskEngine::new(config.risk.clone()),
        geo,
        tokens: TokenIssuer::new(config.token.clone()),
        revocation: revocation.clone(),
        events,
        metrics: metrics.as_ref().clone(),
        encryption,
        lockout: config.lockout.clone(),
        risk_config: config.risk.clone(),
    };

    let trusted_proxies: Vec<ipnet::IpNet> = config
        .api
        .trusted_proxies
        .iter()
        .map(|raw| match raw.parse() {
            Ok(net) => net,
            Err(_) => fail(EXIT_CONFIG, format!("Invalid TRUSTED_PROXIES entry: {}", raw)),
        })
        .collect();

    let state = Arc::new(AppState {
        pipeline,
        roles: RoleResolver::new(db.clone(), cache.clone(), metrics.as_ref().clone()),
        trusted_proxies,
    });

    spawn_sweeper(&config, limiter, revocation);
    spawn_invalidation_listener(&config.redis.url, state.clone());

    let host = config.api.host.clone();
    let port = config.api.port;
    let cors_origins = config.api.cors_allowed_origins.clone();

    tracing::info!("Starting Warden API server at http://{}:{}", host, port);
    tracing::info!("Metrics endpoint: http://{}:{}/metrics", host, port);

    HttpServer::new(move || {
        let cors = match &cors_origins {
            Some(origins) => {
                let mut cors = Cors::default()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600);
                for origin in origins {
                    cors = cors.allowed_origin(origin);
                }
                cors
            }
            None => Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600),
        };

        // Coarse global limiter; the pipeline's sliding windows do the
        // precise per-key accounting.
        let governor_conf = GovernorConfigBuilder::default()
            .requests_per_second(2)
            .burst_size(20)
            .finish()
            .expect("valid global rate limit configuration");

        App::new()
            .wrap(cors)
            .wrap(sentry_actix::Sentry::new())
            .wrap(SecurityHeaders)
            .wrap(RequestLogger)
            .wrap(MetricsMiddleware::new(metrics.clone()))
            .wrap(actix_governor::Governor::new(&governor_conf))
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(metrics.clone()))
            .configure(routes::configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}

/// Initialize Sentry for error tracking. No-op without a DSN.
fn init_sentry(config: &Config) -> sentry::ClientInitGuard {
    let dsn = config.observability.sentry_dsn.clone();

    if dsn.is_none() {
        tracing::info!("Sentry DSN not configured - error tracking disabled");
        return sentry::init(sentry::ClientOptions::default());
    }

    let environment = config.app_env.clone();
    let release = format!("warden@{}", env!("CARGO_PKG_VERSION"));

    let (error_sample_rate, traces_sample_rate) = match environment.as_str() {
        "production" | "prod" => (1.0, 0.1),
        "staging" => (1.0, 0.5),
        _ => (1.0, 1.0),
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: Some(release.clone().into()),
            environment: Some(environment.clone().into()),
            sample_rate: error_sample_rate,
            traces_sample_rate,
            attach_stacktrace: true,
            // Credentials and addresses flow through this service; nothing
            // request-derived may reach the error tracker by default.
            send_default_pii: false,
            ..Default::default()
        },
    ));

    tracing::info!(
        environment = %environment,
        release = %release,
        "Sentry error tracking initialized"
    );

    guard
}

/// Periodic space reclamation: drained limiter windows and expired
/// revocation rows. Missing a run never affects correctness.
fn spawn_sweeper(
    config: &Config,
    limiter: SlidingWindowLimiter,
    revocation: Arc<RevocationStore>,
) {
    let interval = config.rate_limit.cleanup_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(e) = limiter.sweep().await {
                tracing::warn!(error = %e, "Rate limiter sweep failed");
            }
            match revocation.purge_expired().await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged = purged, "Expired revocations purged");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Revocation purge failed"),
            }
        }
    });
}

/// Subscribe to the shared invalidation channel so role-graph mutations on
/// any instance clear this one's in-process caches.
fn spawn_invalidation_listener(redis_url: &str, state: Arc<AppState>) {
    let redis_url = redis_url.to_string();

    tokio::spawn(async move {
        loop {
            let pubsub = async {
                let client = redis::Client::open(redis_url.as_str())?;
                let mut pubsub = client.get_async_pubsub().await?;
                pubsub.subscribe(INVALIDATION_CHANNEL).await?;
                Ok::<_, redis::RedisError>(pubsub)
            }
            .await;

            let mut pubsub = match pubsub {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalidation listener could not subscribe; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let scope: String = message.get_payload().unwrap_or_default();
                if scope == "roles" {
                    tracing::debug!("Role cache invalidation received");
                    state.roles.invalidate_local().await;
                }
            }

            tracing::warn!("Invalidation listener disconnected; resubscribing");
        }
    });
}
