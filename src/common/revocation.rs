/// Revoked-token set with a two-tier read path.
///
/// Lookup order: in-process cache (1 s staleness budget) -> shared Redis
/// tier -> authoritative Postgres table. Writes go to all three, database
/// first, so a crash between tiers can only lose cache entries, never the
/// durable record. Once a jti reads as revoked it stays revoked until the
/// token's natural expiry purges the row.
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::{CacheManager, keys};
use crate::error::Result;
use crate::metrics::Metrics;

/// How long a local-tier answer may be served before re-checking.
const LOCAL_TTL: Duration = Duration::from_secs(1);

struct LocalEntry {
    revoked: bool,
    cached_at: Instant,
}

pub struct RevocationStore {
    pool: PgPool,
    cache: CacheManager,
    metrics: Metrics,
    local: DashMap<String, LocalEntry>,
}

impl RevocationStore {
    pub fn new(pool: PgPool, cache: CacheManager, metrics: Metrics) -> Self {
        Self {
            pool,
            cache,
            metrics,
            local: DashMap::new(),
        }
    }

    /// Record a revocation. `ttl_secs` is the token's remaining lifetime
    /// plus skew; the durable row outlives the token by that margin.
    pub async fn revoke(
        &self,
        jti: &str,
        user_id: Option<Uuid>,
        expires_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO revoked_tokens (jti, user_id, revoked_at, expires_at, reason)
            VALUES ($1, $2, NOW(), $3, $4)
            ON CONFLICT (jti) DO NOTHING
            "#,
        )
        .bind(jti)
        .bind(user_id)
        .bind(expires_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        let ttl_secs = (expires_at - Utc::now()).num_seconds().max(1) as u64;
        let mut conn = self.cache.connection();
        if let Err(e) = async {
            let _: () = conn
                .set_ex(keys::revoked_token(jti), true, ttl_secs)
                .await?;
            Ok::<(), redis::RedisError>(())
        }
        .await
        {
            // The durable tier already holds the row; the shared tier will
            // be backfilled by the next lookup.
            tracing::warn!(jti = %jti, error = %e, "Failed to propagate revocation to shared tier");
        }

        self.local.insert(
            jti.to_string(),
            LocalEntry {
                revoked: true,
                cached_at: Instant::now(),
            },
        );

        self.metrics
            .tokens_revoked_total
            .with_label_values(&[reason])
            .inc();

        tracing::info!(jti = %jti, reason = %reason, "Token revoked");

        Ok(())
    }

    /// Two-tier membership check. Errors from the shared tier degrade to
    /// the authoritative database rather than failing the request.
    pub async fn is_revoked(&self, jti: &str) -> Result<bool> {
        if let Some(entry) = self.local.get(jti) {
            if entry.cached_at.elapsed() < LOCAL_TTL {
                self.metrics
                    .revocation_lookups_total
                    .with_label_values(&["local"])
                    .inc();
                return Ok(entry.revoked);
            }
        }

        let mut conn = self.cache.connection();
        match conn.exists::<_, bool>(keys::revoked_token(jti)).await {
            Ok(true) => {
                self.metrics
                    .revocation_lookups_total
                    .with_label_values(&["shared"])
                    .inc();
                self.remember(jti, true);
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(jti = %jti, error = %e, "Shared revocation tier unavailable");
            }
        }

        let revoked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM revoked_tokens WHERE jti = $1)",
        )
        .bind(jti)
        .fetch_one(&self.pool)
        .await?;

        self.metrics
            .revocation_lookups_total
            .with_label_values(&["database"])
            .inc();
        self.remember(jti, revoked);

        if revoked {
            // Backfill the shared tier for other instances.
            let mut conn = self.cache.connection();
            let _: std::result::Result<(), redis::RedisError> =
                conn.set_ex(keys::revoked_token(jti), true, 3600).await;
        }

        Ok(revoked)
    }

    /// Drop rows whose tokens expired past the skew margin. Run from the
    /// periodic sweep; missing a run only delays space reclamation.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;

        self.local
            .retain(|_, entry| entry.cached_at.elapsed() < LOCAL_TTL);

        Ok(result.rows_affected())
    }

    fn remember(&self, jti: &str, revoked: bool) {
        self.local.insert(
            jti.to_string(),
            LocalEntry {
                revoked,
                cached_at: Instant::now(),
            },
        );
    }
}

