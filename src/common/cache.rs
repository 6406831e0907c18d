/// Redis-backed shared state layer.
///
/// Holds the connection used for:
/// - short-lived caches (role closures, effective permissions)
/// - the shared revoked-token tier
/// - rate-limit sorted sets (via [`crate::rate_limit`])
/// - cache-invalidation fan-out between instances
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct CacheManager {
    client: ConnectionManager,
}

/// Channel carrying role-graph invalidation notices to all instances.
pub const INVALIDATION_CHANNEL: &str = "warden:cache:invalidate";

impl CacheManager {
    pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        tracing::info!("Shared cache layer initialized");

        Ok(Self { client: manager })
    }

    /// A cloned connection handle for components that issue their own
    /// commands (rate limiter scripts, revocation tier).
    pub fn connection(&self) -> ConnectionManager {
        self.client.clone()
    }

    /// Get a value from cache. Returns `Ok(None)` when the key is missing
    /// or holds a payload that no longer deserializes.
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, RedisError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut conn = self.client.clone();
        let value: Option<String> = conn.get(key).await?;

        match value {
            Some(json_str) => match serde_json::from_str(&json_str) {
                Ok(data) => Ok(Some(data)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping corrupted cache entry");
                    let _: () = conn.del(key).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn set_with_ttl<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), RedisError>
    where
        T: Serialize,
    {
        let json_str = serde_json::to_string(value).map_err(|e| {
            RedisError::from((
                redis::ErrorKind::TypeError,
                "serialization error",
                e.to_string(),
            ))
        })?;

        let mut conn = self.client.clone();
        let _: () = conn.set_ex(key, json_str, ttl.as_secs()).await?;

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.client.clone();
        let _: () = conn.del(key).await?;

        Ok(())
    }

    /// Delete all keys matching a pattern, e.g. `warden:perms:*` after a
    /// role-graph mutation.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, RedisError> {
        let mut conn = self.client.clone();

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;

        if keys.is_empty() {
            return Ok(0);
        }

        let count = keys.len() as u64;
        let _: () = conn.del(&keys).await?;

        Ok(count)
    }

    /// Publish an invalidation notice to every instance. Subscribers clear
    /// their in-process tier for the named scope.
    pub async fn publish_invalidation(&self, scope: &str) -> Result<(), RedisError> {
        let mut conn = self.client.clone();
        let _: () = conn.publish(INVALIDATION_CHANNEL, scope).await?;

        Ok(())
    }
}

/// Cache key builders for consistent naming.
pub mod keys {
    use uuid::Uuid;

    /// Effective permission set for a user.
    pub fn user_permissions(user_id: Uuid) -> String {
        format!("warden:perms:user:{}", user_id)
    }

    /// The full role graph snapshot.
    pub fn role_graph() -> String {
        "warden:roles:graph".to_string()
    }

    /// Shared revocation tier entry for a token id.
    pub fn revoked_token(jti: &str) -> String {
        format!("warden:revoked:{}", jti)
    }

    /// Sliding-window sorted set for a limiter key.
    pub fn rate_limit(limiter_key: &str) -> String {
        format!("warden:rl:{}", limiter_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_generation() {
        let user_id = Uuid::new_v4();

        assert_eq!(
            keys::user_permissions(user_id),
            format!("warden:perms:user:{}", user_id)
        );
        assert_eq!(keys::role_graph(), "warden:roles:graph");
        assert_eq!(keys::revoked_token("abc"), "warden:revoked:abc");
        assert_eq!(
            keys::rate_limit("auth-sw:ip:198.51.100.7"),
            "warden:rl:auth-sw:ip:198.51.100.7"
        );
    }
}
