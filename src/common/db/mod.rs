use crate::encryption::{EncryptionManager, blind_index, normalise_email};
use crate::error::{Error, Result};
use crate::models::*;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use ring::rand::SecureRandom;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

/// Connection pool tuning. Production requires SSL; everything else prefers
/// it and falls back.
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub ssl_mode: PgSslMode,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            ssl_mode: PgSslMode::Prefer,
            test_before_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "local".to_string());

        let mut config = Self::default();
        if env == "prod" || env == "production" {
            config.ssl_mode = PgSslMode::Require;
        }

        if let Ok(max_str) = std::env::var("DB_MAX_CONNECTIONS") {
            if let Ok(max) = max_str.parse() {
                config.max_connections = max;
            }
        }

        if let Ok(min_str) = std::env::var("DB_MIN_CONNECTIONS") {
            if let Ok(min) = min_str.parse() {
                config.min_connections = min;
            }
        }

        config
    }
}

/// Generate the immutable external handle: URL-safe base64 of 16 random
/// bytes, also used as the WebAuthn user handle.
fn generate_external_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    ring::rand::SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::Internal("Failed to generate external id".to_string()))?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

pub struct NewUser<'a> {
    pub email: &'a str,
    pub password_hash: Option<String>,
    pub given_name: &'a str,
    pub middle_name: Option<&'a str>,
    pub surname: Option<&'a str>,
    pub nickname: Option<&'a str>,
    pub mobile_number: Option<&'a str>,
    pub recovery_email: Option<&'a str>,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_config(database_url, PoolConfig::from_env()).await
    }

    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| Error::BadRequest(format!("Invalid DATABASE_URL format: {}", e)))?
            .ssl_mode(config.ssl_mode);

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .test_before_acquire(config.test_before_acquire)
            .connect_with(options)
            .await
            .map_err(|e| {
                // Never include the connection string in the error message
                tracing::error!(error = %e, "Database connection failed");
                Error::Database(
                    "Failed to connect to database. Check configuration and network.".to_string(),
                )
            })?;

        tracing::info!(
            min = config.min_connections,
            max = config.max_connections,
            "Database connection pool initialized"
        );

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Database health check failed");
            Error::Database("Database health check failed".to_string())
        })?;

        Ok(())
    }

    // ==================== Users ====================

    /// Create a user, grant the default USER role, and write the audit
    /// event in one transaction. Either everything lands or nothing does.
    pub async fn create_user(
        &self,
        new: NewUser<'_>,
        encryption: &EncryptionManager,
    ) -> Result<User> {
        let email = normalise_email(new.email);

        let (recovery_enc, recovery_idx) = match new.recovery_email {
            Some(raw) => {
                let normalised = normalise_email(raw);
                (
                    Some(encryption.encrypt(&normalised)?),
                    Some(blind_index(&normalised)),
                )
            }
            None => (None, None),
        };

        let mobile_enc = match new.mobile_number {
            Some(raw) => Some(encryption.encrypt(raw.trim())?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let existing: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1 AND deleted_at IS NULL)")
                .bind(&email)
                .fetch_one(&mut *tx)
                .await?;
        if existing {
            return Err(Error::Conflict("Email already registered".to_string()));
        }

        if let Some(idx) = &recovery_idx {
            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM users WHERE recovery_email_idx = $1 AND deleted_at IS NULL)",
            )
            .bind(idx)
            .fetch_one(&mut *tx)
            .await?;
            if taken {
                return Err(Error::Conflict("Recovery email already in use".to_string()));
            }
        }

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                id, external_id, email, recovery_email_enc, recovery_email_idx,
                mobile_number_enc, password_hash, given_name, middle_name,
                surname, nickname
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(generate_external_id()?)
        .bind(&email)
        .bind(&recovery_enc)
        .bind(&recovery_idx)
        .bind(&mobile_enc)
        .bind(&new.password_hash)
        .bind(new.given_name)
        .bind(new.middle_name)
        .bind(new.surname)
        .bind(new.nickname)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = 'USER'
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO security_events (event_type, user_id, email, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(SecurityEventType::Registration.as_str())
        .bind(user.id)
        .bind(&email)
        .bind(serde_json::json!({}))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(user)
    }

    /// Lookup by normalised email; soft-deleted users are invisible.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = $1 AND deleted_at IS NULL",
        )
        .bind(normalise_email(email))
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE external_id = $1 AND deleted_at IS NULL",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn exists_by_recovery_email_blind_index(&self, idx: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE recovery_email_idx = $1 AND deleted_at IS NULL)",
        )
        .bind(idx)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Replace the stored password hash and stamp the change time. The
    /// timestamp doubles as the revoke-all watermark: tokens issued before
    /// it fail subject resolution.
    pub async fn update_password(&self, user_id: Uuid, new_hash: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2,
                last_password_change_at = NOW(),
                credentials_non_expired = TRUE,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(new_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("User not found".to_string()));
        }

        Ok(())
    }

    /// Opportunistic rehash after verifying against a legacy family. CAS on
    /// the version column; losing the race is fine, the next login retries.
    pub async fn rehash_password(&self, user_id: Uuid, version: i64, new_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(version)
        .bind(new_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Success path of the pipeline: clear the failure counter and lockout,
    /// stamp the login. Compare-and-set against the version read in the
    /// status check so no concurrent failure accounting is overwritten.
    pub async fn record_login_success(&self, user_id: Uuid, version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0,
                lockout_expires_at = NULL,
                last_login_at = NOW(),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Failure path: increment the counter and arm the lockout in the same
    /// statement when the threshold is crossed. Returns the new counter and
    /// lockout expiry, or `None` when the CAS lost to a concurrent writer.
    pub async fn record_login_failure(
        &self,
        user_id: Uuid,
        version: i64,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
    ) -> Result<Option<(i32, Option<DateTime<Utc>>)>> {
        let row: Option<(i32, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1,
                lockout_expires_at = CASE
                    WHEN failed_login_attempts + 1 >= $3 THEN $4
                    ELSE lockout_expires_at
                END,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            RETURNING failed_login_attempts, lockout_expires_at
            "#,
        )
        .bind(user_id)
        .bind(version)
        .bind(max_attempts)
        .bind(lockout_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Auto-unlock an expired lockout: reset the counter, clear the expiry.
    pub async fn reset_lockout(&self, user_id: Uuid, version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0,
                lockout_expires_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: &UpdateProfileRequest,
        encryption: &EncryptionManager,
    ) -> Result<User> {
        let (recovery_enc, recovery_idx) = match &update.recovery_email {
            Some(raw) => {
                let normalised = normalise_email(raw);
                let idx = blind_index(&normalised);

                let taken: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS(
                        SELECT 1 FROM users
                        WHERE recovery_email_idx = $1 AND id != $2 AND deleted_at IS NULL
                    )
                    "#,
                )
                .bind(&idx)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
                if taken {
                    return Err(Error::Conflict("Recovery email already in use".to_string()));
                }

                (Some(encryption.encrypt(&normalised)?), Some(idx))
            }
            None => (None, None),
        };

        let mobile_enc = match &update.mobile_number {
            Some(raw) => Some(encryption.encrypt(raw.trim())?),
            None => None,
        };

        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET given_name = COALESCE($2, given_name),
                middle_name = COALESCE($3, middle_name),
                surname = COALESCE($4, surname),
                nickname = COALESCE($5, nickname),
                mobile_number_enc = COALESCE($6, mobile_number_enc),
                recovery_email_enc = COALESCE($7, recovery_email_enc),
                recovery_email_idx = COALESCE($8, recovery_email_idx),
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(&update.given_name)
        .bind(&update.middle_name)
        .bind(&update.surname)
        .bind(&update.nickname)
        .bind(&mobile_enc)
        .bind(&recovery_enc)
        .bind(&recovery_idx)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    /// Soft delete. Audit rows keep their foreign keys; the account simply
    /// disappears from every live lookup.
    pub async fn soft_delete_user(&self, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("User not found".to_string()));
        }

        Ok(())
    }

    // ==================== Roles & permissions ====================

    pub async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(role)
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY path")
            .fetch_all(&self.pool)
            .await?;

        Ok(roles)
    }

    pub async fn roles_of_user(&self, user_id: Uuid) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.* FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ORDER BY r.path
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles)
    }

    /// Load the full role graph: every role, every permission, and the
    /// role->permission edges. The resolver computes closures in memory.
    pub async fn load_role_graph(&self) -> Result<(Vec<Role>, Vec<Permission>, Vec<(Uuid, Uuid)>)> {
        let roles = self.list_roles().await?;

        let permissions = sqlx::query_as::<_, Permission>("SELECT * FROM permissions ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let edges: Vec<(Uuid, Uuid)> =
            sqlx::query_as("SELECT role_id, permission_id FROM role_permissions")
                .fetch_all(&self.pool)
                .await?;

        Ok((roles, permissions, edges))
    }

    pub async fn create_role(
        &self,
        name: &str,
        description: &str,
        parent: Option<&Role>,
    ) -> Result<Role> {
        let path = match parent {
            Some(p) => format!("{}{}{}", p.path, ROLE_PATH_SEPARATOR, name),
            None => name.to_string(),
        };

        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (id, name, description, parent_id, path)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(parent.map(|p| p.id))
        .bind(&path)
        .fetch_one(&self.pool)
        .await?;

        Ok(role)
    }

    /// Delete a role, re-parenting its children to the grandparent and
    /// rewriting every descendant path in the same transaction.
    pub async fn delete_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let grandparent: Option<Role> = match role.parent_id {
            Some(parent_id) => {
                sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        sqlx::query("UPDATE roles SET parent_id = $2, updated_at = NOW() WHERE parent_id = $1")
            .bind(role.id)
            .bind(grandparent.as_ref().map(|g| g.id))
            .execute(&mut *tx)
            .await?;

        // Rewrite descendant paths: drop this role's segment.
        let old_prefix = format!("{}{}", role.path, ROLE_PATH_SEPARATOR);
        let new_prefix = match &grandparent {
            Some(g) => format!("{}{}", g.path, ROLE_PATH_SEPARATOR),
            None => String::new(),
        };

        sqlx::query(
            r#"
            UPDATE roles
            SET path = $2 || SUBSTRING(path FROM CHAR_LENGTH($1) + 1),
                updated_at = NOW()
            WHERE path LIKE $1 || '%'
            "#,
        )
        .bind(&old_prefix)
        .bind(&new_prefix)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(role.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Re-parent a role, rewriting its own path and every descendant path
    /// in one transaction. The resolver has already rejected cycles.
    pub async fn move_role(&self, role: &Role, new_parent: &Role) -> Result<()> {
        let new_path = format!("{}{}{}", new_parent.path, ROLE_PATH_SEPARATOR, role.name);

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE roles SET parent_id = $2, path = $3, updated_at = NOW() WHERE id = $1")
            .bind(role.id)
            .bind(new_parent.id)
            .bind(&new_path)
            .execute(&mut *tx)
            .await?;

        let old_prefix = format!("{}{}", role.path, ROLE_PATH_SEPARATOR);
        let new_prefix = format!("{}{}", new_path, ROLE_PATH_SEPARATOR);

        sqlx::query(
            r#"
            UPDATE roles
            SET path = $2 || SUBSTRING(path FROM CHAR_LENGTH($1) + 1),
                updated_at = NOW()
            WHERE path LIKE $1 || '%'
            "#,
        )
        .bind(&old_prefix)
        .bind(&new_prefix)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn assign_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        granted_by: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, granted_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, role_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .bind(granted_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Passkeys ====================

    pub async fn add_passkey(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        passkey_data: &serde_json::Value,
        transports: &[String],
        friendly_name: &str,
        attestation_format: &str,
    ) -> Result<PasskeyCredential> {
        let credential = sqlx::query_as::<_, PasskeyCredential>(
            r#"
            INSERT INTO passkey_credentials (
                id, user_id, credential_id, passkey_data, sign_count,
                transports, friendly_name, attestation_format
            )
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(credential_id)
        .bind(passkey_data)
        .bind(transports)
        .bind(friendly_name)
        .bind(attestation_format)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::PasskeyValidationFailed("credential id already registered".to_string())
            }
            other => Error::from(other),
        })?;

        Ok(credential)
    }

    pub async fn list_passkeys(&self, user_id: Uuid) -> Result<Vec<PasskeyCredential>> {
        let credentials = sqlx::query_as::<_, PasskeyCredential>(
            "SELECT * FROM passkey_credentials WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(credentials)
    }

    pub async fn find_passkey_by_credential_id(
        &self,
        credential_id: &[u8],
    ) -> Result<Option<PasskeyCredential>> {
        let credential = sqlx::query_as::<_, PasskeyCredential>(
            "SELECT * FROM passkey_credentials WHERE credential_id = $1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(credential)
    }

    /// Removing a credential and its back-reference is a single row delete;
    /// the ownership check rides in the WHERE clause.
    pub async fn remove_passkey(&self, user_id: Uuid, credential_id: &[u8]) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM passkey_credentials WHERE user_id = $1 AND credential_id = $2",
        )
        .bind(user_id)
        .bind(credential_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Advance the signature counter. CAS on the previous value: the update
    /// applies only if no concurrent assertion already moved it, which keeps
    /// the counter strictly monotonic under parallel logins.
    pub async fn advance_passkey_counter(
        &self,
        credential_id: &[u8],
        previous: i64,
        new_count: i64,
        passkey_data: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE passkey_credentials
            SET sign_count = $3, passkey_data = $4, last_used_at = NOW()
            WHERE credential_id = $1 AND sign_count = $2 AND NOT compromised
            "#,
        )
        .bind(credential_id)
        .bind(previous)
        .bind(new_count)
        .bind(passkey_data)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_passkey_compromised(&self, credential_id: &[u8]) -> Result<()> {
        sqlx::query("UPDATE passkey_credentials SET compromised = TRUE WHERE credential_id = $1")
            .bind(credential_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== IP metadata & blocklist ====================

    pub async fn get_ip_metadata(&self, ip: &str) -> Result<Option<IpMetadata>> {
        let metadata = sqlx::query_as::<_, IpMetadata>(
            "SELECT * FROM ip_metadata WHERE ip_address = $1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metadata)
    }

    /// Append an observation to the per-IP ring. Row-locked read-modify-write
    /// so concurrent logins from one address cannot drop history entries.
    pub async fn record_ip_observation(
        &self,
        ip: &str,
        location: &GeoLocation,
        asn: Option<i64>,
        suspicious: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ip_metadata (ip_address)
            VALUES ($1)
            ON CONFLICT (ip_address) DO NOTHING
            "#,
        )
        .bind(ip)
        .execute(&mut *tx)
        .await?;

        let existing = sqlx::query_as::<_, IpMetadata>(
            "SELECT * FROM ip_metadata WHERE ip_address = $1 FOR UPDATE",
        )
        .bind(ip)
        .fetch_one(&mut *tx)
        .await?;

        let mut history = existing.history();
        history.push(GeoObservation {
            location: location.clone(),
            observed_at: Utc::now(),
        });
        while history.len() > GEO_HISTORY_LIMIT {
            history.remove(0);
        }

        sqlx::query(
            r#"
            UPDATE ip_metadata
            SET last_seen_at = NOW(),
                last_geolocation = $2,
                geo_history = $3,
                asn = COALESCE($4, asn),
                suspicious_count = suspicious_count + $5
            WHERE ip_address = $1
            "#,
        )
        .bind(ip)
        .bind(serde_json::to_value(location).unwrap_or(serde_json::Value::Null))
        .bind(serde_json::to_value(&history).unwrap_or_else(|_| serde_json::json!([])))
        .bind(asn)
        .bind(if suspicious { 1i32 } else { 0i32 })
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn get_ip_block(&self, ip: &str) -> Result<Option<IpBlockEntry>> {
        let entry = sqlx::query_as::<_, IpBlockEntry>(
            "SELECT * FROM ip_blocklist WHERE ip_address = $1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    // ==================== Security events ====================

    pub async fn insert_security_event(&self, event: &SecurityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_events (event_type, user_id, email, ip_address, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(event.user_id)
        .bind(&event.email)
        .bind(&event.ip_address)
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Failed logins for a user inside the trailing window; drives the
    /// CAPTCHA gate and the recent-failures risk signal.
    pub async fn recent_failed_logins(&self, email: &str, window: Duration) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM security_events
            WHERE event_type = 'FAILED_LOGIN'
              AND email = $1
              AND created_at > NOW() - $2::interval
            "#,
        )
        .bind(normalise_email(email))
        .bind(format!("{} seconds", window.as_secs()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Country codes of the user's most recent successful logins, newest
    /// first, for the country-change risk signal.
    pub async fn recent_login_countries(&self, user_id: Uuid, limit: i64) -> Result<Vec<String>> {
        let countries: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT details->>'country' FROM security_events
            WHERE event_type = 'SUCCESSFUL_LOGIN'
              AND user_id = $1
              AND details->>'country' IS NOT NULL
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(countries)
    }

    /// Device fingerprints previously seen on successful logins.
    pub async fn known_device_fingerprint(&self, user_id: Uuid, fingerprint: &str) -> Result<bool> {
        let known: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM security_events
                WHERE event_type = 'SUCCESSFUL_LOGIN'
                  AND user_id = $1
                  AND details->>'device_fingerprint' = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await?;

        Ok(known)
    }
}
