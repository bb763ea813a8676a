use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use secrecy::Secret;
use sha2::Digest;
use sha2::Sha256;
use sqlx::PgPool;

use crate::error::CoreError;
use crate::resilience::CircuitBreaker;

/// Thin, content-addressed blob wrapper: rows
/// in a `blobs` table, `Put` enforced write-once via an `ON CONFLICT DO
/// NOTHING` + rows-affected check.
/// There is no real object-storage CDN in this deployment, so `signed_url`
/// returns an opaque, time-limited token appended to `base_url` rather than a
/// provider-issued URL.
pub struct BlobStore {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
    base_url: String,
    signing_key: Secret<String>,
}

impl BlobStore {
    pub fn new(
        pool: PgPool,
        breaker: Arc<CircuitBreaker>,
        base_url: String,
        signing_key: Secret<String>,
    ) -> Self {
        Self { pool, breaker, base_url, signing_key }
    }

    #[tracing::instrument(skip(self, bytes), fields(%key, size = bytes.len()))]
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), CoreError> {
        let key = key.to_string();
        let bytes = bytes.to_vec();
        self.breaker
            .call(|| async {
                let result = sqlx::query!(
                    r#"INSERT INTO blobs (blob_key, data) VALUES ($1, $2) ON CONFLICT DO NOTHING"#,
                    key,
                    bytes,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                if result.rows_affected() == 0 {
                    tracing::debug!(%key, "blob already written, treating as idempotent success");
                }
                Ok(())
            })
            .await
    }

    #[tracing::instrument(skip(self), fields(%key))]
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>, CoreError> {
        let key = key.to_string();
        self.breaker
            .call(|| async {
                let row = sqlx::query!(r#"SELECT data FROM blobs WHERE blob_key = $1"#, key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| CoreError::Transient(e.into()))?;
                row.map(|r| r.data).ok_or_else(|| CoreError::NotFound(key.clone()))
            })
            .await
    }

    /// A time-limited opaque link to `key`, valid for `ttl`.
    pub fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
    ) -> String {
        let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let expires_epoch = expires_at.timestamp();
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key.expose_secret().as_bytes());
        hasher.update(key.as_bytes());
        hasher.update(expires_epoch.to_string().as_bytes());
        let token = hex::encode(hasher.finalize());
        format!("{}/blobs/{key}?expires={expires_epoch}&token={token}", self.base_url)
    }
}
