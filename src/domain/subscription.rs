use chrono::DateTime;
use chrono::Utc;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

/// The mail provider's webhook subscription. At most one row
/// may carry `is_active = true` at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub provider_sub_id: String,
    pub resource: String,
    pub expiration_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub client_state: Secret<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token for `KVStore::UpdateIfMatch`, enforcing
    /// an insert-new-row-first, then-clear-old-row's-flag discipline.
    pub etag: uuid::Uuid,
}
