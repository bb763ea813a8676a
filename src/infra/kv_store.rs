use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::GlCode;
use crate::domain::NormalizedKey;
use crate::domain::Subscription;
use crate::domain::Transaction;
use crate::domain::TransactionStatus;
use crate::domain::Vendor;
use crate::error::CoreError;
use crate::ids::TxId;
use crate::resilience::CircuitBreaker;

/// Outcome of an `InsertIfAbsent` against a uniquely-keyed table. Callers
/// decide what to do with the pre-existing row themselves — `KvStore` just
/// reports whether the insert landed.
pub enum InsertOutcome<T> {
    Inserted(T),
    AlreadyExists,
}

#[derive(Debug, Default, Clone)]
pub struct TransactionPatch {
    pub status: Option<TransactionStatus>,
    pub vendor_name: Option<String>,
    pub gl_code: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub emails_sent_count: Option<i32>,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionPatch {
    pub expiration_at: Option<DateTime<Utc>>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

/// The only code in the crate permitted to run SQL. Every
/// method is wrapped by the `kv_store` `CircuitBreaker` (`FailMax=10,
/// Reset=30s`), since every call here is a suspension point a failing
/// database can stall indefinitely.
pub struct KvStore {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
}

impl KvStore {
    pub fn new(
        pool: PgPool,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self { pool, breaker }
    }

    pub fn pool(&self) -> &PgPool { &self.pool }

    // ---- Vendors ----

    #[tracing::instrument(skip(self), fields(normalized_key = %key))]
    pub async fn get_vendor(
        &self,
        key: &NormalizedKey,
    ) -> Result<Option<Vendor>, CoreError> {
        let key = key.as_ref().to_string();
        self.breaker
            .call(|| async {
                let row = sqlx::query!(
                    r#"
                    SELECT normalized_key, display_name, expense_dept, gl_code,
                           allocation_schedule, billing_party, product_category,
                           active, schema_version
                    FROM vendors WHERE normalized_key = $1
                    "#,
                    key
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                row.map(|r| {
                    Ok(Vendor {
                        normalized_key: NormalizedKey::normalize(&r.normalized_key),
                        display_name: r.display_name,
                        expense_dept: r.expense_dept,
                        gl_code: GlCode::parse(r.gl_code).map_err(|e| CoreError::Fatal(anyhow::anyhow!(e)))?,
                        allocation_schedule: r.allocation_schedule,
                        billing_party: r.billing_party,
                        product_category: r.product_category,
                        active: r.active,
                        schema_version: r.schema_version,
                    })
                })
                .transpose()
            })
            .await
    }

    /// Full-row upsert keyed on `NormalizedKey`. Callers
    /// decide the `active` value to pass in; preserving the prior value when
    /// the admin request omitted it is the caller's responsibility (this
    /// keeps the wrapper a thin, generic primitive).
    #[tracing::instrument(skip(self, vendor), fields(normalized_key = %vendor.normalized_key))]
    pub async fn upsert_vendor(
        &self,
        vendor: &Vendor,
    ) -> Result<(), CoreError> {
        let normalized_key = vendor.normalized_key.as_ref().to_string();
        let display_name = vendor.display_name.clone();
        let expense_dept = vendor.expense_dept.clone();
        let gl_code = vendor.gl_code.as_ref().to_string();
        let allocation_schedule = vendor.allocation_schedule.clone();
        let billing_party = vendor.billing_party.clone();
        let product_category = vendor.product_category.clone();
        let active = vendor.active;
        let schema_version = vendor.schema_version.clone();

        self.breaker
            .call(|| async {
                sqlx::query!(
                    r#"
                    INSERT INTO vendors
                        (normalized_key, display_name, expense_dept, gl_code,
                         allocation_schedule, billing_party, product_category,
                         active, schema_version)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (normalized_key) DO UPDATE SET
                        display_name = excluded.display_name,
                        expense_dept = excluded.expense_dept,
                        gl_code = excluded.gl_code,
                        allocation_schedule = excluded.allocation_schedule,
                        billing_party = excluded.billing_party,
                        product_category = excluded.product_category,
                        active = excluded.active,
                        schema_version = excluded.schema_version,
                        updated_at = now()
                    "#,
                    normalized_key,
                    display_name,
                    expense_dept,
                    gl_code,
                    allocation_schedule,
                    billing_party,
                    product_category,
                    active,
                    schema_version,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;
                Ok(())
            })
            .await
    }

    // ---- Transactions ----

    /// `InsertIfAbsent` into `Transactions`, `RowKey = OriginalMessageId`.
    /// The Deduplicator is the only caller.
    #[tracing::instrument(skip(self, tx), fields(tx_id = %tx.tx_id, original_message_id = %tx.original_message_id))]
    pub async fn insert_transaction_if_absent(
        &self,
        tx: &Transaction,
    ) -> Result<InsertOutcome<()>, CoreError> {
        let tx_id = tx.tx_id.to_string();
        let partition_key = tx.tx_id.partition();
        let row_key = tx.original_message_id.clone();
        let original_message_id = tx.original_message_id.clone();
        let status = tx.status.as_str();
        let sender_domain = tx.sender_domain.clone();
        let received_at = tx.received_at;
        let schema_version = tx.schema_version.clone();
        let etag = tx.etag;
        let claimed_at = tx.claimed_at;

        self.breaker
            .call(|| async {
                let result = sqlx::query!(
                    r#"
                    INSERT INTO transactions
                        (tx_id, partition_key, row_key, original_message_id, status,
                         sender_domain, received_at, schema_version, etag, claimed_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (row_key) DO NOTHING
                    "#,
                    tx_id,
                    partition_key,
                    row_key,
                    original_message_id,
                    status,
                    sender_domain,
                    received_at,
                    schema_version,
                    etag,
                    claimed_at,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                Ok(if result.rows_affected() > 0 {
                    InsertOutcome::Inserted(())
                } else {
                    InsertOutcome::AlreadyExists
                })
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_transaction_by_message_id(
        &self,
        original_message_id: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        let original_message_id = original_message_id.to_string();
        self.breaker
            .call(|| async { self.fetch_transaction("row_key", &original_message_id).await })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_transaction(
        &self,
        tx_id: TxId,
    ) -> Result<Option<Transaction>, CoreError> {
        let tx_id = tx_id.to_string();
        self.breaker.call(|| async { self.fetch_transaction("tx_id", &tx_id).await }).await
    }

    async fn fetch_transaction(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Transaction>, CoreError> {
        // `column` is one of two hardcoded literals chosen by the caller above,
        // never user input; safe to interpolate into the query text.
        let sql = format!(
            r#"
            SELECT tx_id, original_message_id, invoice_hash, status, vendor_name,
                   gl_code, sender_domain, received_at, processed_at,
                   emails_sent_count, error_reason, schema_version, etag, claimed_at
            FROM transactions WHERE {column} = $1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Transient(e.into()))?;
        row.map(row_to_transaction).transpose()
    }

    /// `UpdateIfMatch` on a Transaction row. Returns the new etag on success, `CoreError::Conflict`
    /// if `expected_etag` no longer matches.
    #[tracing::instrument(skip(self, patch), fields(%tx_id))]
    pub async fn update_transaction_if_match(
        &self,
        tx_id: TxId,
        expected_etag: Uuid,
        patch: TransactionPatch,
    ) -> Result<Uuid, CoreError> {
        let tx_id_str = tx_id.to_string();
        let new_etag = Uuid::new_v4();
        let status = patch.status.map(|s| s.as_str().to_string());

        self.breaker
            .call(|| async {
                let result = sqlx::query!(
                    r#"
                    UPDATE transactions SET
                        status = COALESCE($1, status),
                        vendor_name = COALESCE($2, vendor_name),
                        gl_code = COALESCE($3, gl_code),
                        processed_at = COALESCE($4, processed_at),
                        error_reason = COALESCE($5, error_reason),
                        emails_sent_count = COALESCE($6, emails_sent_count),
                        claimed_at = COALESCE($7, claimed_at),
                        etag = $8
                    WHERE tx_id = $9 AND etag = $10
                    "#,
                    status,
                    patch.vendor_name,
                    patch.gl_code,
                    patch.processed_at,
                    patch.error_reason,
                    patch.emails_sent_count,
                    patch.claimed_at,
                    new_etag,
                    tx_id_str,
                    expected_etag,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                if result.rows_affected() > 0 {
                    Ok(new_etag)
                } else {
                    Err(CoreError::Conflict(tx_id_str.clone()))
                }
            })
            .await
    }

    // ---- Subscriptions ----

    #[tracing::instrument(skip(self))]
    pub async fn get_active_subscription(&self) -> Result<Option<Subscription>, CoreError> {
        self.breaker
            .call(|| async {
                let row = sqlx::query!(
                    r#"
                    SELECT provider_sub_id, resource, expiration_at, client_state,
                           is_active, created_at, last_renewed_at, etag
                    FROM subscriptions WHERE is_active = TRUE
                    "#
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                Ok(row.map(|r| Subscription {
                    provider_sub_id: r.provider_sub_id,
                    resource: r.resource,
                    expiration_at: r.expiration_at,
                    client_state: secrecy::Secret::new(r.client_state),
                    is_active: r.is_active,
                    created_at: r.created_at,
                    last_renewed_at: r.last_renewed_at,
                    etag: r.etag,
                }))
            })
            .await
    }

    /// `InsertIfAbsent` for a fresh Subscription. The caller
    /// is responsible for clearing the previous active row afterwards.
    #[tracing::instrument(skip(self, sub), fields(provider_sub_id = %sub.provider_sub_id))]
    pub async fn insert_subscription_if_absent(
        &self,
        sub: &Subscription,
    ) -> Result<InsertOutcome<()>, CoreError> {
        use secrecy::ExposeSecret;
        let provider_sub_id = sub.provider_sub_id.clone();
        let resource = sub.resource.clone();
        let expiration_at = sub.expiration_at;
        let client_state = sub.client_state.expose_secret().clone();
        let created_at = sub.created_at;
        let etag = sub.etag;

        self.breaker
            .call(|| async {
                let result = sqlx::query!(
                    r#"
                    INSERT INTO subscriptions
                        (provider_sub_id, resource, expiration_at, client_state,
                         is_active, created_at, etag)
                    VALUES ($1, $2, $3, $4, TRUE, $5, $6)
                    ON CONFLICT (provider_sub_id) DO NOTHING
                    "#,
                    provider_sub_id,
                    resource,
                    expiration_at,
                    client_state,
                    created_at,
                    etag,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                Ok(if result.rows_affected() > 0 {
                    InsertOutcome::Inserted(())
                } else {
                    InsertOutcome::AlreadyExists
                })
            })
            .await
    }

    #[tracing::instrument(skip(self, patch), fields(%provider_sub_id))]
    pub async fn update_subscription_if_match(
        &self,
        provider_sub_id: &str,
        expected_etag: Uuid,
        patch: SubscriptionPatch,
    ) -> Result<Uuid, CoreError> {
        let provider_sub_id = provider_sub_id.to_string();
        let new_etag = Uuid::new_v4();

        self.breaker
            .call(|| async {
                let result = sqlx::query!(
                    r#"
                    UPDATE subscriptions SET
                        expiration_at = COALESCE($1, expiration_at),
                        last_renewed_at = COALESCE($2, last_renewed_at),
                        is_active = COALESCE($3, is_active),
                        etag = $4
                    WHERE provider_sub_id = $5 AND etag = $6
                    "#,
                    patch.expiration_at,
                    patch.last_renewed_at,
                    patch.is_active,
                    new_etag,
                    provider_sub_id,
                    expected_etag,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                if result.rows_affected() > 0 {
                    Ok(new_etag)
                } else {
                    Err(CoreError::Conflict(provider_sub_id.clone()))
                }
            })
            .await
    }

    // ---- RateLimits ----

    /// Atomically increments `key|window_start_epoch` and returns the new
    /// count.
    #[tracing::instrument(skip(self))]
    pub async fn increment_rate_limit_window(
        &self,
        key: &str,
        window_start_epoch: i64,
    ) -> Result<i64, CoreError> {
        let key = key.to_string();
        self.breaker
            .call(|| async {
                let row = sqlx::query!(
                    r#"
                    INSERT INTO rate_limits (key, window_start_epoch, count)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (key, window_start_epoch)
                        DO UPDATE SET count = rate_limits.count + 1
                    RETURNING count
                    "#,
                    key,
                    window_start_epoch,
                )
                .fetch_one(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;
                Ok(row.count)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_rate_limit_window(
        &self,
        key: &str,
        window_start_epoch: i64,
    ) -> Result<i64, CoreError> {
        let key = key.to_string();
        self.breaker
            .call(|| async {
                let row = sqlx::query!(
                    r#"SELECT count FROM rate_limits WHERE key = $1 AND window_start_epoch = $2"#,
                    key,
                    window_start_epoch,
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;
                Ok(row.map(|r| r.count).unwrap_or(0))
            })
            .await
    }
}

fn row_to_transaction(row: sqlx::postgres::PgRow) -> Result<Transaction, CoreError> {
    use sqlx::Row;
    let tx_id: String = row.try_get("tx_id").map_err(|e| CoreError::Fatal(e.into()))?;
    let status: String = row.try_get("status").map_err(|e| CoreError::Fatal(e.into()))?;
    Ok(Transaction {
        tx_id: tx_id.parse().map_err(|_| CoreError::Fatal(anyhow::anyhow!("corrupt tx_id in row")))?,
        original_message_id: row.try_get("original_message_id").map_err(|e| CoreError::Fatal(e.into()))?,
        invoice_hash: row.try_get("invoice_hash").map_err(|e| CoreError::Fatal(e.into()))?,
        status: TransactionStatus::parse(&status).map_err(|e| CoreError::Fatal(anyhow::anyhow!(e)))?,
        vendor_name: row.try_get("vendor_name").map_err(|e| CoreError::Fatal(e.into()))?,
        gl_code: row.try_get("gl_code").map_err(|e| CoreError::Fatal(e.into()))?,
        sender_domain: row.try_get("sender_domain").map_err(|e| CoreError::Fatal(e.into()))?,
        received_at: row.try_get("received_at").map_err(|e| CoreError::Fatal(e.into()))?,
        processed_at: row.try_get("processed_at").map_err(|e| CoreError::Fatal(e.into()))?,
        emails_sent_count: row.try_get("emails_sent_count").map_err(|e| CoreError::Fatal(e.into()))?,
        error_reason: row.try_get("error_reason").map_err(|e| CoreError::Fatal(e.into()))?,
        schema_version: row.try_get("schema_version").map_err(|e| CoreError::Fatal(e.into()))?,
        etag: row.try_get("etag").map_err(|e| CoreError::Fatal(e.into()))?,
        claimed_at: row.try_get("claimed_at").map_err(|e| CoreError::Fatal(e.into()))?,
    })
}
