use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::Transaction;
use crate::domain::TransactionStatus;
use crate::error::CoreError;
use crate::ids::TxId;
use crate::infra::InsertOutcome;
use crate::infra::KvStore;
use crate::infra::TransactionPatch;

/// At-most-one concurrent processor per inbound email, despite at-least-once
/// queue delivery, webhook + poller double-ingestion, and provider replays.
/// Uses a claim-row idiom, operating directly against the `Transactions`
/// table instead of a dedicated idempotency table.
pub struct Deduplicator {
    kv_store: Arc<KvStore>,
    stale_claim_window: Duration,
}

/// Whether `ClaimAndStart` granted exclusive processing rights.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// A fresh claim, or a stale one successfully stolen.
    Claimed { tx_id: TxId, etag: Uuid },
    /// Another process already owns this message, or it already reached a
    /// terminal state.
    Skip { tx_id: TxId },
}

impl Deduplicator {
    pub fn new(
        kv_store: Arc<KvStore>,
        stale_claim_window: Duration,
    ) -> Self {
        Self { kv_store, stale_claim_window }
    }

    /// `ClaimAndStart(OriginalMessageId) -> (TxID, IsNew)`.
    #[tracing::instrument(skip(self), fields(%original_message_id))]
    pub async fn claim_and_start(
        &self,
        original_message_id: &str,
        sender_domain: &str,
    ) -> Result<ClaimOutcome, CoreError> {
        let tx_id = TxId::new();
        let now = Utc::now();
        let candidate = Transaction {
            tx_id,
            original_message_id: original_message_id.to_string(),
            invoice_hash: None,
            status: TransactionStatus::Received,
            vendor_name: None,
            gl_code: None,
            sender_domain: sender_domain.to_string(),
            received_at: now,
            processed_at: None,
            emails_sent_count: 0,
            error_reason: None,
            schema_version: "1.0".to_string(),
            etag: Uuid::new_v4(),
            claimed_at: now,
        };

        match self.kv_store.insert_transaction_if_absent(&candidate).await? {
            InsertOutcome::Inserted(()) => {
                return Ok(ClaimOutcome::Claimed { tx_id, etag: candidate.etag });
            }
            InsertOutcome::AlreadyExists => {}
        }

        let existing = self
            .kv_store
            .get_transaction_by_message_id(original_message_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("row vanished after AlreadyExists")))?;

        if existing.status.is_terminal() {
            return Ok(ClaimOutcome::Skip { tx_id: existing.tx_id });
        }

        let claim_age = now.signed_duration_since(existing.claimed_at);
        let stale = claim_age
            > chrono::Duration::from_std(self.stale_claim_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));

        if !stale {
            return Ok(ClaimOutcome::Skip { tx_id: existing.tx_id });
        }

        // Steal the stale claim.
        match self
            .kv_store
            .update_transaction_if_match(
                existing.tx_id,
                existing.etag,
                TransactionPatch {
                    status: Some(TransactionStatus::Received),
                    claimed_at: Some(now),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(new_etag) => Ok(ClaimOutcome::Claimed { tx_id: existing.tx_id, etag: new_etag }),
            // Someone else stole it first between our read and our write.
            Err(CoreError::Conflict(_)) => Ok(ClaimOutcome::Skip { tx_id: existing.tx_id }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_window_boundary_uses_claimed_at_not_received_at() {
        // A regression guard: the staleness check must compare against
        // `claimed_at`, which is refreshed on every steal, not the original
        // `received_at`, or a long-lived in-flight message would be stolen
        // repeatedly by concurrent processors.
        let claimed_at = Utc::now() - chrono::Duration::minutes(5);
        let age = Utc::now().signed_duration_since(claimed_at);
        assert!(age < chrono::Duration::minutes(30));
    }
}
