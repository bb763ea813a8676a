use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ids::TxId;

/// Status of a Transaction row. Advances
/// monotonically through one of:
///   received -> enriched -> posted
///   received -> unknown  -> posted
/// with either `enriched` or `unknown` able to fall to `failed` instead of
/// reaching `posted`. Never moves backward, never revisits `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Received,
    Enriched,
    Unknown,
    Posted,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Received => "received",
            TransactionStatus::Enriched => "enriched",
            TransactionStatus::Unknown => "unknown",
            TransactionStatus::Posted => "posted",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "received" => Ok(TransactionStatus::Received),
            "enriched" => Ok(TransactionStatus::Enriched),
            "unknown" => Ok(TransactionStatus::Unknown),
            "posted" => Ok(TransactionStatus::Posted),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unrecognized transaction status: {other:?}")),
        }
    }

    /// Whether `self -> next` is a legal transition. Used defensively at the
    /// one place the status is mutated (`KVStore::update_if_match`'s
    /// callers); violating it is a programming error, not a recoverable one.
    pub fn can_advance_to(
        &self,
        next: TransactionStatus,
    ) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Received, Enriched)
                | (Received, Unknown)
                | (Received, Failed)
                | (Enriched, Posted)
                | (Enriched, Failed)
                | (Unknown, Posted)
                | (Unknown, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Posted | TransactionStatus::Failed)
    }
}

/// One row per unique inbound message. Row key is the `TxID`;
/// partitioned by `YYYYMM` of receipt via `TxId::partition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: TxId,
    pub original_message_id: String,
    pub invoice_hash: Option<String>,
    pub status: TransactionStatus,
    pub vendor_name: Option<String>,
    pub gl_code: Option<String>,
    pub sender_domain: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub emails_sent_count: i32,
    pub error_reason: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Optimistic-concurrency token, bumped on every `UpdateIfMatch`.
    pub etag: uuid::Uuid,
    /// When the current mid-flight claim was taken; used by the
    /// Deduplicator's stale-claim recovery.
    pub claimed_at: DateTime<Utc>,
}

fn default_schema_version() -> String { "1.0".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_paths_through_enriched() {
        assert!(TransactionStatus::Received.can_advance_to(TransactionStatus::Enriched));
        assert!(TransactionStatus::Enriched.can_advance_to(TransactionStatus::Posted));
    }

    #[test]
    fn legal_paths_through_unknown() {
        assert!(TransactionStatus::Received.can_advance_to(TransactionStatus::Unknown));
        assert!(TransactionStatus::Unknown.can_advance_to(TransactionStatus::Posted));
    }

    #[test]
    fn never_revisits_received() {
        assert!(!TransactionStatus::Enriched.can_advance_to(TransactionStatus::Received));
        assert!(!TransactionStatus::Posted.can_advance_to(TransactionStatus::Received));
    }

    #[test]
    fn terminal_states_do_not_advance() {
        assert!(!TransactionStatus::Posted.can_advance_to(TransactionStatus::Enriched));
        assert!(!TransactionStatus::Failed.can_advance_to(TransactionStatus::Posted));
    }
}
