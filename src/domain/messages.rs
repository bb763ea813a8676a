use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::transaction::TransactionStatus;
use crate::ids::TxId;

pub const CURRENT_SCHEMA_VERSION: &str = "1.0";

/// A provider-native change-notification, validated and forwarded onto
/// `notif-queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotice {
    pub schema_version: String,
    pub subscription_id: String,
    pub client_state: String,
    pub change_type: String,
    /// Provider-native resource path, e.g. `Users/me/Messages/{id}`.
    pub resource: String,
}

/// Queue payload after a message has been fetched and its first PDF
/// attachment written to the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMail {
    pub schema_version: String,
    pub tx_id: TxId,
    pub sender: String,
    pub subject: String,
    pub blob_ref: String,
    pub received_at: DateTime<Utc>,
    pub original_message_id: String,
    pub vendor_hint: Option<String>,
}

/// `RawMail` plus the enrichment outcome. `status` is one of
/// `enriched` / `unknown`; other `TransactionStatus` variants never appear
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enriched {
    pub raw: RawMail,
    pub vendor_name: Option<String>,
    pub expense_dept: String,
    pub gl_code: String,
    pub allocation_schedule: Option<String>,
    pub billing_party: Option<String>,
    pub status: TransactionStatus,
    pub invoice_amount: Option<String>,
    pub currency: Option<String>,
    pub due_date: Option<String>,
    pub payment_terms: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Unknown,
    Error,
}

/// A chat-card notification queued for the Notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub tx_id: TxId,
    pub summary: String,
    pub details: serde_json::Value,
}
