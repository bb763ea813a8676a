mod messages;
mod subscription;
mod transaction;
mod vendor;

pub use messages::Enriched;
pub use messages::Notification;
pub use messages::NotificationKind;
pub use messages::RawMail;
pub use messages::WebhookNotice;
pub use messages::CURRENT_SCHEMA_VERSION;
pub use subscription::Subscription;
pub use transaction::Transaction;
pub use transaction::TransactionStatus;
pub use vendor::GlCode;
pub use vendor::NormalizedKey;
pub use vendor::Vendor;
pub use vendor::RESELLER_CATEGORY;
