mod blob_store;
mod kv_store;
mod notification_sink;
mod queue_bus;

pub use blob_store::BlobStore;
pub use kv_store::InsertOutcome;
pub use kv_store::KvStore;
pub use kv_store::SubscriptionPatch;
pub use kv_store::TransactionPatch;
pub use notification_sink::HttpNotificationSink;
pub use notification_sink::NotificationSink;
pub use queue_bus::QueueBus;
pub use queue_bus::QueueMessage;
