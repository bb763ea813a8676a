use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::domain::Notification;
use crate::error::CoreError;
use crate::infra::QueueMessage;
use crate::worker::QueueHandler;

/// Consumer of `notify-queue`. Best-effort by design: any
/// failure posting the card is logged and swallowed, never redelivered.
pub struct Notifier;

#[async_trait]
impl QueueHandler for Notifier {
    fn queue_name(&self) -> &str { "notify-queue" }

    #[tracing::instrument(skip_all, fields(message_id = message.id))]
    async fn handle(
        &self,
        message: &QueueMessage,
        context: &ApplicationContext,
    ) -> Result<(), CoreError> {
        let notification: Notification = match message.decode() {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed notification message");
                return Ok(());
            }
        };

        if let Err(e) = context.notification_sink.post(&notification).await {
            tracing::warn!(
                error = %e,
                tx_id = %notification.tx_id,
                kind = ?notification.kind,
                "failed to deliver notification card, dropping"
            );
        }
        Ok(())
    }
}
