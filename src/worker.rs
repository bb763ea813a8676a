use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::error::CoreError;
use crate::infra::QueueMessage;

/// One queue consumer, in a reusable shape shared by every pipeline stage.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    fn queue_name(&self) -> &str;
    async fn handle(
        &self,
        message: &QueueMessage,
        context: &ApplicationContext,
    ) -> Result<(), CoreError>;
}

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(500);

/// Runs `handler` against its queue forever.
/// Ack on success; on failure, redeliver or poison via
/// `CoreError::should_redeliver` and `QueueBus::nack`'s own `max_dequeue`
/// accounting.
#[tracing::instrument(skip_all, fields(queue = handler.queue_name()))]
pub async fn run_worker(
    handler: Arc<dyn QueueHandler>,
    context: Arc<ApplicationContext>,
) -> Result<(), anyhow::Error> {
    let queue = handler.queue_name().to_string();
    loop {
        match context.queue_bus.dequeue(&queue).await {
            Ok(Some(message)) => {
                let message_id = message.id;
                let dequeue_count = message.dequeue_count;
                match handler.handle(&message, &context).await {
                    Ok(()) => {
                        if let Err(e) = context.queue_bus.ack(message_id).await {
                            tracing::error!(error = %e, message_id, "failed to ack processed message");
                        }
                    }
                    Err(e) => {
                        if e.should_redeliver() {
                            tracing::warn!(error = %e, message_id, "handler failed, redelivering");
                            if let Err(nack_err) = context.queue_bus.nack(&queue, message_id, dequeue_count).await {
                                tracing::error!(error = %nack_err, message_id, "failed to nack message");
                            }
                        } else {
                            tracing::info!(error = %e, message_id, "handler reported a terminal outcome, acking");
                            if let Err(ack_err) = context.queue_bus.ack(message_id).await {
                                tracing::error!(error = %ack_err, message_id, "failed to ack terminal message");
                            }
                        }
                    }
                }
            }
            Ok(None) => tokio::time::sleep(EMPTY_QUEUE_BACKOFF).await,
            Err(e) => {
                tracing::error!(error = %e, queue, "dequeue failed, backing off");
                tokio::time::sleep(EMPTY_QUEUE_BACKOFF).await;
            }
        }
    }
}
