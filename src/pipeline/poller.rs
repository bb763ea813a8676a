use std::time::Duration;

use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::pipeline::webhook_processor::process_email;
use crate::scheduler::ScheduledTask;

const LIST_LIMIT: u32 = 50;

/// Safety net for missed webhook deliveries. Runs
/// `ListUnread` and feeds every result through the same claim/enrich-hand-off
/// sequence the webhook path uses; the Deduplicator guarantees no double
/// processing when the two race on the same message.
pub struct Poller {
    interval: Duration,
}

impl Poller {
    pub fn new(interval: Duration) -> Self { Self { interval } }
}

#[async_trait]
impl ScheduledTask for Poller {
    fn name(&self) -> &str { "poller" }

    fn interval(&self) -> Duration { self.interval }

    async fn run(
        &self,
        context: &ApplicationContext,
    ) -> Result<(), anyhow::Error> {
        let emails = context.mail_client.list_unread(&context.settings.monitored_mailbox, LIST_LIMIT).await?;
        tracing::info!(count = emails.len(), "poller fetched unread messages");
        for email in emails {
            let message_id = email.message_id.clone();
            if let Err(e) = process_email(email, context).await {
                tracing::warn!(error = %e, message_id, "poller failed to process message, will retry next run");
            }
        }
        Ok(())
    }
}
