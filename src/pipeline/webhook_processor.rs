use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::dedup::ClaimOutcome;
use crate::domain::RawMail;
use crate::domain::WebhookNotice;
use crate::domain::CURRENT_SCHEMA_VERSION;
use crate::error::CoreError;
use crate::infra::QueueMessage;
use crate::mail_client::Email;
use crate::pipeline::loop_prevention;
use crate::worker::QueueHandler;

/// Splits a provider resource path (`Users/{mailbox}/Messages/{id}`) into its
/// mailbox and message id segments.
fn parse_resource(resource: &str) -> Result<(String, String), CoreError> {
    let segments: Vec<&str> = resource.split('/').collect();
    let mailbox = segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case("Users"))
        .and_then(|i| segments.get(i + 1))
        .ok_or_else(|| CoreError::Validation(format!("cannot find mailbox segment in resource {resource:?}")))?;
    let message_id = segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case("Messages"))
        .and_then(|i| segments.get(i + 1))
        .ok_or_else(|| CoreError::Validation(format!("cannot find message id segment in resource {resource:?}")))?;
    Ok((mailbox.to_string(), message_id.to_string()))
}

/// Consumer of `notif-queue`. Fetches the full email, filters
/// loop-prevention candidates, claims exclusive ownership, downloads the
/// first PDF attachment, and hands the rest of the pipeline a `RawMail`.
///
/// The claim happens before the attachment download, not after as a literal
/// reading of the step order would suggest: `Deduplicator::claim_and_start`
/// mints the `TxID` the blob is keyed on, so claiming first means a message
/// skipped as a duplicate never causes an orphaned blob write.
pub struct WebhookProcessor;

#[async_trait]
impl QueueHandler for WebhookProcessor {
    fn queue_name(&self) -> &str { "notif-queue" }

    #[tracing::instrument(skip_all, fields(message_id = message.id))]
    async fn handle(
        &self,
        message: &QueueMessage,
        context: &ApplicationContext,
    ) -> Result<(), CoreError> {
        let notice: WebhookNotice = message.decode()?;
        let (mailbox, message_id) = parse_resource(&notice.resource)?;
        let email = context.mail_client.get_email(&mailbox, &message_id).await?;
        process_email(email, context).await
    }
}

/// Shared tail of ingestion: loop-prevention, claim, attachment
/// download, best-effort vendor hint, enqueue, mark read. Entered once the
/// caller already has a fetched `Email`, whether from the webhook path
/// (`GetEmail`) or the poller (`ListUnread`).
#[tracing::instrument(skip_all, fields(message_id = %email.message_id))]
pub async fn process_email(
    email: Email,
    context: &ApplicationContext,
) -> Result<(), CoreError> {
    let has_attachment = !email.attachments.is_empty();
    if loop_prevention::should_discard(
        &email.sender,
        &email.subject,
        has_attachment,
        &context.settings.monitored_mailbox,
        &context.settings.ap_address,
    ) {
        tracing::info!("loop-prevention filter discarded message");
        return Ok(());
    }

    let Some(attachment) = email.attachments.iter().find(|a| a.is_pdf) else {
        tracing::info!("no pdf attachment present, discarding");
        return Ok(());
    };

    let sender_domain = email.sender.rsplit('@').next().unwrap_or(&email.sender).to_string();
    let claim = context.deduplicator.claim_and_start(&email.message_id, &sender_domain).await?;
    let tx_id = match claim {
        ClaimOutcome::Claimed { tx_id, .. } => tx_id,
        ClaimOutcome::Skip { tx_id } => {
            tracing::info!(%tx_id, "deduplicator reported skip, another processor owns this message");
            return Ok(());
        }
    };

    let bytes = context.mail_client.download_attachment(&email.message_id, &attachment.attachment_id).await?;
    let blob_ref = format!("raw/{tx_id}.pdf");
    context.blob_store.put(&blob_ref, &bytes).await?;

    let vendor_hint = match context.vendor_extractor.extract(&bytes).await {
        Ok(result) => result.vendor_guess,
        Err(e) => {
            tracing::warn!(error = %e, "vendor hint extraction failed, continuing without it");
            None
        }
    };

    let raw_mail = RawMail {
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        tx_id,
        sender: email.sender.clone(),
        subject: email.subject.clone(),
        blob_ref,
        received_at: email.received_at,
        original_message_id: email.message_id.clone(),
        vendor_hint,
    };
    context.queue_bus.enqueue("raw-queue", &raw_mail).await?;
    context.mail_client.mark_read(&email.message_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mailbox_and_message_id() {
        let (mailbox, message_id) = parse_resource("Users/invoices@example.com/Messages/AAMkAd123").unwrap();
        assert_eq!(mailbox, "invoices@example.com");
        assert_eq!(message_id, "AAMkAd123");
    }

    #[test]
    fn rejects_malformed_resource() {
        assert!(parse_resource("not-a-resource-path").is_err());
    }
}
