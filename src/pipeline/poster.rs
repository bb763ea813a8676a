use std::time::Duration;

use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::domain::Enriched;
use crate::domain::Notification;
use crate::domain::NotificationKind;
use crate::domain::TransactionStatus;
use crate::error::CoreError;
use crate::infra::QueueMessage;
use crate::infra::TransactionPatch;
use crate::mail_client::OutboundAttachment;
use crate::worker::QueueHandler;

fn subject_for(enriched: &Enriched) -> (String, String) {
    match enriched.status {
        TransactionStatus::Enriched => (
            enriched.raw.sender.clone(),
            format!(
                "Invoice: {} — GL {}",
                enriched.vendor_name.as_deref().unwrap_or("Unknown Vendor"),
                enriched.gl_code
            ),
        ),
        _ => (
            enriched.raw.sender.clone(),
            format!("Unknown Vendor — requires registration (TxID {})", enriched.raw.tx_id.short()),
        ),
    }
}

fn recipient_for(
    enriched: &Enriched,
    ap_address: &str,
) -> String {
    match enriched.status {
        TransactionStatus::Enriched => ap_address.to_string(),
        _ => enriched.raw.sender.clone(),
    }
}

fn body_for(enriched: &Enriched) -> String {
    let mut lines = Vec::new();
    match enriched.status {
        TransactionStatus::Enriched => {
            lines.push(format!(
                "GL {} — {}",
                enriched.gl_code,
                enriched.vendor_name.as_deref().unwrap_or("Unknown Vendor")
            ));
            if let Some(dept) = &enriched.allocation_schedule {
                lines.push(format!("Allocation schedule: {dept}"));
            }
            if let Some(party) = &enriched.billing_party {
                lines.push(format!("Billing party: {party}"));
            }
            if let Some(amount) = &enriched.invoice_amount {
                lines.push(format!("Amount: {} {}", enriched.currency.as_deref().unwrap_or(""), amount));
            }
            if let Some(due) = &enriched.due_date {
                lines.push(format!("Due date: {due}"));
            }
            if let Some(terms) = &enriched.payment_terms {
                lines.push(format!("Terms: {terms}"));
            }
        }
        _ => {
            lines.push("We could not automatically match this invoice to a registered vendor.".to_string());
            lines.push("Please reply with your company's expense department and GL code so we can register you.".to_string());
        }
    }
    lines.push(String::new());
    lines.push(format!("TxID {}", enriched.raw.tx_id));
    lines.push(format!("Original sender: {}", enriched.raw.sender));
    lines.join("\n")
}

/// Consumer of `post-queue`. Sends the standardized invoice
/// email — attached inline when the blob is under the configured size
/// ceiling, linked via a signed URL otherwise — and advances the Transaction
/// row to its terminal outcome.
pub struct Poster;

#[async_trait]
impl QueueHandler for Poster {
    fn queue_name(&self) -> &str { "post-queue" }

    #[tracing::instrument(skip_all, fields(message_id = message.id))]
    async fn handle(
        &self,
        message: &QueueMessage,
        context: &ApplicationContext,
    ) -> Result<(), CoreError> {
        let enriched: Enriched = message.decode()?;
        let to = recipient_for(&enriched, &context.settings.ap_address);
        let sender = context.settings.mail_client.sender.clone();
        let (_, subject) = subject_for(&enriched);
        let body = body_for(&enriched);

        let blob_bytes = context.blob_store.get(&enriched.raw.blob_ref).await;
        let send_result = match blob_bytes {
            Ok(bytes) if (bytes.len() as u64) <= context.settings.poster.inline_attachment_max_bytes => {
                let attachment = OutboundAttachment {
                    filename: format!("{}.pdf", enriched.raw.tx_id),
                    content_type: "application/pdf".to_string(),
                    bytes,
                };
                context.mail_client.send_mail(&sender, &to, &subject, &body, Some(attachment)).await
            }
            Ok(_) => {
                let url = context.blob_store.signed_url(
                    &enriched.raw.blob_ref,
                    Duration::from_secs(context.settings.blob_store.signed_url_ttl_secs),
                );
                let body_with_link = format!("{body}\n\nInvoice document: {url}");
                context.mail_client.send_mail(&sender, &to, &subject, &body_with_link, None).await
            }
            Err(e) => Err(e),
        };

        match send_result {
            Ok(()) => {
                let notification_kind = match enriched.status {
                    TransactionStatus::Enriched => NotificationKind::Success,
                    _ => NotificationKind::Unknown,
                };
                advance_to_posted(context, &enriched).await?;
                context
                    .queue_bus
                    .enqueue(
                        "notify-queue",
                        &Notification {
                            kind: notification_kind,
                            tx_id: enriched.raw.tx_id,
                            summary: format!("Posted {} for {}", enriched.gl_code, enriched.raw.sender),
                            details: serde_json::json!({
                                "vendor_name": enriched.vendor_name,
                                "gl_code": enriched.gl_code,
                                "subject": subject,
                            }),
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                mark_failed(context, &enriched, &e).await?;
                context
                    .queue_bus
                    .enqueue(
                        "notify-queue",
                        &Notification {
                            kind: NotificationKind::Error,
                            tx_id: enriched.raw.tx_id,
                            summary: format!("Failed to post invoice for {}", enriched.raw.sender),
                            details: serde_json::json!({ "reason": e.to_string() }),
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

async fn advance_to_posted(
    context: &ApplicationContext,
    enriched: &Enriched,
) -> Result<(), CoreError> {
    let current = context
        .kv_store
        .get_transaction(enriched.raw.tx_id)
        .await?
        .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("transaction {} vanished before posting", enriched.raw.tx_id)))?;
    context
        .kv_store
        .update_transaction_if_match(
            enriched.raw.tx_id,
            current.etag,
            TransactionPatch {
                status: Some(TransactionStatus::Posted),
                emails_sent_count: Some(current.emails_sent_count + 1),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

async fn mark_failed(
    context: &ApplicationContext,
    enriched: &Enriched,
    error: &CoreError,
) -> Result<(), CoreError> {
    let current = context
        .kv_store
        .get_transaction(enriched.raw.tx_id)
        .await?
        .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("transaction {} vanished before failing", enriched.raw.tx_id)))?;
    context
        .kv_store
        .update_transaction_if_match(
            enriched.raw.tx_id,
            current.etag,
            TransactionPatch {
                status: Some(TransactionStatus::Failed),
                error_reason: Some(error.to_string()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::RawMail;
    use crate::ids::TxId;

    fn sample_enriched(status: TransactionStatus) -> Enriched {
        Enriched {
            raw: RawMail {
                schema_version: "1.0".to_string(),
                tx_id: TxId::new(),
                sender: "billing@adobe.com".to_string(),
                subject: "Invoice 12345".to_string(),
                blob_ref: "raw/x.pdf".to_string(),
                received_at: Utc::now(),
                original_message_id: "m1".to_string(),
                vendor_hint: None,
            },
            vendor_name: Some("Adobe Inc".to_string()),
            expense_dept: "IT".to_string(),
            gl_code: "6100".to_string(),
            allocation_schedule: Some("MONTHLY".to_string()),
            billing_party: Some("HQ".to_string()),
            status,
            invoice_amount: None,
            currency: None,
            due_date: None,
            payment_terms: None,
        }
    }

    #[test]
    fn enriched_subject_names_vendor_and_gl() {
        let enriched = sample_enriched(TransactionStatus::Enriched);
        let (_, subject) = subject_for(&enriched);
        assert_eq!(subject, "Invoice: Adobe Inc — GL 6100");
    }

    #[test]
    fn enriched_routes_to_ap_address() {
        let enriched = sample_enriched(TransactionStatus::Enriched);
        assert_eq!(recipient_for(&enriched, "ap@example.com"), "ap@example.com");
    }

    #[test]
    fn unknown_routes_back_to_original_sender() {
        let enriched = sample_enriched(TransactionStatus::Unknown);
        assert_eq!(recipient_for(&enriched, "ap@example.com"), "billing@adobe.com");
    }

    #[test]
    fn unknown_subject_carries_short_tx_id() {
        let enriched = sample_enriched(TransactionStatus::Unknown);
        let (_, subject) = subject_for(&enriched);
        assert!(subject.starts_with("Unknown Vendor — requires registration"));
    }
}
