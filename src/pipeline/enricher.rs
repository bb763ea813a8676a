use async_trait::async_trait;

use crate::context::ApplicationContext;
use crate::domain::Enriched;
use crate::domain::GlCode;
use crate::domain::NormalizedKey;
use crate::domain::RawMail;
use crate::domain::TransactionStatus;
use crate::domain::Vendor;
use crate::error::CoreError;
use crate::infra::QueueMessage;
use crate::infra::TransactionPatch;
use crate::worker::QueueHandler;

const UNKNOWN_EXPENSE_DEPT: &str = "UNKNOWN";

/// Lookup key a `RawMail` resolves to before the Vendor fetch. `VendorHint` always wins when present; otherwise the key is
/// derived from the sender address per `lookup_strategy`.
fn resolve_lookup_key(
    raw: &RawMail,
    lookup_strategy: &str,
) -> NormalizedKey {
    if let Some(hint) = raw.vendor_hint.as_deref().filter(|h| !h.trim().is_empty()) {
        return NormalizedKey::normalize(hint);
    }

    let domain = raw.sender.rsplit('@').next().unwrap_or(&raw.sender);
    let source = match lookup_strategy {
        "local_part" => raw.sender.split('@').next().unwrap_or(&raw.sender),
        "domain" => domain,
        _ => domain.rsplit_once('.').map(|(head, _)| head).unwrap_or(domain),
    };
    NormalizedKey::normalize(source)
}

/// Whether a matched Vendor row should actually be treated as a hit: a
/// `Reseller` vendor is forced to the `unknown` path regardless of match,
/// because its GL code is invoice-specific rather than vendor-specific.
fn is_usable_match(vendor: &Vendor) -> bool { vendor.active && !vendor.is_reseller() }

fn compose_unknown(raw: RawMail) -> Enriched {
    Enriched {
        raw,
        vendor_name: None,
        expense_dept: UNKNOWN_EXPENSE_DEPT.to_string(),
        gl_code: GlCode::unknown().to_string(),
        allocation_schedule: None,
        billing_party: None,
        status: TransactionStatus::Unknown,
        invoice_amount: None,
        currency: None,
        due_date: None,
        payment_terms: None,
    }
}

/// Consumer of `raw-queue`. Resolves the vendor, composes an
/// `Enriched` record, and advances the Transaction row via `UpdateIfMatch`
/// with one re-read-and-retry on etag conflict.
pub struct Enricher;

#[async_trait]
impl QueueHandler for Enricher {
    fn queue_name(&self) -> &str { "raw-queue" }

    #[tracing::instrument(skip_all, fields(message_id = message.id))]
    async fn handle(
        &self,
        message: &QueueMessage,
        context: &ApplicationContext,
    ) -> Result<(), CoreError> {
        let raw: RawMail = message.decode()?;
        let lookup_key = resolve_lookup_key(&raw, &context.settings.enricher.lookup_strategy);
        let matched_vendor = context.kv_store.get_vendor(&lookup_key).await?;

        let mut enriched = match matched_vendor {
            Some(vendor) if is_usable_match(&vendor) => Enriched {
                vendor_name: Some(vendor.display_name.clone()),
                expense_dept: vendor.expense_dept.clone(),
                gl_code: vendor.gl_code.to_string(),
                allocation_schedule: Some(vendor.allocation_schedule.clone()),
                billing_party: Some(vendor.billing_party.clone()),
                status: TransactionStatus::Enriched,
                invoice_amount: None,
                currency: None,
                due_date: None,
                payment_terms: None,
                raw: raw.clone(),
            },
            _ => compose_unknown(raw.clone()),
        };

        if enriched.status == TransactionStatus::Enriched {
            match context.blob_store.get(&raw.blob_ref).await {
                Ok(bytes) => match context.vendor_extractor.extract(&bytes).await {
                    Ok(result) => {
                        enriched.invoice_amount = result.invoice_amount;
                        enriched.currency = result.currency;
                        enriched.due_date = result.due_date;
                        enriched.payment_terms = result.payment_terms;
                    }
                    Err(e) => tracing::warn!(error = %e, "field extraction failed, posting without amount/date/terms"),
                },
                Err(e) => tracing::warn!(error = %e, "failed to re-fetch blob for field extraction"),
            }
        }

        let patch = TransactionPatch {
            status: Some(enriched.status),
            vendor_name: enriched.vendor_name.clone(),
            gl_code: Some(enriched.gl_code.clone()),
            processed_at: Some(chrono::Utc::now()),
            ..Default::default()
        };
        update_transaction_with_retry(context, raw.tx_id, patch).await?;

        context.queue_bus.enqueue("post-queue", &enriched).await?;
        Ok(())
    }
}

/// `UpdateIfMatch` with one re-read-and-retry on conflict.
async fn update_transaction_with_retry(
    context: &ApplicationContext,
    tx_id: crate::ids::TxId,
    patch: TransactionPatch,
) -> Result<(), CoreError> {
    for attempt in 0..2 {
        let current = context
            .kv_store
            .get_transaction(tx_id)
            .await?
            .ok_or_else(|| CoreError::Fatal(anyhow::anyhow!("transaction {tx_id} vanished before enrichment update")))?;

        match context.kv_store.update_transaction_if_match(tx_id, current.etag, patch.clone()).await {
            Ok(_) => return Ok(()),
            Err(CoreError::Conflict(_)) if attempt == 0 => continue,
            Err(CoreError::Conflict(reason)) => {
                return Err(CoreError::Transient(anyhow::anyhow!("repeated etag conflict updating {reason}")))
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns within two attempts")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ids::TxId;

    fn sample_raw(vendor_hint: Option<&str>, sender: &str) -> RawMail {
        RawMail {
            schema_version: "1.0".to_string(),
            tx_id: TxId::new(),
            sender: sender.to_string(),
            subject: "Invoice".to_string(),
            blob_ref: "raw/x.pdf".to_string(),
            received_at: Utc::now(),
            original_message_id: "m1".to_string(),
            vendor_hint: vendor_hint.map(str::to_string),
        }
    }

    #[test]
    fn vendor_hint_wins_over_sender_derivation() {
        let raw = sample_raw(Some("Adobe Inc"), "billing@some-reseller.com");
        let key = resolve_lookup_key(&raw, "domain_without_tld");
        assert_eq!(key, NormalizedKey::normalize("Adobe Inc"));
    }

    #[test]
    fn falls_back_to_domain_without_tld() {
        let raw = sample_raw(None, "billing@adobe.com");
        let key = resolve_lookup_key(&raw, "domain_without_tld");
        assert_eq!(key, NormalizedKey::normalize("adobe"));
    }

    #[test]
    fn local_part_strategy_uses_sender_local_part() {
        let raw = sample_raw(None, "billing@adobe.com");
        let key = resolve_lookup_key(&raw, "local_part");
        assert_eq!(key, NormalizedKey::normalize("billing"));
    }

    #[test]
    fn reseller_vendor_is_not_a_usable_match() {
        let vendor = Vendor {
            normalized_key: NormalizedKey::normalize("reseller co"),
            display_name: "Reseller Co".into(),
            expense_dept: "IT".into(),
            gl_code: GlCode::parse("1234".to_string()).unwrap(),
            allocation_schedule: "MONTHLY".into(),
            billing_party: "HQ".into(),
            product_category: Some(crate::domain::RESELLER_CATEGORY.to_string()),
            active: true,
            schema_version: "1.0".into(),
        };
        assert!(!is_usable_match(&vendor));
    }
}
