use chrono::Utc;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use invoice_agent::domain::GlCode;
use invoice_agent::domain::NormalizedKey;
use invoice_agent::domain::RawMail;
use invoice_agent::domain::TransactionStatus;
use invoice_agent::domain::Vendor;
use invoice_agent::domain::CURRENT_SCHEMA_VERSION;
use invoice_agent::ids::TxId;
use invoice_agent::infra::QueueMessage;
use invoice_agent::pipeline::Enricher;
use invoice_agent::pipeline::Poster;
use invoice_agent::worker::QueueHandler;

use crate::helpers::spawn_app;

fn sample_raw_mail(
    tx_id: TxId,
    sender: &str,
    vendor_hint: Option<&str>,
) -> RawMail {
    RawMail {
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        tx_id,
        sender: sender.to_string(),
        subject: "Invoice #4471".to_string(),
        blob_ref: format!("raw/{tx_id}.pdf"),
        received_at: Utc::now(),
        original_message_id: Uuid::new_v4().to_string(),
        vendor_hint: vendor_hint.map(str::to_string),
    }
}

async fn seed_transaction_row(
    app: &crate::helpers::TestApp,
    raw: &RawMail,
) {
    let transaction = invoice_agent::domain::Transaction {
        tx_id: raw.tx_id,
        original_message_id: raw.original_message_id.clone(),
        invoice_hash: None,
        status: TransactionStatus::Received,
        vendor_name: None,
        gl_code: None,
        sender_domain: raw.sender.rsplit('@').next().unwrap().to_string(),
        received_at: raw.received_at,
        processed_at: None,
        emails_sent_count: 0,
        error_reason: None,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        etag: Uuid::new_v4(),
        claimed_at: Utc::now(),
    };
    app.context.kv_store.insert_transaction_if_absent(&transaction).await.unwrap();
}

fn queue_message(raw: &RawMail) -> QueueMessage {
    QueueMessage { id: 1, payload: serde_json::to_value(raw).unwrap(), dequeue_count: 1 }
}

#[tokio::test]
async fn known_vendor_reaches_posted_and_notifies_success() {
    let app = spawn_app().await;

    let vendor = Vendor {
        normalized_key: NormalizedKey::normalize("adobe"),
        display_name: "Adobe Inc".to_string(),
        expense_dept: "IT".to_string(),
        gl_code: GlCode::parse("6100".to_string()).unwrap(),
        allocation_schedule: "MONTHLY".to_string(),
        billing_party: "HQ".to_string(),
        product_category: None,
        active: true,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
    };
    app.context.kv_store.upsert_vendor(&vendor).await.unwrap();

    let tx_id = TxId::new();
    let raw = sample_raw_mail(tx_id, "billing@adobe.com", None);
    seed_transaction_row(&app, &raw).await;
    app.context.blob_store.put(&raw.blob_ref, b"%PDF-1.4 not a real pdf").await.unwrap();

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.chat_server)
        .await;

    let enricher = Enricher;
    enricher.handle(&queue_message(&raw), &app.context).await.unwrap();

    let enriched_tx = app.context.kv_store.get_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(enriched_tx.status, TransactionStatus::Enriched);
    assert_eq!(enriched_tx.gl_code.as_deref(), Some("6100"));

    let post_message = sqlx::query!("SELECT payload FROM queue_messages WHERE queue_name = 'post-queue'")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    let enriched: invoice_agent::domain::Enriched = serde_json::from_value(post_message.payload).unwrap();

    let poster = Poster;
    poster
        .handle(
            &QueueMessage { id: 2, payload: serde_json::to_value(&enriched).unwrap(), dequeue_count: 1 },
            &app.context,
        )
        .await
        .unwrap();

    let posted_tx = app.context.kv_store.get_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(posted_tx.status, TransactionStatus::Posted);
    assert_eq!(posted_tx.emails_sent_count, 1);

    let notify_count = sqlx::query!("SELECT count(*) as count FROM queue_messages WHERE queue_name = 'notify-queue'")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(notify_count.count, Some(1));
}

#[tokio::test]
async fn unmatched_vendor_routes_back_to_sender_as_unknown() {
    let app = spawn_app().await;

    let tx_id = TxId::new();
    let raw = sample_raw_mail(tx_id, "billing@some-unregistered-vendor.com", None);
    seed_transaction_row(&app, &raw).await;
    app.context.blob_store.put(&raw.blob_ref, b"not a pdf").await.unwrap();

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.mail_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&app.chat_server)
        .await;

    let enricher = Enricher;
    enricher.handle(&queue_message(&raw), &app.context).await.unwrap();

    let tx = app.context.kv_store.get_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Unknown);
    assert_eq!(tx.gl_code.as_deref(), Some("0000"));
}

#[tokio::test]
async fn reseller_vendor_match_is_still_treated_as_unknown() {
    let app = spawn_app().await;

    let vendor = Vendor {
        normalized_key: NormalizedKey::normalize("bigreseller"),
        display_name: "Big Reseller".to_string(),
        expense_dept: "IT".to_string(),
        gl_code: GlCode::parse("6100".to_string()).unwrap(),
        allocation_schedule: "MONTHLY".to_string(),
        billing_party: "HQ".to_string(),
        product_category: Some(invoice_agent::domain::RESELLER_CATEGORY.to_string()),
        active: true,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
    };
    app.context.kv_store.upsert_vendor(&vendor).await.unwrap();

    let tx_id = TxId::new();
    let raw = sample_raw_mail(tx_id, "billing@bigreseller.com", None);
    seed_transaction_row(&app, &raw).await;
    app.context.blob_store.put(&raw.blob_ref, b"not a pdf").await.unwrap();

    let enricher = Enricher;
    enricher.handle(&queue_message(&raw), &app.context).await.unwrap();

    let tx = app.context.kv_store.get_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Unknown);
}

#[tokio::test]
async fn vendor_hint_overrides_sender_derived_lookup() {
    let app = spawn_app().await;

    let vendor = Vendor {
        normalized_key: NormalizedKey::normalize("true vendor"),
        display_name: "True Vendor".to_string(),
        expense_dept: "OPS".to_string(),
        gl_code: GlCode::parse("7000".to_string()).unwrap(),
        allocation_schedule: "QUARTERLY".to_string(),
        billing_party: "HQ".to_string(),
        product_category: None,
        active: true,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
    };
    app.context.kv_store.upsert_vendor(&vendor).await.unwrap();

    let tx_id = TxId::new();
    // sender domain would never resolve to "true vendor" on its own.
    let raw = sample_raw_mail(tx_id, "billing@some-reseller-portal.com", Some("True Vendor"));
    seed_transaction_row(&app, &raw).await;
    app.context.blob_store.put(&raw.blob_ref, b"not a pdf").await.unwrap();

    let enricher = Enricher;
    enricher.handle(&queue_message(&raw), &app.context).await.unwrap();

    let tx = app.context.kv_store.get_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Enriched);
    assert_eq!(tx.gl_code.as_deref(), Some("7000"));
}

#[tokio::test]
async fn resubmitted_original_message_id_is_skipped_as_duplicate() {
    let app = spawn_app().await;

    let sender_domain = "adobe.com";
    let original_message_id = Uuid::new_v4().to_string();

    let first = app.context.deduplicator.claim_and_start(&original_message_id, sender_domain).await.unwrap();
    let second = app.context.deduplicator.claim_and_start(&original_message_id, sender_domain).await.unwrap();

    use invoice_agent::dedup::ClaimOutcome;
    assert!(matches!(first, ClaimOutcome::Claimed { .. }));
    match (first, second) {
        (ClaimOutcome::Claimed { tx_id: first_id, .. }, ClaimOutcome::Skip { tx_id: second_id }) => {
            assert_eq!(first_id, second_id);
        }
        other => panic!("expected Claimed then Skip, got {other:?}"),
    }
}
