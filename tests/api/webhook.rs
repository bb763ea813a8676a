use serde_json::json;
use uuid::Uuid;

use invoice_agent::domain::Subscription;
use secrecy::Secret;

use crate::helpers::spawn_app;

async fn seed_active_subscription(
    app: &crate::helpers::TestApp,
    client_state: &str,
) {
    let subscription = Subscription {
        provider_sub_id: Uuid::new_v4().to_string(),
        resource: "invoices@example.com".to_string(),
        expiration_at: chrono::Utc::now() + chrono::Duration::days(5),
        client_state: Secret::new(client_state.to_string()),
        is_active: true,
        created_at: chrono::Utc::now(),
        last_renewed_at: None,
        etag: Uuid::new_v4(),
    };
    app.context.kv_store.insert_subscription_if_absent(&subscription).await.unwrap();
}

#[tokio::test]
async fn validation_handshake_echoes_the_token() {
    let app = spawn_app().await;

    let response = app.get_validation_handshake("abc123").await;

    assert!(response.status().is_success());
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "abc123");
}

#[tokio::test]
async fn notification_with_matching_client_state_is_queued() {
    let app = spawn_app().await;
    seed_active_subscription(&app, "secret-state").await;

    let body = json!({
        "value": [{
            "subscriptionId": "sub-1",
            "clientState": "secret-state",
            "changeType": "created",
            "resource": "Users/invoices@example.com/Messages/AAA",
        }]
    });

    let response = app.post_webhook(body).await;
    assert_eq!(response.status().as_u16(), 202);

    let queued = sqlx::query!("SELECT count(*) as count FROM queue_messages WHERE queue_name = 'notif-queue'")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(queued.count, Some(1));
}

#[tokio::test]
async fn notification_with_mismatched_client_state_is_dropped() {
    let app = spawn_app().await;
    seed_active_subscription(&app, "secret-state").await;

    let body = json!({
        "value": [{
            "subscriptionId": "sub-1",
            "clientState": "wrong-state",
            "changeType": "created",
            "resource": "Users/invoices@example.com/Messages/AAA",
        }]
    });

    let response = app.post_webhook(body).await;
    assert_eq!(response.status().as_u16(), 202);

    let queued = sqlx::query!("SELECT count(*) as count FROM queue_messages WHERE queue_name = 'notif-queue'")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(queued.count, Some(0));
}

#[tokio::test]
async fn notification_with_no_active_subscription_is_dropped() {
    let app = spawn_app().await;

    let body = json!({
        "value": [{
            "subscriptionId": "sub-1",
            "clientState": "whatever",
            "changeType": "created",
            "resource": "Users/invoices@example.com/Messages/AAA",
        }]
    });

    let response = app.post_webhook(body).await;
    assert_eq!(response.status().as_u16(), 202);

    let queued = sqlx::query!("SELECT count(*) as count FROM queue_messages WHERE queue_name = 'notif-queue'")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(queued.count, Some(0));
}
