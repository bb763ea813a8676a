use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::context::ApplicationContext;
use crate::domain::WebhookNotice;
use crate::domain::CURRENT_SCHEMA_VERSION;

#[derive(Debug, Deserialize)]
pub struct ValidationQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationEnvelope {
    pub value: Vec<RawNotification>,
}

#[derive(Debug, Deserialize)]
pub struct RawNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "clientState")]
    pub client_state: String,
    #[serde(rename = "changeType")]
    pub change_type: String,
    pub resource: String,
}

/// `POST /{webhook-path}`. Two request shapes share one
/// handler because the provider addresses both at the same URL: a
/// `validationToken` query parameter means "handshake", anything else means
/// "notification delivery".
#[tracing::instrument(skip_all)]
pub async fn receive_webhook(
    query: web::Query<ValidationQuery>,
    body: web::Bytes,
    req: HttpRequest,
    context: web::Data<ApplicationContext>,
) -> HttpResponse {
    if let Some(token) = &query.validation_token {
        return HttpResponse::Ok().content_type("text/plain").body(token.clone());
    }

    let caller_ip = req.peer_addr().map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string());
    match context.rate_limiter.check(&caller_ip).await {
        Ok(true) => {}
        Ok(false) => return HttpResponse::TooManyRequests().finish(),
        Err(e) => tracing::warn!(error = %e, caller_ip, "rate limiter check failed, admitting request"),
    }

    let envelope: NotificationEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "malformed webhook notification body, ignoring");
            return HttpResponse::Accepted().finish();
        }
    };

    let active_subscription = match context.kv_store.get_active_subscription().await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!(error = %e, "failed to load active subscription, dropping all notices");
            return HttpResponse::Accepted().finish();
        }
    };

    for notice in envelope.value {
        let Some(active) = &active_subscription else {
            tracing::warn!(subscription_id = %notice.subscription_id, "no active subscription on record, dropping notice");
            continue;
        };
        if notice.client_state.as_bytes() != active.client_state.expose_secret().as_bytes() {
            tracing::warn!(subscription_id = %notice.subscription_id, "clientState mismatch, dropping notice");
            continue;
        }

        let webhook_notice = WebhookNotice {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            subscription_id: notice.subscription_id,
            client_state: notice.client_state,
            change_type: notice.change_type,
            resource: notice.resource,
        };
        if let Err(e) = context.queue_bus.enqueue("notif-queue", &webhook_notice).await {
            tracing::error!(error = %e, "failed to enqueue webhook notice");
        }
    }

    HttpResponse::Accepted().finish()
}
