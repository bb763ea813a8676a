use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CoreError;
use crate::resilience::CircuitBreaker;
use crate::resilience::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentMeta {
    pub attachment_id: String,
    pub content_type: String,
    pub is_pdf: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Email {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentMeta>,
}

pub struct OutboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The set of operations the core consumes from the mail provider, expressed
/// as a trait so `pipeline/*` can be tested against a fake.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn list_unread(
        &self,
        mailbox: &str,
        limit: u32,
    ) -> Result<Vec<Email>, CoreError>;

    async fn get_email(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Email, CoreError>;

    async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, CoreError>;

    async fn send_mail(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        attachment: Option<OutboundAttachment>,
    ) -> Result<(), CoreError>;

    async fn subscribe(
        &self,
        resource: &str,
        notif_url: &str,
        client_state: &str,
        ttl: Duration,
    ) -> Result<String, CoreError>;

    async fn renew(
        &self,
        subscription_id: &str,
        ttl: Duration,
    ) -> Result<(), CoreError>;

    async fn delete(
        &self,
        subscription_id: &str,
    ) -> Result<(), CoreError>;

    async fn mark_read(
        &self,
        message_id: &str,
    ) -> Result<(), CoreError>;
}

/// `reqwest`-backed implementation. Every operation is wrapped
/// by the mail-provider `CircuitBreaker` and `RetryPolicy`, retry as the
/// outer layer and the breaker the inner. Authentication is an
/// externally-injected token: the client does not know how it
/// was minted.
pub struct HttpMailClient {
    http_client: Client,
    base_url: String,
    sender: String,
    auth_token: Secret<String>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl HttpMailClient {
    pub fn new(
        base_url: String,
        sender: String,
        auth_token: Secret<String>,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        let http_client = Client::builder().timeout(timeout).build().expect("failed to build reqwest client");
        Self { http_client, base_url, sender, auth_token, breaker, retry }
    }

    async fn guarded<F, Fut, T>(
        &self,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.breaker.call(move || self.retry.run(op)).await
    }

    fn bearer(&self) -> String { format!("Bearer {}", self.auth_token.expose_secret()) }

    fn classify(response: reqwest::Response) -> ResponseClass {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        ResponseClass { status, retry_after }
    }
}

struct ResponseClass {
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
}

impl ResponseClass {
    fn into_error(self) -> CoreError {
        if self.status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            CoreError::RateLimited { retry_after_secs: self.retry_after }
        } else if self.status.is_server_error() {
            CoreError::Transient(anyhow::anyhow!("mail provider returned {}", self.status))
        } else {
            CoreError::Permanent(format!("mail provider returned {}", self.status))
        }
    }
}

#[async_trait]
impl MailClient for HttpMailClient {
    #[tracing::instrument(skip(self), fields(%mailbox, limit))]
    async fn list_unread(
        &self,
        mailbox: &str,
        limit: u32,
    ) -> Result<Vec<Email>, CoreError> {
        self.guarded(|| async {
            let response = self
                .http_client
                .get(format!("{}/mailboxes/{mailbox}/messages", self.base_url))
                .query(&[("unread", "true"), ("limit", &limit.to_string())])
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            response.json::<Vec<Email>>().await.map_err(|e| CoreError::Transient(e.into()))
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(%mailbox, %message_id))]
    async fn get_email(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Email, CoreError> {
        self.guarded(|| async {
            let response = self
                .http_client
                .get(format!("{}/mailboxes/{mailbox}/messages/{message_id}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(CoreError::NotFound(message_id.to_string()));
            }
            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            response.json::<Email>().await.map_err(|e| CoreError::Transient(e.into()))
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(%message_id, %attachment_id))]
    async fn download_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, CoreError> {
        self.guarded(|| async {
            let response = self
                .http_client
                .get(format!("{}/messages/{message_id}/attachments/{attachment_id}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            response.bytes().await.map(|b| b.to_vec()).map_err(|e| CoreError::Transient(e.into()))
        })
        .await
    }

    #[tracing::instrument(skip(self, body, attachment), fields(%from, %to, %subject))]
    async fn send_mail(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        attachment: Option<OutboundAttachment>,
    ) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct SendRequest<'a> {
            from: &'a str,
            to: &'a str,
            subject: &'a str,
            body: &'a str,
            attachment_filename: Option<&'a str>,
            attachment_content_type: Option<&'a str>,
            attachment_base64: Option<String>,
        }

        use base64::Engine;
        let attachment_base64 = attachment.as_ref().map(|a| base64::engine::general_purpose::STANDARD.encode(&a.bytes));
        let payload = SendRequest {
            from,
            to,
            subject,
            body,
            attachment_filename: attachment.as_ref().map(|a| a.filename.as_str()),
            attachment_content_type: attachment.as_ref().map(|a| a.content_type.as_str()),
            attachment_base64,
        };

        self.guarded(|| async {
            let response = self
                .http_client
                .post(format!("{}/mail/send", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .json(&payload)
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self, client_state), fields(%resource, %notif_url))]
    async fn subscribe(
        &self,
        resource: &str,
        notif_url: &str,
        client_state: &str,
        ttl: Duration,
    ) -> Result<String, CoreError> {
        #[derive(Serialize)]
        struct SubscribeRequest<'a> {
            resource: &'a str,
            notification_url: &'a str,
            client_state: &'a str,
            expiration_seconds: u64,
        }
        #[derive(Deserialize)]
        struct SubscribeResponse {
            subscription_id: String,
        }

        let payload =
            SubscribeRequest { resource, notification_url: notif_url, client_state, expiration_seconds: ttl.as_secs() };

        self.guarded(|| async {
            let response = self
                .http_client
                .post(format!("{}/subscriptions", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .json(&payload)
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            response
                .json::<SubscribeResponse>()
                .await
                .map(|r| r.subscription_id)
                .map_err(|e| CoreError::Transient(e.into()))
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(%subscription_id))]
    async fn renew(
        &self,
        subscription_id: &str,
        ttl: Duration,
    ) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct RenewRequest {
            expiration_seconds: u64,
        }
        let payload = RenewRequest { expiration_seconds: ttl.as_secs() };

        self.guarded(|| async {
            let response = self
                .http_client
                .patch(format!("{}/subscriptions/{subscription_id}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .json(&payload)
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(%subscription_id))]
    async fn delete(
        &self,
        subscription_id: &str,
    ) -> Result<(), CoreError> {
        self.guarded(|| async {
            let response = self
                .http_client
                .delete(format!("{}/subscriptions/{subscription_id}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
                return Err(Self::classify(response).into_error());
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(%message_id))]
    async fn mark_read(
        &self,
        message_id: &str,
    ) -> Result<(), CoreError> {
        self.guarded(|| async {
            let response = self
                .http_client
                .patch(format!("{}/messages/{message_id}", self.base_url))
                .header(reqwest::header::AUTHORIZATION, self.bearer())
                .json(&serde_json::json!({ "read": true }))
                .send()
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

            if !response.status().is_success() {
                return Err(Self::classify(response).into_error());
            }
            Ok(())
        })
        .await
    }
}

impl HttpMailClient {
    pub fn sender(&self) -> &str { &self.sender }
}
