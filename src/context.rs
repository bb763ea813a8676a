use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::configuration::Settings;
use crate::dedup::Deduplicator;
use crate::infra::BlobStore;
use crate::infra::HttpNotificationSink;
use crate::infra::KvStore;
use crate::infra::NotificationSink;
use crate::infra::QueueBus;
use crate::mail_client::HttpMailClient;
use crate::mail_client::MailClient;
use crate::rate_limiter::RateLimiter;
use crate::resilience::CircuitBreaker;
use crate::resilience::RetryPolicy;
use crate::vendor_extractor::HeuristicVendorExtractor;
use crate::vendor_extractor::VendorExtractor;

/// Explicit, constructed-once singleton: holds every shared handle the pipeline needs, built once in
/// `main.rs`/`startup.rs` and passed to every handler and worker. No global
/// mutable state lives outside of this struct.
pub struct ApplicationContext {
    pub settings: Settings,
    pub pool: PgPool,
    pub queue_bus: Arc<QueueBus>,
    pub blob_store: Arc<BlobStore>,
    pub kv_store: Arc<KvStore>,
    pub mail_client: Arc<dyn MailClient>,
    pub vendor_extractor: Arc<dyn VendorExtractor>,
    pub deduplicator: Arc<Deduplicator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub notification_sink: Arc<dyn NotificationSink>,
}

impl ApplicationContext {
    pub fn build(
        settings: Settings,
        pool: PgPool,
    ) -> Self {
        let kv_breaker = Arc::new(CircuitBreaker::new(
            "kv_store",
            settings.breakers.kv_store.fail_max,
            Duration::from_secs(settings.breakers.kv_store.reset_seconds),
        ));
        let mail_breaker = Arc::new(CircuitBreaker::new(
            "mail_provider",
            settings.breakers.mail.fail_max,
            Duration::from_secs(settings.breakers.mail.reset_seconds),
        ));
        let extractor_breaker = Arc::new(CircuitBreaker::new(
            "vendor_extractor",
            settings.breakers.extractor.fail_max,
            Duration::from_secs(settings.breakers.extractor.reset_seconds),
        ));

        let retry = RetryPolicy::new(
            settings.retry.max_attempts,
            Duration::from_millis(settings.retry.base_delay_ms),
            Duration::from_millis(settings.retry.max_delay_ms),
        );

        let kv_store = Arc::new(KvStore::new(pool.clone(), kv_breaker.clone()));

        let queue_bus = Arc::new(QueueBus::new(
            pool.clone(),
            Duration::from_secs(settings.queues.visibility_timeout_minutes as u64 * 60),
            settings.queues.max_dequeue,
        ));

        let blob_store = Arc::new(BlobStore::new(
            pool.clone(),
            kv_breaker,
            settings.application.base_url.clone(),
            settings.blob_store.signing_key.clone(),
        ));

        let mail_client: Arc<dyn MailClient> = Arc::new(HttpMailClient::new(
            settings.mail_client.base_url.clone(),
            settings.mail_client.sender.clone(),
            settings.mail_client.auth_token.clone(),
            Duration::from_millis(settings.mail_client.timeout_ms),
            mail_breaker,
            retry,
        ));

        let vendor_extractor: Arc<dyn VendorExtractor> = Arc::new(HeuristicVendorExtractor::new(
            settings.extractor.base_url.clone(),
            settings.extractor.auth_token.clone(),
            settings.extractor.enabled,
            settings.extractor.max_pdf_bytes,
            settings.extractor.force_llm_on_empty_text,
            Duration::from_millis(settings.extractor.timeout_ms),
            extractor_breaker,
            retry,
        ));

        let deduplicator = Arc::new(Deduplicator::new(
            kv_store.clone(),
            Duration::from_secs(settings.dedup.stale_claim_window_minutes as u64 * 60),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(kv_store.clone(), settings.rate_limit.requests_per_minute));

        let notification_sink: Arc<dyn NotificationSink> = Arc::new(HttpNotificationSink::new(
            settings.notification_sink.webhook_url.clone(),
            Duration::from_millis(settings.notification_sink.timeout_ms),
        ));

        Self {
            settings,
            pool,
            queue_bus,
            blob_store,
            kv_store,
            mail_client,
            vendor_extractor,
            deduplicator,
            rate_limiter,
            notification_sink,
        }
    }
}
