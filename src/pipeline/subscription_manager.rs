use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::ExposeSecret;
use secrecy::Secret;
use uuid::Uuid;

use crate::configuration::PROVIDER_MAX_SUBSCRIPTION_DAYS;
use crate::context::ApplicationContext;
use crate::domain::Subscription;
use crate::infra::InsertOutcome;
use crate::infra::SubscriptionPatch;
use crate::scheduler::ScheduledTask;

const RENEWAL_WINDOW_HOURS: i64 = 48;

enum SubscriptionState {
    None,
    Expiring(Subscription),
    Healthy,
}

fn classify(
    subscription: Option<Subscription>,
    now: chrono::DateTime<Utc>,
) -> SubscriptionState {
    match subscription {
        None => SubscriptionState::None,
        Some(sub) if sub.expiration_at - now < chrono::Duration::hours(RENEWAL_WINDOW_HOURS) => {
            SubscriptionState::Expiring(sub)
        }
        Some(_) => SubscriptionState::Healthy,
    }
}

fn generate_client_state() -> Secret<String> {
    let token: String = rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect();
    Secret::new(token)
}

fn provider_ttl() -> Duration {
    Duration::from_secs((PROVIDER_MAX_SUBSCRIPTION_DAYS - 1).max(1) as u64 * 24 * 60 * 60)
}

/// Scheduled task keeping the mail provider's push subscription alive
///. Runs on the `subscription.ttl_days` cadence, independent
/// of how close any individual row is to expiring — the state machine below
/// decides whether that run is a no-op.
pub struct SubscriptionManager {
    interval: Duration,
}

impl SubscriptionManager {
    pub fn new(interval: Duration) -> Self { Self { interval } }
}

#[async_trait]
impl ScheduledTask for SubscriptionManager {
    fn name(&self) -> &str { "subscription_manager" }

    fn interval(&self) -> Duration { self.interval }

    async fn run(
        &self,
        context: &ApplicationContext,
    ) -> Result<(), anyhow::Error> {
        let current = context.kv_store.get_active_subscription().await?;
        let now = Utc::now();

        match classify(current, now) {
            SubscriptionState::Healthy => Ok(()),
            SubscriptionState::Expiring(sub) => renew(context, sub).await,
            SubscriptionState::None => create_fresh(context).await,
        }
    }
}

async fn create_fresh(context: &ApplicationContext) -> Result<(), anyhow::Error> {
    let client_state = generate_client_state();
    let notif_url = &context.settings.application.webhook_public_url;

    let provider_sub_id = context
        .mail_client
        .subscribe(&context.settings.monitored_mailbox, notif_url, client_state.expose_secret(), provider_ttl())
        .await?;

    let subscription = Subscription {
        provider_sub_id,
        resource: context.settings.monitored_mailbox.clone(),
        expiration_at: now_plus(provider_ttl()),
        client_state,
        is_active: true,
        created_at: Utc::now(),
        last_renewed_at: None,
        etag: Uuid::new_v4(),
    };

    match context.kv_store.insert_subscription_if_absent(&subscription).await? {
        InsertOutcome::Inserted(()) => {
            tracing::info!(provider_sub_id = %subscription.provider_sub_id, "created fresh mail subscription");
            Ok(())
        }
        InsertOutcome::AlreadyExists => {
            // Another scheduler tick (or replica) won the race; leave the
            // provider-side subscription orphaned rather than contend.
            tracing::warn!(provider_sub_id = %subscription.provider_sub_id, "subscription row already present, discarding new provider subscription");
            Ok(())
        }
    }
}

async fn renew(
    context: &ApplicationContext,
    sub: Subscription,
) -> Result<(), anyhow::Error> {
    match context.mail_client.renew(&sub.provider_sub_id, provider_ttl()).await {
        Ok(()) => {
            let new_expiration = now_plus(provider_ttl());
            context
                .kv_store
                .update_subscription_if_match(
                    &sub.provider_sub_id,
                    sub.etag,
                    SubscriptionPatch {
                        expiration_at: Some(new_expiration),
                        last_renewed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(provider_sub_id = %sub.provider_sub_id, "renewed mail subscription");
            Ok(())
        }
        Err(e) if sub.expiration_at <= Utc::now() => {
            // The row already expired server-side; renewal is no longer
            // meaningful, so retire it and let the next tick create a
            // replacement.
            tracing::warn!(error = %e, provider_sub_id = %sub.provider_sub_id, "renewal failed on an already-expired subscription, retiring row");
            context
                .kv_store
                .update_subscription_if_match(
                    &sub.provider_sub_id,
                    sub.etag,
                    SubscriptionPatch { is_active: Some(false), ..Default::default() },
                )
                .await?;
            create_fresh(context).await
        }
        Err(e) => {
            tracing::warn!(error = %e, provider_sub_id = %sub.provider_sub_id, "renewal failed, will retry next schedule");
            Err(e.into())
        }
    }
}

fn now_plus(ttl: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(PROVIDER_MAX_SUBSCRIPTION_DAYS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_subscription(expiration_at: chrono::DateTime<Utc>) -> Subscription {
        Subscription {
            provider_sub_id: "sub-1".to_string(),
            resource: "invoices@example.com".to_string(),
            expiration_at,
            client_state: Secret::new("secret".to_string()),
            is_active: true,
            created_at: Utc::now(),
            last_renewed_at: None,
            etag: Uuid::new_v4(),
        }
    }

    #[test]
    fn no_row_classifies_as_none() {
        assert!(matches!(classify(None, Utc::now()), SubscriptionState::None));
    }

    #[test]
    fn far_out_expiration_is_healthy() {
        let sub = sample_subscription(Utc::now() + chrono::Duration::days(5));
        assert!(matches!(classify(Some(sub), Utc::now()), SubscriptionState::Healthy));
    }

    #[test]
    fn near_expiration_is_expiring() {
        let sub = sample_subscription(Utc::now() + chrono::Duration::hours(10));
        assert!(matches!(classify(Some(sub), Utc::now()), SubscriptionState::Expiring(_)));
    }
}
