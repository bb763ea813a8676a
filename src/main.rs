use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use invoice_agent::configuration::get_configuration;
use invoice_agent::context::ApplicationContext;
use invoice_agent::pipeline::Enricher;
use invoice_agent::pipeline::Notifier;
use invoice_agent::pipeline::Poller;
use invoice_agent::pipeline::Poster;
use invoice_agent::pipeline::SubscriptionManager;
use invoice_agent::pipeline::WebhookProcessor;
use invoice_agent::scheduler::run_scheduled_task;
use invoice_agent::startup::get_connection_pool;
use invoice_agent::startup::Application;
use invoice_agent::telemetry::get_subscriber;
use invoice_agent::telemetry::init_subscriber;
use invoice_agent::worker::run_worker;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => tracing::info!("{name} exited gracefully"),
        Ok(Err(e)) => tracing::error!(error.cause_chain = ?e, error.message = %e, "{name} failed (inner)"),
        Err(e) => tracing::error!(error.cause_chain = ?e, error.message = %e, "{name} failed (outer)"),
    }
}

/// Initialise telemetry, load config, build the singleton `ApplicationContext`,
/// and run the HTTP server alongside every queue worker and scheduled task
///.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cfg = get_configuration()?;

    let subscriber = get_subscriber("invoice-agent", &cfg.log_level, std::io::stdout);
    init_subscriber(subscriber);

    let pool = get_connection_pool(&cfg.database);
    let context = Arc::new(ApplicationContext::build(cfg.clone(), pool));

    let application = Application::build(&cfg, context.clone()).await?;
    let server = application.run_until_stopped();

    let webhook_processor = run_worker(Arc::new(WebhookProcessor), context.clone());
    let enricher = run_worker(Arc::new(Enricher), context.clone());
    let poster = run_worker(Arc::new(Poster), context.clone());
    let notifier = run_worker(Arc::new(Notifier), context.clone());

    let subscription_manager = run_scheduled_task(
        Arc::new(SubscriptionManager::new(Duration::from_secs(cfg.subscription.ttl_days.max(1) as u64 * 24 * 60 * 60))),
        context.clone(),
    );

    let server_thread = tokio::spawn(server);
    let webhook_processor_thread = tokio::spawn(webhook_processor);
    let enricher_thread = tokio::spawn(enricher);
    let poster_thread = tokio::spawn(poster);
    let notifier_thread = tokio::spawn(notifier);
    let subscription_manager_thread = tokio::spawn(subscription_manager);

    let poller_thread = if cfg.poller.enabled {
        let poller = run_scheduled_task(
            Arc::new(Poller::new(Duration::from_secs(cfg.poller.interval_minutes * 60))),
            context.clone(),
        );
        Some(tokio::spawn(poller))
    } else {
        tracing::info!("poller disabled, relying solely on push webhooks");
        None
    };

    tokio::select! {
        o = server_thread => { report_exit("HTTP server", o) },
        o = webhook_processor_thread => { report_exit("WebhookProcessor worker", o) },
        o = enricher_thread => { report_exit("Enricher worker", o) },
        o = poster_thread => { report_exit("Poster worker", o) },
        o = notifier_thread => { report_exit("Notifier worker", o) },
        o = subscription_manager_thread => { report_exit("SubscriptionManager scheduler", o) },
    }

    if let Some(poller_thread) = poller_thread {
        poller_thread.abort();
    }

    Ok(())
}
