use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ApplicationContext;

/// A scheduled task with a single `run` method. Shared by `Poller` and
/// `SubscriptionManager` as a reusable sleep-based loop abstraction.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;
    async fn run(
        &self,
        context: &ApplicationContext,
    ) -> Result<(), anyhow::Error>;
}

#[tracing::instrument(skip_all, fields(task = task.name()))]
pub async fn run_scheduled_task(
    task: Arc<dyn ScheduledTask>,
    context: Arc<ApplicationContext>,
) -> Result<(), anyhow::Error> {
    loop {
        if let Err(e) = task.run(&context).await {
            tracing::error!(error = ?e, task = task.name(), "scheduled task failed");
        }
        tokio::time::sleep(task.interval()).await;
    }
}
