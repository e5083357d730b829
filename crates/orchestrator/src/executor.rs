use crate::poller::{ChildJobPoller, PollingTask};
use crate::registry::{JobTypeRegistry, StepAction, StepContext};
use chrono::Utc;
use futures::FutureExt;
use ingest::services::{CrawlerService, SourceService};
use ingest::EventBus;
use serde_json::json;
use shared::{
    AppError, Event, EventType, JobDefinition, JobStatus, JobStep, OnError, RetryPolicy,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLLING_TIMEOUT_SECS: i64 = 1800;

/// Outcome of one definition invocation. When `async_polling_active` is set
/// the caller must wait for the status callback before treating the job as
/// terminal: crawl children are still being polled in the background.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub async_polling_active: bool,
}

pub type StatusCallback = Arc<dyn Fn(JobStatus, Option<String>) + Send + Sync>;

/// Runs the steps of a [`JobDefinition`] in declaration order, applying each
/// step's error strategy, and launches background polling for crawl steps
/// that wait on their children.
pub struct JobExecutor {
    registry: Arc<JobTypeRegistry>,
    events: Arc<EventBus>,
    sources: Arc<dyn SourceService>,
    crawler: Arc<dyn CrawlerService>,
    lifecycle: CancellationToken,
    poll_interval: Duration,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<JobTypeRegistry>,
        events: Arc<EventBus>,
        sources: Arc<dyn SourceService>,
        crawler: Arc<dyn CrawlerService>,
    ) -> Self {
        Self {
            registry,
            events,
            sources,
            crawler,
            lifecycle: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cancel every polling task spawned by this executor.
    pub fn shutdown(&self) {
        self.lifecycle.cancel();
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        def: &JobDefinition,
        status_callback: Option<StatusCallback>,
    ) -> shared::Result<ExecutionResult> {
        def.validate()?;
        info!(job_id = %def.id, job_name = %def.name, steps = def.steps.len(), "executing job definition");

        // Source resolution is serial and fatal for the whole invocation.
        let mut sources = Vec::with_capacity(def.source_ids.len());
        for source_id in &def.source_ids {
            let source = self.sources.get_source(source_id).await.map_err(|e| {
                AppError::Validation(format!("failed to resolve source '{}': {}", source_id, e))
            })?;
            sources.push(source);
        }

        let mut step_errors: Vec<String> = Vec::new();
        let mut async_polling = false;

        for (index, step) in def.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                self.publish_step(def, index, step, JobStatus::Failed, Some("cancelled"))
                    .await;
                return Err(AppError::Cancelled);
            }

            self.publish_step(def, index, step, JobStatus::Running, None)
                .await;

            let mut ctx = StepContext::new(
                cancel.clone(),
                &def.id,
                &def.name,
                def.kind,
                step.clone(),
                sources.clone(),
            );

            let result = match self.registry.get_action(def.kind, &step.action) {
                Ok(action) => self.run_with_strategy(&mut ctx, action.as_ref()).await,
                // A registry miss is a step error routed through the strategy.
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    let wait = ctx.step.bool_option("wait_for_completion", true);
                    if step.action == "crawl" && wait && !ctx.crawl_job_ids.is_empty() {
                        self.spawn_polling(def, index, &ctx, status_callback.clone());
                        async_polling = true;
                    } else {
                        self.publish_step(def, index, step, JobStatus::Completed, None)
                            .await;
                    }
                }
                Err(AppError::Cancelled) => {
                    self.publish_step(def, index, step, JobStatus::Failed, Some("cancelled"))
                        .await;
                    return Err(AppError::Cancelled);
                }
                Err(e) => match step.on_error {
                    OnError::Continue => {
                        warn!(job_id = %def.id, step = index, error = %e, "step failed, continuing");
                        self.publish_step(def, index, step, JobStatus::Failed, Some(&e.to_string()))
                            .await;
                        step_errors.push(format!("step {} ({}): {}", index, step.name, e));
                    }
                    _ => {
                        error!(job_id = %def.id, step = index, error = %e, "step failed");
                        self.publish_step(def, index, step, JobStatus::Failed, Some(&e.to_string()))
                            .await;
                        return Err(AppError::StepFailed {
                            index,
                            name: step.name.clone(),
                            message: e.to_string(),
                        });
                    }
                },
            }
        }

        if !step_errors.is_empty() {
            let message = format!(
                "{} step(s) failed: {}",
                step_errors.len(),
                step_errors.join("; ")
            );
            self.publish_job(def, JobStatus::Failed, Some(&message)).await;
            return Err(AppError::Internal(message));
        }

        if !async_polling {
            self.publish_job(def, JobStatus::Completed, None).await;
            info!(job_id = %def.id, "job completed");
        }
        Ok(ExecutionResult {
            async_polling_active: async_polling,
        })
    }

    /// Run one step under its error strategy. Retry uses exponential backoff
    /// with the shape configured on the step; backoff sleeps are
    /// interruptible by cancellation.
    async fn run_with_strategy(
        &self,
        ctx: &mut StepContext,
        action: &dyn StepAction,
    ) -> shared::Result<()> {
        if ctx.step.on_error != OnError::Retry {
            return action.execute(ctx).await;
        }

        let policy = RetryPolicy::from_step(&ctx.step);
        let mut last_error: Option<AppError> = None;
        for attempt in 1..=policy.max_retries {
            match action.execute(ctx).await {
                Ok(()) => return Ok(()),
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        error = %e,
                        "step attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < policy.max_retries {
                        let delay = policy.backoff(attempt - 1);
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(AppError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| AppError::Internal("retry loop finished without error".to_string())))
    }

    fn spawn_polling(
        &self,
        def: &JobDefinition,
        step_index: usize,
        ctx: &StepContext,
        status_callback: Option<StatusCallback>,
    ) {
        let timeout = Duration::from_secs(
            ctx.step
                .int_option("polling_timeout_seconds", DEFAULT_POLLING_TIMEOUT_SECS)
                .max(1) as u64,
        );
        let task = PollingTask {
            definition_id: def.id.clone(),
            definition_name: def.name.clone(),
            kind: def.kind,
            step_index,
            step_name: ctx.step.name.clone(),
            step_action: ctx.step.action.clone(),
            total_steps: def.steps.len(),
            on_error: ctx.step.on_error,
            job_ids: ctx.crawl_job_ids.clone(),
            timeout,
            status_callback,
        };
        let poller = ChildJobPoller::new(
            Arc::clone(&self.crawler),
            Arc::clone(&self.events),
            self.poll_interval,
        );
        // Polling lives on a token derived from the executor lifecycle so
        // shutdown() stops it, independent of the invocation's own token.
        let poll_cancel = self.lifecycle.child_token();
        info!(
            job_id = %def.id,
            step = step_index,
            children = task.job_ids.len(),
            "crawl polling started"
        );
        tokio::spawn(async move {
            if AssertUnwindSafe(poller.run(poll_cancel, task))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("crawl polling task panicked");
            }
        });
    }

    async fn publish_step(
        &self,
        def: &JobDefinition,
        index: usize,
        step: &JobStep,
        status: JobStatus,
        error: Option<&str>,
    ) {
        let mut event = Event::new(EventType::JobProgress)
            .with("job_id", json!(def.id))
            .with("job_name", json!(def.name))
            .with("job_type", json!(def.kind.as_str()))
            .with("step_index", json!(index))
            .with("step_name", json!(step.name))
            .with("step_action", json!(step.action))
            .with("total_steps", json!(def.steps.len()))
            .with("status", json!(status.as_str()))
            .with("timestamp", json!(Utc::now().to_rfc3339()));
        if let Some(message) = error {
            event = event.with("error", json!(message));
        }
        if let Err(e) = self.events.publish_sync(event).await {
            warn!(job_id = %def.id, error = %e, "failed to publish step progress");
        }
    }

    async fn publish_job(&self, def: &JobDefinition, status: JobStatus, error: Option<&str>) {
        let mut event = Event::new(EventType::JobProgress)
            .with("job_id", json!(def.id))
            .with("job_name", json!(def.name))
            .with("job_type", json!(def.kind.as_str()))
            .with("total_steps", json!(def.steps.len()))
            .with("status", json!(status.as_str()))
            .with("timestamp", json!(Utc::now().to_rfc3339()));
        if let Some(message) = error {
            event = event.with("error", json!(message));
        }
        if let Err(e) = self.events.publish_sync(event).await {
            warn!(job_id = %def.id, error = %e, "failed to publish job progress");
        }
    }
}
