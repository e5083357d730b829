//! Background polling of crawl child jobs launched by the executor.

use crate::executor::StatusCallback;
use chrono::Utc;
use ingest::services::CrawlerService;
use ingest::EventBus;
use serde_json::json;
use shared::{CrawlJob, Event, EventType, JobKind, JobStatus, OnError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A child is declared locally failed after this many consecutive status
/// fetch failures; one successful read resets the counter.
const FAILURE_THRESHOLD: u32 = 5;

pub struct PollingTask {
    pub definition_id: String,
    pub definition_name: String,
    pub kind: JobKind,
    pub step_index: usize,
    pub step_name: String,
    pub step_action: String,
    pub total_steps: usize,
    pub on_error: OnError,
    pub job_ids: Vec<String>,
    pub timeout: Duration,
    pub status_callback: Option<StatusCallback>,
}

struct ChildState {
    id: String,
    last_status: Option<JobStatus>,
    consecutive_failures: u32,
    terminal: bool,
    failure: Option<String>,
}

pub struct ChildJobPoller {
    crawler: Arc<dyn CrawlerService>,
    events: Arc<EventBus>,
    interval: Duration,
}

impl ChildJobPoller {
    pub fn new(crawler: Arc<dyn CrawlerService>, events: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            crawler,
            events,
            interval,
        }
    }

    /// Poll every child until all are terminal, the timeout elapses, or the
    /// lifecycle token is cancelled. Publishes the step's terminal event,
    /// the final job event and invokes the status callback.
    pub async fn run(&self, cancel: CancellationToken, task: PollingTask) {
        let deadline = tokio::time::Instant::now() + task.timeout;
        let mut children: Vec<ChildState> = task
            .job_ids
            .iter()
            .map(|id| ChildState {
                id: id.clone(),
                last_status: None,
                consecutive_failures: 0,
                terminal: false,
                failure: None,
            })
            .collect();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while children.iter().any(|c| !c.terminal) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(job_id = %task.definition_id, "crawl polling cancelled by shutdown");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id = %task.definition_id, "crawl polling timed out");
                    for child in children.iter_mut().filter(|c| !c.terminal) {
                        child.terminal = true;
                        child.failure = Some(format!(
                            "polling timed out after {}s",
                            task.timeout.as_secs()
                        ));
                    }
                }
                _ = ticker.tick() => {
                    for child in children.iter_mut().filter(|c| !c.terminal) {
                        match self.crawler.get_job_status(&child.id).await {
                            Ok(job) => {
                                child.consecutive_failures = 0;
                                if child.last_status != Some(job.status) {
                                    info!(
                                        crawl_job_id = %child.id,
                                        status = %job.status,
                                        "crawl job status changed"
                                    );
                                    child.last_status = Some(job.status);
                                }
                                self.publish_crawl_progress(&task, &job).await;
                                match job.status {
                                    JobStatus::Completed => child.terminal = true,
                                    JobStatus::Failed => {
                                        child.terminal = true;
                                        child.failure = Some(
                                            job.error.unwrap_or_else(|| "failed".to_string()),
                                        );
                                    }
                                    JobStatus::Cancelled => {
                                        child.terminal = true;
                                        child.failure = Some("job was cancelled".to_string());
                                    }
                                    // Pending and running stay in the polling set.
                                    JobStatus::Pending | JobStatus::Running => {}
                                }
                            }
                            Err(e) => {
                                child.consecutive_failures += 1;
                                warn!(
                                    crawl_job_id = %child.id,
                                    failures = child.consecutive_failures,
                                    error = %e,
                                    "crawl status poll failed"
                                );
                                if child.consecutive_failures >= FAILURE_THRESHOLD {
                                    child.terminal = true;
                                    child.failure =
                                        Some("exceeded failure threshold".to_string());
                                }
                            }
                        }
                    }
                }
            }
        }

        let failures: Vec<String> = children
            .iter()
            .filter_map(|c| c.failure.as_ref().map(|f| format!("{}: {}", c.id, f)))
            .collect();

        if failures.is_empty() || task.on_error == OnError::Continue {
            if !failures.is_empty() {
                warn!(
                    job_id = %task.definition_id,
                    failed = failures.len(),
                    "crawl children failed, continuing per step strategy"
                );
            }
            self.publish_step(&task, JobStatus::Completed, None).await;
            self.publish_job(&task, JobStatus::Completed, None).await;
            if let Some(callback) = &task.status_callback {
                callback(JobStatus::Completed, None);
            }
        } else {
            let message = format!(
                "{} crawl job(s) failed: {}",
                failures.len(),
                failures.join("; ")
            );
            self.publish_step(&task, JobStatus::Failed, Some(&message)).await;
            self.publish_job(&task, JobStatus::Failed, Some(&message)).await;
            if let Some(callback) = &task.status_callback {
                callback(JobStatus::Failed, Some(message));
            }
        }
    }

    async fn publish_crawl_progress(&self, task: &PollingTask, job: &CrawlJob) {
        let mut event = self
            .step_event(task, job.status)
            .with("crawl_job_id", json!(job.id))
            .with("source_type", json!(job.source_type))
            .with("total_urls", json!(job.progress.total_urls))
            .with("completed_urls", json!(job.progress.completed_urls))
            .with("failed_urls", json!(job.progress.failed_urls))
            .with("pending_urls", json!(job.progress.pending_urls))
            .with("percentage", json!(job.progress.percentage));
        if let Some(current_url) = &job.progress.current_url {
            event = event.with("current_url", json!(current_url));
        }
        if let Some(error) = &job.error {
            event = event.with("error", json!(error));
        }
        if let Err(e) = self.events.publish_sync(event).await {
            warn!(job_id = %task.definition_id, error = %e, "failed to publish crawl progress");
        }
    }

    async fn publish_step(&self, task: &PollingTask, status: JobStatus, error: Option<&str>) {
        let mut event = self.step_event(task, status);
        if let Some(message) = error {
            event = event.with("error", json!(message));
        }
        if let Err(e) = self.events.publish_sync(event).await {
            warn!(job_id = %task.definition_id, error = %e, "failed to publish step result");
        }
    }

    async fn publish_job(&self, task: &PollingTask, status: JobStatus, error: Option<&str>) {
        let mut event = Event::new(EventType::JobProgress)
            .with("job_id", json!(task.definition_id))
            .with("job_name", json!(task.definition_name))
            .with("job_type", json!(task.kind.as_str()))
            .with("total_steps", json!(task.total_steps))
            .with("status", json!(status.as_str()))
            .with("timestamp", json!(Utc::now().to_rfc3339()));
        if let Some(message) = error {
            event = event.with("error", json!(message));
        }
        if let Err(e) = self.events.publish_sync(event).await {
            warn!(job_id = %task.definition_id, error = %e, "failed to publish job result");
        }
    }

    fn step_event(&self, task: &PollingTask, status: JobStatus) -> Event {
        Event::new(EventType::JobProgress)
            .with("job_id", json!(task.definition_id))
            .with("job_name", json!(task.definition_name))
            .with("job_type", json!(task.kind.as_str()))
            .with("step_index", json!(task.step_index))
            .with("step_name", json!(task.step_name))
            .with("step_action", json!(task.step_action))
            .with("total_steps", json!(task.total_steps))
            .with("status", json!(status.as_str()))
            .with("timestamp", json!(Utc::now().to_rfc3339()))
    }
}
