use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use ingest::storage::{JobChildStats, JobFilter, JobStorage};
use shared::{AppError, AuthCredentials, CrawlJob, CrawlProgress, JobStatus, SourceConfig};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Cycle guardrail for cascade deletion. Hierarchies this deep do not exist
/// in practice.
const MAX_CASCADE_DEPTH: usize = 10;

const CANCELLED_BY_TOLERANCE: &str = "Cancelled by parent job error tolerance threshold";

#[derive(Debug, Clone, Default)]
pub struct CreateJobRequest {
    pub name: String,
    pub source_type: String,
    pub entity_type: String,
    pub parent_id: Option<String>,
    pub job_definition_id: Option<String>,
    pub source_snapshot: Option<SourceConfig>,
    pub auth_snapshot: Option<AuthCredentials>,
}

/// Lifecycle CRUD over crawl job records. Creating a job never enqueues
/// work; the crawler subsystem picks pending jobs up itself.
pub struct JobManager {
    storage: Arc<dyn JobStorage>,
}

impl JobManager {
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self { storage }
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> shared::Result<String> {
        let now = Utc::now();
        let job = CrawlJob {
            id: Uuid::new_v4().to_string(),
            parent_id: request.parent_id,
            job_definition_id: request.job_definition_id,
            name: request.name,
            source_type: request.source_type,
            entity_type: request.entity_type,
            status: JobStatus::Pending,
            progress: CrawlProgress::default(),
            error: None,
            source_snapshot: request.source_snapshot,
            auth_snapshot: request.auth_snapshot,
            created_at: now,
            updated_at: now,
        };
        self.storage.save_job(&job).await?;
        info!(job_id = %job.id, name = %job.name, "crawl job created");
        Ok(job.id)
    }

    pub async fn get_job(&self, id: &str) -> shared::Result<CrawlJob> {
        self.storage
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job '{}'", id)))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> shared::Result<Vec<CrawlJob>> {
        self.storage.list_jobs(filter).await
    }

    /// Routes to the filtered or the global count depending on the filter.
    pub async fn count_jobs(&self, filter: &JobFilter) -> shared::Result<usize> {
        if filter.is_empty() {
            self.storage.count_jobs().await
        } else {
            self.storage.count_jobs_with_filters(filter).await
        }
    }

    pub async fn update_job(&self, job: &CrawlJob) -> shared::Result<()> {
        self.storage.save_job(job).await
    }

    /// Delete a job and cascade over its descendants, depth-first. Running
    /// jobs are never deleted: a running root fails the whole call, a
    /// running descendant is logged, counted as a failure and skipped.
    /// Returns the number of successfully deleted descendants (the root is
    /// not counted).
    pub async fn delete_job(&self, id: &str) -> shared::Result<usize> {
        let job = self.get_job(id).await?;
        if job.status == JobStatus::Running {
            return Err(AppError::Policy(format!(
                "cannot delete running job '{}'",
                id
            )));
        }

        let deleted = self.delete_descendants(id, 0).await;
        self.storage.delete_job(id).await?;
        info!(job_id = %id, cascade_deleted = deleted, "job deleted");
        Ok(deleted)
    }

    fn delete_descendants<'a>(&'a self, parent_id: &'a str, depth: usize) -> BoxFuture<'a, usize> {
        async move {
            if depth >= MAX_CASCADE_DEPTH {
                warn!(parent_id = %parent_id, depth, "cascade depth limit reached, stopping");
                return 0;
            }
            let children = match self.storage.get_child_jobs(parent_id).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "failed to list child jobs");
                    return 0;
                }
            };

            let mut deleted = 0;
            for child in children {
                deleted += self.delete_descendants(&child.id, depth + 1).await;
                if child.status == JobStatus::Running {
                    warn!(job_id = %child.id, "skipping deletion of running child job");
                    continue;
                }
                match self.storage.delete_job(&child.id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        warn!(job_id = %child.id, error = %e, "failed to delete child job")
                    }
                }
            }
            deleted
        }
        .boxed()
    }

    /// Duplicate a job record under a fresh ID in pending state.
    pub async fn copy_job(&self, id: &str) -> shared::Result<String> {
        let mut job = self.get_job(id).await?;
        job.id = Uuid::new_v4().to_string();
        job.name = format!("Copy of {}", job.name);
        job.status = JobStatus::Pending;
        let now = Utc::now();
        job.created_at = now;
        job.updated_at = now;
        self.storage.save_job(&job).await?;
        info!(job_id = %job.id, "job copied");
        Ok(job.id)
    }

    /// Cancel every running or pending child of a parent. Individual save
    /// failures are logged and skipped; returns the number of children
    /// actually cancelled.
    pub async fn stop_all_child_jobs(&self, parent_id: &str) -> shared::Result<usize> {
        let children = self.storage.get_child_jobs(parent_id).await?;
        let mut cancelled = 0;
        for mut child in children {
            if !matches!(child.status, JobStatus::Running | JobStatus::Pending) {
                continue;
            }
            child.status = JobStatus::Cancelled;
            child.error = Some(CANCELLED_BY_TOLERANCE.to_string());
            child.updated_at = Utc::now();
            match self.storage.save_job(&child).await {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    warn!(job_id = %child.id, error = %e, "failed to cancel child job")
                }
            }
        }
        info!(parent_id = %parent_id, cancelled, "child jobs stopped");
        Ok(cancelled)
    }

    pub async fn get_job_child_stats(&self, parent_id: &str) -> shared::Result<JobChildStats> {
        self.storage.get_job_child_stats(parent_id).await
    }
}
