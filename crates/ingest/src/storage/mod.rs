use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{AuthCredentials, CrawlJob, Document, JobDefinition, JobStatus};
use std::collections::HashMap;

pub mod memory;

pub use memory::{
    MemoryAuthStorage, MemoryDefinitionStorage, MemoryDocumentStorage, MemoryJobStorage,
    MemoryKeyValueStorage,
};

/// Key/value store backing placeholder substitution and runtime settings.
/// Missing keys surface as [`shared::AppError::KeyNotFound`].
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> shared::Result<String>;
    /// Insert a new key; fails if the key already exists.
    async fn set(&self, key: &str, value: &str) -> shared::Result<()>;
    /// Insert or update.
    async fn upsert(&self, key: &str, value: &str) -> shared::Result<()>;
    async fn delete(&self, key: &str) -> shared::Result<()>;
    async fn delete_all(&self) -> shared::Result<()>;
    async fn list(&self) -> shared::Result<Vec<String>>;
    async fn list_by_prefix(&self, prefix: &str) -> shared::Result<Vec<String>>;
    async fn get_all(&self) -> shared::Result<HashMap<String, String>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDocumentsOptions {
    pub limit: usize,
    pub offset: usize,
    /// Restrict to one source type; ordering is always `updated_at` descending.
    pub source_type: Option<String>,
}

#[async_trait]
pub trait DocumentStorage: Send + Sync {
    async fn list_documents(&self, opts: &ListDocumentsOptions) -> shared::Result<Vec<Document>>;
    async fn get_document(&self, id: &str) -> shared::Result<Option<Document>>;
    async fn count_documents(&self) -> shared::Result<usize>;
    async fn update_document(&self, doc: &Document) -> shared::Result<()>;
    /// Documents flagged `force_sync_pending`.
    async fn get_documents_force_sync(&self) -> shared::Result<Vec<Document>>;
    /// Documents flagged `force_embed_pending`, up to `limit`.
    async fn get_documents_force_embed(&self, limit: usize) -> shared::Result<Vec<Document>>;
    /// Documents with no embedding yet, up to `limit`.
    async fn get_unvectorized_documents(&self, limit: usize) -> shared::Result<Vec<Document>>;
    async fn rebuild_fts_index(&self) -> shared::Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source_type: Option<String>,
    pub entity_type: Option<String>,
    pub parent_id: Option<String>,
}

impl JobFilter {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.source_type.is_none()
            && self.entity_type.is_none()
            && self.parent_id.is_none()
    }

    pub fn matches(&self, job: &CrawlJob) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(source_type) = &self.source_type {
            if &job.source_type != source_type {
                return false;
            }
        }
        if let Some(entity_type) = &self.entity_type {
            if &job.entity_type != entity_type {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if job.parent_id.as_deref() != Some(parent_id.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobChildStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[async_trait]
pub trait JobStorage: Send + Sync {
    async fn save_job(&self, job: &CrawlJob) -> shared::Result<()>;
    async fn get_job(&self, id: &str) -> shared::Result<Option<CrawlJob>>;
    async fn list_jobs(&self, filter: &JobFilter) -> shared::Result<Vec<CrawlJob>>;
    async fn delete_job(&self, id: &str) -> shared::Result<()>;
    async fn get_child_jobs(&self, parent_id: &str) -> shared::Result<Vec<CrawlJob>>;
    async fn count_jobs(&self) -> shared::Result<usize>;
    async fn count_jobs_with_filters(&self, filter: &JobFilter) -> shared::Result<usize>;
    async fn get_job_child_stats(&self, parent_id: &str) -> shared::Result<JobChildStats>;
}

#[async_trait]
pub trait AuthStorage: Send + Sync {
    async fn get_credentials_by_id(&self, id: &str) -> shared::Result<Option<AuthCredentials>>;
}

#[async_trait]
pub trait DefinitionStorage: Send + Sync {
    async fn save_definition(&self, def: &JobDefinition) -> shared::Result<()>;
    async fn get_definition(&self, id: &str) -> shared::Result<Option<JobDefinition>>;
    async fn list_definitions(&self) -> shared::Result<Vec<JobDefinition>>;
    async fn delete_definition(&self, id: &str) -> shared::Result<()>;
}
