//! In-memory storage backends. These serve as the reference implementation
//! of the repository traits and as the test substrate for the engine.

use super::{
    AuthStorage, DefinitionStorage, DocumentStorage, JobChildStats, JobFilter, JobStorage,
    KeyValueStorage, ListDocumentsOptions,
};
use async_trait::async_trait;
use shared::{doc_meta, AppError, AuthCredentials, CrawlJob, Document, JobDefinition, JobStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryKeyValueStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryKeyValueStorage {
    async fn get(&self, key: &str) -> shared::Result<String> {
        self.values
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> shared::Result<()> {
        let mut guard = self.values.write().await;
        if guard.contains_key(key) {
            return Err(AppError::Storage(format!("key '{}' already exists", key)));
        }
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn upsert(&self, key: &str, value: &str) -> shared::Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> shared::Result<()> {
        self.values
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| AppError::KeyNotFound(key.to_string()))
    }

    async fn delete_all(&self) -> shared::Result<()> {
        self.values.write().await.clear();
        Ok(())
    }

    async fn list(&self) -> shared::Result<Vec<String>> {
        let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_by_prefix(&self, prefix: &str) -> shared::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_all(&self) -> shared::Result<HashMap<String, String>> {
        Ok(self.values.read().await.clone())
    }
}

#[derive(Default)]
pub struct MemoryDocumentStorage {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, doc: Document) {
        self.documents.write().await.insert(doc.id.clone(), doc);
    }

    fn sorted_by_updated_desc(mut docs: Vec<Document>) -> Vec<Document> {
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        docs
    }
}

#[async_trait]
impl DocumentStorage for MemoryDocumentStorage {
    async fn list_documents(&self, opts: &ListDocumentsOptions) -> shared::Result<Vec<Document>> {
        let docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| {
                opts.source_type
                    .as_ref()
                    .map(|st| &d.source_type == st)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        let sorted = Self::sorted_by_updated_desc(docs);
        Ok(sorted
            .into_iter()
            .skip(opts.offset)
            .take(if opts.limit == 0 { usize::MAX } else { opts.limit })
            .collect())
    }

    async fn get_document(&self, id: &str) -> shared::Result<Option<Document>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn count_documents(&self) -> shared::Result<usize> {
        Ok(self.documents.read().await.len())
    }

    async fn update_document(&self, doc: &Document) -> shared::Result<()> {
        let mut guard = self.documents.write().await;
        if !guard.contains_key(&doc.id) {
            return Err(AppError::NotFound(format!("document '{}'", doc.id)));
        }
        guard.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_documents_force_sync(&self) -> shared::Result<Vec<Document>> {
        let docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.meta_bool(doc_meta::FORCE_SYNC_PENDING))
            .cloned()
            .collect();
        Ok(Self::sorted_by_updated_desc(docs))
    }

    async fn get_documents_force_embed(&self, limit: usize) -> shared::Result<Vec<Document>> {
        let docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.meta_bool(doc_meta::FORCE_EMBED_PENDING))
            .cloned()
            .collect();
        Ok(Self::sorted_by_updated_desc(docs)
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn get_unvectorized_documents(&self, limit: usize) -> shared::Result<Vec<Document>> {
        let docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.embedding.is_none())
            .cloned()
            .collect();
        Ok(Self::sorted_by_updated_desc(docs)
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn rebuild_fts_index(&self) -> shared::Result<()> {
        // Nothing to rebuild for the in-memory backend.
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryJobStorage {
    jobs: RwLock<HashMap<String, CrawlJob>>,
}

impl MemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStorage for MemoryJobStorage {
    async fn save_job(&self, job: &CrawlJob) -> shared::Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> shared::Result<Option<CrawlJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> shared::Result<Vec<CrawlJob>> {
        let mut jobs: Vec<CrawlJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> shared::Result<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("job '{}'", id)))
    }

    async fn get_child_jobs(&self, parent_id: &str) -> shared::Result<Vec<CrawlJob>> {
        let mut jobs: Vec<CrawlJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn count_jobs(&self) -> shared::Result<usize> {
        Ok(self.jobs.read().await.len())
    }

    async fn count_jobs_with_filters(&self, filter: &JobFilter) -> shared::Result<usize> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| filter.matches(j))
            .count())
    }

    async fn get_job_child_stats(&self, parent_id: &str) -> shared::Result<JobChildStats> {
        let mut stats = JobChildStats::default();
        for job in self.jobs.read().await.values() {
            if job.parent_id.as_deref() != Some(parent_id) {
                continue;
            }
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Default)]
pub struct MemoryAuthStorage {
    credentials: RwLock<HashMap<String, AuthCredentials>>,
}

impl MemoryAuthStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, creds: AuthCredentials) {
        self.credentials
            .write()
            .await
            .insert(creds.id.clone(), creds);
    }
}

#[async_trait]
impl AuthStorage for MemoryAuthStorage {
    async fn get_credentials_by_id(&self, id: &str) -> shared::Result<Option<AuthCredentials>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryDefinitionStorage {
    definitions: RwLock<HashMap<String, JobDefinition>>,
}

impl MemoryDefinitionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStorage for MemoryDefinitionStorage {
    async fn save_definition(&self, def: &JobDefinition) -> shared::Result<()> {
        self.definitions
            .write()
            .await
            .insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> shared::Result<Option<JobDefinition>> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn list_definitions(&self) -> shared::Result<Vec<JobDefinition>> {
        let mut defs: Vec<JobDefinition> =
            self.definitions.read().await.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &str) -> shared::Result<()> {
        self.definitions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("job definition '{}'", id)))
    }
}
