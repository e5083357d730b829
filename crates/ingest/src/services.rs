//! Interfaces to the collaborators the orchestration core consumes but does
//! not own: the crawler subsystem, source registry, LLM providers, summary
//! generation and per-source scrapers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{AuthCredentials, CrawlJob, CrawlResult, CrawlerConfig, Document, SourceConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCrawlRequest {
    pub source_type: String,
    pub entity_type: String,
    pub seed_urls: Vec<String>,
    pub config: CrawlerConfig,
    pub source_id: String,
    pub refresh_source: bool,
    /// Snapshots taken at start; a live config reload must not change
    /// in-flight crawls.
    pub source: SourceConfig,
    pub auth: Option<AuthCredentials>,
    pub job_definition_id: Option<String>,
}

/// The crawler subsystem: enqueues URL-level tasks and reports child job
/// progress. Implemented outside the core.
#[async_trait]
pub trait CrawlerService: Send + Sync {
    /// Start a crawl and return the new job's ID.
    async fn start_crawl(&self, request: StartCrawlRequest) -> shared::Result<String>;
    async fn get_job_status(&self, job_id: &str) -> shared::Result<CrawlJob>;
    async fn get_job_results(&self, job_id: &str) -> shared::Result<Vec<CrawlResult>>;
    async fn wait_for_job(
        &self,
        cancel: &CancellationToken,
        job_id: &str,
    ) -> shared::Result<Vec<CrawlResult>>;
}

#[async_trait]
pub trait SourceService: Send + Sync {
    async fn get_source(&self, id: &str) -> shared::Result<SourceConfig>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> shared::Result<String>;
    async fn embed(&self, cancel: &CancellationToken, text: &str) -> shared::Result<Vec<f32>>;
    fn mode(&self) -> String;
    async fn health_check(&self) -> shared::Result<()>;
}

#[async_trait]
pub trait SummaryService: Send + Sync {
    async fn generate_summary_document(&self, cancel: &CancellationToken) -> shared::Result<()>;
}

/// Source-type-specific refresh used by the collection coordinator to
/// re-fetch a single document from its origin.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    async fn refresh_document(
        &self,
        cancel: &CancellationToken,
        doc: &Document,
    ) -> shared::Result<Document>;
}
