//! Built-in step actions, grouped by job kind:
//! crawler `crawl` / `transform` / `embed`, summarizer `scan` /
//! `summarize` / `extract_keywords`, custom `reindex` / `corpus_summary`.

pub mod crawl;
pub mod custom;
pub mod embed;
pub mod keywords;
pub mod summarize;
pub mod transform;

pub use crawl::CrawlAction;
pub use custom::{CorpusSummaryAction, ReindexAction};
pub use embed::EmbedAction;
pub use summarize::{ExtractKeywordsAction, ScanAction, SummarizeAction};
pub use transform::TransformAction;

use crate::registry::JobTypeRegistry;
use ingest::services::{CrawlerService, LlmService, SummaryService};
use ingest::storage::{AuthStorage, DocumentStorage};
use ingest::{ConfigService, EventBus};
use shared::JobKind;
use std::sync::Arc;

/// Everything the built-in actions need. Wired once at startup.
#[derive(Clone)]
pub struct ActionDeps {
    pub events: Arc<EventBus>,
    pub documents: Arc<dyn DocumentStorage>,
    pub llm: Arc<dyn LlmService>,
    pub summary: Arc<dyn SummaryService>,
    pub crawler: Arc<dyn CrawlerService>,
    pub auth: Arc<dyn AuthStorage>,
    pub config: Arc<ConfigService>,
}

pub fn register_builtin_actions(
    registry: &JobTypeRegistry,
    deps: &ActionDeps,
) -> shared::Result<()> {
    registry.register_action(
        JobKind::Crawler,
        "crawl",
        Arc::new(CrawlAction::new(
            Arc::clone(&deps.crawler),
            Arc::clone(&deps.auth),
            Arc::clone(&deps.config),
        )),
    )?;
    registry.register_action(
        JobKind::Crawler,
        "transform",
        Arc::new(TransformAction::new(Arc::clone(&deps.events))),
    )?;
    registry.register_action(
        JobKind::Crawler,
        "embed",
        Arc::new(EmbedAction::new(Arc::clone(&deps.events))),
    )?;
    registry.register_action(
        JobKind::Summarizer,
        "scan",
        Arc::new(ScanAction::new(Arc::clone(&deps.documents))),
    )?;
    registry.register_action(
        JobKind::Summarizer,
        "summarize",
        Arc::new(SummarizeAction::new(
            Arc::clone(&deps.documents),
            Arc::clone(&deps.llm),
        )),
    )?;
    registry.register_action(
        JobKind::Summarizer,
        "extract_keywords",
        Arc::new(ExtractKeywordsAction::new(Arc::clone(&deps.documents))),
    )?;
    registry.register_action(
        JobKind::Custom,
        "reindex",
        Arc::new(ReindexAction::new(Arc::clone(&deps.documents))),
    )?;
    registry.register_action(
        JobKind::Custom,
        "corpus_summary",
        Arc::new(CorpusSummaryAction::new(Arc::clone(&deps.summary))),
    )?;
    Ok(())
}
