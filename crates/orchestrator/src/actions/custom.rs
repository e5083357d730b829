use crate::registry::{StepAction, StepContext};
use async_trait::async_trait;
use ingest::services::SummaryService;
use ingest::storage::DocumentStorage;
use std::sync::Arc;
use tracing::info;

/// Rebuilds the full-text index unless the step runs dry.
pub struct ReindexAction {
    documents: Arc<dyn DocumentStorage>,
}

impl ReindexAction {
    pub fn new(documents: Arc<dyn DocumentStorage>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl StepAction for ReindexAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        if ctx.step.bool_option("dry_run", false) {
            info!("reindex skipped (dry run)");
            return Ok(());
        }
        self.documents.rebuild_fts_index().await?;
        info!("full-text index rebuilt");
        Ok(())
    }
}

/// Regenerates the corpus-wide summary document.
pub struct CorpusSummaryAction {
    summary: Arc<dyn SummaryService>,
}

impl CorpusSummaryAction {
    pub fn new(summary: Arc<dyn SummaryService>) -> Self {
        Self { summary }
    }
}

#[async_trait]
impl StepAction for CorpusSummaryAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        self.summary.generate_summary_document(&ctx.cancel).await?;
        info!("corpus summary regenerated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::{AppError, JobKind, JobStep};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct CountingSummary {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SummaryService for CountingSummary {
        async fn generate_summary_document(
            &self,
            _cancel: &CancellationToken,
        ) -> shared::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingIndex;

    #[async_trait]
    impl DocumentStorage for FailingIndex {
        async fn list_documents(
            &self,
            _opts: &ingest::storage::ListDocumentsOptions,
        ) -> shared::Result<Vec<shared::Document>> {
            Ok(Vec::new())
        }
        async fn get_document(&self, _id: &str) -> shared::Result<Option<shared::Document>> {
            Ok(None)
        }
        async fn count_documents(&self) -> shared::Result<usize> {
            Ok(0)
        }
        async fn update_document(&self, _doc: &shared::Document) -> shared::Result<()> {
            Ok(())
        }
        async fn get_documents_force_sync(&self) -> shared::Result<Vec<shared::Document>> {
            Ok(Vec::new())
        }
        async fn get_documents_force_embed(
            &self,
            _limit: usize,
        ) -> shared::Result<Vec<shared::Document>> {
            Ok(Vec::new())
        }
        async fn get_unvectorized_documents(
            &self,
            _limit: usize,
        ) -> shared::Result<Vec<shared::Document>> {
            Ok(Vec::new())
        }
        async fn rebuild_fts_index(&self) -> shared::Result<()> {
            Err(AppError::Storage("index rebuild failed".to_string()))
        }
    }

    fn context(step: JobStep) -> StepContext {
        StepContext::new(
            CancellationToken::new(),
            "def-1",
            "Custom",
            JobKind::Custom,
            step,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_dry_run_skips_rebuild() {
        let action = ReindexAction::new(Arc::new(FailingIndex));
        let mut step = JobStep::new("reindex", "reindex");
        step.config.insert("dry_run".to_string(), json!(true));
        assert!(action.execute(&mut context(step)).await.is_ok());

        // Without dry_run the backend failure is fatal.
        let step = JobStep::new("reindex", "reindex");
        assert!(action.execute(&mut context(step)).await.is_err());
    }

    #[tokio::test]
    async fn test_corpus_summary_delegates() {
        let summary = Arc::new(CountingSummary {
            calls: AtomicUsize::new(0),
        });
        let action = CorpusSummaryAction::new(Arc::clone(&summary) as Arc<dyn SummaryService>);
        action
            .execute(&mut context(JobStep::new("summary", "corpus_summary")))
            .await
            .unwrap();
        assert_eq!(summary.calls.load(Ordering::SeqCst), 1);
    }
}
