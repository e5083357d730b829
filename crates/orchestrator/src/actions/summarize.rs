//! Summarizer-kind actions: `scan`, `summarize` and `extract_keywords`.
//! All three stream documents page by page, newest first, and share the
//! same skip rules.

use super::keywords::{extract_keywords, truncate_chars, word_count};
use crate::registry::{StepAction, StepContext};
use async_trait::async_trait;
use chrono::Utc;
use ingest::services::{ChatMessage, LlmService};
use ingest::storage::{DocumentStorage, ListDocumentsOptions};
use serde_json::json;
use shared::{doc_meta, AppError, Document, JobStep, OnError};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_CONTENT_LIMIT: usize = 10_000;
const DEFAULT_TOP_N: usize = 10;
const DEFAULT_MIN_WORD_LENGTH: usize = 3;
const DEFAULT_SUMMARY_PROMPT: &str =
    "You are a documentation assistant. Summarize the following document in \
     two or three sentences, keeping concrete names and terms.";

/// The shared streaming frame: batch size, paging offset, optional source
/// filter and an overall document cap.
struct StreamOptions {
    batch_size: usize,
    offset: usize,
    max_documents: usize,
    source_type: Option<String>,
}

impl StreamOptions {
    fn from_step(step: &JobStep) -> Self {
        let batch_size = step.int_option("batch_size", DEFAULT_BATCH_SIZE as i64);
        let offset = step.int_option("offset", 0);
        let max_documents = step.int_option("max_documents", 0);
        let source_type = match step.string_option("source_type", "") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        Self {
            batch_size: if batch_size <= 0 {
                DEFAULT_BATCH_SIZE
            } else {
                batch_size as usize
            },
            offset: offset.max(0) as usize,
            max_documents: max_documents.max(0) as usize,
            source_type,
        }
    }
}

/// Pages through documents ordered by `updated_at` descending. `next_page`
/// returns an empty vector once the stream (or the document cap) is
/// exhausted.
struct DocumentPager<'a> {
    documents: &'a Arc<dyn DocumentStorage>,
    opts: &'a StreamOptions,
    offset: usize,
    visited: usize,
}

impl<'a> DocumentPager<'a> {
    fn new(documents: &'a Arc<dyn DocumentStorage>, opts: &'a StreamOptions) -> Self {
        Self {
            documents,
            opts,
            offset: opts.offset,
            visited: 0,
        }
    }

    async fn next_page(&mut self) -> shared::Result<Vec<Document>> {
        if self.opts.max_documents > 0 && self.visited >= self.opts.max_documents {
            return Ok(Vec::new());
        }
        let mut page = self
            .documents
            .list_documents(&ListDocumentsOptions {
                limit: self.opts.batch_size,
                offset: self.offset,
                source_type: self.opts.source_type.clone(),
            })
            .await?;
        self.offset += page.len();
        if self.opts.max_documents > 0 {
            let remaining = self.opts.max_documents - self.visited;
            page.truncate(remaining);
        }
        self.visited += page.len();
        Ok(page)
    }
}

fn allowed_source_ids(ctx: &StepContext) -> Vec<String> {
    ctx.sources.iter().map(|s| s.id.clone()).collect()
}

fn source_mismatch(allowed: &[String], doc: &Document) -> bool {
    !allowed.is_empty() && !allowed.iter().any(|id| id == &doc.source_id)
}

fn has_nonempty_summary(doc: &Document) -> bool {
    doc.meta_str(doc_meta::SUMMARY)
        .map(|s| !s.is_empty())
        .unwrap_or(false)
}

/// Dry pass over the corpus: reports what a summarize run would touch
/// without mutating anything.
pub struct ScanAction {
    documents: Arc<dyn DocumentStorage>,
}

impl ScanAction {
    pub fn new(documents: Arc<dyn DocumentStorage>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl StepAction for ScanAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let opts = StreamOptions::from_step(&ctx.step);
        let skip_with_summary = ctx.step.bool_option("skip_with_summary", true);
        let skip_empty_content = ctx.step.bool_option("skip_empty_content", true);
        let allowed = allowed_source_ids(ctx);

        let mut scanned = 0usize;
        let mut eligible = 0usize;
        let mut skipped = 0usize;
        let mut pager = DocumentPager::new(&self.documents, &opts);
        loop {
            let page = pager.next_page().await?;
            if page.is_empty() {
                break;
            }
            for doc in page {
                if ctx.cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                scanned += 1;
                if (skip_with_summary && has_nonempty_summary(&doc))
                    || (skip_empty_content && doc.content_markdown.is_empty())
                    || source_mismatch(&allowed, &doc)
                {
                    skipped += 1;
                } else {
                    eligible += 1;
                }
            }
        }

        info!(scanned, eligible, skipped, "document scan complete");
        Ok(())
    }
}

/// Summarizes documents through the LLM and persists the summary, and
/// optionally word count and keywords, into document metadata.
pub struct SummarizeAction {
    documents: Arc<dyn DocumentStorage>,
    llm: Arc<dyn LlmService>,
}

impl SummarizeAction {
    pub fn new(documents: Arc<dyn DocumentStorage>, llm: Arc<dyn LlmService>) -> Self {
        Self { documents, llm }
    }
}

#[async_trait]
impl StepAction for SummarizeAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let opts = StreamOptions::from_step(&ctx.step);
        let skip_with_summary = ctx.step.bool_option("skip_with_summary", true);
        let skip_empty_content = ctx.step.bool_option("skip_empty_content", true);
        let include_keywords = ctx.step.bool_option("include_keywords", true);
        let include_word_count = ctx.step.bool_option("include_word_count", true);
        let content_limit = ctx
            .step
            .int_option("content_limit", DEFAULT_CONTENT_LIMIT as i64)
            .max(0) as usize;
        let top_n = ctx.step.int_option("top_n", DEFAULT_TOP_N as i64).max(0) as usize;
        let min_word_length = ctx
            .step
            .int_option("min_word_length", DEFAULT_MIN_WORD_LENGTH as i64)
            .max(1) as usize;
        let system_prompt = ctx.step.string_option("system_prompt", DEFAULT_SUMMARY_PROMPT);
        let on_error = ctx.step.on_error;
        let allowed = allowed_source_ids(ctx);

        let mut errors: Vec<String> = Vec::new();
        let mut updated = 0usize;
        let mut pager = DocumentPager::new(&self.documents, &opts);
        'stream: loop {
            let page = pager.next_page().await?;
            if page.is_empty() {
                break;
            }
            for mut doc in page {
                if ctx.cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                if (skip_with_summary && has_nonempty_summary(&doc))
                    || (skip_empty_content && doc.content_markdown.is_empty())
                    || source_mismatch(&allowed, &doc)
                {
                    continue;
                }

                let (clamped, cut) = truncate_chars(&doc.content_markdown, content_limit);
                let prompt_content = if cut {
                    format!("{}...", clamped)
                } else {
                    clamped.to_string()
                };

                let messages = [
                    ChatMessage::system(system_prompt.clone()),
                    ChatMessage::user(prompt_content),
                ];
                let summary = match self.llm.chat(&ctx.cancel, &messages).await {
                    Ok(summary) => summary,
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(e) => {
                        warn!(doc_id = %doc.id, error = %e, "summary generation failed");
                        errors.push(format!("{}: {}", doc.id, e));
                        "Summary not available".to_string()
                    }
                };

                doc.metadata
                    .insert(doc_meta::SUMMARY.to_string(), json!(summary));
                if include_word_count {
                    doc.metadata.insert(
                        doc_meta::WORD_COUNT.to_string(),
                        json!(word_count(&doc.content_markdown)),
                    );
                }
                if include_keywords && top_n > 0 {
                    doc.metadata.insert(
                        doc_meta::KEYWORDS.to_string(),
                        json!(extract_keywords(&doc.content_markdown, top_n, min_word_length)),
                    );
                }
                doc.metadata.insert(
                    doc_meta::LAST_SUMMARIZED.to_string(),
                    json!(Utc::now().to_rfc3339()),
                );
                doc.updated_at = Utc::now();

                if let Err(e) = self.documents.update_document(&doc).await {
                    warn!(doc_id = %doc.id, error = %e, "failed to persist summary");
                    errors.push(format!("{}: {}", doc.id, e));
                } else {
                    updated += 1;
                }

                // A fail strategy short-circuits the stream on the first error.
                if on_error == OnError::Fail && !errors.is_empty() {
                    break 'stream;
                }
            }
        }

        info!(updated, failed = errors.len(), "summarize pass complete");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Llm(format!(
                "{} document(s) failed: {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

/// Writes frequency keywords into document metadata without touching
/// summaries.
pub struct ExtractKeywordsAction {
    documents: Arc<dyn DocumentStorage>,
}

impl ExtractKeywordsAction {
    pub fn new(documents: Arc<dyn DocumentStorage>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl StepAction for ExtractKeywordsAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let opts = StreamOptions::from_step(&ctx.step);
        let skip_with_keywords = ctx.step.bool_option("skip_with_keywords", true);
        let skip_empty_content = ctx.step.bool_option("skip_empty_content", true);
        let top_n = ctx.step.int_option("top_n", DEFAULT_TOP_N as i64).max(0) as usize;
        let min_word_length = ctx
            .step
            .int_option("min_word_length", DEFAULT_MIN_WORD_LENGTH as i64)
            .max(1) as usize;
        let on_error = ctx.step.on_error;
        let allowed = allowed_source_ids(ctx);

        let mut errors: Vec<String> = Vec::new();
        let mut updated = 0usize;
        let mut pager = DocumentPager::new(&self.documents, &opts);
        'stream: loop {
            let page = pager.next_page().await?;
            if page.is_empty() {
                break;
            }
            for mut doc in page {
                if ctx.cancel.is_cancelled() {
                    return Err(AppError::Cancelled);
                }
                if (skip_with_keywords && doc.has_keywords())
                    || (skip_empty_content && doc.content_markdown.is_empty())
                    || source_mismatch(&allowed, &doc)
                {
                    continue;
                }

                doc.metadata.insert(
                    doc_meta::KEYWORDS.to_string(),
                    json!(extract_keywords(&doc.content_markdown, top_n, min_word_length)),
                );
                doc.metadata.insert(
                    doc_meta::LAST_KEYWORD_EXTRACTION.to_string(),
                    json!(Utc::now().to_rfc3339()),
                );
                doc.updated_at = Utc::now();
                if let Err(e) = self.documents.update_document(&doc).await {
                    warn!(doc_id = %doc.id, error = %e, "failed to persist keywords");
                    errors.push(format!("{}: {}", doc.id, e));
                } else {
                    updated += 1;
                    debug!(doc_id = %doc.id, "keywords extracted");
                }

                // A fail strategy short-circuits the stream on the first error.
                if on_error == OnError::Fail && !errors.is_empty() {
                    break 'stream;
                }
            }
        }

        info!(updated, failed = errors.len(), "keyword extraction complete");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Storage(format!(
                "{} document(s) failed: {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepContext;
    use ingest::storage::memory::MemoryDocumentStorage;
    use shared::JobKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FakeLlm {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeLlm {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl LlmService for FakeLlm {
        async fn chat(
            &self,
            _cancel: &CancellationToken,
            messages: &[ChatMessage],
        ) -> shared::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Llm("model unavailable".to_string()));
            }
            Ok(format!("summary of {} bytes", messages[1].content.len()))
        }
        async fn embed(
            &self,
            _cancel: &CancellationToken,
            _text: &str,
        ) -> shared::Result<Vec<f32>> {
            Ok(vec![0.0])
        }
        fn mode(&self) -> String {
            "test".to_string()
        }
        async fn health_check(&self) -> shared::Result<()> {
            Ok(())
        }
    }

    fn document(id: &str, content: &str) -> Document {
        let now = Utc::now();
        Document {
            id: id.to_string(),
            source_type: "jira".to_string(),
            source_id: "s1".to_string(),
            url: None,
            title: None,
            content_markdown: content.to_string(),
            metadata: serde_json::Map::new(),
            embedding: None,
            embedding_model: None,
            last_synced: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn context(step: JobStep) -> StepContext {
        StepContext::new(
            CancellationToken::new(),
            "def-1",
            "Summarizer",
            JobKind::Summarizer,
            step,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_summarize_writes_metadata() {
        let memory = MemoryDocumentStorage::new();
        memory
            .insert(document("d1", "grammar grammar parser token"))
            .await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);
        let llm = Arc::new(FakeLlm::new(false));
        let action = SummarizeAction::new(Arc::clone(&storage), llm.clone());

        let mut ctx = context(JobStep::new("summarize", "summarize"));
        action.execute(&mut ctx).await.unwrap();

        let doc = storage.get_document("d1").await.unwrap().unwrap();
        assert!(doc.meta_str(doc_meta::SUMMARY).unwrap().starts_with("summary"));
        assert_eq!(doc.metadata[doc_meta::WORD_COUNT], json!(4));
        assert_eq!(
            doc.metadata[doc_meta::KEYWORDS],
            json!(["grammar", "parser", "token"])
        );
        assert!(doc.metadata.contains_key(doc_meta::LAST_SUMMARIZED));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_summarize_skips_existing_summaries_and_empty_content() {
        let memory = MemoryDocumentStorage::new();
        let mut done = document("d1", "already handled");
        done.metadata
            .insert(doc_meta::SUMMARY.to_string(), json!("existing"));
        memory.insert(done).await;
        memory.insert(document("d2", "")).await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);

        let llm = Arc::new(FakeLlm::new(false));
        let action = SummarizeAction::new(Arc::clone(&storage), llm.clone());
        let mut ctx = context(JobStep::new("summarize", "summarize"));
        action.execute(&mut ctx).await.unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_summarize_falls_back_on_llm_failure() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(document("d1", "content here")).await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);

        let action = SummarizeAction::new(Arc::clone(&storage), Arc::new(FakeLlm::new(true)));
        let mut step = JobStep::new("summarize", "summarize");
        step.on_error = OnError::Continue;
        let mut ctx = context(step);

        let result = action.execute(&mut ctx).await;
        assert!(matches!(result, Err(AppError::Llm(_))));

        let doc = storage.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.meta_str(doc_meta::SUMMARY), Some("Summary not available"));
    }

    #[tokio::test]
    async fn test_content_clamped_to_char_limit() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(document("d1", &"ü".repeat(50))).await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);

        let llm = Arc::new(FakeLlm::new(false));
        let action = SummarizeAction::new(Arc::clone(&storage), llm);
        let mut step = JobStep::new("summarize", "summarize");
        step.config.insert("content_limit".to_string(), json!(10.0));
        let mut ctx = context(step);
        action.execute(&mut ctx).await.unwrap();

        let doc = storage.get_document("d1").await.unwrap().unwrap();
        // 10 two-byte chars plus "..." reach the model, never a split char.
        assert_eq!(doc.meta_str(doc_meta::SUMMARY), Some("summary of 23 bytes"));
    }

    /// Delegates to the in-memory backend but fails `update_document` for
    /// one document ID.
    struct FailingUpdates {
        inner: MemoryDocumentStorage,
        fail_id: String,
    }

    #[async_trait]
    impl DocumentStorage for FailingUpdates {
        async fn list_documents(
            &self,
            opts: &ListDocumentsOptions,
        ) -> shared::Result<Vec<Document>> {
            self.inner.list_documents(opts).await
        }
        async fn get_document(&self, id: &str) -> shared::Result<Option<Document>> {
            self.inner.get_document(id).await
        }
        async fn count_documents(&self) -> shared::Result<usize> {
            self.inner.count_documents().await
        }
        async fn update_document(&self, doc: &Document) -> shared::Result<()> {
            if doc.id == self.fail_id {
                return Err(AppError::Storage("disk full".to_string()));
            }
            self.inner.update_document(doc).await
        }
        async fn get_documents_force_sync(&self) -> shared::Result<Vec<Document>> {
            self.inner.get_documents_force_sync().await
        }
        async fn get_documents_force_embed(
            &self,
            limit: usize,
        ) -> shared::Result<Vec<Document>> {
            self.inner.get_documents_force_embed(limit).await
        }
        async fn get_unvectorized_documents(
            &self,
            limit: usize,
        ) -> shared::Result<Vec<Document>> {
            self.inner.get_unvectorized_documents(limit).await
        }
        async fn rebuild_fts_index(&self) -> shared::Result<()> {
            self.inner.rebuild_fts_index().await
        }
    }

    /// Two documents, the newer one failing to persist. Streaming order is
    /// `updated_at` descending, so the failure comes first.
    async fn failing_update_storage() -> Arc<dyn DocumentStorage> {
        let inner = MemoryDocumentStorage::new();
        let newer = document("d-fail", "alpha alpha beta");
        inner.insert(newer).await;
        let mut older = document("d-ok", "gamma gamma delta");
        older.updated_at = Utc::now() - chrono::Duration::seconds(60);
        inner.insert(older).await;
        Arc::new(FailingUpdates {
            inner,
            fail_id: "d-fail".to_string(),
        })
    }

    #[tokio::test]
    async fn test_extract_keywords_continue_accumulates_persist_failures() {
        let storage = failing_update_storage().await;
        let action = ExtractKeywordsAction::new(Arc::clone(&storage));

        let mut step = JobStep::new("keywords", "extract_keywords");
        step.on_error = OnError::Continue;
        let mut ctx = context(step);
        let result = action.execute(&mut ctx).await;
        assert!(matches!(result, Err(AppError::Storage(_))));

        // The failure did not stop the stream: the older document was
        // still processed and persisted.
        let ok = storage.get_document("d-ok").await.unwrap().unwrap();
        assert!(ok.metadata.contains_key(doc_meta::LAST_KEYWORD_EXTRACTION));
    }

    #[tokio::test]
    async fn test_extract_keywords_fail_stops_stream() {
        let storage = failing_update_storage().await;
        let action = ExtractKeywordsAction::new(Arc::clone(&storage));

        // Default strategy is fail: the first persistence error ends the
        // stream before the older document is reached.
        let mut ctx = context(JobStep::new("keywords", "extract_keywords"));
        let result = action.execute(&mut ctx).await;
        assert!(matches!(result, Err(AppError::Storage(_))));

        let ok = storage.get_document("d-ok").await.unwrap().unwrap();
        assert!(!ok.metadata.contains_key(doc_meta::LAST_KEYWORD_EXTRACTION));
    }

    #[tokio::test]
    async fn test_extract_keywords_respects_skip_flag() {
        let memory = MemoryDocumentStorage::new();
        let mut tagged = document("d1", "alpha alpha beta");
        tagged
            .metadata
            .insert(doc_meta::KEYWORDS.to_string(), json!(["alpha"]));
        memory.insert(tagged).await;
        memory.insert(document("d2", "gamma gamma delta")).await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);

        let action = ExtractKeywordsAction::new(Arc::clone(&storage));
        let mut ctx = context(JobStep::new("keywords", "extract_keywords"));
        action.execute(&mut ctx).await.unwrap();

        let d1 = storage.get_document("d1").await.unwrap().unwrap();
        assert_eq!(d1.metadata[doc_meta::KEYWORDS], json!(["alpha"]));
        assert!(!d1.metadata.contains_key(doc_meta::LAST_KEYWORD_EXTRACTION));

        let d2 = storage.get_document("d2").await.unwrap().unwrap();
        assert_eq!(d2.metadata[doc_meta::KEYWORDS], json!(["gamma", "delta"]));
        assert!(d2.metadata.contains_key(doc_meta::LAST_KEYWORD_EXTRACTION));
    }

    #[tokio::test]
    async fn test_scan_does_not_mutate() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(document("d1", "some content")).await;
        let storage: Arc<dyn DocumentStorage> = Arc::new(memory);

        let action = ScanAction::new(Arc::clone(&storage));
        let mut step = JobStep::new("scan", "scan");
        step.config.insert("max_documents".to_string(), json!(1));
        let mut ctx = context(step);
        action.execute(&mut ctx).await.unwrap();

        let doc = storage.get_document("d1").await.unwrap().unwrap();
        assert!(doc.metadata.is_empty());
    }
}
