use super::SingleFlight;
use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use ingest::events::{handler, SubscriptionId};
use ingest::services::LlmService;
use ingest::storage::DocumentStorage;
use ingest::{EventBus, WorkerPool};
use shared::{doc_meta, AppError, Document, Event, EventType};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// A single worker serializes writes; the SQLite-backed document store does
// not take concurrent writers.
const EMBEDDING_WORKERS: usize = 1;
const EMBED_BATCH_LIMIT: usize = 100;

/// Vectorizes documents: first the force-embed backlog, then documents that
/// have never been embedded.
pub struct EmbeddingCoordinator {
    documents: Arc<dyn DocumentStorage>,
    llm: Arc<dyn LlmService>,
    default_model: String,
    events: Arc<EventBus>,
    flight: SingleFlight,
    subscription: Mutex<Option<SubscriptionId>>,
    cancel: CancellationToken,
}

impl EmbeddingCoordinator {
    pub fn new(
        documents: Arc<dyn DocumentStorage>,
        llm: Arc<dyn LlmService>,
        default_model: String,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            documents,
            llm,
            default_model,
            events,
            flight: SingleFlight::new(),
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let id = self.events.subscribe(
            EventType::EmbeddingTriggered,
            handler(move |event| {
                let weak = weak.clone();
                async move {
                    let Some(coordinator) = weak.upgrade() else {
                        return Ok(());
                    };
                    match AssertUnwindSafe(coordinator.handle(event)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!("embedding handler panicked");
                            Err(AppError::Internal(
                                "embedding handler panicked".to_string(),
                            ))
                        }
                    }
                }
            }),
        );
        *self.subscription.lock().unwrap() = Some(id);
        info!("embedding coordinator started");
    }

    /// Unsubscribe and cancel the lifecycle token; an in-flight pass aborts
    /// at its next context check.
    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().unwrap().take() {
            self.events.unsubscribe(EventType::EmbeddingTriggered, id);
        }
        self.cancel.cancel();
    }

    async fn handle(&self, event: Event) -> shared::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if self.default_model.is_empty() {
            return Err(AppError::DependencyMissing(
                "no embedding model configured".to_string(),
            ));
        }
        let Some(_guard) = self.flight.try_acquire() else {
            warn!("embedding pass already in progress, skipping trigger");
            return Ok(());
        };
        self.process(&event).await
    }

    async fn process(&self, event: &Event) -> shared::Result<()> {
        let model = match event.str_field("model_name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_model.clone(),
        };
        let filter_source_ids: HashSet<String> =
            event.string_list_field("filter_source_ids").into_iter().collect();

        // Force-embed backlog first, then never-embedded documents.
        let mut candidates = self
            .documents
            .get_documents_force_embed(EMBED_BATCH_LIMIT)
            .await?;
        let mut seen: HashSet<String> = candidates.iter().map(|d| d.id.clone()).collect();
        for doc in self
            .documents
            .get_unvectorized_documents(EMBED_BATCH_LIMIT)
            .await?
        {
            if seen.insert(doc.id.clone()) {
                candidates.push(doc);
            }
        }
        if !filter_source_ids.is_empty() {
            candidates.retain(|doc| filter_source_ids.contains(&doc.source_id));
        }
        if candidates.is_empty() {
            debug!("no documents pending embedding");
            return Ok(());
        }
        info!(count = candidates.len(), model = %model, "embedding pass starting");

        // The pool token is a child of the coordinator lifecycle, so the
        // per-document closures abort when the coordinator stops.
        let mut pool = WorkerPool::with_parent(EMBEDDING_WORKERS, &self.cancel);
        for doc in candidates {
            let documents = Arc::clone(&self.documents);
            let llm = Arc::clone(&self.llm);
            let model = model.clone();
            pool.submit(Box::new(move |cancel| {
                Box::pin(async move { embed_document(documents, llm, model, doc, cancel).await })
            }))
            .await?;
        }
        pool.wait().await;
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let errors = pool.errors();
        if errors.is_empty() {
            info!("embedding pass complete");
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "embedding pass: {} document(s) failed: {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

async fn embed_document(
    documents: Arc<dyn DocumentStorage>,
    llm: Arc<dyn LlmService>,
    model: String,
    mut doc: Document,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let embedding = llm
        .embed(&cancel, &doc.content_markdown)
        .await
        .map_err(|e| anyhow!("embed '{}': {}", doc.id, e))?;
    doc.embedding = Some(embedding);
    doc.embedding_model = Some(model);
    if doc.meta_bool(doc_meta::FORCE_EMBED_PENDING) {
        doc.metadata.remove(doc_meta::FORCE_EMBED_PENDING);
    }
    doc.updated_at = Utc::now();
    documents
        .update_document(&doc)
        .await
        .map_err(|e| anyhow!("persist '{}': {}", doc.id, e))?;
    Ok(())
}
