use super::SingleFlight;
use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use ingest::events::{handler, SubscriptionId};
use ingest::services::SourceScraper;
use ingest::storage::DocumentStorage;
use ingest::{EventBus, WorkerPool};
use shared::{doc_meta, AppError, Event, EventType};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COLLECTION_WORKERS: usize = 10;

/// Refreshes documents flagged `force_sync_pending` by re-fetching them
/// through the per-source-type scrapers.
pub struct CollectionCoordinator {
    documents: Arc<dyn DocumentStorage>,
    scrapers: HashMap<String, Arc<dyn SourceScraper>>,
    events: Arc<EventBus>,
    flight: SingleFlight,
    subscription: Mutex<Option<SubscriptionId>>,
    cancel: CancellationToken,
}

impl CollectionCoordinator {
    pub fn new(
        documents: Arc<dyn DocumentStorage>,
        scrapers: HashMap<String, Arc<dyn SourceScraper>>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            documents,
            scrapers,
            events,
            flight: SingleFlight::new(),
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to `collection_triggered`. The handler recovers panics to
    /// satisfy the bus contract.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let id = self.events.subscribe(
            EventType::CollectionTriggered,
            handler(move |event| {
                let weak = weak.clone();
                async move {
                    let Some(coordinator) = weak.upgrade() else {
                        return Ok(());
                    };
                    match AssertUnwindSafe(coordinator.handle(event)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!("collection handler panicked");
                            Err(AppError::Internal(
                                "collection handler panicked".to_string(),
                            ))
                        }
                    }
                }
            }),
        );
        *self.subscription.lock().unwrap() = Some(id);
        info!("collection coordinator started");
    }

    /// Unsubscribe and cancel the lifecycle token; an in-flight pass aborts
    /// at its next context check.
    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().unwrap().take() {
            self.events.unsubscribe(EventType::CollectionTriggered, id);
        }
        self.cancel.cancel();
    }

    async fn handle(&self, event: Event) -> shared::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if self.scrapers.is_empty() {
            return Err(AppError::DependencyMissing(
                "no source scrapers configured".to_string(),
            ));
        }
        let Some(_guard) = self.flight.try_acquire() else {
            warn!("collection pass already in progress, skipping trigger");
            return Ok(());
        };
        self.process(&event).await
    }

    async fn process(&self, event: &Event) -> shared::Result<()> {
        let source_filter = event.str_field("source_id").map(|s| s.to_string());
        let mut candidates = self.documents.get_documents_force_sync().await?;
        if let Some(source_id) = &source_filter {
            candidates.retain(|doc| &doc.source_id == source_id);
        }
        if candidates.is_empty() {
            debug!("no documents pending collection");
            return Ok(());
        }
        info!(count = candidates.len(), "collection pass starting");

        // The pool token is a child of the coordinator lifecycle, so the
        // per-document closures abort when the coordinator stops.
        let mut pool = WorkerPool::with_parent(COLLECTION_WORKERS, &self.cancel);
        for doc in candidates {
            let Some(scraper) = self.scrapers.get(&doc.source_type).map(Arc::clone) else {
                warn!(doc_id = %doc.id, source_type = %doc.source_type, "no scraper for source type");
                continue;
            };
            let documents = Arc::clone(&self.documents);
            pool.submit(Box::new(move |cancel| {
                Box::pin(async move {
                    let mut refreshed = scraper
                        .refresh_document(&cancel, &doc)
                        .await
                        .map_err(|e| anyhow!("refresh '{}': {}", doc.id, e))?;
                    refreshed.last_synced = Some(Utc::now());
                    refreshed.metadata.remove(doc_meta::FORCE_SYNC_PENDING);
                    refreshed.updated_at = Utc::now();
                    documents
                        .update_document(&refreshed)
                        .await
                        .map_err(|e| anyhow!("persist '{}': {}", refreshed.id, e))?;
                    Ok(())
                })
            }))
            .await?;
        }
        pool.wait().await;
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let errors = pool.errors();
        if errors.is_empty() {
            info!("collection pass complete");
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "collection pass: {} document(s) failed: {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingest::storage::memory::MemoryDocumentStorage;
    use serde_json::json;
    use shared::Document;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct SlowScraper {
        refreshed: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl SourceScraper for SlowScraper {
        async fn refresh_document(
            &self,
            _cancel: &CancellationToken,
            doc: &Document,
        ) -> shared::Result<Document> {
            tokio::time::sleep(self.delay).await;
            self.refreshed.fetch_add(1, Ordering::SeqCst);
            let mut refreshed = doc.clone();
            refreshed.title = Some("refreshed".to_string());
            Ok(refreshed)
        }
    }

    fn pending_doc(id: &str, source_type: &str) -> Document {
        let now = Utc::now();
        let mut metadata = serde_json::Map::new();
        metadata.insert(doc_meta::FORCE_SYNC_PENDING.to_string(), json!(true));
        Document {
            id: id.to_string(),
            source_type: source_type.to_string(),
            source_id: "s1".to_string(),
            url: None,
            title: None,
            content_markdown: "content".to_string(),
            metadata,
            embedding: None,
            embedding_model: None,
            last_synced: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_refreshes_and_clears_flag() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(pending_doc("d1", "jira")).await;
        memory.insert(pending_doc("d2", "jira")).await;
        let documents: Arc<dyn DocumentStorage> = Arc::new(memory);

        let scraper = Arc::new(SlowScraper {
            refreshed: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
        scrapers.insert("jira".to_string(), Arc::clone(&scraper) as Arc<dyn SourceScraper>);

        let events = Arc::new(EventBus::new());
        let coordinator =
            CollectionCoordinator::new(Arc::clone(&documents), scrapers, Arc::clone(&events));
        coordinator.start();

        events
            .publish_sync(Event::new(EventType::CollectionTriggered))
            .await
            .unwrap();

        assert_eq!(scraper.refreshed.load(Ordering::SeqCst), 2);
        let d1 = documents.get_document("d1").await.unwrap().unwrap();
        assert!(!d1.meta_bool(doc_meta::FORCE_SYNC_PENDING));
        assert!(d1.last_synced.is_some());
        assert_eq!(d1.title.as_deref(), Some("refreshed"));
    }

    #[tokio::test]
    async fn test_single_flight_skips_concurrent_trigger() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(pending_doc("d1", "jira")).await;
        let documents: Arc<dyn DocumentStorage> = Arc::new(memory);

        let scraper = Arc::new(SlowScraper {
            refreshed: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });
        let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
        scrapers.insert("jira".to_string(), Arc::clone(&scraper) as Arc<dyn SourceScraper>);

        let events = Arc::new(EventBus::new());
        let coordinator =
            CollectionCoordinator::new(Arc::clone(&documents), scrapers, Arc::clone(&events));
        coordinator.start();

        // First trigger runs async; the second arrives while it is busy.
        events
            .publish(Event::new(EventType::CollectionTriggered))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        events
            .publish_sync(Event::new(EventType::CollectionTriggered))
            .await
            .unwrap();
        assert_eq!(scraper.refreshed.load(Ordering::SeqCst), 0);

        // After the first pass finishes the flag is unstuck and a third
        // trigger processes again.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scraper.refreshed.load(Ordering::SeqCst), 1);

        let mut d1 = documents.get_document("d1").await.unwrap().unwrap();
        d1.metadata
            .insert(doc_meta::FORCE_SYNC_PENDING.to_string(), json!(true));
        documents.update_document(&d1).await.unwrap();
        events
            .publish_sync(Event::new(EventType::CollectionTriggered))
            .await
            .unwrap();
        assert_eq!(scraper.refreshed.load(Ordering::SeqCst), 2);
    }

    /// Blocks until cancelled; refreshes only if the sleep wins.
    struct BlockingScraper {
        refreshed: AtomicUsize,
    }

    #[async_trait]
    impl SourceScraper for BlockingScraper {
        async fn refresh_document(
            &self,
            cancel: &CancellationToken,
            doc: &Document,
        ) -> shared::Result<Document> {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
            self.refreshed.fetch_add(1, Ordering::SeqCst);
            Ok(doc.clone())
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_pass() {
        let memory = MemoryDocumentStorage::new();
        memory.insert(pending_doc("d1", "jira")).await;
        let documents: Arc<dyn DocumentStorage> = Arc::new(memory);

        let scraper = Arc::new(BlockingScraper {
            refreshed: AtomicUsize::new(0),
        });
        let mut scrapers: HashMap<String, Arc<dyn SourceScraper>> = HashMap::new();
        scrapers.insert("jira".to_string(), Arc::clone(&scraper) as Arc<dyn SourceScraper>);

        let events = Arc::new(EventBus::new());
        let coordinator =
            CollectionCoordinator::new(Arc::clone(&documents), scrapers, Arc::clone(&events));
        coordinator.start();

        events
            .publish(Event::new(EventType::CollectionTriggered))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The pass aborted cooperatively: nothing refreshed, flag intact.
        assert_eq!(scraper.refreshed.load(Ordering::SeqCst), 0);
        let d1 = documents.get_document("d1").await.unwrap().unwrap();
        assert!(d1.meta_bool(doc_meta::FORCE_SYNC_PENDING));
    }

    #[tokio::test]
    async fn test_missing_scrapers_fail_fast() {
        let documents: Arc<dyn DocumentStorage> = Arc::new(MemoryDocumentStorage::new());
        let events = Arc::new(EventBus::new());
        let coordinator =
            CollectionCoordinator::new(Arc::clone(&documents), HashMap::new(), Arc::clone(&events));
        coordinator.start();

        let result = events
            .publish_sync(Event::new(EventType::CollectionTriggered))
            .await;
        assert!(matches!(result, Err(AppError::DependencyMissing(_))));
    }
}
