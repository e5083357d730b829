use crate::registry::{StepAction, StepContext};
use async_trait::async_trait;
use chrono::Utc;
use ingest::EventBus;
use serde_json::json;
use shared::{Event, EventType};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Wakes the collection coordinator: one `collection_triggered` event per
/// resolved source, or a single unfiltered event when the definition names
/// none.
pub struct TransformAction {
    events: Arc<EventBus>,
}

impl TransformAction {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StepAction for TransformAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let force_sync = ctx.step.bool_option("force_sync", false);
        let batch_size = ctx.step.int_option("batch_size", DEFAULT_BATCH_SIZE);
        let timestamp = Utc::now().to_rfc3339();

        if ctx.sources.is_empty() {
            let event = Event::new(EventType::CollectionTriggered)
                .with("job_id", json!(ctx.definition_id))
                .with("force_sync", json!(force_sync))
                .with("batch_size", json!(batch_size))
                .with("timestamp", json!(timestamp));
            self.events.publish(event)?;
            debug!("collection triggered without source filter");
            return Ok(());
        }

        for source in &ctx.sources {
            let event = Event::new(EventType::CollectionTriggered)
                .with("job_id", json!(ctx.definition_id))
                .with("source_id", json!(source.id))
                .with("source_type", json!(source.source_type))
                .with("force_sync", json!(force_sync))
                .with("batch_size", json!(batch_size))
                .with("timestamp", json!(timestamp));
            self.events.publish(event)?;
            debug!(source_id = %source.id, "collection triggered");
        }
        Ok(())
    }
}
