use crate::registry::{StepAction, StepContext};
use async_trait::async_trait;
use chrono::Utc;
use ingest::EventBus;
use serde_json::json;
use shared::{Event, EventType};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Wakes the embedding coordinator with a single `embedding_triggered`
/// event. When the step names no explicit source filter, the resolved
/// sources become the filter.
pub struct EmbedAction {
    events: Arc<EventBus>,
}

impl EmbedAction {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StepAction for EmbedAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let force_embed = ctx.step.bool_option("force_embed", false);
        let batch_size = ctx.step.int_option("batch_size", DEFAULT_BATCH_SIZE);
        let model_name = ctx.step.string_option("model_name", "");
        let mut filter_source_ids = ctx.step.string_list_option("filter_source_ids");
        if filter_source_ids.is_empty() && !ctx.sources.is_empty() {
            filter_source_ids = ctx.sources.iter().map(|s| s.id.clone()).collect();
        }

        let mut event = Event::new(EventType::EmbeddingTriggered)
            .with("force_embed", json!(force_embed))
            .with("batch_size", json!(batch_size))
            .with("timestamp", json!(Utc::now().to_rfc3339()));
        if !model_name.is_empty() {
            event = event.with("model_name", json!(model_name));
        }
        if !filter_source_ids.is_empty() {
            event = event.with("filter_source_ids", json!(filter_source_ids));
        }

        self.events.publish(event)?;
        debug!(force_embed, "embedding triggered");
        Ok(())
    }
}
