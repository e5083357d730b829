use crate::crawl_job::{start_crawl_job, JobCrawlOverrides};
use crate::registry::{StepAction, StepContext};
use async_trait::async_trait;
use ingest::services::CrawlerService;
use ingest::storage::AuthStorage;
use ingest::ConfigService;
use serde_json::{json, Value};
use shared::{AppError, OnError};
use std::sync::Arc;
use tracing::{error, info};

/// Starts one crawl per resolved source and deposits the returned job IDs
/// for the executor. Fire-and-forget: waiting on the children is the
/// executor's polling concern.
pub struct CrawlAction {
    crawler: Arc<dyn CrawlerService>,
    auth: Arc<dyn AuthStorage>,
    config: Arc<ConfigService>,
}

impl CrawlAction {
    pub fn new(
        crawler: Arc<dyn CrawlerService>,
        auth: Arc<dyn AuthStorage>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            crawler,
            auth,
            config,
        }
    }
}

#[async_trait]
impl StepAction for CrawlAction {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()> {
        let refresh_source = ctx.step.bool_option("refresh_source", false);
        let overrides = JobCrawlOverrides {
            max_depth: ctx.step.int_option("max_depth", 0).max(0) as u32,
            max_pages: ctx.step.int_option("max_pages", 0).max(0) as u32,
            concurrency: ctx.step.int_option("concurrency", 0).max(0) as u32,
            follow_links: ctx
                .step
                .config
                .get("follow_links")
                .and_then(Value::as_bool),
            include_patterns: ctx.step.string_list_option("include_patterns"),
            exclude_patterns: ctx.step.string_list_option("exclude_patterns"),
        };
        let app_config = self.config.get_config().await;

        let mut started: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for source in &ctx.sources {
            if ctx.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            match start_crawl_job(
                &ctx.cancel,
                source,
                self.auth.as_ref(),
                self.crawler.as_ref(),
                &app_config,
                &overrides,
                refresh_source,
                Some(&ctx.definition_id),
            )
            .await
            {
                Ok(job_id) => {
                    info!(source_id = %source.id, job_id = %job_id, "crawl started");
                    started.push(job_id);
                }
                Err(e) => {
                    error!(source_id = %source.id, error = %e, "failed to start crawl");
                    if ctx.step.on_error == OnError::Fail {
                        deposit_job_ids(ctx, &started);
                        return Err(e);
                    }
                    errors.push(format!("source '{}': {}", source.id, e));
                }
            }
        }

        deposit_job_ids(ctx, &started);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Internal(format!(
                "{} crawl start(s) failed: {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }
}

/// Append the started job IDs both to the step's `crawl_job_ids` option (an
/// ordered list) and to the context slot the executor reads after the
/// handler returns.
fn deposit_job_ids(ctx: &mut StepContext, started: &[String]) {
    if started.is_empty() {
        return;
    }
    let mut ids = ctx.step.string_list_option("crawl_job_ids");
    ids.extend(started.iter().cloned());
    ctx.step
        .config
        .insert("crawl_job_ids".to_string(), json!(ids));
    ctx.crawl_job_ids = ids;
}
