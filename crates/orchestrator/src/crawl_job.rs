//! Validates a source, merges job-level crawl overrides with source
//! defaults and hands the crawl to the crawler subsystem.

use ingest::services::{CrawlerService, StartCrawlRequest};
use ingest::storage::AuthStorage;
use regex::Regex;
use shared::{AppConfig, AppError, CrawlerConfig, SourceConfig, SourceType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Job-step-level crawl settings. Zero (or `None`) means "use the source
/// default".
#[derive(Debug, Clone, Default)]
pub struct JobCrawlOverrides {
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrency: u32,
    pub follow_links: Option<bool>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

pub async fn start_crawl_job(
    cancel: &CancellationToken,
    source: &SourceConfig,
    auth: &dyn AuthStorage,
    crawler: &dyn CrawlerService,
    config: &AppConfig,
    overrides: &JobCrawlOverrides,
    refresh_source: bool,
    job_definition_id: Option<&str>,
) -> shared::Result<String> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    if source.base_url.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "source '{}' has no base URL",
            source.id
        )));
    }
    let parsed = Url::parse(&source.base_url)
        .map_err(|e| AppError::Validation(format!("invalid base URL '{}': {}", source.base_url, e)))?;
    let host = parsed.host_str().unwrap_or_default();
    let is_test_url = host == "localhost" || host == "127.0.0.1";
    if config.is_production() && is_test_url {
        return Err(AppError::Policy(format!(
            "test URL '{}' is not allowed in production",
            source.base_url
        )));
    }

    let source_type = SourceType::parse(&source.source_type).ok_or_else(|| {
        AppError::Validation(format!(
            "source '{}' has unsupported type '{}'",
            source.id, source.source_type
        ))
    })?;
    let entity_type = source_type.entity_type();

    let auth_creds = match &source.auth_id {
        Some(auth_id) => Some(
            auth.get_credentials_by_id(auth_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("auth credentials '{}'", auth_id)))?,
        ),
        None => None,
    };

    let crawler_config = CrawlerConfig {
        max_depth: prefer_nonzero(overrides.max_depth, source.crawl.max_depth),
        max_pages: prefer_nonzero(overrides.max_pages, source.crawl.max_pages),
        concurrency: prefer_nonzero(overrides.concurrency, source.crawl.concurrency),
        follow_links: overrides.follow_links.unwrap_or(source.crawl.follow_links),
        rate_limit_ms: source.crawl.rate_limit_ms,
        detail_level: "full".to_string(),
        retry_attempts: 3,
        retry_backoff_secs: 2,
        // Job-level patterns win when present; otherwise the source's
        // comma-delimited keyword filters are translated to regexes.
        include_patterns: if !overrides.include_patterns.is_empty() {
            overrides.include_patterns.clone()
        } else {
            keywords_to_patterns(&source.filters.include_keywords)
        },
        exclude_patterns: if !overrides.exclude_patterns.is_empty() {
            overrides.exclude_patterns.clone()
        } else {
            keywords_to_patterns(&source.filters.exclude_keywords)
        },
    };

    let seed_url = source.base_url.trim_end_matches('/').to_string();
    debug!(
        source_id = %source.id,
        seed_url = %seed_url,
        entity_type,
        "starting crawl"
    );

    let job_id = crawler
        .start_crawl(StartCrawlRequest {
            source_type: source_type.as_str().to_string(),
            entity_type: entity_type.to_string(),
            seed_urls: vec![seed_url],
            config: crawler_config,
            source_id: source.id.clone(),
            refresh_source,
            source: source.clone(),
            auth: auth_creds,
            job_definition_id: job_definition_id.map(|s| s.to_string()),
        })
        .await?;

    info!(source_id = %source.id, job_id = %job_id, "crawl job started");
    Ok(job_id)
}

fn prefer_nonzero(job_value: u32, source_value: u32) -> u32 {
    if job_value != 0 {
        job_value
    } else {
        source_value
    }
}

/// Translate a comma-delimited keyword list into regex patterns. Tokens that
/// already look like regexes (and compile) pass through verbatim; everything
/// else is quoted and wrapped in `.*`.
pub fn keywords_to_patterns(keywords: &str) -> Vec<String> {
    const REGEX_META: &[char] = &[
        '.', '+', '*', '?', '[', ']', '{', '}', '(', ')', '^', '$', '|', '\\',
    ];
    keywords
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.contains(REGEX_META) && Regex::new(token).is_ok() {
                token.to_string()
            } else {
                format!(".*{}.*", regex::escape(token))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingest::storage::memory::MemoryAuthStorage;
    use shared::{CrawlJob, CrawlResult};
    use std::sync::Mutex;

    struct RecordingCrawler {
        requests: Mutex<Vec<StartCrawlRequest>>,
    }

    impl RecordingCrawler {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CrawlerService for RecordingCrawler {
        async fn start_crawl(&self, request: StartCrawlRequest) -> shared::Result<String> {
            self.requests.lock().unwrap().push(request);
            Ok("job-1".to_string())
        }
        async fn get_job_status(&self, job_id: &str) -> shared::Result<CrawlJob> {
            Err(AppError::NotFound(job_id.to_string()))
        }
        async fn get_job_results(&self, _job_id: &str) -> shared::Result<Vec<CrawlResult>> {
            Ok(Vec::new())
        }
        async fn wait_for_job(
            &self,
            _cancel: &CancellationToken,
            _job_id: &str,
        ) -> shared::Result<Vec<CrawlResult>> {
            Ok(Vec::new())
        }
    }

    fn source(base_url: &str) -> SourceConfig {
        SourceConfig {
            id: "s1".to_string(),
            name: "Tracker".to_string(),
            source_type: "jira".to_string(),
            base_url: base_url.to_string(),
            enabled: true,
            auth_id: None,
            crawl: Default::default(),
            filters: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_start_crawl_merges_and_seeds() {
        let crawler = RecordingCrawler::new();
        let auth = MemoryAuthStorage::new();
        let cancel = CancellationToken::new();
        let mut src = source("https://issues.example.com/");
        src.crawl.max_depth = 4;
        src.filters.include_keywords = "release, ^docs/.*".to_string();

        let overrides = JobCrawlOverrides {
            max_pages: 50,
            ..Default::default()
        };
        let job_id = start_crawl_job(
            &cancel,
            &src,
            &auth,
            &crawler,
            &AppConfig::default(),
            &overrides,
            false,
            Some("def-1"),
        )
        .await
        .unwrap();
        assert_eq!(job_id, "job-1");

        let requests = crawler.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.entity_type, "projects");
        assert_eq!(request.seed_urls, vec!["https://issues.example.com"]);
        // Job override wins when non-zero, source default otherwise.
        assert_eq!(request.config.max_pages, 50);
        assert_eq!(request.config.max_depth, 4);
        assert_eq!(
            request.config.include_patterns,
            vec![".*release.*", "^docs/.*"]
        );
        assert_eq!(request.job_definition_id.as_deref(), Some("def-1"));
    }

    #[tokio::test]
    async fn test_rejects_test_url_in_production() {
        let crawler = RecordingCrawler::new();
        let auth = MemoryAuthStorage::new();
        let cancel = CancellationToken::new();
        let mut config = AppConfig::default();
        config.server.environment = "production".to_string();

        let result = start_crawl_job(
            &cancel,
            &source("http://localhost:8080"),
            &auth,
            &crawler,
            &config,
            &JobCrawlOverrides::default(),
            false,
            None,
        )
        .await;
        assert!(matches!(result, Err(AppError::Policy(_))));
    }

    #[tokio::test]
    async fn test_rejects_unknown_source_type_and_missing_url() {
        let crawler = RecordingCrawler::new();
        let auth = MemoryAuthStorage::new();
        let cancel = CancellationToken::new();

        let mut unknown = source("https://example.com");
        unknown.source_type = "gitlab".to_string();
        assert!(matches!(
            start_crawl_job(
                &cancel,
                &unknown,
                &auth,
                &crawler,
                &AppConfig::default(),
                &JobCrawlOverrides::default(),
                false,
                None,
            )
            .await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            start_crawl_job(
                &cancel,
                &source(""),
                &auth,
                &crawler,
                &AppConfig::default(),
                &JobCrawlOverrides::default(),
                false,
                None,
            )
            .await,
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_keyword_translation() {
        assert_eq!(
            keywords_to_patterns("api, guide"),
            vec![".*api.*", ".*guide.*"]
        );
        // A token with regex metacharacters that compiles is used verbatim.
        assert_eq!(keywords_to_patterns("^v[0-9]+$"), vec!["^v[0-9]+$"]);
        // One that does not compile gets quoted instead.
        assert_eq!(keywords_to_patterns("a[b"), vec![".*a\\[b.*"]);
        assert!(keywords_to_patterns(" , ,").is_empty());
    }
}
