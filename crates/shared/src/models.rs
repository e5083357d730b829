use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

// Custom enum types

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Crawler,
    Summarizer,
    Custom,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Crawler => "crawler",
            JobKind::Summarizer => "summarizer",
            JobKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobOwnership {
    System,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: a job never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Jira,
    Confluence,
    Github,
}

impl SourceType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jira" => Some(SourceType::Jira),
            "confluence" => Some(SourceType::Confluence),
            "github" => Some(SourceType::Github),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Jira => "jira",
            SourceType::Confluence => "confluence",
            SourceType::Github => "github",
        }
    }

    /// The entity namespace this source type crawls.
    pub fn entity_type(&self) -> &'static str {
        match self {
            SourceType::Jira => "projects",
            SourceType::Confluence => "spaces",
            SourceType::Github => "repos",
        }
    }
}

// Job definitions (user-authored workflow templates)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub ownership: JobOwnership,
    pub steps: Vec<JobStep>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub validation_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl JobDefinition {
    /// Structural validation applied at intake. Registry lookups happen
    /// later, at execution time, because handlers may be registered after
    /// the definition is stored.
    pub fn validate(&self) -> crate::Result<()> {
        if self.steps.is_empty() {
            return Err(crate::AppError::Validation(format!(
                "job definition '{}' has no steps",
                self.id
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.action.trim().is_empty() {
                return Err(crate::AppError::Validation(format!(
                    "step {} of '{}' has an empty action",
                    i, self.id
                )));
            }
            if step.on_error == OnError::Retry {
                let retries = step.int_option("max_retries", RetryPolicy::DEFAULT_MAX_RETRIES as i64);
                if retries <= 0 {
                    return Err(crate::AppError::Validation(format!(
                        "step {} of '{}' uses on_error=retry with max_retries={}",
                        i, self.id, retries
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub on_error: OnError,
}

impl JobStep {
    pub fn new(name: &str, action: &str) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            config: Map::new(),
            on_error: OnError::Fail,
        }
    }

    /// Step config arrives either from JSON intake (where integers decay to
    /// floats) or from typed source code. The accessors below coerce
    /// tolerantly and fall back to the supplied default on any mismatch.
    pub fn bool_option(&self, key: &str, default: bool) -> bool {
        match self.config.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn int_option(&self, key: &str, default: i64) -> i64 {
        match self.config.get(key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    i
                } else if let Some(f) = n.as_f64() {
                    f as i64
                } else {
                    default
                }
            }
            _ => default,
        }
    }

    pub fn float_option(&self, key: &str, default: f64) -> f64 {
        match self.config.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    pub fn string_option(&self, key: &str, default: &str) -> String {
        match self.config.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    pub fn string_list_option(&self, key: &str) -> Vec<String> {
        match self.config.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Durations accept integer seconds, fractional seconds, or a suffixed
    /// string such as "500ms", "2s", "1m" or "1h".
    pub fn duration_option(&self, key: &str, default: Duration) -> Duration {
        match self.config.get(key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    if i >= 0 {
                        return Duration::from_secs(i as u64);
                    }
                } else if let Some(f) = n.as_f64() {
                    if f >= 0.0 {
                        return Duration::from_secs_f64(f);
                    }
                }
                default
            }
            Some(Value::String(s)) => parse_duration(s).unwrap_or(default),
            _ => default,
        }
    }
}

/// Parse a duration literal: a bare number means seconds, otherwise the
/// suffixes ms, s, m and h are recognized.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = digits.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    match unit.trim() {
        "ms" => Some(Duration::from_secs_f64(value / 1000.0)),
        "s" => Some(Duration::from_secs_f64(value)),
        "m" => Some(Duration::from_secs_f64(value * 60.0)),
        "h" => Some(Duration::from_secs_f64(value * 3600.0)),
        _ => None,
    }
}

/// Exponential backoff shape for `on_error = retry` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Read the retry shape from step config, falling back to the default
    /// `(3, 2s, 60s, x2)` per missing field.
    pub fn from_step(step: &JobStep) -> Self {
        let defaults = Self::default();
        let max_retries = step.int_option("max_retries", defaults.max_retries as i64);
        Self {
            max_retries: if max_retries > 0 {
                max_retries as u32
            } else {
                defaults.max_retries
            },
            initial_backoff: step.duration_option("initial_backoff", defaults.initial_backoff),
            max_backoff: step.duration_option("max_backoff", defaults.max_backoff),
            multiplier: step.float_option("backoff_multiplier", defaults.multiplier),
        }
    }

    /// Delay before retry number `retry_index + 1`. The first backoff is the
    /// initial delay, each following one multiplies, capped at the maximum.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.powi(retry_index as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

// Source configuration (external endpoints the crawler targets)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_id: Option<String>,
    #[serde(default)]
    pub crawl: CrawlDefaults,
    #[serde(default)]
    pub filters: FilterKeywords,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlDefaults {
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrency: u32,
    pub rate_limit_ms: u64,
    pub follow_links: bool,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 500,
            concurrency: 4,
            rate_limit_ms: 500,
            follow_links: true,
        }
    }
}

/// Comma-delimited keyword filters, translated to regex patterns when a
/// crawl is started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterKeywords {
    #[serde(default)]
    pub include_keywords: String,
    #[serde(default)]
    pub exclude_keywords: String,
}

// Crawl jobs (one instance of crawling one source)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub job_definition_id: Option<String>,
    pub name: String,
    pub source_type: String,
    pub entity_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: CrawlProgress,
    #[serde(default)]
    pub error: Option<String>,
    /// Snapshots taken at start so a live config reload does not change
    /// in-flight behavior.
    #[serde(default)]
    pub source_snapshot: Option<SourceConfig>,
    #[serde(default)]
    pub auth_snapshot: Option<AuthCredentials>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub total_urls: u64,
    pub completed_urls: u64,
    pub failed_urls: u64,
    pub pending_urls: u64,
    pub percentage: f64,
    #[serde(default)]
    pub current_url: Option<String>,
}

impl CrawlProgress {
    pub fn recalculate(&mut self) {
        let total = self.total_urls.max(1);
        self.percentage = (self.completed_urls as f64 / total as f64) * 100.0;
    }
}

/// The merged per-crawl configuration handed to the crawler subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrency: u32,
    pub follow_links: bool,
    pub rate_limit_ms: u64,
    pub detail_level: String,
    pub retry_attempts: u32,
    pub retry_backoff_secs: u64,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub id: String,
    pub auth_type: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// One crawled page, as produced by the crawler subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// Documents (transformed artifacts; the core reads and writes metadata)

pub mod doc_meta {
    pub const SUMMARY: &str = "summary";
    pub const KEYWORDS: &str = "keywords";
    pub const WORD_COUNT: &str = "word_count";
    pub const LAST_SUMMARIZED: &str = "last_summarized";
    pub const LAST_KEYWORD_EXTRACTION: &str = "last_keyword_extraction";
    pub const FORCE_SYNC_PENDING: &str = "force_sync_pending";
    pub const FORCE_EMBED_PENDING: &str = "force_embed_pending";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub content_markdown: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn meta_bool(&self, key: &str) -> bool {
        matches!(self.metadata.get(key), Some(Value::Bool(true)))
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Non-empty keyword list check used by the skip rules.
    pub fn has_keywords(&self) -> bool {
        matches!(self.metadata.get(doc_meta::KEYWORDS), Some(Value::Array(items)) if !items.is_empty())
    }
}

// Events (typed in-process envelopes)

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    KeyUpdated,
    CollectionTriggered,
    EmbeddingTriggered,
    JobProgress,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::KeyUpdated => "key_updated",
            EventType::CollectionTriggered => "collection_triggered",
            EventType::EmbeddingTriggered => "embedding_triggered",
            EventType::JobProgress => "job_progress",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn bool_field(&self, key: &str, default: bool) -> bool {
        match self.payload.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn int_field(&self, key: &str, default: i64) -> i64 {
        match self.payload.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            _ => default,
        }
    }

    pub fn string_list_field(&self, key: &str) -> Vec<String> {
        match self.payload.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}
