use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub crawler: CrawlerSettings,
    pub sources: SourceToggles,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub database_path: String,
    pub document_index_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub mode: String,
    pub endpoint: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlerSettings {
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrency: u32,
    pub rate_limit_ms: u64,
    pub follow_links: bool,
    pub polling_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceToggles {
    pub jira_enabled: bool,
    pub confluence_enabled: bool,
    pub github_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                environment: "development".to_string(),
            },
            storage: StorageConfig {
                database_path: "data/ingest.db".to_string(),
                document_index_path: "data/index".to_string(),
            },
            llm: LlmConfig {
                mode: "local".to_string(),
                endpoint: "http://localhost:11434".to_string(),
                chat_model: "llama3".to_string(),
                embedding_model: "nomic-embed-text".to_string(),
                api_key: String::new(),
                timeout_secs: 60,
            },
            crawler: CrawlerSettings {
                max_depth: 3,
                max_pages: 500,
                concurrency: 4,
                rate_limit_ms: 500,
                follow_links: true,
                polling_timeout_secs: 1800,
            },
            sources: SourceToggles {
                jira_enabled: true,
                confluence_enabled: true,
                github_enabled: true,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, crate::AppError> {
        let defaults = Self::default();
        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|e| crate::AppError::Config(format!("Invalid SERVER_PORT: {}", e)))?,
                environment: env::var("APP_ENVIRONMENT").unwrap_or(defaults.server.environment),
            },
            storage: StorageConfig {
                database_path: env::var("DATABASE_PATH").unwrap_or(defaults.storage.database_path),
                document_index_path: env::var("DOCUMENT_INDEX_PATH")
                    .unwrap_or(defaults.storage.document_index_path),
            },
            llm: LlmConfig {
                mode: env::var("LLM_MODE").unwrap_or(defaults.llm.mode),
                endpoint: env::var("LLM_ENDPOINT").unwrap_or(defaults.llm.endpoint),
                chat_model: env::var("LLM_CHAT_MODEL").unwrap_or(defaults.llm.chat_model),
                embedding_model: env::var("LLM_EMBEDDING_MODEL")
                    .unwrap_or(defaults.llm.embedding_model),
                api_key: env::var("LLM_API_KEY").unwrap_or_default(),
                timeout_secs: env::var("LLM_TIMEOUT")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            },
            crawler: CrawlerSettings {
                max_depth: env::var("CRAWLER_MAX_DEPTH")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                max_pages: env::var("CRAWLER_MAX_PAGES")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .unwrap_or(500),
                concurrency: env::var("CRAWLER_CONCURRENCY")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4),
                rate_limit_ms: env::var("CRAWLER_RATE_LIMIT_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .unwrap_or(500),
                follow_links: env::var("CRAWLER_FOLLOW_LINKS")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                polling_timeout_secs: env::var("CRAWLER_POLLING_TIMEOUT")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .unwrap_or(1800),
            },
            sources: SourceToggles {
                jira_enabled: env::var("SOURCE_JIRA_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                confluence_enabled: env::var("SOURCE_CONFLUENCE_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                github_enabled: env::var("SOURCE_GITHUB_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
            },
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self, crate::AppError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| crate::AppError::Config(format!("Invalid config file {:?}: {}", path, e)))
    }

    pub fn is_production(&self) -> bool {
        self.server.environment.eq_ignore_ascii_case("production")
    }
}
