use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing dependency: {0}")]
    DependencyMissing(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("Event delivery failed: {0}")]
    Event(String),

    #[error("Step {index} ({name}) failed: {message}")]
    StepFailed {
        index: usize,
        name: String,
        message: String,
    },

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DependencyMissing(_) => "DEPENDENCY_MISSING",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::KeyNotFound(_) => "KEY_NOT_FOUND",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Llm(_) => "LLM_ERROR",
            AppError::Event(_) => "EVENT_ERROR",
            AppError::StepFailed { .. } => "STEP_FAILED",
            AppError::Policy(_) => "POLICY_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Cancelled => "CANCELLED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
