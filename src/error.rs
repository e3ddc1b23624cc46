use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinsightError {
    #[error("Unrecognized input shape: {0}")]
    UnknownDialect(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store temporarily unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("LLM provider rejected the request: {0}")]
    LlmProvider(String),

    #[error("LLM transient failure: {0}")]
    LlmTransient(String),

    #[error("LLM rate limited (retry after {retry_after_s:?}s)")]
    LlmRateLimited { retry_after_s: Option<u64> },

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, FinsightError>;

impl FinsightError {
    /// Stable machine-readable kind, used in boundary error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            FinsightError::UnknownDialect(_) => "unknown_dialect",
            FinsightError::Parse(_) => "parse_error",
            FinsightError::Validation(_) => "validation_error",
            FinsightError::NotFound(_) => "data_not_found",
            FinsightError::Conflict(_) => "conflict_error",
            FinsightError::StoreUnavailable(_) => "store_transient_error",
            FinsightError::Store(_) => "store_error",
            FinsightError::LlmProvider(_) => "llm_error",
            FinsightError::LlmTransient(_) => "llm_transient_error",
            FinsightError::LlmRateLimited { .. } => "llm_rate_limited",
            FinsightError::LlmUnavailable(_) => "llm_unavailable",
            FinsightError::Configuration(_) => "configuration_error",
            FinsightError::Serialization(_) => "internal_error",
            FinsightError::Io(_) => "internal_error",
            FinsightError::Internal { .. } => "internal_error",
        }
    }

    /// Whether a store-layer retry with backoff is worthwhile.
    pub fn is_transient_store(&self) -> bool {
        matches!(self, FinsightError::StoreUnavailable(_))
    }

    /// Whether an LLM-layer retry with backoff is worthwhile.
    pub fn is_transient_llm(&self) -> bool {
        matches!(
            self,
            FinsightError::LlmTransient(_) | FinsightError::LlmRateLimited { .. }
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FinsightError::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for FinsightError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let message = db.message().to_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    FinsightError::StoreUnavailable(db.message().to_string())
                } else if message.contains("unique constraint") {
                    FinsightError::Conflict(db.message().to_string())
                } else {
                    FinsightError::Store(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => {
                FinsightError::StoreUnavailable("connection pool timed out".to_string())
            }
            sqlx::Error::Io(io) => FinsightError::StoreUnavailable(io.to_string()),
            sqlx::Error::RowNotFound => FinsightError::NotFound("row not found".to_string()),
            _ => FinsightError::Store(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for FinsightError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            FinsightError::LlmTransient(err.to_string())
        } else {
            FinsightError::LlmProvider(err.to_string())
        }
    }
}
