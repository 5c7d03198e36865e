use serde::Serialize;
use thiserror::Error;

use crate::llm::analysis::AnalysisKind;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Errors that can occur in the analytics pipeline.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Network-level failure talking to the LLM endpoint; safe to retry on
    /// a later run since successful chats are checkpointed.
    #[error("transient call failure: {0}")]
    Transient(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Model output did not match the axis schema, even after one retry
    #[error("{kind} response failed schema validation: {}", .violations.join("; "))]
    SchemaValidation {
        kind: AnalysisKind,
        violations: Vec<String>,
    },

    /// The upstream returned 429 despite rate-budget enforcement. Should not
    /// happen when the budget ceiling matches the external quota.
    #[error("upstream rate limit hit despite budget enforcement")]
    RateLimitExceeded,

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A chunked write aborted partway; `committed` rows made it to storage.
    #[error("storage write failed after {committed} rows: {source}")]
    StorageWrite {
        committed: u64,
        #[source]
        source: anyhow::Error,
    },

    /// Cache backend unreachable. Never fatal: callers degrade to no-cache.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chat had no messages to analyze
    #[error("chat {0} has no messages")]
    EmptyChat(String),

    /// Chat record failed validation on ingestion
    #[error("invalid chat record: {0}")]
    InvalidChat(String),

    /// Internal error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse failure classification recorded per chat in a batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    SchemaValidation,
    EmptyChat,
    RateLimit,
    Cache,
    Storage,
    Other,
}

impl ParleyError {
    /// Classify this error for per-chat failure accounting.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) | Self::Http(_) => FailureKind::Transient,
            Self::SchemaValidation { .. } => FailureKind::SchemaValidation,
            Self::EmptyChat(_) => FailureKind::EmptyChat,
            Self::RateLimitExceeded => FailureKind::RateLimit,
            Self::CacheUnavailable(_) => FailureKind::Cache,
            Self::StorageWrite { .. } => FailureKind::Storage,
            #[cfg(feature = "postgres")]
            Self::Database(_) => FailureKind::Storage,
            Self::Json(_) | Self::InvalidChat(_) | Self::Other(_) => FailureKind::Other,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::SchemaValidation => "schema_validation",
            Self::EmptyChat => "empty_chat",
            Self::RateLimit => "rate_limit",
            Self::Cache => "cache",
            Self::Storage => "storage",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}
