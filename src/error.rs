//! Error types for chat-relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Correlation store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging platform errors.
///
/// The dispatch layer reacts to the specific variants: `RateLimited` is
/// retried, `MessageNotModified` and `MessageIdInvalid` are reported and
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Message is not modified")]
    MessageNotModified,

    #[error("Message id is invalid or the message no longer exists")]
    MessageIdInvalid,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Whether the call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Translation service errors.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Translation request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid translation response: {0}")]
    InvalidResponse(String),
}

/// Forwarder registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Forwarder for target {target} not found")]
    NotFound { target: i64 },

    #[error("Target {target} is already used by another forwarder")]
    DuplicateTarget { target: i64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to persist rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rule file is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
