//! Error types for the mail triage service.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail store error: {0}")]
    MailStore(#[from] MailStoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Folder resolution error: {0}")]
    PathResolution(#[from] PathResolutionError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),

    #[error("Invalid markup pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to load prompt template: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a `MailStore` backend.
#[derive(Debug, thiserror::Error)]
pub enum MailStoreError {
    #[error("Folder '{name}' already exists")]
    Conflict { name: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for MailStoreError {
    fn from(e: reqwest::Error) -> Self {
        MailStoreError::Request(e.to_string())
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Failure to turn a folder path into a folder id.
///
/// `Clone` so that a single in-flight resolution can report the same
/// failure to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathResolutionError {
    #[error("Folder path '{path}' has no segments")]
    EmptyPath { path: String },

    #[error("Folder '{segment}' in '{path}' conflicted on create but could not be found")]
    ConflictUnresolved { path: String, segment: String },

    #[error("Failed to create folder '{segment}' in '{path}': {reason}")]
    CreateFailed {
        path: String,
        segment: String,
        reason: String,
    },

    #[error("Folder '{segment}' in '{path}' does not exist")]
    NotFound { path: String, segment: String },

    #[error("Mail store error while resolving '{path}': {reason}")]
    Transport { path: String, reason: String },
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Errors raised inside a processing cycle.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Cycle cancelled")]
    Cancelled,

    #[error("Source folder unavailable: {0}")]
    SourceFolder(#[from] PathResolutionError),

    #[error("Fetch failed: {0}")]
    Fetch(MailStoreError),

    #[error("Tagging message {message_id} failed: {source}")]
    Tag {
        message_id: String,
        #[source]
        source: MailStoreError,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
