use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller input rejected before any provider was contacted.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stage template references a placeholder with no bound value.
    #[error("Stage {stage_id} is missing input for placeholder '{{{placeholder}}}'")]
    MissingInput { stage_id: u32, placeholder: String },

    /// Lookup of a stage id that the registry does not contain.
    #[error("Unknown stage id {0}")]
    UnknownStage(u32),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text, or the provider's error message when parseable.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A single provider attempt exceeded its wall-clock budget.
    #[error("Provider call timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// The provider answered, but not with usable text.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// All transport retries were spent on transient failures.
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// The run or call was cancelled via its cancellation token.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// A pipeline stage failed. Wraps the underlying cause.
    #[error("Step {stage_id} ({stage}) failed: {source}")]
    StageFailed {
        stage_id: u32,
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`PipelineError`].
///
/// The first four kinds are transient and retried by the provider adapters;
/// everything else stops the current call immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Overloaded,
    Connection,
    Timeout,
    Authentication,
    MalformedRequest,
    InvalidResponse,
    RetriesExhausted,
    Validation,
    Configuration,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Overloaded | ErrorKind::Connection | ErrorKind::Timeout
        )
    }
}

impl PipelineError {
    /// Classify this error. `StageFailed` reports the kind of its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Request(e) => {
                if e.is_timeout() {
                    ErrorKind::Timeout
                } else if e.is_decode() || e.is_body() {
                    ErrorKind::InvalidResponse
                } else if e.is_builder() {
                    ErrorKind::Configuration
                } else {
                    ErrorKind::Connection
                }
            }
            PipelineError::Json(_) | PipelineError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::InvalidConfig(_)
            | PipelineError::MissingInput { .. }
            | PipelineError::UnknownStage(_) => ErrorKind::Configuration,
            PipelineError::HttpError { status, .. } => kind_for_status(*status),
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::StageFailed { source, .. } => source.kind(),
            PipelineError::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Stage id carried by a [`PipelineError::StageFailed`].
    pub fn failed_stage_id(&self) -> Option<u32> {
        match self {
            PipelineError::StageFailed { stage_id, .. } => Some(*stage_id),
            _ => None,
        }
    }

    /// Innermost error, unwrapping stage and retry wrappers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::StageFailed { source, .. }
            | PipelineError::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Map an HTTP status to an [`ErrorKind`].
///
/// 529 is Anthropic's "overloaded" status.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        500 | 502 | 503 | 504 | 529 => ErrorKind::Overloaded,
        401 | 403 => ErrorKind::Authentication,
        408 => ErrorKind::Timeout,
        400..=499 => ErrorKind::MalformedRequest,
        _ => ErrorKind::Internal,
    }
}

/// Serializable summary of an error, stored in stage results and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
