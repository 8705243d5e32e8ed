//! Pipeline error kinds
//!
//! Every stage returns `Result<_, IngestError>`. The orchestrator decides per
//! stage whether an error ends the domain or is demoted to a warning; see
//! [`super::orchestrator::DomainStage::failure_policy`].

use serde::Serialize;
use thiserror::Error;

/// Result type for pipeline stages
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Credentials rejected (401/403). Never retried.
    #[error("Authentication rejected by {endpoint} (HTTP {status})")]
    Auth { endpoint: String, status: u16 },

    /// Network failure, timeout, 429 or 5xx. Retried with backoff.
    #[error("Transient fetch failure from {endpoint}: {message}")]
    TransientFetch {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    /// Any other rejected request (bad URL, 4xx). Not retried.
    #[error("Request to {endpoint} rejected: {message}")]
    Request {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Load into {table} failed ({rows} rows attempted): {message}")]
    Load {
        table: String,
        rows: usize,
        message: String,
    },

    #[error("Pipeline setup error: {0}")]
    Setup(String),
}

/// Error classification surfaced in run summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    TransientFetch,
    Request,
    Schema,
    Validation,
    Archive,
    Load,
    Setup,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::TransientFetch => "transient_fetch",
            ErrorKind::Request => "request",
            ErrorKind::Schema => "schema",
            ErrorKind::Validation => "validation",
            ErrorKind::Archive => "archive",
            ErrorKind::Load => "load",
            ErrorKind::Setup => "setup",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Auth { .. } => ErrorKind::Auth,
            IngestError::TransientFetch { .. } => ErrorKind::TransientFetch,
            IngestError::Request { .. } => ErrorKind::Request,
            IngestError::Schema(_) => ErrorKind::Schema,
            IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::Archive(_) => ErrorKind::Archive,
            IngestError::Load { .. } => ErrorKind::Load,
            IngestError::Setup(_) => ErrorKind::Setup,
        }
    }

    pub fn load(table: impl Into<String>, rows: usize, message: impl std::fmt::Display) -> Self {
        IngestError::Load {
            table: table.into(),
            rows,
            message: message.to_string(),
        }
    }
}

/// Errors that a [`super::retry::RetryPolicy`] may retry
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for IngestError {
    fn is_retryable(&self) -> bool {
        matches!(self, IngestError::TransientFetch { .. })
    }
}
