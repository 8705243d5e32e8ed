//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CrmError>;

/// Errors raised by shared utilities and configuration parsing
#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl CrmError {
    pub fn config(message: impl Into<String>) -> Self {
        CrmError::Config(message.into())
    }
}
