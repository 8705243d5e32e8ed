//! CRM Common Library
//!
//! Shared utilities for the CRM ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CrmError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: SHA-256 digests for archived payloads
//!
//! # Example
//!
//! ```no_run
//! use crm_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CrmError, Result};
