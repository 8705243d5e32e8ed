//! CRM Server Library
//!
//! Pulls account and call-activity records from a CRM HTTP API, normalizes and
//! validates them, archives the raw payloads and loads the results into a
//! warehouse table.
//!
//! # Overview
//!
//! - **Ingestion pipeline** ([`ingest`]): fetch with retry, normalize, validate,
//!   archive and load, one domain at a time or concurrently
//! - **HTTP API** ([`api`]): trigger endpoint returning the run summary, health check
//! - **Storage Backend** ([`storage`]): S3-compatible object storage for raw snapshots
//! - **Configuration** ([`config`]): environment-based settings plus a TOML
//!   file describing the CRM domains
//! - **Middleware** ([`middleware`]): CORS and request logging
//!
//! # Example
//!
//! ```no_run
//! use crm_server::{app, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pipeline = app::build_pipeline(&config).await?;
//!     let summary = pipeline.run().await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod storage;

// Re-export commonly used types
pub use error::AppError;
