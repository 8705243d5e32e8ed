//! CRM ingestion pipeline
//!
//! # Architecture
//!
//! - **fetcher**: authenticated GET with bounded retry ([`retry::RetryPolicy`])
//! - **archiver**: verbatim raw payload snapshots (S3-compatible or local directory)
//! - **normalizer**: payload to [`models::RecordSet`] with renamed, typed columns
//! - **validator**: schema completeness and data quality findings
//! - **loader**: replace or append-with-schema-evolution into the warehouse
//! - **orchestrator**: runs the stages per domain and builds the [`summary::RunSummary`]
//!
//! Domains are described by [`config::DomainConfig`] entries loaded from a TOML
//! file; one [`orchestrator::Pipeline`] runs them all.

pub mod archiver;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod retry;
pub mod summary;
pub mod validator;

pub use archiver::{LocalArchiver, ObjectStoreArchiver, RawArchiver};
pub use config::{DomainConfig, IngestConfig, LoadMode};
pub use error::{ErrorKind, IngestError};
pub use fetcher::{Fetcher, HttpFetcher};
pub use loader::{LoadOutcome, MemoryWarehouse, PostgresLoader, TableLoader};
pub use models::{RawPayload, RecordSet, Value};
pub use orchestrator::{DomainStage, Pipeline};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use summary::{DomainResult, DomainStatus, OverallStatus, RunSummary};
