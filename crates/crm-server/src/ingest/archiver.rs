//! Raw payload archiving
//!
//! Payloads are stored verbatim under
//! `<domain>/raw/<domain>_<YYYYMMDD_HHMMSS_micros>.json`, timestamped in the domain
//! timezone. Archives are write-once: an existing key is never overwritten.

use super::error::{IngestError, Result};
use super::models::RawPayload;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

pub const CONTENT_TYPE: &str = "application/json";

#[async_trait]
pub trait RawArchiver: Send + Sync {
    /// Persist the payload and return its location key
    async fn archive(&self, payload: &RawPayload, tz: Tz) -> Result<String>;

    /// Most recent archive keys for a domain, newest first
    async fn list(&self, domain: &str, limit: usize) -> Result<Vec<String>>;
}

/// Location key for a payload fetched at `at`
pub fn archive_key<T: TimeZone>(domain: &str, at: &DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    format!("{}/raw/{}_{}.json", domain, domain, at.format("%Y%m%d_%H%M%S_%6f"))
}

fn domain_prefix(domain: &str) -> String {
    format!("{}/raw/", domain)
}

/// Archives into an S3-compatible bucket
pub struct ObjectStoreArchiver {
    storage: Storage,
}

impl ObjectStoreArchiver {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RawArchiver for ObjectStoreArchiver {
    #[instrument(skip(self, payload), fields(domain = %payload.domain()))]
    async fn archive(&self, payload: &RawPayload, tz: Tz) -> Result<String> {
        let key = archive_key(payload.domain(), &payload.fetched_at().with_timezone(&tz));
        let uploaded = self
            .storage
            .upload(&key, payload.body().to_vec(), Some(CONTENT_TYPE))
            .await
            .map_err(|e| IngestError::Archive(format!("{:#}", e)))?;

        info!(
            domain = %payload.domain(),
            key = %uploaded.key,
            bytes = uploaded.size,
            sha256 = %uploaded.checksum,
            "Archived raw payload to s3://{}",
            self.storage.bucket()
        );
        Ok(uploaded.key)
    }

    async fn list(&self, domain: &str, limit: usize) -> Result<Vec<String>> {
        let mut keys = self
            .storage
            .list(&domain_prefix(domain))
            .await
            .map_err(|e| IngestError::Archive(format!("{:#}", e)))?;
        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys.truncate(limit);
        Ok(keys)
    }
}

/// Archives into a local directory
pub struct LocalArchiver {
    root: PathBuf,
}

impl LocalArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RawArchiver for LocalArchiver {
    #[instrument(skip(self, payload), fields(domain = %payload.domain()))]
    async fn archive(&self, payload: &RawPayload, tz: Tz) -> Result<String> {
        let key = archive_key(payload.domain(), &payload.fetched_at().with_timezone(&tz));
        let path = self.root.join(&key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                IngestError::Archive(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        write_new(&path, payload.body())
            .await
            .map_err(|e| IngestError::Archive(format!("failed to write {}: {}", path.display(), e)))?;

        info!(
            domain = %payload.domain(),
            key = %key,
            bytes = payload.body().len(),
            "Archived raw payload to {}",
            path.display()
        );
        Ok(key)
    }

    async fn list(&self, domain: &str, limit: usize) -> Result<Vec<String>> {
        let dir = self.root.join(domain_prefix(domain));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(IngestError::Archive(format!(
                    "failed to read {}: {}",
                    dir.display(),
                    e
                )))
            },
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IngestError::Archive(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    keys.push(format!("{}{}", domain_prefix(domain), name));
                }
            }
        }
        keys.sort_unstable_by(|a, b| b.cmp(a));
        keys.truncate(limit);
        Ok(keys)
    }
}

async fn write_new(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(body).await?;
    file.flush().await
}
