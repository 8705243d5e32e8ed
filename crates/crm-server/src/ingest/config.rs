//! Ingestion configuration
//!
//! Two layers:
//! - [`IngestConfig`]: process-wide settings read from the environment (retry
//!   policy, concurrency, archive and warehouse backends, schedule).
//! - [`DomainConfig`]: one entry per CRM domain, read from a TOML file. Secrets
//!   are never written in the file; entries name the environment variables that
//!   hold them (`api_key_env`, `password_env`, `token_env`).

use super::retry::RetryPolicy;
use anyhow::Context;
use chrono_tz::Tz;
use crm_common::CrmError;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Domain configuration
// ============================================================================

/// How the loader writes a record set into its table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Drop and recreate the table from the incoming schema
    #[default]
    Replace,
    /// Create if absent, add new columns, append rows
    Append,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Replace => "replace",
            LoadMode::Append => "append",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericType {
    Integer,
    Float,
}

/// Inclusive numeric range; either side may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericBound {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl NumericBound {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Geographic box used by the coordinate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    #[serde(default = "default_lat_field")]
    pub lat_field: String,
    #[serde(default = "default_lon_field")]
    pub lon_field: String,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

fn default_lat_field() -> String {
    "latitude".to_string()
}

fn default_lon_field() -> String {
    "longitude".to_string()
}

impl GeoBounds {
    /// Province of Ontario
    pub fn ontario() -> Self {
        Self {
            lat_field: default_lat_field(),
            lon_field: default_lon_field(),
            min_lat: 41.6,
            max_lat: 57.0,
            min_lon: -95.2,
            max_lon: -74.3,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Data quality rules applied by the validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Columns that must exist in the record set (hard failure)
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Columns whose values must be present in every row (warning)
    #[serde(default)]
    pub critical_fields: Vec<String>,
    /// Allowed value sets per column (warning)
    #[serde(default)]
    pub allowed_values: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub numeric_bounds: BTreeMap<String, NumericBound>,
    #[serde(default)]
    pub geo_bounds: Option<GeoBounds>,
    /// Maximum number of offending values reported per finding
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_sample_size() -> usize {
    5
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            critical_fields: Vec::new(),
            allowed_values: BTreeMap::new(),
            numeric_bounds: BTreeMap::new(),
            geo_bounds: None,
            sample_size: default_sample_size(),
        }
    }
}

/// A credential value that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Transport credentials sent alongside the API key
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Credentials {
    #[default]
    None,
    Basic { username: String, password: Secret },
    Bearer { token: Secret },
}

/// Fully resolved configuration for one CRM domain
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub id: String,
    pub endpoint: String,
    pub api_key: Option<Secret>,
    /// Fixed query parameters sent with every request
    pub query: BTreeMap<String, String>,
    pub credentials: Credentials,
    /// Field holding the row array when the payload is an object
    pub records_field: Option<String>,
    pub table: String,
    pub load_mode: LoadMode,
    /// Source field name -> destination column name
    pub rename: BTreeMap<String, String>,
    pub primary_key: Option<String>,
    // Coercion lists use destination (post-rename) column names.
    pub date_fields: Vec<String>,
    pub numeric_fields: BTreeMap<String, NumericType>,
    pub text_fields: Vec<String>,
    pub timezone: Tz,
    pub validation: ValidationRules,
}

impl DomainConfig {
    /// Minimal domain: no transformations, replace mode, UTC
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            api_key: None,
            query: BTreeMap::new(),
            credentials: Credentials::None,
            records_field: None,
            table: table.into(),
            load_mode: LoadMode::Replace,
            rename: BTreeMap::new(),
            primary_key: None,
            date_fields: Vec::new(),
            numeric_fields: BTreeMap::new(),
            text_fields: Vec::new(),
            timezone: Tz::UTC,
            validation: ValidationRules::default(),
        }
    }

    /// Required columns including the primary key
    pub fn required_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self
            .validation
            .required_fields
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(pk) = self.primary_key.as_deref() {
            if !cols.contains(&pk) {
                cols.push(pk);
            }
        }
        cols
    }
}

/// Credentials as written in the domains file
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsSpec {
    Basic {
        username: String,
        password_env: String,
    },
    Bearer {
        token_env: String,
    },
}

/// One `[[domains]]` entry of the domains file
#[derive(Debug, Clone, Deserialize)]
pub struct DomainSpec {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: Option<CredentialsSpec>,
    #[serde(default)]
    pub records_field: Option<String>,
    pub table: String,
    #[serde(default)]
    pub load_mode: LoadMode,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub date_fields: Vec<String>,
    #[serde(default)]
    pub numeric_fields: BTreeMap<String, NumericType>,
    #[serde(default)]
    pub text_fields: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub validation: ValidationRules,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Deserialize)]
struct DomainsFile {
    #[serde(default)]
    domains: Vec<DomainSpec>,
}

impl DomainSpec {
    /// Resolve secrets and the timezone, producing a runnable domain
    pub fn resolve<F>(self, env: F) -> crm_common::Result<DomainConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env(name).ok_or_else(|| CrmError::MissingEnv(name.to_string()));

        validate_table_name(&self.table)?;

        let timezone = self.timezone.parse::<Tz>().map_err(|e| {
            CrmError::config(format!(
                "domain '{}' has invalid timezone '{}': {}",
                self.id, self.timezone, e
            ))
        })?;

        let api_key = self
            .api_key_env
            .as_deref()
            .map(|name| lookup(name).map(Secret::new))
            .transpose()?;

        let credentials = match &self.credentials {
            None => Credentials::None,
            Some(CredentialsSpec::Basic {
                username,
                password_env,
            }) => Credentials::Basic {
                username: username.clone(),
                password: Secret::new(lookup(password_env)?),
            },
            Some(CredentialsSpec::Bearer { token_env }) => Credentials::Bearer {
                token: Secret::new(lookup(token_env)?),
            },
        };

        Ok(DomainConfig {
            id: self.id,
            endpoint: self.endpoint,
            api_key,
            query: self.query,
            credentials,
            records_field: self.records_field,
            table: self.table,
            load_mode: self.load_mode,
            rename: self.rename,
            primary_key: self.primary_key,
            date_fields: self.date_fields,
            numeric_fields: self.numeric_fields,
            text_fields: self.text_fields,
            timezone,
            validation: self.validation,
        })
    }
}

/// Table names are `name` or `schema.name` with plain SQL identifier parts
pub fn validate_table_name(table: &str) -> crm_common::Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(CrmError::InvalidIdentifier(table.to_string()))
    }
}

/// Parse domain definitions from TOML text, resolving secrets through `env`
pub fn parse_domains<F>(toml: &str, env: F) -> crm_common::Result<Vec<DomainConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let file: DomainsFile = Figment::from(Toml::string(toml))
        .extract()
        .map_err(|e| CrmError::config(format!("invalid domains definition: {}", e)))?;
    file.domains.into_iter().map(|spec| spec.resolve(&env)).collect()
}

/// Load domain definitions from a TOML file, resolving secrets from the process environment
pub fn load_domains(path: &Path) -> crm_common::Result<Vec<DomainConfig>> {
    if !path.exists() {
        return Err(CrmError::config(format!(
            "domains file not found: {}",
            path.display()
        )));
    }
    let file: DomainsFile = Figment::from(Toml::file(path))
        .extract()
        .map_err(|e| CrmError::config(format!("invalid domains file {}: {}", path.display(), e)))?;
    file.domains
        .into_iter()
        .map(|spec| spec.resolve(|name| std::env::var(name).ok()))
        .collect()
}

// ============================================================================
// Process-wide configuration
// ============================================================================

/// Where raw payloads are archived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveBackend {
    Disabled,
    Local { dir: PathBuf },
    /// S3-compatible storage configured by `S3_*` variables
    S3,
}

/// Where normalized record sets are loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub domains_file: PathBuf,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Run domains concurrently
    pub parallel: bool,
    /// In-process schedule; `None` disables it
    pub schedule_interval_secs: Option<u64>,
    pub archive: ArchiveBackend,
    pub warehouse: WarehouseBackend,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            domains_file: PathBuf::from("config/domains.toml"),
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 60_000,
            request_timeout_secs: 60,
            parallel: true,
            schedule_interval_secs: None,
            archive: ArchiveBackend::Disabled,
            warehouse: WarehouseBackend::Postgres,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let archive = match std::env::var("ARCHIVE_BACKEND")
            .unwrap_or_else(|_| "disabled".to_string())
            .to_lowercase()
            .as_str()
        {
            "disabled" | "none" => ArchiveBackend::Disabled,
            "local" => ArchiveBackend::Local {
                dir: std::env::var("ARCHIVE_LOCAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("raw_data")),
            },
            "s3" => ArchiveBackend::S3,
            other => anyhow::bail!("ARCHIVE_BACKEND must be disabled, local or s3, got '{}'", other),
        };

        let warehouse = match std::env::var("WAREHOUSE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => WarehouseBackend::Postgres,
            "memory" => WarehouseBackend::Memory,
            other => anyhow::bail!("WAREHOUSE_BACKEND must be postgres or memory, got '{}'", other),
        };

        let schedule_interval_secs = env_parse("INGEST_SCHEDULE_INTERVAL_SECS", 0u64)?;

        let config = Self {
            domains_file: std::env::var("CRM_DOMAINS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.domains_file),
            max_attempts: env_parse("INGEST_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay_ms: env_parse("INGEST_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_multiplier: env_parse("INGEST_RETRY_MULTIPLIER", defaults.retry_multiplier)?,
            retry_max_delay_ms: env_parse("INGEST_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            request_timeout_secs: env_parse(
                "INGEST_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            parallel: env_parse("INGEST_PARALLEL", defaults.parallel)?,
            schedule_interval_secs: (schedule_interval_secs > 0).then_some(schedule_interval_secs),
            archive,
            warehouse,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("INGEST_MAX_ATTEMPTS must be at least 1");
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            anyhow::bail!("INGEST_RETRY_MULTIPLIER must be a finite number >= 1.0");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("INGEST_REQUEST_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_interval_secs.map(Duration::from_secs)
    }
}
