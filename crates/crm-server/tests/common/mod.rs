//! Shared fixtures for crm-server integration tests
//!
//! Everything here runs in-process: a canned [`Fetcher`], archivers that fail
//! on demand, a loader that counts calls, and domain definitions shaped like
//! the production `accounts` and `call_reports` domains.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use crm_server::ingest::config::{GeoBounds, NumericType, ValidationRules};
use crm_server::ingest::{
    DomainConfig, Fetcher, IngestError, LoadMode, LoadOutcome, MemoryWarehouse, RawArchiver,
    RawPayload, RecordSet, TableLoader,
};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Clone)]
enum Canned {
    Body(Json),
    Raw(Vec<u8>),
    AuthFailure,
    Unavailable,
}

/// Fetcher returning canned payloads keyed by domain id
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, Canned>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(self, domain: &str, body: Json) -> Self {
        self.set(domain, Canned::Body(body));
        self
    }

    pub fn with_raw(self, domain: &str, body: &[u8]) -> Self {
        self.set(domain, Canned::Raw(body.to_vec()));
        self
    }

    pub fn with_auth_failure(self, domain: &str) -> Self {
        self.set(domain, Canned::AuthFailure);
        self
    }

    pub fn with_unavailable(self, domain: &str) -> Self {
        self.set(domain, Canned::Unavailable);
        self
    }

    /// Replace the canned response for a domain between runs
    pub fn set_json(&self, domain: &str, body: Json) {
        self.set(domain, Canned::Body(body));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, domain: &str, canned: Canned) {
        self.responses
            .lock()
            .unwrap()
            .insert(domain.to_string(), canned);
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, domain: &DomainConfig) -> crm_server::ingest::error::Result<RawPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let canned = self.responses.lock().unwrap().get(&domain.id).cloned();

        match canned {
            Some(Canned::Body(body)) => {
                RawPayload::from_body(domain.id.clone(), Utc::now(), body.to_string().into_bytes())
            },
            Some(Canned::Raw(body)) => RawPayload::from_body(domain.id.clone(), Utc::now(), body),
            Some(Canned::AuthFailure) => Err(IngestError::Auth {
                endpoint: domain.endpoint.clone(),
                status: 401,
            }),
            Some(Canned::Unavailable) => Err(IngestError::TransientFetch {
                endpoint: domain.endpoint.clone(),
                status: Some(503),
                message: "HTTP 503 Service Unavailable".to_string(),
            }),
            None => Err(IngestError::Request {
                endpoint: domain.endpoint.clone(),
                status: Some(404),
                message: "HTTP 404 Not Found".to_string(),
            }),
        }
    }
}

// ============================================================================
// Archivers and loaders
// ============================================================================

/// Archiver whose store is always unreachable
pub struct UnreachableArchiver;

#[async_trait]
impl RawArchiver for UnreachableArchiver {
    async fn archive(&self, _payload: &RawPayload, _tz: Tz) -> crm_server::ingest::error::Result<String> {
        Err(IngestError::Archive("connection refused".to_string()))
    }

    async fn list(&self, _domain: &str, _limit: usize) -> crm_server::ingest::error::Result<Vec<String>> {
        Err(IngestError::Archive("connection refused".to_string()))
    }
}

/// Loader that delegates to a [`MemoryWarehouse`] and counts calls
pub struct CountingLoader {
    pub warehouse: Arc<MemoryWarehouse>,
    calls: AtomicUsize,
}

impl CountingLoader {
    pub fn new(warehouse: Arc<MemoryWarehouse>) -> Self {
        Self {
            warehouse,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableLoader for CountingLoader {
    async fn load(
        &self,
        records: &RecordSet,
        domain: &DomainConfig,
    ) -> crm_server::ingest::error::Result<LoadOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.warehouse.load(records, domain).await
    }
}

// ============================================================================
// Domains and payloads
// ============================================================================

pub const ACCOUNTS_TABLE: &str = "crm.accounts";
pub const CALL_REPORTS_TABLE: &str = "crm.call_reports";

/// Store accounts, replaced on every run
pub fn accounts_domain() -> DomainConfig {
    let mut domain = DomainConfig::new("accounts", "http://crm.test/api", ACCOUNTS_TABLE);
    domain.timezone = chrono_tz::America::Montreal;
    domain.primary_key = Some("store_id".to_string());
    domain.rename = BTreeMap::from([
        ("accnt_no".to_string(), "store_id".to_string()),
        ("accnt_name".to_string(), "store_name".to_string()),
        ("accnt_city".to_string(), "city".to_string()),
        ("accnt_prov".to_string(), "province".to_string()),
    ]);
    domain.date_fields = vec!["client_since".to_string()];
    domain.numeric_fields = BTreeMap::from([
        ("store_id".to_string(), NumericType::Integer),
        ("latitude".to_string(), NumericType::Float),
        ("longitude".to_string(), NumericType::Float),
    ]);
    domain.validation = ValidationRules {
        required_fields: vec![
            "store_id".to_string(),
            "store_name".to_string(),
            "city".to_string(),
            "province".to_string(),
        ],
        critical_fields: vec!["store_id".to_string(), "store_name".to_string()],
        allowed_values: BTreeMap::from([("province".to_string(), vec!["ON".to_string()])]),
        geo_bounds: Some(GeoBounds::ontario()),
        ..ValidationRules::default()
    };
    domain
}

/// Call activity, appended on every run
pub fn call_reports_domain() -> DomainConfig {
    let mut domain = DomainConfig::new("call_reports", "http://crm.test/api", CALL_REPORTS_TABLE);
    domain.timezone = chrono_tz::America::Montreal;
    domain.load_mode = LoadMode::Append;
    domain.primary_key = Some("call_id".to_string());
    domain.rename = BTreeMap::from([
        ("accnt_no".to_string(), "store_id".to_string()),
        ("call_no".to_string(), "call_id".to_string()),
    ]);
    domain.date_fields = vec!["call_date".to_string()];
    domain.numeric_fields = BTreeMap::from([
        ("store_id".to_string(), NumericType::Integer),
        ("call_id".to_string(), NumericType::Integer),
    ]);
    domain.validation = ValidationRules {
        required_fields: vec![
            "call_id".to_string(),
            "store_id".to_string(),
            "call_date".to_string(),
        ],
        ..ValidationRules::default()
    };
    domain
}

/// One valid account row as the CRM returns it
pub fn account_row(n: usize) -> Json {
    json!({
        "accnt_no": n,
        "accnt_name": format!("Store {}", n),
        "accnt_city": "Toronto",
        "accnt_prov": "ON",
        "latitude": 43.65,
        "longitude": -79.38,
        "client_since": "2021-03-15"
    })
}

/// `count` valid account rows with store ids `1..=count`
pub fn account_rows(count: usize) -> Json {
    Json::Array((1..=count).map(account_row).collect())
}

/// Call report rows with ids `first..first + count`
pub fn call_report_rows(first: usize, count: usize) -> Json {
    Json::Array(
        (first..first + count)
            .map(|n| {
                json!({
                    "call_no": n,
                    "accnt_no": 100 + n % 7,
                    "call_date": "2024-05-02"
                })
            })
            .collect(),
    )
}
