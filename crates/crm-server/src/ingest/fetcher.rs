//! CRM API fetcher
//!
//! Issues `GET <endpoint>?<query>&key=<api_key>` with optional basic or
//! bearer credentials. Transient failures (network, timeout, 429, 5xx) are
//! retried under the configured [`RetryPolicy`]; every attempt is a fresh
//! request.

use super::config::{Credentials, DomainConfig};
use super::error::{IngestError, Result};
use super::models::RawPayload;
use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const USER_AGENT: &str = concat!("crm-server/", env!("CARGO_PKG_VERSION"));

/// Retrieves the raw payload for one domain
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, domain: &DomainConfig) -> Result<RawPayload>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::Setup(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn fetch_once(&self, domain: &DomainConfig, attempt: u32) -> Result<RawPayload> {
        let endpoint = display_endpoint(&domain.endpoint);
        debug!(domain = %domain.id, attempt, endpoint, "Requesting CRM data");

        let mut request = self.client.get(&domain.endpoint).query(&domain.query);
        if let Some(key) = &domain.api_key {
            request = request.query(&[("key", key.expose())]);
        }
        request = match &domain.credentials {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose()))
            },
            Credentials::Bearer { token } => request.bearer_auth(token.expose()),
        };

        let response = request
            .send()
            .await
            .map_err(|e| classify_send_error(endpoint, e))?;

        let status = response.status();
        check_status(endpoint, status)?;

        let body = response.bytes().await.map_err(|e| IngestError::TransientFetch {
            endpoint: endpoint.to_string(),
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {}", e.without_url()),
        })?;

        RawPayload::from_body(domain.id.clone(), Utc::now(), body.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, domain), fields(domain = %domain.id))]
    async fn fetch(&self, domain: &DomainConfig) -> Result<RawPayload> {
        let payload = self
            .retry
            .run(self.sleeper.as_ref(), |attempt| self.fetch_once(domain, attempt))
            .await?;

        info!(
            domain = %domain.id,
            bytes = payload.body().len(),
            "Fetched CRM payload"
        );
        Ok(payload)
    }
}

/// Endpoint without its query string, safe to log
fn display_endpoint(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}

/// Map a response status onto the pipeline error kinds
pub(crate) fn check_status(endpoint: &str, status: StatusCode) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(IngestError::Auth {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(IngestError::TransientFetch {
            endpoint: endpoint.to_string(),
            status: Some(status.as_u16()),
            message: format!("HTTP {}", status),
        });
    }
    if !status.is_success() {
        return Err(IngestError::Request {
            endpoint: endpoint.to_string(),
            status: Some(status.as_u16()),
            message: format!("HTTP {}", status),
        });
    }
    Ok(())
}

fn classify_send_error(endpoint: &str, err: reqwest::Error) -> IngestError {
    // The request URL carries the API key, so it is stripped from messages.
    if err.is_builder() {
        IngestError::Request {
            endpoint: endpoint.to_string(),
            status: None,
            message: err.without_url().to_string(),
        }
    } else {
        IngestError::TransientFetch {
            endpoint: endpoint.to_string(),
            status: None,
            message: err.without_url().to_string(),
        }
    }
}
