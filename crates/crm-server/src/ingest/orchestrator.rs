//! Pipeline orchestrator
//!
//! Each domain moves through
//! `pending → fetching → archiving → normalizing → validating → loading → done`,
//! or to `failed` from any stage. Archive failures are demoted to warnings;
//! every other failure ends that domain only. Domains run concurrently unless
//! sequential execution is configured.

use super::archiver::RawArchiver;
use super::config::DomainConfig;
use super::error::{IngestError, Result};
use super::fetcher::Fetcher;
use super::loader::{LoadOutcome, TableLoader};
use super::normalizer::normalize;
use super::summary::{DomainResult, DomainStatus, RunSummary};
use super::validator::{counts_by_rule, validate};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStage {
    Pending,
    Fetching,
    Archiving,
    Normalizing,
    Validating,
    Loading,
    Done,
    Failed,
}

/// What happens to a domain when a stage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the failure and stop the domain
    Abort,
    /// Record a warning and continue with the next stage
    Demote,
}

impl DomainStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStage::Pending => "pending",
            DomainStage::Fetching => "fetching",
            DomainStage::Archiving => "archiving",
            DomainStage::Normalizing => "normalizing",
            DomainStage::Validating => "validating",
            DomainStage::Loading => "loading",
            DomainStage::Done => "done",
            DomainStage::Failed => "failed",
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            DomainStage::Archiving => FailurePolicy::Demote,
            _ => FailurePolicy::Abort,
        }
    }
}

impl std::fmt::Display for DomainStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage and accumulated warnings of one domain
struct StageTracker<'a> {
    domain: &'a str,
    stage: DomainStage,
    warnings: Vec<String>,
}

impl<'a> StageTracker<'a> {
    fn new(domain: &'a str) -> Self {
        Self {
            domain,
            stage: DomainStage::Pending,
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, stage: DomainStage) {
        debug!(domain = self.domain, from = %self.stage, to = %stage, "Stage transition");
        self.stage = stage;
    }

    /// Apply the current stage's failure policy
    fn handle_failure(&mut self, err: IngestError) -> Result<()> {
        match self.stage.failure_policy() {
            FailurePolicy::Abort => Err(err),
            FailurePolicy::Demote => {
                warn!(
                    domain = self.domain,
                    stage = %self.stage,
                    error = %err,
                    "Stage failed, continuing"
                );
                self.warnings.push(format!("{} failed: {}", self.stage, err));
                Ok(())
            },
        }
    }
}

struct Completed {
    records: usize,
    archive_key: Option<String>,
    outcome: LoadOutcome,
}

/// One parameterized ingestion pipeline over a set of domains
pub struct Pipeline {
    domains: Vec<DomainConfig>,
    fetcher: Arc<dyn Fetcher>,
    archiver: Option<Arc<dyn RawArchiver>>,
    loader: Arc<dyn TableLoader>,
    parallel: bool,
}

impl Pipeline {
    pub fn new(
        domains: Vec<DomainConfig>,
        fetcher: Arc<dyn Fetcher>,
        loader: Arc<dyn TableLoader>,
    ) -> Self {
        Self {
            domains,
            fetcher,
            archiver: None,
            loader,
            parallel: true,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn RawArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn domains(&self) -> &[DomainConfig] {
        &self.domains
    }

    pub fn archiver(&self) -> Option<&Arc<dyn RawArchiver>> {
        self.archiver.as_ref()
    }

    /// Checks that must pass before any domain starts
    fn preflight(&self) -> Result<()> {
        if self.domains.is_empty() {
            return Err(IngestError::Setup("no domains configured".to_string()));
        }

        let mut seen = HashSet::new();
        for domain in &self.domains {
            if domain.id.trim().is_empty() {
                return Err(IngestError::Setup("domain with empty id".to_string()));
            }
            if !seen.insert(domain.id.as_str()) {
                return Err(IngestError::Setup(format!("duplicate domain id '{}'", domain.id)));
            }
            if domain.endpoint.trim().is_empty() {
                return Err(IngestError::Setup(format!("domain '{}' has no endpoint", domain.id)));
            }
            if domain.table.trim().is_empty() {
                return Err(IngestError::Setup(format!(
                    "domain '{}' has no destination table",
                    domain.id
                )));
            }
        }
        Ok(())
    }

    /// Run every domain and aggregate the results.
    ///
    /// Only setup failures are returned as `Err`; domain failures are recorded
    /// in the summary.
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        self.preflight().map_err(|e| {
            error!(error = %e, "Pipeline setup failed");
            e
        })?;

        let started = Instant::now();
        info!(
            domains = self.domains.len(),
            parallel = self.parallel,
            "Starting CRM data processing"
        );

        let results: Vec<(String, DomainResult)> = if self.parallel {
            join_all(self.domains.iter().map(|domain| {
                async move { (domain.id.clone(), self.run_domain(domain).await) }
                    .instrument(info_span!("domain", domain = %domain.id))
            }))
            .await
        } else {
            let mut results = Vec::with_capacity(self.domains.len());
            for domain in &self.domains {
                let result = self
                    .run_domain(domain)
                    .instrument(info_span!("domain", domain = %domain.id))
                    .await;
                results.push((domain.id.clone(), result));
            }
            results
        };

        let elapsed = started.elapsed().as_secs_f64();
        let details: BTreeMap<String, DomainResult> = results.into_iter().collect();
        let summary = RunSummary::from_results(run_id, elapsed, details);

        info!(
            status = ?summary.overall_status,
            processing_time_seconds = elapsed,
            total_records = summary.total_records_processed,
            "Processing complete"
        );
        Ok(summary)
    }

    async fn run_domain(&self, domain: &DomainConfig) -> DomainResult {
        let started = Instant::now();
        let mut tracker = StageTracker::new(&domain.id);

        match self.execute(domain, &mut tracker).await {
            Ok(done) => {
                info!(
                    domain = %domain.id,
                    records = done.records,
                    table = %done.outcome.table,
                    committed_rows = done.outcome.committed_rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Domain processed"
                );
                DomainResult {
                    status: DomainStatus::Success,
                    records_processed: Some(done.records),
                    message: None,
                    stage: None,
                    error_kind: None,
                    warnings: tracker.warnings,
                    archive_key: done.archive_key,
                    committed_rows: Some(done.outcome.committed_rows),
                }
            },
            Err(err) => {
                let failed_stage = tracker.stage;
                tracker.enter(DomainStage::Failed);
                error!(
                    domain = %domain.id,
                    stage = %failed_stage,
                    kind = %err.kind(),
                    error = %err,
                    "Domain failed"
                );
                DomainResult {
                    status: DomainStatus::Error,
                    records_processed: None,
                    message: Some(err.to_string()),
                    stage: Some(failed_stage),
                    error_kind: Some(err.kind()),
                    warnings: tracker.warnings,
                    archive_key: None,
                    committed_rows: None,
                }
            },
        }
    }

    async fn execute(&self, domain: &DomainConfig, tracker: &mut StageTracker<'_>) -> Result<Completed> {
        tracker.enter(DomainStage::Fetching);
        let payload = self.fetcher.fetch(domain).await?;

        tracker.enter(DomainStage::Archiving);
        let archive_key = match &self.archiver {
            Some(archiver) => match archiver.archive(&payload, domain.timezone).await {
                Ok(key) => Some(key),
                Err(err) => {
                    tracker.handle_failure(err)?;
                    None
                },
            },
            None => None,
        };

        tracker.enter(DomainStage::Normalizing);
        let records = normalize(&payload, domain, Utc::now())?;
        info!(domain = %domain.id, records = records.len(), "Fetched records");

        tracker.enter(DomainStage::Validating);
        let report = validate(&records, domain);
        if !report.passed() {
            return Err(IngestError::Validation(report.error_summary()));
        }
        if !report.findings.is_empty() {
            info!(domain = %domain.id, findings = ?counts_by_rule(&report), "Data quality warnings");
        }
        tracker
            .warnings
            .extend(report.warnings().map(|f| f.message.clone()));

        tracker.enter(DomainStage::Loading);
        let outcome = self.loader.load(&records, domain).await?;
        info!(
            domain = %domain.id,
            table = %outcome.table,
            rows = outcome.rows_written,
            committed_rows = outcome.committed_rows,
            "Verified table row count after load"
        );

        tracker.enter(DomainStage::Done);
        Ok(Completed {
            records: records.len(),
            archive_key,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_archiving_is_demoted() {
        for stage in [
            DomainStage::Fetching,
            DomainStage::Normalizing,
            DomainStage::Validating,
            DomainStage::Loading,
        ] {
            assert_eq!(stage.failure_policy(), FailurePolicy::Abort);
        }
        assert_eq!(DomainStage::Archiving.failure_policy(), FailurePolicy::Demote);
    }

    #[test]
    fn test_tracker_demotes_archive_failure() {
        let mut tracker = StageTracker::new("accounts");
        tracker.enter(DomainStage::Archiving);

        assert!(tracker
            .handle_failure(IngestError::Archive("bucket unreachable".to_string()))
            .is_ok());
        assert_eq!(tracker.warnings.len(), 1);
        assert!(tracker.warnings[0].starts_with("archiving failed"));
    }

    #[test]
    fn test_tracker_aborts_other_stages() {
        let mut tracker = StageTracker::new("accounts");
        tracker.enter(DomainStage::Loading);

        let err = tracker
            .handle_failure(IngestError::load("accounts", 3, "connection reset"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Load { .. }));
        assert!(tracker.warnings.is_empty());
    }
}
