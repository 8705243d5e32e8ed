//! Run summary returned by the trigger endpoint and the CLI

use super::error::ErrorKind;
use super::orchestrator::DomainStage;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialFailure,
    Failure,
}

impl OverallStatus {
    /// `success` if every domain succeeded, `failure` if none did
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        if total > 0 && succeeded == total {
            OverallStatus::Success
        } else if succeeded > 0 {
            OverallStatus::PartialFailure
        } else {
            OverallStatus::Failure
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OverallStatus::Success => 200,
            OverallStatus::PartialFailure => 207,
            OverallStatus::Failure => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainResult {
    pub status: DomainStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Stage that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<DomainStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_rows: Option<u64>,
}

impl DomainResult {
    pub fn succeeded(&self) -> bool {
        self.status == DomainStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub overall_status: OverallStatus,
    pub processing_time_seconds: f64,
    pub total_records_processed: usize,
    pub details: BTreeMap<String, DomainResult>,
}

impl RunSummary {
    pub fn from_results(
        run_id: Uuid,
        processing_time_seconds: f64,
        details: BTreeMap<String, DomainResult>,
    ) -> Self {
        let succeeded = details.values().filter(|r| r.succeeded()).count();
        let total_records_processed = details
            .values()
            .filter_map(|r| r.records_processed)
            .sum();

        Self {
            run_id,
            overall_status: OverallStatus::from_counts(succeeded, details.len()),
            processing_time_seconds,
            total_records_processed,
            details,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.overall_status.http_status()
    }
}
