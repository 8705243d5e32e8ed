//! Data quality checks
//!
//! Missing required columns are hard failures and block the load. Everything
//! else (allowed values, missing critical values, numeric bounds, coordinates,
//! duplicate keys) is reported as a warning.

use super::config::{DomainConfig, GeoBounds, ValidationRules};
use super::models::{RecordSet, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    MissingColumn,
    InvalidValue,
    MissingValue,
    OutOfRange,
    InvalidCoordinates,
    DuplicateKey,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::MissingColumn => "missing_column",
            Rule::InvalidValue => "invalid_value",
            Rule::MissingValue => "missing_value",
            Rule::OutOfRange => "out_of_range",
            Rule::InvalidCoordinates => "invalid_coordinates",
            Rule::DuplicateKey => "duplicate_key",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub rule: Rule,
    pub field: String,
    /// Number of offending rows (or keys, for duplicates)
    pub count: usize,
    /// Bounded sample of offending values
    pub sample: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub domain: String,
    pub row_count: usize,
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// True when no hard failure was found
    pub fn passed(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn find(&self, rule: Rule, field: &str) -> Option<&Finding> {
        self.findings
            .iter()
            .find(|f| f.rule == rule && f.field == field)
    }

    /// One-line description of the hard failures
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[instrument(skip_all, fields(domain = %domain.id))]
pub fn validate(records: &RecordSet, domain: &DomainConfig) -> ValidationReport {
    let rules = &domain.validation;
    let mut findings = Vec::new();

    check_required_columns(records, domain, &mut findings);
    check_allowed_values(records, rules, &mut findings);
    check_critical_fields(records, rules, &mut findings);
    check_numeric_bounds(records, rules, &mut findings);
    if let Some(geo) = &rules.geo_bounds {
        check_coordinates(records, domain, geo, &mut findings);
    }
    if let Some(pk) = domain.primary_key.as_deref() {
        check_duplicates(records, pk, rules.sample_size, &mut findings);
    }

    let report = ValidationReport {
        domain: domain.id.clone(),
        row_count: records.len(),
        findings,
    };

    for finding in &report.findings {
        warn!(
            domain = %domain.id,
            rule = %finding.rule,
            field = %finding.field,
            count = finding.count,
            sample = ?finding.sample,
            severity = ?finding.severity,
            "{}",
            finding.message
        );
    }
    info!(
        domain = %domain.id,
        rows = report.row_count,
        errors = report.errors().count(),
        warnings = report.warnings().count(),
        "Validation complete"
    );

    report
}

fn check_required_columns(records: &RecordSet, domain: &DomainConfig, findings: &mut Vec<Finding>) {
    for column in domain.required_columns() {
        if !records.has_column(column) {
            findings.push(Finding {
                severity: Severity::Error,
                rule: Rule::MissingColumn,
                field: column.to_string(),
                count: records.len(),
                sample: Vec::new(),
                message: format!("required column '{}' is missing", column),
            });
        }
    }
}

fn check_allowed_values(records: &RecordSet, rules: &ValidationRules, findings: &mut Vec<Finding>) {
    for (field, allowed) in &rules.allowed_values {
        let Some(values) = records.column_values(field) else {
            continue;
        };

        let mut count = 0;
        let mut sample = Sample::new(rules.sample_size);
        for value in values.filter(|v| !v.is_null()) {
            let text = value.to_string();
            if !allowed.iter().any(|a| *a == text) {
                count += 1;
                sample.push_distinct(text);
            }
        }

        if count > 0 {
            findings.push(warning(
                Rule::InvalidValue,
                field,
                count,
                sample,
                format!("{} rows have values outside {:?} in '{}'", count, allowed, field),
            ));
        }
    }
}

fn check_critical_fields(records: &RecordSet, rules: &ValidationRules, findings: &mut Vec<Finding>) {
    for field in &rules.critical_fields {
        let count = match records.column_values(field) {
            Some(values) => values.filter(|v| v.is_blank()).count(),
            None => records.len(),
        };

        if count > 0 {
            findings.push(warning(
                Rule::MissingValue,
                field,
                count,
                Sample::new(0),
                format!("{} rows are missing a value for critical field '{}'", count, field),
            ));
        }
    }
}

fn check_numeric_bounds(records: &RecordSet, rules: &ValidationRules, findings: &mut Vec<Finding>) {
    for (field, bound) in &rules.numeric_bounds {
        let Some(values) = records.column_values(field) else {
            continue;
        };

        let mut count = 0;
        let mut sample = Sample::new(rules.sample_size);
        for value in values {
            if let Some(number) = value.as_f64() {
                if !bound.contains(number) {
                    count += 1;
                    sample.push(value.to_string());
                }
            }
        }

        if count > 0 {
            findings.push(warning(
                Rule::OutOfRange,
                field,
                count,
                sample,
                format!(
                    "{} rows have '{}' outside [{}, {}]",
                    count,
                    field,
                    bound.min.map_or("-inf".to_string(), |v| v.to_string()),
                    bound.max.map_or("inf".to_string(), |v| v.to_string()),
                ),
            ));
        }
    }
}

fn check_coordinates(
    records: &RecordSet,
    domain: &DomainConfig,
    geo: &GeoBounds,
    findings: &mut Vec<Finding>,
) {
    let lat_idx = records.column_index(&geo.lat_field);
    let lon_idx = records.column_index(&geo.lon_field);
    let pk_idx = domain
        .primary_key
        .as_deref()
        .and_then(|pk| records.column_index(pk));
    let field = format!("{},{}", geo.lat_field, geo.lon_field);

    let mut count = 0;
    let mut sample = Sample::new(domain.validation.sample_size);
    for (row_no, row) in records.rows().iter().enumerate() {
        let lat = lat_idx.and_then(|i| row[i].as_f64());
        let lon = lon_idx.and_then(|i| row[i].as_f64());

        let valid = match (lat, lon) {
            (Some(lat), Some(lon)) => !(lat == 0.0 && lon == 0.0) && geo.contains(lat, lon),
            _ => false,
        };

        if !valid {
            count += 1;
            let label = match pk_idx.map(|i| &row[i]) {
                Some(v) if !v.is_null() => v.to_string(),
                _ => format!("row {}", row_no),
            };
            sample.push(label);
        }
    }

    if count > 0 {
        findings.push(warning(
            Rule::InvalidCoordinates,
            &field,
            count,
            sample,
            format!(
                "{} rows have missing, zero or out-of-bounds coordinates (lat {}..{}, lon {}..{})",
                count, geo.min_lat, geo.max_lat, geo.min_lon, geo.max_lon
            ),
        ));
    }
}

fn check_duplicates(records: &RecordSet, pk: &str, sample_size: usize, findings: &mut Vec<Finding>) {
    let Some(values) = records.column_values(pk) else {
        return;
    };

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut order = Vec::new();
    for value in values.filter(|v| !v.is_null()) {
        let key = value.to_string();
        let hits = seen.entry(key.clone()).or_insert(0);
        if *hits == 0 {
            order.push(key);
        }
        *hits += 1;
    }

    let duplicated: Vec<String> = order.into_iter().filter(|k| seen[k] > 1).collect();
    if duplicated.is_empty() {
        return;
    }

    let mut sample = Sample::new(sample_size);
    for key in &duplicated {
        sample.push(key.clone());
    }
    let extra_rows: usize = duplicated.iter().map(|k| seen[k] - 1).sum();

    findings.push(warning(
        Rule::DuplicateKey,
        pk,
        duplicated.len(),
        sample,
        format!(
            "{} '{}' values appear more than once ({} extra rows)",
            duplicated.len(),
            pk,
            extra_rows
        ),
    ));
}

fn warning(rule: Rule, field: &str, count: usize, sample: Sample, message: String) -> Finding {
    Finding {
        severity: Severity::Warning,
        rule,
        field: field.to_string(),
        count,
        sample: sample.into_inner(),
        message,
    }
}

/// Bounded list of offending values
struct Sample {
    limit: usize,
    values: Vec<String>,
}

impl Sample {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            values: Vec::new(),
        }
    }

    fn push(&mut self, value: String) {
        if self.values.len() < self.limit {
            self.values.push(value);
        }
    }

    fn push_distinct(&mut self, value: String) {
        if !self.values.contains(&value) {
            self.push(value);
        }
    }

    fn into_inner(self) -> Vec<String> {
        self.values
    }
}

/// Findings grouped by rule, for log summaries
pub fn counts_by_rule(report: &ValidationReport) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for finding in &report.findings {
        *counts.entry(finding.rule.as_str()).or_insert(0) += finding.count;
    }
    counts
}
