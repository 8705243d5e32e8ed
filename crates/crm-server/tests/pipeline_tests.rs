//! End-to-end pipeline runs against in-process stages
//!
//! Covers:
//! - Replace loads are idempotent across runs
//! - Hard validation failures never reach the loader
//! - Data quality warnings are reported without blocking the load
//! - Per-domain failure isolation and overall status
//! - Append loads with schema evolution
//! - Archive outages demoted to warnings
//! - Setup errors abort the run before any domain starts
//! - The in-process schedule

mod common;

use common::*;
use crm_server::app::spawn_schedule;
use crm_server::ingest::{
    DomainStage, DomainStatus, ErrorKind, IngestError, LocalArchiver, MemoryWarehouse,
    OverallStatus, Pipeline, TableLoader,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helper Functions
// ============================================================================

fn pipeline_with(
    domains: Vec<crm_server::ingest::DomainConfig>,
    fetcher: Arc<StubFetcher>,
    warehouse: Arc<MemoryWarehouse>,
) -> Pipeline {
    Pipeline::new(domains, fetcher, warehouse as Arc<dyn TableLoader>)
}

// ============================================================================
// Replace loads
// ============================================================================

#[tokio::test]
async fn test_replace_run_is_idempotent() {
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(25)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher.clone(), warehouse.clone());

    let first = pipeline.run().await.unwrap();
    let columns_after_first = warehouse.column_names(ACCOUNTS_TABLE).await.unwrap();
    let second = pipeline.run().await.unwrap();

    assert_eq!(first.overall_status, OverallStatus::Success);
    assert_eq!(second.overall_status, OverallStatus::Success);
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(25));
    assert_eq!(
        warehouse.column_names(ACCOUNTS_TABLE).await.unwrap(),
        columns_after_first
    );
    assert_eq!(second.details["accounts"].committed_rows, Some(25));
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_loaded_table_has_renamed_columns_and_load_timestamp() {
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(3)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher, warehouse.clone());

    pipeline.run().await.unwrap();

    let columns = warehouse.column_names(ACCOUNTS_TABLE).await.unwrap();
    for expected in ["store_id", "store_name", "city", "province", "load_timestamp"] {
        assert!(columns.iter().any(|c| c == expected), "missing column {}", expected);
    }
    assert!(!columns.iter().any(|c| c.starts_with("accnt_")));
}

#[tokio::test]
async fn test_records_field_payload_shape() {
    let mut domain = accounts_domain();
    domain.records_field = Some("data".to_string());
    let fetcher = Arc::new(
        StubFetcher::new().with_json("accounts", json!({ "data": account_rows(4), "page": 1 })),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![domain], fetcher, warehouse.clone());

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.details["accounts"].records_processed, Some(4));
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(4));
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_missing_required_column_blocks_load() {
    let rows = json!([
        { "accnt_no": 1, "accnt_name": "Store 1", "accnt_prov": "ON" },
        { "accnt_no": 2, "accnt_name": "Store 2", "accnt_prov": "ON" }
    ]);
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", rows));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = Arc::new(CountingLoader::new(warehouse.clone()));
    let pipeline = Pipeline::new(vec![accounts_domain()], fetcher, loader.clone());

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["accounts"];

    assert_eq!(summary.overall_status, OverallStatus::Failure);
    assert_eq!(result.status, DomainStatus::Error);
    assert_eq!(result.stage, Some(DomainStage::Validating));
    assert_eq!(result.error_kind, Some(ErrorKind::Validation));
    assert!(result.message.as_deref().unwrap().contains("city"));
    assert_eq!(loader.calls(), 0);
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, None);
}

#[tokio::test]
async fn test_duplicate_keys_warn_but_load() {
    let rows = json!([account_row(1), account_row(2), account_row(2), account_row(3)]);
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", rows));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let loader = Arc::new(CountingLoader::new(warehouse.clone()));
    let pipeline = Pipeline::new(vec![accounts_domain()], fetcher, loader.clone());

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["accounts"];

    assert_eq!(summary.overall_status, OverallStatus::Success);
    assert_eq!(loader.calls(), 1);
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(4));
    assert!(
        result.warnings.iter().any(|w| w.contains("store_id") && w.contains("1 extra rows")),
        "warnings: {:?}",
        result.warnings
    );
}

#[tokio::test]
async fn test_out_of_province_coordinates_are_warnings() {
    let mut rows = account_rows(2);
    rows[1]["latitude"] = json!(0.0);
    rows[1]["longitude"] = json!(0.0);
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", rows));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher, warehouse.clone());

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["accounts"];

    assert!(result.succeeded());
    assert_eq!(result.warnings.len(), 1, "warnings: {:?}", result.warnings);
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(2));
}

#[tokio::test]
async fn test_malformed_payload_fails_normalizing() {
    let fetcher = Arc::new(
        StubFetcher::new().with_json("accounts", json!({ "error": "agent not found" })),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher, warehouse);

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["accounts"];

    assert_eq!(result.stage, Some(DomainStage::Normalizing));
    assert_eq!(result.error_kind, Some(ErrorKind::Schema));
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_one_domain_failing_is_partial_failure() {
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_json("accounts", account_rows(500))
            .with_auth_failure("call_reports"),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(
        vec![accounts_domain(), call_reports_domain()],
        fetcher,
        warehouse.clone(),
    );

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.overall_status, OverallStatus::PartialFailure);
    assert_eq!(summary.http_status(), 207);
    assert_eq!(summary.total_records_processed, 500);

    let accounts = &summary.details["accounts"];
    assert_eq!(accounts.status, DomainStatus::Success);
    assert_eq!(accounts.records_processed, Some(500));

    let calls = &summary.details["call_reports"];
    assert_eq!(calls.status, DomainStatus::Error);
    assert_eq!(calls.stage, Some(DomainStage::Fetching));
    assert_eq!(calls.error_kind, Some(ErrorKind::Auth));
    assert!(calls.message.as_deref().unwrap().contains("401"));
    assert_eq!(calls.records_processed, None);

    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(500));
    assert_eq!(warehouse.row_count(CALL_REPORTS_TABLE).await, None);
}

#[tokio::test]
async fn test_every_domain_failing_is_failure() {
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_unavailable("accounts")
            .with_auth_failure("call_reports"),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(
        vec![accounts_domain(), call_reports_domain()],
        fetcher,
        warehouse,
    );

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.overall_status, OverallStatus::Failure);
    assert_eq!(summary.http_status(), 500);
    assert_eq!(summary.total_records_processed, 0);
    assert_eq!(
        summary.details["accounts"].error_kind,
        Some(ErrorKind::TransientFetch)
    );
}

#[tokio::test]
async fn test_sequential_mode_matches_parallel() {
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_json("accounts", account_rows(10))
            .with_json("call_reports", call_report_rows(1, 6)),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(
        vec![accounts_domain(), call_reports_domain()],
        fetcher,
        warehouse.clone(),
    )
    .with_parallel(false);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.overall_status, OverallStatus::Success);
    assert_eq!(summary.total_records_processed, 16);
    assert_eq!(
        summary.details.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["accounts", "call_reports"]
    );
    assert_eq!(warehouse.row_count(CALL_REPORTS_TABLE).await, Some(6));
}

#[tokio::test]
async fn test_summary_json_shape() {
    let fetcher = Arc::new(
        StubFetcher::new()
            .with_json("accounts", account_rows(2))
            .with_auth_failure("call_reports"),
    );
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(
        vec![accounts_domain(), call_reports_domain()],
        fetcher,
        warehouse,
    );

    let summary = pipeline.run().await.unwrap();
    let value = serde_json::to_value(&summary).unwrap();

    assert_eq!(value["overall_status"], "partial_failure");
    assert_eq!(value["total_records_processed"], 2);
    assert!(value["processing_time_seconds"].is_number());
    assert_eq!(value["details"]["accounts"]["status"], "success");
    assert_eq!(value["details"]["accounts"]["records_processed"], 2);
    assert_eq!(value["details"]["call_reports"]["status"], "error");
    assert_eq!(value["details"]["call_reports"]["stage"], "fetching");
    assert_eq!(value["details"]["call_reports"]["error_kind"], "auth");
    assert!(value["details"]["call_reports"].get("records_processed").is_none());
}

// ============================================================================
// Append loads
// ============================================================================

#[tokio::test]
async fn test_append_accumulates_and_evolves_schema() {
    let fetcher = Arc::new(StubFetcher::new().with_json("call_reports", call_report_rows(1, 3)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![call_reports_domain()], fetcher.clone(), warehouse.clone());

    pipeline.run().await.unwrap();
    assert_eq!(warehouse.row_count(CALL_REPORTS_TABLE).await, Some(3));

    let mut rows = call_report_rows(4, 2);
    for row in rows.as_array_mut().unwrap() {
        row["outcome"] = json!("order placed");
    }
    fetcher.set_json("call_reports", rows);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.overall_status, OverallStatus::Success);
    assert_eq!(summary.details["call_reports"].committed_rows, Some(5));

    let table = warehouse.table(CALL_REPORTS_TABLE).await.unwrap();
    let outcome = table.column_index("outcome").expect("outcome column added");
    assert_eq!(table.rows.len(), 5);
    assert!(table.rows[..3].iter().all(|row| row[outcome].is_null()));
    assert!(table.rows[3..].iter().all(|row| !row[outcome].is_null()));
}

#[tokio::test]
async fn test_all_null_column_takes_type_from_later_append() {
    let mut rows = call_report_rows(1, 2);
    for row in rows.as_array_mut().unwrap() {
        row["rating"] = json!(null);
    }
    let fetcher = Arc::new(StubFetcher::new().with_json("call_reports", rows));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![call_reports_domain()], fetcher.clone(), warehouse.clone());

    pipeline.run().await.unwrap();
    let columns = warehouse.column_names(CALL_REPORTS_TABLE).await.unwrap();
    assert!(!columns.iter().any(|c| c == "rating"));

    let mut rows = call_report_rows(3, 2);
    for row in rows.as_array_mut().unwrap() {
        row["rating"] = json!(4);
    }
    fetcher.set_json("call_reports", rows);

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["call_reports"];

    assert_eq!(result.status, DomainStatus::Success, "{:?}", result.message);
    assert_eq!(result.committed_rows, Some(4));

    let table = warehouse.table(CALL_REPORTS_TABLE).await.unwrap();
    let rating = table.column_index("rating").expect("rating column added");
    assert_eq!(table.columns[rating].1, crm_server::ingest::models::ColumnType::Integer);
    assert!(table.rows[..2].iter().all(|row| row[rating].is_null()));
    assert_eq!(table.rows[3][rating], crm_server::ingest::Value::Integer(4));
}

#[tokio::test]
async fn test_append_type_conflict_fails_loading() {
    let mut rows = call_report_rows(1, 2);
    for row in rows.as_array_mut().unwrap() {
        row["notes"] = json!("left voicemail");
    }
    let fetcher = Arc::new(StubFetcher::new().with_json("call_reports", rows));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![call_reports_domain()], fetcher.clone(), warehouse.clone());
    pipeline.run().await.unwrap();

    let mut rows = call_report_rows(3, 1);
    rows[0]["notes"] = json!(true);
    fetcher.set_json("call_reports", rows);

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["call_reports"];

    assert_eq!(result.stage, Some(DomainStage::Loading));
    assert_eq!(result.error_kind, Some(ErrorKind::Load));
    assert_eq!(warehouse.row_count(CALL_REPORTS_TABLE).await, Some(2));
}

// ============================================================================
// Archiving
// ============================================================================

#[tokio::test]
async fn test_archive_outage_is_a_warning() {
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(5)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher, warehouse.clone())
        .with_archiver(Arc::new(UnreachableArchiver));

    let summary = pipeline.run().await.unwrap();
    let result = &summary.details["accounts"];

    assert_eq!(summary.overall_status, OverallStatus::Success);
    assert_eq!(result.archive_key, None);
    assert!(result.warnings.iter().any(|w| w.starts_with("archiving failed")));
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(5));
}

#[tokio::test]
async fn test_local_archive_holds_verbatim_payload() {
    let dir = tempfile::tempdir().unwrap();
    let raw = br#"[{"accnt_no":1,"accnt_name":"Store 1","accnt_city":"Ottawa","accnt_prov":"ON"}]"#;
    let fetcher = Arc::new(StubFetcher::new().with_raw("accounts", raw));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher, warehouse)
        .with_archiver(Arc::new(LocalArchiver::new(dir.path())));

    let summary = pipeline.run().await.unwrap();
    let key = summary.details["accounts"].archive_key.clone().unwrap();

    assert!(key.starts_with("accounts/raw/accounts_"));
    assert!(key.ends_with(".json"));
    assert_eq!(std::fs::read(dir.path().join(&key)).unwrap(), raw.to_vec());
}

#[tokio::test]
async fn test_back_to_back_runs_keep_every_archive() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(1)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = pipeline_with(vec![accounts_domain()], fetcher.clone(), warehouse)
        .with_archiver(Arc::new(LocalArchiver::new(dir.path())));

    let first = pipeline.run().await.unwrap();
    fetcher.set_json("accounts", account_rows(3));
    let second = pipeline.run().await.unwrap();

    let first_key = first.details["accounts"].archive_key.clone().unwrap();
    let second_key = second.details["accounts"].archive_key.clone().unwrap();
    assert_ne!(first_key, second_key);

    let first_body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(&first_key)).unwrap()).unwrap();
    let second_body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(&second_key)).unwrap()).unwrap();
    assert_eq!(first_body, account_rows(1));
    assert_eq!(second_body, account_rows(3));
}

// ============================================================================
// Setup errors
// ============================================================================

#[tokio::test]
async fn test_no_domains_is_setup_error() {
    let pipeline = pipeline_with(
        Vec::new(),
        Arc::new(StubFetcher::new()),
        Arc::new(MemoryWarehouse::new()),
    );

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, IngestError::Setup(_)));
    assert_eq!(err.kind(), ErrorKind::Setup);
}

#[tokio::test]
async fn test_duplicate_domain_ids_abort_before_fetching() {
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(1)));
    let pipeline = pipeline_with(
        vec![accounts_domain(), accounts_domain()],
        fetcher.clone(),
        Arc::new(MemoryWarehouse::new()),
    );

    let err = pipeline.run().await.unwrap_err();
    assert!(err.to_string().contains("duplicate domain id 'accounts'"));
    assert_eq!(fetcher.calls(), 0);
}

// ============================================================================
// Schedule
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_schedule_runs_on_interval() {
    let fetcher = Arc::new(StubFetcher::new().with_json("accounts", account_rows(2)));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = Arc::new(pipeline_with(
        vec![accounts_domain()],
        fetcher.clone(),
        warehouse.clone(),
    ));

    let handle = spawn_schedule(pipeline, Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fetcher.calls(), 0);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(warehouse.row_count(ACCOUNTS_TABLE).await, Some(2));

    handle.abort();
}
