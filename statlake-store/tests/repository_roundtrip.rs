//! End-to-end registration through the unified repository: metadata first,
//! analytics second, compensation and recovery when the two disagree.

use statlake_core::{
    DatasetCategory, DatasetId, DatasetStatus, ManualClock, ObservationRow, PartitionStrategy, SqlValue,
};
use statlake_store::metadata::{Actor, AuditFilter, DatasetRegistration, Page, RunStatus};
use statlake_store::{Compensation, PartitionFilters, RegistrationRequest, RepositoryError, RepositoryOptions, StoreError, UnifiedRepository};
use std::sync::Arc;
use std::time::Duration;

fn open(dir: &tempfile::TempDir, strategy: PartitionStrategy) -> UnifiedRepository {
    open_with_clock(dir, strategy, Arc::new(ManualClock::new()))
}

fn open_with_clock(dir: &tempfile::TempDir, strategy: PartitionStrategy, clock: Arc<ManualClock>) -> UnifiedRepository {
    let mut opts = RepositoryOptions::in_dir(dir.path());
    opts.strategy = strategy;
    opts.master_key = Some("integration-master-key".into());
    UnifiedRepository::open_with(opts, clock).unwrap()
}

fn id(s: &str) -> DatasetId {
    DatasetId::parse(s).unwrap()
}

/// Ten rows across five territories and two years.
fn population_rows() -> Vec<ObservationRow> {
    let territories = ["IT", "FR", "DE", "ES", "PT"];
    let mut rows = Vec::new();
    for (i, territory) in territories.iter().enumerate() {
        for year in [2022, 2023] {
            rows.push(
                ObservationRow::new(*territory, year.to_string(), "POP_TOTAL", Some(1_000.0 * (i + 1) as f64 + year as f64))
                    .with_quality(0.5 + 0.1 * i as f64),
            );
        }
    }
    rows
}

fn display_rows(rows: &[Vec<SqlValue>]) -> Vec<String> {
    let mut out: Vec<String> = rows
        .iter()
        .map(|r| r.iter().map(ToString::to_string).collect::<Vec<_>>().join("|"))
        .collect();
    out.sort();
    out
}

#[test]
fn pop_2023_registers_with_inferred_category_and_row_count() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Year);

    let outcome = repo
        .register_dataset_complete(
            RegistrationRequest::new(id("POP_2023"), "Resident population 2023", population_rows()),
            &Actor::new("loader"),
        )
        .unwrap();
    assert_eq!(outcome.rows_written, 10);
    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(outcome.created_partitions.len(), 2);

    let entry = repo.get_dataset_metadata("POP_2023").unwrap().unwrap();
    assert_eq!(entry.category, DatasetCategory::Population);
    assert_eq!(entry.status, DatasetStatus::Active);
    assert_eq!(entry.row_count, 10);

    let listed = repo.list_datasets(Some(DatasetCategory::Population), Page::default()).unwrap();
    assert_eq!(listed.len(), 1);
}

#[test]
fn registered_rows_come_back_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Hybrid);
    let mut rows = population_rows();
    rows.push(ObservationRow::new("IT", "2023-Q2", "POP_TOTAL", None));

    repo.register_dataset_complete(RegistrationRequest::new(id("POP_MIX"), "Population", rows.clone()), &Actor::system())
        .unwrap();
    // A second dataset must not leak into the first one's results.
    repo.register_dataset_complete(
        RegistrationRequest::new(id("ENV_AIR"), "Air quality", vec![ObservationRow::new("IT", "2023", "PM10", Some(21.0))]),
        &Actor::system(),
    )
    .unwrap();

    let rs = repo
        .run_analytics_query(
            "SELECT territory_key, time_key, measure_key, value, quality_score FROM observations WHERE dataset_id = ?",
            &[SqlValue::from("POP_MIX")],
        )
        .unwrap();

    let expected: Vec<Vec<SqlValue>> = rows
        .iter()
        .map(|r| {
            vec![
                SqlValue::from(r.territory_key.as_str()),
                SqlValue::from(r.time_key.as_str()),
                SqlValue::from(r.measure_key.as_str()),
                SqlValue::from(r.value),
                SqlValue::from(r.quality_score),
            ]
        })
        .collect();
    assert_eq!(display_rows(&rs.rows), display_rows(&expected));
}

#[test]
fn analytics_failure_marks_dataset_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Year);
    let mut rows = population_rows();
    rows[7].quality_score = Some(5.0);

    let err = repo
        .register_dataset_complete(RegistrationRequest::new(id("POP_BAD"), "Broken", rows), &Actor::new("loader"))
        .unwrap_err();
    match &err {
        RepositoryError::IngestionFailed {
            dataset_id,
            cause,
            compensation,
        } => {
            assert_eq!(dataset_id, "POP_BAD");
            assert!(matches!(**cause, StoreError::DuckDb(_)));
            assert_eq!(*compensation, Compensation::MarkedInvalid);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.needs_recovery());

    let entry = repo.get_dataset_metadata("POP_BAD").unwrap().unwrap();
    assert_eq!(entry.status, DatasetStatus::Invalid);
    assert!(entry.invalid_reason.is_some());

    let runs = repo.list_ingestion_runs("POP_BAD").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Compensated);
    assert_eq!(runs[0].rows_written, Some(0));

    let rs = repo
        .run_analytics_query("SELECT COUNT(*) FROM observations WHERE dataset_id = ?", &[SqlValue::from("POP_BAD")])
        .unwrap();
    assert_eq!(rs.scalar(), Some(&SqlValue::Int(0)));

    let ops: Vec<String> = repo
        .query_audit(&AuditFilter::for_record("dataset_registry", "POP_BAD"))
        .unwrap()
        .into_iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(ops, ["create", "invalidate"]);
}

#[test]
fn unparseable_period_is_compensated_under_year_layout() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Year);
    let rows = vec![ObservationRow::new("IT", "latest", "X", Some(1.0))];

    let err = repo
        .register_dataset_complete(RegistrationRequest::new(id("TOUR_1"), "Arrivals", rows), &Actor::system())
        .unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::IngestionFailed {
            compensation: Compensation::MarkedInvalid,
            ..
        }
    ));
    assert_eq!(
        repo.get_dataset_metadata("TOUR_1").unwrap().unwrap().status,
        DatasetStatus::Invalid
    );
    assert!(repo.partitions().unwrap().is_empty());
}

#[test]
fn reingestion_appends_and_retry_after_failure_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Territory);
    let mut bad = population_rows();
    bad[0].quality_score = Some(-1.0);

    assert!(repo
        .register_dataset_complete(RegistrationRequest::new(id("POP_R"), "Retry", bad), &Actor::system())
        .is_err());
    let ok = repo
        .register_dataset_complete(RegistrationRequest::new(id("POP_R"), "Retry", population_rows()), &Actor::system())
        .unwrap();
    assert_eq!(ok.entry.status, DatasetStatus::Active);
    assert_eq!(ok.entry.row_count, 10);

    let again = repo
        .register_dataset_complete(RegistrationRequest::new(id("POP_R"), "Retry", population_rows()), &Actor::system())
        .unwrap();
    assert_eq!(again.entry.row_count, 20);
    assert_eq!(repo.list_ingestion_runs("POP_R").unwrap().len(), 3);
}

#[test]
fn recovery_settles_pending_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let actor = Actor::system();

    {
        let crashed = open_with_clock(&dir, PartitionStrategy::Year, clock.clone());

        // Crash after the analytics write: rows exist, metadata still pending.
        let written = DatasetRegistration::new(id("EDU_DONE"), "Enrolment", "istat");
        crashed.metadata().begin_registration(&written, 2, &actor).unwrap();
        let now = chrono::Utc::now();
        let observations: Vec<_> = [
            ObservationRow::new("IT", "2021", "ENROL", Some(1.0)),
            ObservationRow::new("FR", "2021", "ENROL", Some(2.0)),
        ]
        .into_iter()
        .map(|r| r.into_observation("EDU_DONE", now))
        .collect();
        crashed.partition_manager().insert_observations(&observations).unwrap();

        // Crash before the analytics write.
        let lost = DatasetRegistration::new(id("EDU_LOST"), "Graduates", "istat");
        crashed.metadata().begin_registration(&lost, 5, &actor).unwrap();
    }

    clock.advance(Duration::from_secs(30));
    let repo = open_with_clock(&dir, PartitionStrategy::Year, clock);
    let report = repo.recover_interrupted_ingestions().unwrap();
    assert_eq!(report.activated, vec![("EDU_DONE".to_string(), 2)]);
    assert_eq!(report.invalidated, vec!["EDU_LOST".to_string()]);
    assert!(report.skipped.is_empty());

    let done = repo.get_dataset_metadata("EDU_DONE").unwrap().unwrap();
    assert_eq!((done.status, done.row_count), (DatasetStatus::Active, 2));
    assert_eq!(
        repo.get_dataset_metadata("EDU_LOST").unwrap().unwrap().status,
        DatasetStatus::Invalid
    );
    assert_eq!(repo.list_ingestion_runs("EDU_LOST").unwrap()[0].status, RunStatus::Compensated);

    // Nothing left to do.
    assert_eq!(repo.recover_interrupted_ingestions().unwrap(), Default::default());
}

#[test]
fn recovery_leaves_registrations_started_after_open_alone() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new());
    let repo = open_with_clock(&dir, PartitionStrategy::Year, clock.clone());

    // Metadata committed, analytics write not yet done: looks exactly like a crash.
    clock.advance(Duration::from_secs(5));
    let running = DatasetRegistration::new(id("EDU_RUN"), "Running", "istat");
    repo.metadata().begin_registration(&running, 3, &Actor::system()).unwrap();

    let report = repo.recover_interrupted_ingestions().unwrap();
    assert_eq!(report.skipped, vec!["EDU_RUN".to_string()]);
    assert!(report.invalidated.is_empty());
    assert_eq!(
        repo.get_dataset_metadata("EDU_RUN").unwrap().unwrap().status,
        DatasetStatus::Pending
    );
}

#[test]
fn recovery_racing_a_registration_never_invalidates_it() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Year);
    let rows: Vec<ObservationRow> = (0..2_000)
        .map(|i| ObservationRow::new(format!("T{:03}", i % 50), (2000 + i % 20).to_string(), "M", Some(i as f64)))
        .collect();

    let (outcome, reports) = std::thread::scope(|s| {
        let registration = s.spawn(|| {
            repo.register_dataset_complete(RegistrationRequest::new(id("BIG_LOAD"), "Big", rows), &Actor::system())
        });
        let mut reports = Vec::new();
        while !registration.is_finished() {
            reports.push(repo.recover_interrupted_ingestions().unwrap());
        }
        (registration.join().unwrap(), reports)
    });

    let outcome = outcome.unwrap();
    assert_eq!(outcome.entry.status, DatasetStatus::Active);
    assert_eq!(outcome.entry.row_count, 2_000);
    assert!(reports.iter().all(|r| r.invalidated.is_empty() && r.activated.is_empty()));
    assert_eq!(
        repo.get_dataset_metadata("BIG_LOAD").unwrap().unwrap().status,
        DatasetStatus::Active
    );
}

#[test]
fn quality_report_summarizes_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Year);
    let rows = vec![
        ObservationRow::new("IT", "2020", "GDP", Some(10.0)).with_quality(1.0),
        ObservationRow::new("IT", "2021", "GDP", None).with_quality(0.5),
        ObservationRow::new("FR", "2021", "GDP", Some(7.0)),
        ObservationRow::new("FR", "2022-Q1", "GDP", None),
    ];
    repo.register_dataset_complete(RegistrationRequest::new(id("GDP_Q"), "GDP", rows), &Actor::system())
        .unwrap();

    let report = repo.dataset_quality("GDP_Q").unwrap();
    assert_eq!(report.row_count, 4);
    assert_eq!(report.mean_quality_score, Some(0.75));
    assert!((report.missing_value_ratio - 0.5).abs() < 1e-12);
    assert_eq!(report.territories, 2);
    assert_eq!(report.periods, 3);
    assert_eq!((report.first_year, report.last_year), (Some(2020), Some(2022)));

    assert!(matches!(
        repo.dataset_quality("NOPE"),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn pruned_query_reads_only_matching_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open(&dir, PartitionStrategy::Hybrid);
    repo.register_dataset_complete(RegistrationRequest::new(id("POP_P"), "Pruned", population_rows()), &Actor::system())
        .unwrap();

    let filters = PartitionFilters::new().year(2023).territory("IT").territory("FR");
    let pruned = repo
        .run_pruned_query(
            "SELECT territory_key, value FROM observations WHERE measure_key = ?",
            &[SqlValue::from("POP_TOTAL")],
            &filters,
        )
        .unwrap();
    assert_eq!(pruned.partitions_total, 10);
    assert_eq!(pruned.partitions_scanned.len(), 2);
    assert_eq!(pruned.result.len(), 2);

    let mut territories: Vec<_> = pruned
        .result
        .column("territory_key")
        .unwrap()
        .into_iter()
        .filter_map(SqlValue::as_str)
        .collect();
    territories.sort();
    assert_eq!(territories, ["FR", "IT"]);

    assert!(repo
        .run_pruned_query("DELETE FROM observations", &[], &filters)
        .unwrap_err()
        .is_validation());
}

#[test]
fn reopening_with_another_layout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    drop(open(&dir, PartitionStrategy::Year));

    let mut opts = RepositoryOptions::in_dir(dir.path());
    opts.strategy = PartitionStrategy::Territory;
    let err = UnifiedRepository::open_with(opts, Arc::new(ManualClock::new())).unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::Store(StoreError::LayoutConflict {
            existing: PartitionStrategy::Year,
            requested: PartitionStrategy::Territory,
        })
    ));
}

#[test]
fn data_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let repo = open(&dir, PartitionStrategy::Hybrid);
        repo.register_dataset_complete(RegistrationRequest::new(id("POP_KEEP"), "Keep", population_rows()), &Actor::system())?;
    }
    let repo = open(&dir, PartitionStrategy::Hybrid);
    let entry = repo
        .get_dataset_metadata("POP_KEEP")?
        .ok_or_else(|| anyhow::anyhow!("POP_KEEP missing after reopen"))?;
    assert_eq!(entry.row_count, 10);
    let rs = repo.run_analytics_query("SELECT COUNT(*) FROM observations WHERE dataset_id = ?", &[SqlValue::from("POP_KEEP")])?;
    assert_eq!(rs.scalar(), Some(&SqlValue::Int(10)));
    Ok(())
}
