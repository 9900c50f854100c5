//! Unified repository: one entry point over both stores.
//!
//! Registration is a saga. The metadata write (dataset `Pending`, an
//! ingestion run and its audit entry) commits first; the analytics insert
//! runs second in its own transaction. If the insert fails the metadata is
//! compensated: dataset `Invalid`, run `Compensated`. A crash between the two
//! leaves the dataset `Pending`, which `recover_interrupted_ingestions`
//! settles on the next start. Recovery leaves alone any registration this
//! repository is still running and any run started after it was opened.

use crate::analytics::{AnalyticsOptions, AnalyticsStore, ResultSet, TableName};
use crate::error::{Compensation, RepositoryError, Result, StoreError};
use crate::metadata::{
    Actor, ApiCredential, AuditEntry, AuditFilter, CredentialCheck, DatasetRegistration,
    DatasetRegistryEntry, FieldCipher, IngestionRun, MetadataOptions, MetadataStore, NewCredential,
    Page, PreferenceValue, Resolution, RunStatus, UserPreference,
};
use crate::optimizer::{CacheOptions, CacheStats, QueryOptimizer, TableStatistics};
use crate::partition::{PartitionFilters, PartitionInfo, PartitionManager};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use statlake_core::config::master_key_from_env;
use statlake_core::{
    system_clock, Clock, DatasetCategory, DatasetId, DatasetStatus, ObservationRow, PartitionStrategy,
    SqlValue, StatlakeConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Everything needed to open both stores.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub metadata: MetadataOptions,
    pub analytics: AnalyticsOptions,
    pub cache: CacheOptions,
    pub strategy: PartitionStrategy,
    pub master_key: Option<String>,
}

impl RepositoryOptions {
    pub fn from_config(cfg: &StatlakeConfig, master_key: Option<String>) -> Self {
        let storage = &cfg.storage;
        Self {
            metadata: MetadataOptions {
                path: storage.metadata_path.clone(),
                pool_size: storage.pool_size,
                acquire_timeout: storage.acquire_timeout(),
                busy_timeout: storage.busy_timeout(),
            },
            analytics: AnalyticsOptions {
                path: Some(storage.analytics_path.clone()),
                pool_size: storage.pool_size,
                acquire_timeout: storage.acquire_timeout(),
            },
            cache: CacheOptions::from(&cfg.cache),
            strategy: cfg.partitioning.strategy,
            master_key,
        }
    }

    /// Both database files under `dir`, default settings.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            metadata: MetadataOptions::new(dir.join("metadata.sqlite")),
            analytics: AnalyticsOptions::file(dir.join("analytics.duckdb")),
            cache: CacheOptions::default(),
            strategy: PartitionStrategy::default(),
            master_key: None,
        }
    }
}

/// A dataset plus its observations.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub dataset_id: DatasetId,
    pub name: String,
    /// `None` infers from the id, then the name.
    pub category: Option<DatasetCategory>,
    pub source: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub rows: Vec<ObservationRow>,
}

impl RegistrationRequest {
    pub fn new(dataset_id: DatasetId, name: impl Into<String>, rows: Vec<ObservationRow>) -> Self {
        Self {
            dataset_id,
            name: name.into(),
            category: None,
            source: "upstream".into(),
            metadata: serde_json::Map::new(),
            rows,
        }
    }

    pub fn with_category(mut self, category: DatasetCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub entry: DatasetRegistryEntry,
    pub run: IngestionRun,
    pub rows_written: usize,
    pub partitions: Vec<TableName>,
    pub created_partitions: Vec<TableName>,
}

/// Data-quality summary consumed by BI template generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset_id: String,
    pub status: DatasetStatus,
    pub row_count: u64,
    pub mean_quality_score: Option<f64>,
    /// Share of rows with a null value; 0 for an empty dataset.
    pub missing_value_ratio: f64,
    pub territories: u64,
    pub periods: u64,
    pub first_year: Option<i32>,
    pub last_year: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct PrunedResult {
    pub result: Arc<ResultSet>,
    pub partitions_scanned: Vec<TableName>,
    pub partitions_total: usize,
}

/// What `recover_interrupted_ingestions` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Datasets activated, with their counted rows.
    pub activated: Vec<(String, u64)>,
    pub invalidated: Vec<String>,
    /// Pending datasets whose registration is still running.
    pub skipped: Vec<String>,
}

/// Dataset ids with a registration in progress, counted per id.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashMap<String, usize>>);

impl InFlight {
    fn enter(&self, dataset_id: &str) -> InFlightGuard<'_> {
        *self.0.lock().entry(dataset_id.to_string()).or_default() += 1;
        InFlightGuard {
            set: self,
            dataset_id: dataset_id.to_string(),
        }
    }

    /// Run `f` unless a registration of `dataset_id` is in progress. New
    /// registrations of any dataset wait until `f` returns.
    fn unless_running<R>(&self, dataset_id: &str, f: impl FnOnce() -> R) -> Option<R> {
        let running = self.0.lock();
        if running.contains_key(dataset_id) {
            return None;
        }
        Some(f())
    }
}

struct InFlightGuard<'a> {
    set: &'a InFlight,
    dataset_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.set.0.lock();
        if let Some(n) = map.get_mut(&self.dataset_id) {
            *n -= 1;
            if *n == 0 {
                map.remove(&self.dataset_id);
            }
        }
    }
}

pub struct UnifiedRepository {
    metadata: MetadataStore,
    analytics: Arc<AnalyticsStore>,
    partitions: Arc<PartitionManager>,
    optimizer: QueryOptimizer,
    clock: Arc<dyn Clock>,
    opened_at: DateTime<Utc>,
    in_flight: InFlight,
}

impl std::fmt::Debug for UnifiedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedRepository")
            .field("metadata", &self.metadata)
            .field("analytics", &self.analytics)
            .field("optimizer", &self.optimizer)
            .finish_non_exhaustive()
    }
}

impl UnifiedRepository {
    /// Open from configuration; the master key comes from the environment.
    pub fn open(cfg: &StatlakeConfig) -> Result<Self, RepositoryError> {
        Self::open_with(RepositoryOptions::from_config(cfg, master_key_from_env()), system_clock())
    }

    pub fn open_with(opts: RepositoryOptions, clock: Arc<dyn Clock>) -> Result<Self, RepositoryError> {
        let cipher = FieldCipher::new(opts.master_key.as_deref());
        if !cipher.can_seal() {
            tracing::warn!("no master key configured; encrypted preferences are unavailable");
        }
        let metadata = MetadataStore::open(&opts.metadata, cipher, clock.clone())?;
        let analytics = Arc::new(AnalyticsStore::open(&opts.analytics)?);
        let partitions = Arc::new(PartitionManager::new(analytics.clone(), clock.clone()));
        partitions.create_partitioned_layout(opts.strategy)?;
        let optimizer = QueryOptimizer::new(analytics.clone(), partitions.clone(), opts.cache, clock.clone());

        tracing::info!(
            metadata = %opts.metadata.path.display(),
            strategy = %opts.strategy,
            "repository opened"
        );
        Ok(Self {
            metadata,
            analytics,
            partitions,
            optimizer,
            // Run timestamps are stored with microsecond precision.
            opened_at: clock.wall().trunc_subsecs(6),
            clock,
            in_flight: InFlight::default(),
        })
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn analytics(&self) -> &AnalyticsStore {
        &self.analytics
    }

    pub fn optimizer(&self) -> &QueryOptimizer {
        &self.optimizer
    }

    pub fn partition_manager(&self) -> &PartitionManager {
        &self.partitions
    }

    // ── Registration saga ───────────────────────────────────────────

    /// Register a dataset and load its observations.
    ///
    /// On an analytics failure the metadata is compensated and the error says
    /// whether that worked (`MarkedInvalid`) or not (`StorageIntegrity`).
    pub fn register_dataset_complete(
        &self,
        req: RegistrationRequest,
        actor: &Actor,
    ) -> Result<RegistrationOutcome, RepositoryError> {
        let RegistrationRequest {
            dataset_id,
            name,
            category,
            source,
            metadata,
            rows,
        } = req;
        let id = dataset_id.as_str().to_string();
        let reg = DatasetRegistration {
            dataset_id,
            name,
            category,
            source,
            metadata,
        };

        let _registering = self.in_flight.enter(&id);
        let (_, run) = self.metadata.begin_registration(&reg, rows.len() as u64, actor)?;
        tracing::debug!(dataset_id = %id, run_id = run.run_id, rows = rows.len(), "registration started");

        let ingested_at = self.clock.wall();
        let observations: Vec<_> = rows
            .into_iter()
            .map(|row| row.into_observation(&id, ingested_at))
            .collect();

        let summary = match self.partitions.insert_observations(&observations) {
            Ok(summary) => summary,
            Err(cause) => return Err(self.compensate(&id, run.run_id, cause, actor)),
        };
        self.optimizer.invalidate(&id);

        let row_count = self
            .analytics
            .row_count(&id)
            .map_err(|e| integrity(&id, "rows written but could not be counted", e))?;
        let entry = self
            .metadata
            .complete_ingestion(run.run_id, &id, row_count, summary.rows_written as u64, actor)
            .map_err(|e| integrity(&id, "rows written but the dataset could not be activated", e))?;

        if let Err(e) = self.optimizer.create_recommended_indexes() {
            tracing::warn!(dataset_id = %id, error = %e, "index maintenance after ingestion failed");
        }

        let run = self.metadata.get_ingestion_run(run.run_id)?.unwrap_or(run);
        tracing::info!(
            dataset_id = %id,
            rows = summary.rows_written,
            partitions = summary.partitions.len(),
            "dataset registered"
        );
        Ok(RegistrationOutcome {
            entry,
            run,
            rows_written: summary.rows_written,
            partitions: summary.partitions,
            created_partitions: summary.created_partitions,
        })
    }

    fn compensate(&self, dataset_id: &str, run_id: i64, cause: StoreError, actor: &Actor) -> RepositoryError {
        tracing::warn!(dataset_id, run_id, error = %cause, "analytics write failed; compensating");
        let compensation = match self
            .metadata
            .compensate_ingestion(run_id, dataset_id, &cause.to_string(), actor)
        {
            Ok(()) => Compensation::MarkedInvalid,
            Err(e) => {
                tracing::error!(dataset_id, run_id, error = %e, "compensation failed; dataset left pending");
                Compensation::StorageIntegrity(e.to_string())
            }
        };
        RepositoryError::IngestionFailed {
            dataset_id: dataset_id.to_string(),
            cause: Box::new(cause),
            compensation,
        }
    }

    /// Settle datasets left `Pending` by an interrupted registration:
    /// rows present means `Active`, none means `Invalid`.
    ///
    /// Registrations running in this repository, and runs started after it
    /// was opened, are reported as skipped and left untouched.
    pub fn recover_interrupted_ingestions(&self) -> Result<RecoveryReport, RepositoryError> {
        let actor = Actor::system();
        let mut report = RecoveryReport::default();

        for entry in self.metadata.list_pending_datasets()? {
            let id = entry.dataset_id;
            let settled = self
                .in_flight
                .unless_running(&id, || self.settle_pending(&id, &actor, &mut report))
                .transpose()?
                .unwrap_or(false);
            if !settled {
                tracing::debug!(dataset_id = %id, "registration in progress; not recovering");
                report.skipped.push(id);
            }
        }

        if !report.activated.is_empty() || !report.invalidated.is_empty() {
            tracing::warn!(
                activated = report.activated.len(),
                invalidated = report.invalidated.len(),
                "recovered interrupted ingestions"
            );
        }
        Ok(report)
    }

    /// Returns false, touching nothing, when a run started after open is pending.
    fn settle_pending(
        &self,
        id: &str,
        actor: &Actor,
        report: &mut RecoveryReport,
    ) -> Result<bool, RepositoryError> {
        if self.started_since_open(id)? {
            return Ok(false);
        }
        let rows = self.analytics.row_count(id)?;
        if rows > 0 {
            self.metadata
                .resolve_pending(id, &Resolution::Active { row_count: rows }, actor)?;
            report.activated.push((id.to_string(), rows));
        } else {
            let reason = "ingestion interrupted before any rows were written".to_string();
            self.metadata
                .resolve_pending(id, &Resolution::Invalid { reason }, actor)?;
            report.invalidated.push(id.to_string());
        }
        self.optimizer.invalidate(id);
        Ok(true)
    }

    /// Whether `dataset_id` has a pending run started after this repository opened.
    fn started_since_open(&self, dataset_id: &str) -> Result<bool> {
        Ok(self
            .metadata
            .list_ingestion_runs(dataset_id)?
            .iter()
            .any(|run| run.status == RunStatus::Pending && run.started_at >= self.opened_at))
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get_dataset_metadata(&self, dataset_id: &str) -> Result<Option<DatasetRegistryEntry>> {
        self.metadata.get_dataset(dataset_id)
    }

    pub fn list_datasets(&self, category: Option<DatasetCategory>, page: Page) -> Result<Vec<DatasetRegistryEntry>> {
        self.metadata.list_by_category(category, page)
    }

    /// Cached read-only query over the analytics store.
    pub fn run_analytics_query(&self, sql: &str, params: &[SqlValue]) -> Result<Arc<ResultSet>> {
        self.optimizer.query(sql, params)
    }

    /// Read-only query restricted by `filters`, reading only matching partitions.
    pub fn run_pruned_query(
        &self,
        base_query: &str,
        params: &[SqlValue],
        filters: &PartitionFilters,
    ) -> Result<PrunedResult> {
        crate::optimizer::ensure_read_only(base_query)?;
        let pruned = self.partitions.prune_query(base_query, params, filters)?;
        tracing::debug!(
            scanned = pruned.partitions_scanned.len(),
            total = pruned.partitions_total,
            "pruned query"
        );
        let result = self.optimizer.query(&pruned.sql, &pruned.params)?;
        Ok(PrunedResult {
            result,
            partitions_scanned: pruned.partitions_scanned,
            partitions_total: pruned.partitions_total,
        })
    }

    pub fn dataset_quality(&self, dataset_id: &str) -> Result<QualityReport> {
        let entry = self
            .metadata
            .get_dataset(dataset_id)?
            .ok_or_else(|| StoreError::not_found("dataset", dataset_id))?;

        let rs = self.optimizer.query(
            "SELECT COUNT(*) AS row_count,
                    AVG(quality_score) AS mean_quality,
                    COUNT(*) - COUNT(value) AS missing,
                    COUNT(DISTINCT territory_key) AS territories,
                    COUNT(DISTINCT time_key) AS periods,
                    MIN(period_year) AS first_year,
                    MAX(period_year) AS last_year
             FROM observations WHERE dataset_id = ?",
            &[SqlValue::from(dataset_id)],
        )?;

        let count = |col: &str| rs.get(0, col).and_then(SqlValue::as_i64).unwrap_or(0).max(0) as u64;
        let year = |col: &str| rs.get(0, col).and_then(SqlValue::as_i64).and_then(|y| i32::try_from(y).ok());
        let row_count = count("row_count");
        let missing = count("missing");

        Ok(QualityReport {
            dataset_id: entry.dataset_id,
            status: entry.status,
            row_count,
            mean_quality_score: rs.get(0, "mean_quality").and_then(SqlValue::as_f64),
            missing_value_ratio: if row_count == 0 {
                0.0
            } else {
                missing as f64 / row_count as f64
            },
            territories: count("territories"),
            periods: count("periods"),
            first_year: year("first_year"),
            last_year: year("last_year"),
        })
    }

    pub fn list_ingestion_runs(&self, dataset_id: &str) -> Result<Vec<IngestionRun>> {
        self.metadata.list_ingestion_runs(dataset_id)
    }

    pub fn partitions(&self) -> Result<Vec<PartitionInfo>> {
        self.partitions.partitions()
    }

    // ── Optimizer ───────────────────────────────────────────────────

    pub fn cache_stats(&self) -> CacheStats {
        self.optimizer.cache_stats()
    }

    pub fn invalidate_cache(&self, dataset_id: &str) -> usize {
        self.optimizer.invalidate(dataset_id)
    }

    pub fn create_recommended_indexes(&self) -> Result<usize> {
        self.optimizer.create_recommended_indexes()
    }

    pub fn refresh_statistics(&self) -> Result<Vec<TableStatistics>> {
        self.optimizer.refresh_statistics()
    }

    // ── Preferences, credentials, audit ─────────────────────────────

    pub fn set_user_preference(
        &self,
        user_id: &str,
        key: &str,
        value: &PreferenceValue,
        encrypt: bool,
        actor: &Actor,
    ) -> Result<()> {
        self.metadata.set_user_preference(user_id, key, value, encrypt, actor)
    }

    pub fn get_user_preferences(&self, user_id: &str) -> Result<Vec<UserPreference>> {
        self.metadata.get_user_preferences(user_id)
    }

    pub fn reveal_user_preference(&self, user_id: &str, key: &str) -> Result<Option<PreferenceValue>> {
        self.metadata.reveal_user_preference(user_id, key)
    }

    pub fn store_credential(&self, cred: &NewCredential, actor: &Actor) -> Result<ApiCredential> {
        self.metadata.store_credential(cred, actor)
    }

    pub fn validate_credential(&self, service_name: &str, secret: &str) -> Result<CredentialCheck> {
        self.metadata.validate_credential(service_name, secret)
    }

    pub fn append_audit(
        &self,
        operation: &str,
        table_name: &str,
        record_id: &str,
        actor: &Actor,
        details: Option<&str>,
    ) -> Result<i64> {
        self.metadata.append_audit(operation, table_name, record_id, actor, details)
    }

    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.metadata.query_audit(filter)
    }
}

fn integrity(dataset_id: &str, what: &str, e: StoreError) -> RepositoryError {
    tracing::error!(dataset_id, error = %e, "{what}");
    RepositoryError::Store(StoreError::StorageIntegrity(format!("{dataset_id}: {what}: {e}")))
}
