//! SQLite metadata store.
//!
//! Holds the dataset registry, user preferences, API credentials, the
//! append-only audit log and the ingestion-run journal. One writer
//! connection serializes all writes; reads go through a pool of read-only
//! connections. The database runs in WAL mode so readers never block the
//! writer.
//!
//! Every write to a governed table (registry, preferences, credentials)
//! appends exactly one audit entry in the same transaction.

pub mod crypto;
pub(crate) mod schema;
pub mod types;

pub use crypto::FieldCipher;
pub use types::{
    Actor, ApiCredential, AuditEntry, AuditFilter, CredentialCheck, DatasetRegistration,
    DatasetRegistryEntry, IngestionRun, NewCredential, Page, PreferenceValue, Resolution,
    RunStatus, UserPreference,
};

use crate::error::{Result, StoreError};
use crate::pool::{ConnectionPool, PooledConnection};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior};
use statlake_core::{Clock, DatasetCategory, DatasetStatus};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const REGISTRY_TABLE: &str = "dataset_registry";
const PREFERENCES_TABLE: &str = "user_preferences";
const CREDENTIALS_TABLE: &str = "api_credentials";

const REGISTRY_COLUMNS: &str = "dataset_id, name, category, source, metadata, status, row_count, \
                                invalid_reason, created_at, updated_at";
const AUDIT_COLUMNS: &str = "id, operation, table_name, record_id, user_id, details, timestamp";
const RUN_COLUMNS: &str = "run_id, dataset_id, status, rows_expected, rows_written, error, \
                           started_at, finished_at";

#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub path: PathBuf,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl MetadataOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool_size: 4,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

pub struct MetadataStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: ConnectionPool<Connection>,
    cipher: FieldCipher,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("readers", &self.readers)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open (creating if needed) and migrate the database.
    pub fn open(opts: &MetadataOptions, cipher: FieldCipher, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = opts.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::validation(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let mut writer = Connection::open(&opts.path)?;
        writer.busy_timeout(opts.busy_timeout)?;
        let mode: String = writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %opts.path.display(), mode, "metadata database not in WAL mode");
        }
        writer.pragma_update(None, "foreign_keys", "ON")?;
        schema::run_migrations(&mut writer)?;

        let readers = (0..opts.pool_size.max(1))
            .map(|_| open_reader(&opts.path, opts.busy_timeout))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(path = %opts.path.display(), readers = readers.len(), "metadata store opened");
        Ok(Self {
            path: opts.path.clone(),
            writer: Mutex::new(writer),
            readers: ConnectionPool::new("metadata-readers", readers, opts.acquire_timeout),
            cipher,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest applied schema migration.
    pub fn schema_version(&self) -> Result<i64> {
        schema::current_version(&*self.reader()?)
    }

    fn reader(&self) -> Result<PooledConnection<'_, Connection>> {
        self.readers.acquire()
    }

    /// Run `f` in an immediate write transaction. `f` receives the commit timestamp.
    fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>, &str) -> Result<T>) -> Result<T> {
        let now = timestamp(self.clock.wall());
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx, &now)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Dataset registry ────────────────────────────────────────────

    /// Create or re-register a dataset. The entry is (re)set to `Pending`.
    pub fn register_dataset(&self, reg: &DatasetRegistration, actor: &Actor) -> Result<DatasetRegistryEntry> {
        self.write_tx(|tx, now| register_in(tx, reg, actor, now))
    }

    pub fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetRegistryEntry>> {
        fetch_dataset(&*self.reader()?, dataset_id)
    }

    /// Datasets ordered by id, optionally restricted to one category.
    pub fn list_by_category(&self, category: Option<DatasetCategory>, page: Page) -> Result<Vec<DatasetRegistryEntry>> {
        let conn = self.reader()?;
        let rows = match category {
            Some(category) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REGISTRY_COLUMNS} FROM dataset_registry
                     WHERE category = ?1 ORDER BY dataset_id LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt
                    .query_map(params![category.as_str(), page.limit, page.offset], registry_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REGISTRY_COLUMNS} FROM dataset_registry
                     ORDER BY dataset_id LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(params![page.limit, page.offset], registry_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn list_pending_datasets(&self) -> Result<Vec<DatasetRegistryEntry>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM dataset_registry WHERE status = 'pending' ORDER BY dataset_id"
        ))?;
        let rows = stmt
            .query_map([], registry_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_dataset_active(&self, dataset_id: &str, row_count: u64, actor: &Actor) -> Result<()> {
        self.write_tx(|tx, now| {
            set_status(tx, dataset_id, DatasetStatus::Active, Some(row_count), None, now)?;
            insert_audit(
                tx,
                "activate",
                REGISTRY_TABLE,
                dataset_id,
                actor,
                Some(&serde_json::json!({ "row_count": row_count }).to_string()),
                now,
            )?;
            Ok(())
        })
    }

    pub fn mark_dataset_invalid(&self, dataset_id: &str, reason: &str, actor: &Actor) -> Result<()> {
        self.write_tx(|tx, now| {
            set_status(tx, dataset_id, DatasetStatus::Invalid, None, Some(reason), now)?;
            insert_audit(
                tx,
                "invalidate",
                REGISTRY_TABLE,
                dataset_id,
                actor,
                Some(&serde_json::json!({ "reason": reason }).to_string()),
                now,
            )?;
            Ok(())
        })
    }

    // ── Ingestion saga ──────────────────────────────────────────────

    /// Register the dataset as `Pending` and open an ingestion run, atomically.
    pub fn begin_registration(
        &self,
        reg: &DatasetRegistration,
        rows_expected: u64,
        actor: &Actor,
    ) -> Result<(DatasetRegistryEntry, IngestionRun)> {
        self.write_tx(|tx, now| {
            let entry = register_in(tx, reg, actor, now)?;
            let run = insert_run(tx, reg.dataset_id.as_str(), rows_expected, now)?;
            Ok((entry, run))
        })
    }

    /// Close a run as completed and activate its dataset.
    pub fn complete_ingestion(
        &self,
        run_id: i64,
        dataset_id: &str,
        row_count: u64,
        rows_written: u64,
        actor: &Actor,
    ) -> Result<DatasetRegistryEntry> {
        self.write_tx(|tx, now| {
            close_run(tx, run_id, RunStatus::Completed, Some(rows_written), None, now)?;
            set_status(tx, dataset_id, DatasetStatus::Active, Some(row_count), None, now)?;
            insert_audit(
                tx,
                "activate",
                REGISTRY_TABLE,
                dataset_id,
                actor,
                Some(&serde_json::json!({ "run_id": run_id, "rows_written": rows_written, "row_count": row_count }).to_string()),
                now,
            )?;
            fetch_dataset(tx, dataset_id)?.ok_or_else(|| StoreError::not_found("dataset", dataset_id))
        })
    }

    /// Close a run as compensated and mark its dataset invalid.
    pub fn compensate_ingestion(&self, run_id: i64, dataset_id: &str, reason: &str, actor: &Actor) -> Result<()> {
        self.write_tx(|tx, now| {
            close_run(tx, run_id, RunStatus::Compensated, Some(0), Some(reason), now)?;
            set_status(tx, dataset_id, DatasetStatus::Invalid, None, Some(reason), now)?;
            insert_audit(
                tx,
                "invalidate",
                REGISTRY_TABLE,
                dataset_id,
                actor,
                Some(&serde_json::json!({ "run_id": run_id, "reason": reason }).to_string()),
                now,
            )?;
            Ok(())
        })
    }

    /// Settle a `Pending` dataset and every open run for it.
    pub fn resolve_pending(&self, dataset_id: &str, resolution: &Resolution, actor: &Actor) -> Result<()> {
        self.write_tx(|tx, now| {
            let details = match resolution {
                Resolution::Active { row_count } => {
                    tx.execute(
                        "UPDATE ingestion_runs SET status = 'completed', rows_written = ?1, finished_at = ?2
                         WHERE dataset_id = ?3 AND status = 'pending'",
                        params![*row_count as i64, now, dataset_id],
                    )?;
                    set_status(tx, dataset_id, DatasetStatus::Active, Some(*row_count), None, now)?;
                    serde_json::json!({ "resolution": "active", "row_count": row_count })
                }
                Resolution::Invalid { reason } => {
                    tx.execute(
                        "UPDATE ingestion_runs SET status = 'compensated', rows_written = 0, error = ?1, finished_at = ?2
                         WHERE dataset_id = ?3 AND status = 'pending'",
                        params![reason, now, dataset_id],
                    )?;
                    set_status(tx, dataset_id, DatasetStatus::Invalid, None, Some(reason.as_str()), now)?;
                    serde_json::json!({ "resolution": "invalid", "reason": reason })
                }
            };
            insert_audit(tx, "recover", REGISTRY_TABLE, dataset_id, actor, Some(&details.to_string()), now)?;
            Ok(())
        })
    }

    pub fn begin_ingestion_run(&self, dataset_id: &str, rows_expected: u64) -> Result<IngestionRun> {
        self.write_tx(|tx, now| {
            if fetch_dataset(tx, dataset_id)?.is_none() {
                return Err(StoreError::not_found("dataset", dataset_id));
            }
            insert_run(tx, dataset_id, rows_expected, now)
        })
    }

    pub fn finish_ingestion_run(
        &self,
        run_id: i64,
        status: RunStatus,
        rows_written: Option<u64>,
        error: Option<&str>,
    ) -> Result<()> {
        if status == RunStatus::Pending {
            return Err(StoreError::validation("an ingestion run cannot finish as pending"));
        }
        self.write_tx(|tx, now| close_run(tx, run_id, status, rows_written, error, now))
    }

    pub fn get_ingestion_run(&self, run_id: i64) -> Result<Option<IngestionRun>> {
        let conn = self.reader()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE run_id = ?1"),
                [run_id],
                run_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Runs for a dataset, oldest first.
    pub fn list_ingestion_runs(&self, dataset_id: &str) -> Result<Vec<IngestionRun>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE dataset_id = ?1 ORDER BY run_id"
        ))?;
        let runs = stmt
            .query_map([dataset_id], run_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    // ── Preferences ─────────────────────────────────────────────────

    /// Upsert a preference. With `encrypt`, the value is sealed before it
    /// reaches the database and reads return `PreferenceValue::Sealed`.
    pub fn set_user_preference(
        &self,
        user_id: &str,
        key: &str,
        value: &PreferenceValue,
        encrypt: bool,
        actor: &Actor,
    ) -> Result<()> {
        if user_id.is_empty() || key.is_empty() {
            return Err(StoreError::validation("preference user_id and key must be non-empty"));
        }
        let (Some(value_type), Some(text)) = (value.value_type(), value.to_storage()) else {
            return Err(StoreError::validation("a sealed placeholder cannot be stored"));
        };
        let stored = if encrypt {
            self.cipher.seal(&text, &crypto::preference_aad(user_id, key))?
        } else {
            text
        };

        self.write_tx(|tx, now| {
            tx.execute(
                "INSERT INTO user_preferences (user_id, preference_key, value, value_type, encrypted, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, preference_key) DO UPDATE SET
                     value = excluded.value,
                     value_type = excluded.value_type,
                     encrypted = excluded.encrypted,
                     updated_at = excluded.updated_at",
                params![user_id, key, stored, value_type, encrypt, now],
            )?;
            insert_audit(
                tx,
                "set",
                PREFERENCES_TABLE,
                &format!("{user_id}/{key}"),
                actor,
                Some(&serde_json::json!({ "value_type": value_type, "encrypted": encrypt }).to_string()),
                now,
            )?;
            Ok(())
        })
    }

    /// All preferences for a user, ordered by key. Encrypted values come back sealed.
    pub fn get_user_preferences(&self, user_id: &str) -> Result<Vec<UserPreference>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, preference_key, value, value_type, encrypted, updated_at
             FROM user_preferences WHERE user_id = ?1 ORDER BY preference_key",
        )?;
        let prefs = stmt
            .query_map([user_id], |row| {
                let encrypted: bool = row.get(4)?;
                let value = if encrypted {
                    PreferenceValue::Sealed
                } else {
                    let value_type: String = row.get(3)?;
                    PreferenceValue::from_storage(&value_type, row.get(2)?).map_err(|e| conversion_err(2, e))?
                };
                Ok(UserPreference {
                    user_id: row.get(0)?,
                    preference_key: row.get(1)?,
                    value,
                    encrypted,
                    updated_at: ts_col(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prefs)
    }

    /// Decrypted value of one preference. The only path that opens sealed fields.
    pub fn reveal_user_preference(&self, user_id: &str, key: &str) -> Result<Option<PreferenceValue>> {
        let row: Option<(String, String, bool)> = self
            .reader()?
            .query_row(
                "SELECT value, value_type, encrypted FROM user_preferences
                 WHERE user_id = ?1 AND preference_key = ?2",
                params![user_id, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((stored, value_type, encrypted)) = row else {
            return Ok(None);
        };
        let text = if encrypted {
            self.cipher.open(&stored, &crypto::preference_aad(user_id, key))?
        } else {
            stored
        };
        PreferenceValue::from_storage(&value_type, text)
            .map(Some)
            .map_err(StoreError::StorageIntegrity)
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// Store a new secret for a service and revoke every older one, atomically.
    pub fn store_credential(&self, cred: &NewCredential, actor: &Actor) -> Result<ApiCredential> {
        if cred.service_name.is_empty() || cred.secret.is_empty() {
            return Err(StoreError::validation("credential service_name and secret must be non-empty"));
        }
        let hash = self.cipher.hash_secret(&cred.service_name, &cred.secret);
        let scopes = serde_json::to_string(&cred.scopes)?;

        self.write_tx(|tx, now| {
            tx.execute(
                "INSERT INTO api_credentials (service_name, secret_hash, scopes, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cred.service_name,
                    hash,
                    scopes,
                    cred.expires_at.map(timestamp),
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            let revoked = tx.execute(
                "UPDATE api_credentials SET revoked_at = ?1
                 WHERE service_name = ?2 AND id <> ?3 AND revoked_at IS NULL",
                params![now, cred.service_name, id],
            )?;
            let operation = if revoked > 0 { "rotate" } else { "create" };
            insert_audit(
                tx,
                operation,
                CREDENTIALS_TABLE,
                &cred.service_name,
                actor,
                Some(&serde_json::json!({ "credential_id": id, "revoked": revoked, "scopes": cred.scopes }).to_string()),
                now,
            )?;
            if revoked > 0 {
                tracing::info!(service = %cred.service_name, revoked, "credential rotated");
            }

            tx.query_row(
                "SELECT id, service_name, scopes, expires_at, created_at, revoked_at
                 FROM api_credentials WHERE id = ?1",
                [id],
                credential_row,
            )
            .map_err(StoreError::from)
        })
    }

    /// Check a presented secret against the live credentials of a service.
    pub fn validate_credential(&self, service_name: &str, secret: &str) -> Result<CredentialCheck> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_name, scopes, expires_at, created_at, revoked_at, secret_hash
             FROM api_credentials WHERE service_name = ?1 AND revoked_at IS NULL",
        )?;
        let live = stmt
            .query_map([service_name], |row| Ok((credential_row(row)?, row.get::<_, String>(6)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let now = self.clock.wall();
        for (credential, hash) in live {
            if self.cipher.verify_secret(service_name, secret, &hash) {
                if credential.expires_at.is_some_and(|at| at <= now) {
                    return Ok(CredentialCheck::Expired);
                }
                return Ok(CredentialCheck::Valid(credential));
            }
        }
        Ok(CredentialCheck::Invalid)
    }

    // ── Audit ───────────────────────────────────────────────────────

    /// Append a free-standing audit entry. Returns its id.
    pub fn append_audit(
        &self,
        operation: &str,
        table_name: &str,
        record_id: &str,
        actor: &Actor,
        details: Option<&str>,
    ) -> Result<i64> {
        if operation.is_empty() || table_name.is_empty() {
            return Err(StoreError::validation("audit operation and table_name must be non-empty"));
        }
        self.write_tx(|tx, now| insert_audit(tx, operation, table_name, record_id, actor, details, now))
    }

    /// Audit entries matching every set filter, oldest first.
    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut sql = format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        let conditions = [
            ("table_name =", filter.table_name.clone().map(Value::Text)),
            ("record_id =", filter.record_id.clone().map(Value::Text)),
            ("user_id =", filter.user_id.clone().map(Value::Text)),
            ("operation =", filter.operation.clone().map(Value::Text)),
            ("timestamp >=", filter.since.map(|t| Value::Text(timestamp(t)))),
            ("timestamp <=", filter.until.map(|t| Value::Text(timestamp(t)))),
        ];
        for (clause, value) in conditions {
            if let Some(value) = value {
                values.push(value);
                let _ = write!(sql, " AND {clause} ?{}", values.len());
            }
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            values.push(Value::Integer(i64::from(limit)));
            let _ = write!(sql, " LIMIT ?{}", values.len());
        }

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values.iter()), audit_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

fn open_reader(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

// ── Transaction bodies ──────────────────────────────────────────────

fn register_in(
    tx: &Connection,
    reg: &DatasetRegistration,
    actor: &Actor,
    now: &str,
) -> Result<DatasetRegistryEntry> {
    if reg.name.trim().is_empty() {
        return Err(StoreError::validation("dataset name must be non-empty"));
    }
    let dataset_id = reg.dataset_id.as_str();
    let category = reg.resolved_category();
    let existed = fetch_dataset(tx, dataset_id)?.is_some();

    tx.execute(
        "INSERT INTO dataset_registry
             (dataset_id, name, category, source, metadata, status, row_count, invalid_reason, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, NULL, ?6, ?6)
         ON CONFLICT(dataset_id) DO UPDATE SET
             name = excluded.name,
             category = excluded.category,
             source = excluded.source,
             metadata = excluded.metadata,
             status = 'pending',
             invalid_reason = NULL,
             updated_at = excluded.updated_at",
        params![
            dataset_id,
            reg.name,
            category.as_str(),
            reg.source,
            serde_json::to_string(&reg.metadata)?,
            now
        ],
    )?;
    insert_audit(
        tx,
        if existed { "update" } else { "create" },
        REGISTRY_TABLE,
        dataset_id,
        actor,
        Some(&serde_json::json!({ "category": category.as_str(), "source": reg.source }).to_string()),
        now,
    )?;

    fetch_dataset(tx, dataset_id)?.ok_or_else(|| StoreError::not_found("dataset", dataset_id))
}

fn set_status(
    tx: &Connection,
    dataset_id: &str,
    status: DatasetStatus,
    row_count: Option<u64>,
    reason: Option<&str>,
    now: &str,
) -> Result<()> {
    let updated = tx.execute(
        "UPDATE dataset_registry
         SET status = ?1, row_count = COALESCE(?2, row_count), invalid_reason = ?3, updated_at = ?4
         WHERE dataset_id = ?5",
        params![status.as_str(), row_count.map(|n| n as i64), reason, now, dataset_id],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("dataset", dataset_id));
    }
    Ok(())
}

fn insert_run(tx: &Connection, dataset_id: &str, rows_expected: u64, now: &str) -> Result<IngestionRun> {
    tx.execute(
        "INSERT INTO ingestion_runs (dataset_id, status, rows_expected, started_at)
         VALUES (?1, 'pending', ?2, ?3)",
        params![dataset_id, rows_expected as i64, now],
    )?;
    let run_id = tx.last_insert_rowid();
    tx.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM ingestion_runs WHERE run_id = ?1"),
        [run_id],
        run_row,
    )
    .map_err(StoreError::from)
}

fn close_run(
    tx: &Connection,
    run_id: i64,
    status: RunStatus,
    rows_written: Option<u64>,
    error: Option<&str>,
    now: &str,
) -> Result<()> {
    let updated = tx.execute(
        "UPDATE ingestion_runs SET status = ?1, rows_written = ?2, error = ?3, finished_at = ?4
         WHERE run_id = ?5 AND status = 'pending'",
        params![status.as_str(), rows_written.map(|n| n as i64), error, now, run_id],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("pending ingestion run", run_id.to_string()));
    }
    Ok(())
}

fn insert_audit(
    tx: &Connection,
    operation: &str,
    table_name: &str,
    record_id: &str,
    actor: &Actor,
    details: Option<&str>,
    now: &str,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO audit_log (operation, table_name, record_id, user_id, details, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![operation, table_name, record_id, actor.user_id, details, now],
    )?;
    Ok(tx.last_insert_rowid())
}

fn fetch_dataset(conn: &Connection, dataset_id: &str) -> Result<Option<DatasetRegistryEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {REGISTRY_COLUMNS} FROM dataset_registry WHERE dataset_id = ?1"),
            [dataset_id],
            registry_row,
        )
        .optional()?;
    Ok(entry)
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Storage form: RFC 3339, UTC, microsecond precision. Sorts lexically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parsed_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_err(idx, e))
}

fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn registry_row(row: &Row<'_>) -> rusqlite::Result<DatasetRegistryEntry> {
    let metadata: String = row.get(4)?;
    Ok(DatasetRegistryEntry {
        dataset_id: row.get(0)?,
        name: row.get(1)?,
        category: parsed_col(row, 2)?,
        source: row.get(3)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_err(4, e))?,
        status: parsed_col(row, 5)?,
        row_count: count_col(row, 6)?,
        invalid_reason: row.get(7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<IngestionRun> {
    Ok(IngestionRun {
        run_id: row.get(0)?,
        dataset_id: row.get(1)?,
        status: parsed_col(row, 2)?,
        rows_expected: count_col(row, 3)?,
        rows_written: row.get::<_, Option<i64>>(4)?.map(|n| n.max(0) as u64),
        error: row.get(5)?,
        started_at: ts_col(row, 6)?,
        finished_at: opt_ts_col(row, 7)?,
    })
}

fn credential_row(row: &Row<'_>) -> rusqlite::Result<ApiCredential> {
    let scopes: String = row.get(2)?;
    Ok(ApiCredential {
        id: row.get(0)?,
        service_name: row.get(1)?,
        scopes: serde_json::from_str(&scopes).map_err(|e| conversion_err(2, e))?,
        expires_at: opt_ts_col(row, 3)?,
        created_at: ts_col(row, 4)?,
        revoked_at: opt_ts_col(row, 5)?,
    })
}

fn audit_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        operation: row.get(1)?,
        table_name: row.get(2)?,
        record_id: row.get(3)?,
        user_id: row.get(4)?,
        details: row.get(5)?,
        timestamp: ts_col(row, 6)?,
    })
}
