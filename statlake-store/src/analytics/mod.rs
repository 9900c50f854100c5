//! DuckDB analytics store.
//!
//! Observations live in partition tables behind the `observations` view.
//! Writes go through a single writer connection inside a transaction; reads
//! use pooled clones of the same database handle.
//!
//! Every variable value is bound as a positional parameter. The only
//! identifiers ever spliced into SQL are [`TableName`]s.

pub mod result;
pub mod table;

pub use result::ResultSet;
pub use table::{TableName, BASE_TABLE, OBSERVATIONS_VIEW, PARTITION_PREFIX};

use crate::error::{Result, StoreError};
use crate::pool::{ConnectionPool, PooledConnection};
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection, Transaction};
use parking_lot::Mutex;
use statlake_core::{Observation, SqlValue};
use std::borrow::Borrow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use table::{observation_table_ddl, OBSERVATION_ARITY, OBSERVATION_COLUMNS};

/// Rows per multi-row `INSERT`.
const INSERT_CHUNK: usize = 256;

const SUPPORT_DDL: &str = "
CREATE TABLE IF NOT EXISTS partition_layout (
    strategy   VARCHAR NOT NULL,
    created_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS partition_catalog (
    table_name    VARCHAR NOT NULL,
    year          INTEGER,
    territory_key VARCHAR,
    created_at    BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS optimizer_statistics (
    table_name           VARCHAR NOT NULL,
    row_count            BIGINT NOT NULL,
    distinct_datasets    BIGINT NOT NULL,
    distinct_territories BIGINT NOT NULL,
    min_year             INTEGER,
    max_year             INTEGER,
    refreshed_at         BIGINT NOT NULL
);
CREATE VIEW IF NOT EXISTS observations AS SELECT * FROM observations_base;
";

#[derive(Debug, Clone)]
pub struct AnalyticsOptions {
    /// `None` keeps the database in memory.
    pub path: Option<PathBuf>,
    pub pool_size: usize,
    pub acquire_timeout: Duration,
}

impl AnalyticsOptions {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            pool_size: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub struct AnalyticsStore {
    path: Option<PathBuf>,
    writer: Mutex<Connection>,
    readers: ConnectionPool<Connection>,
    executions: AtomicU64,
}

impl std::fmt::Debug for AnalyticsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsStore")
            .field("path", &self.path)
            .field("readers", &self.readers)
            .field("executions", &self.execution_count())
            .finish()
    }
}

impl AnalyticsStore {
    pub fn open(opts: &AnalyticsOptions) -> Result<Self> {
        let writer = match &opts.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::validation(format!("cannot create {}: {e}", parent.display()))
                    })?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        writer.execute_batch(&observation_table_ddl(&TableName::base()))?;
        writer.execute_batch(SUPPORT_DDL)?;

        let readers = (0..opts.pool_size.max(1))
            .map(|_| writer.try_clone())
            .collect::<duckdb::Result<Vec<_>>>()?;

        Ok(Self {
            path: opts.path.clone(),
            writer: Mutex::new(writer),
            readers: ConnectionPool::new("analytics-readers", readers, opts.acquire_timeout),
            executions: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn reader(&self) -> Result<PooledConnection<'_, Connection>> {
        self.readers.acquire()
    }

    /// Run `f` in a write transaction; any error rolls everything back.
    pub fn with_write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Borrow a pooled read connection.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.reader()?;
        f(&conn)
    }

    /// Insert observations into one table, atomically.
    pub fn bulk_insert(&self, table: &TableName, rows: &[Observation]) -> Result<usize> {
        self.with_write_tx(|tx| insert_rows(tx, table, rows))
    }

    /// Run a query with positional parameters.
    pub fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.with_reader(|conn| query_with(conn, sql, params))
    }

    /// Plan text for a query.
    pub fn explain(&self, sql: &str, params: &[SqlValue]) -> Result<String> {
        let plan = self.with_reader(|conn| query_with(conn, &format!("EXPLAIN {sql}"), params))?;
        let idx = plan.column_index("explain_value").unwrap_or(plan.columns.len().saturating_sub(1));
        Ok(plan
            .rows
            .iter()
            .filter_map(|row| row.get(idx))
            .map(|v| match v {
                SqlValue::Text(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Number of `execute_query` calls since open.
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Observations visible for one dataset.
    pub fn row_count(&self, dataset_id: &str) -> Result<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM observations WHERE dataset_id = ?",
                [dataset_id],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

/// Multi-row `INSERT`s of at most [`INSERT_CHUNK`] rows each, on `conn`.
pub(crate) fn insert_rows<O: Borrow<Observation>>(
    conn: &Connection,
    table: &TableName,
    rows: &[O],
) -> Result<usize> {
    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let sql = insert_sql(table, chunk.len());
        let values = chunk.iter().flat_map(|obs| observation_values(obs.borrow()));
        written += conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(written)
}

fn insert_sql(table: &TableName, rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; OBSERVATION_ARITY].join(", "));
    format!(
        "INSERT INTO {table} ({OBSERVATION_COLUMNS}) VALUES {}",
        vec![tuple.as_str(); rows].join(", ")
    )
}

fn observation_values(obs: &Observation) -> [Value; OBSERVATION_ARITY] {
    [
        Value::Text(obs.dataset_id.clone()),
        Value::Text(obs.territory_key.clone()),
        Value::Text(obs.time_key.clone()),
        Value::Text(obs.measure_key.clone()),
        obs.value.map_or(Value::Null, Value::Double),
        obs.quality_score.map_or(Value::Null, Value::Double),
        Value::BigInt(obs.ingested_at_micros()),
        obs.year().map_or(Value::Null, Value::Int),
    ]
}

pub(crate) fn to_duck(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Boolean(*b),
        SqlValue::Int(i) => Value::BigInt(*i),
        SqlValue::Float(f) => Value::Double(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_duck(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Bool(b),
        Value::TinyInt(i) => SqlValue::Int(i.into()),
        Value::SmallInt(i) => SqlValue::Int(i.into()),
        Value::Int(i) => SqlValue::Int(i.into()),
        Value::BigInt(i) => SqlValue::Int(i),
        Value::UTinyInt(i) => SqlValue::Int(i.into()),
        Value::USmallInt(i) => SqlValue::Int(i.into()),
        Value::UInt(i) => SqlValue::Int(i.into()),
        Value::UBigInt(i) => i64::try_from(i).map_or(SqlValue::Float(i as f64), SqlValue::Int),
        Value::HugeInt(i) => i64::try_from(i).map_or(SqlValue::Float(i as f64), SqlValue::Int),
        Value::Float(f) => SqlValue::Float(f.into()),
        Value::Double(f) => SqlValue::Float(f),
        Value::Decimal(d) => {
            let text = d.to_string();
            text.parse().map_or(SqlValue::Text(text), SqlValue::Float)
        }
        Value::Text(s) => SqlValue::Text(s),
        other => SqlValue::Text(format!("{other:?}")),
    }
}

pub(crate) fn query_with(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_duck)))?;
    let columns = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            cells.push(from_duck(row.get::<_, Value>(idx)?));
        }
        out.push(cells);
    }
    Ok(ResultSet { columns, rows: out })
}
