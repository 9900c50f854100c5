//! Query optimizer: result cache, read-only guard, indexes and statistics.

pub mod cache;

pub use cache::{CacheOptions, CacheScope, CacheStats, QueryCache};

use crate::analytics::{AnalyticsStore, ResultSet, TableName};
use crate::error::{Result, StoreError};
use crate::partition::PartitionManager;
use duckdb::params;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use statlake_core::sql;
use statlake_core::{Clock, QueryFingerprint, SqlValue};
use std::sync::Arc;

/// Per-table row statistics kept in `optimizer_statistics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub table_name: String,
    pub row_count: u64,
    pub distinct_datasets: u64,
    pub distinct_territories: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
}

pub struct QueryOptimizer {
    store: Arc<AnalyticsStore>,
    partitions: Arc<PartitionManager>,
    cache: QueryCache,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QueryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptimizer")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl QueryOptimizer {
    pub fn new(
        store: Arc<AnalyticsStore>,
        partitions: Arc<PartitionManager>,
        opts: CacheOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            partitions,
            cache: QueryCache::new(opts, clock.clone()),
            clock,
        }
    }

    /// Cached read query. A fresh hit never touches the store.
    ///
    /// A result is only cached if no invalidation ran while it was computed.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Arc<ResultSet>> {
        let statement = parse_read_only(sql)?;
        let fp = QueryFingerprint::compute(sql, params);

        match self.cache.lookup(&fp) {
            Ok(hit) => {
                tracing::trace!(fingerprint = fp.short(), "query cache hit");
                Ok(hit)
            }
            Err(miss) => {
                tracing::debug!(fingerprint = fp.short(), ?miss, "query cache miss");
                let generation = self.cache.generation();
                let result = Arc::new(self.store.execute_query(sql, params)?);
                let scope = CacheScope::for_statement(&statement, params);
                if !self.cache.insert(fp.clone(), result.clone(), scope, generation) {
                    tracing::trace!(fingerprint = fp.short(), "result not cached");
                }
                Ok(result)
            }
        }
    }

    /// Drop cached results that may depend on `dataset_id`.
    pub fn invalidate(&self, dataset_id: &str) -> usize {
        let dropped = self.cache.invalidate_dataset(dataset_id);
        tracing::debug!(dataset_id, dropped, "query cache invalidated");
        dropped
    }

    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn observation_tables(&self) -> Result<Vec<TableName>> {
        let mut tables = vec![TableName::base()];
        tables.extend(self.partitions.partitions()?.into_iter().map(|p| p.table));
        Ok(tables)
    }

    /// Lookup indexes on every observation table. Safe to repeat.
    /// Returns the number of tables covered.
    pub fn create_recommended_indexes(&self) -> Result<usize> {
        let tables = self.observation_tables()?;
        self.store.with_write_tx(|tx| {
            for table in &tables {
                tx.execute_batch(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_dataset ON {table} (dataset_id);
                     CREATE INDEX IF NOT EXISTS idx_{table}_territory_time ON {table} (territory_key, time_key);"
                ))?;
            }
            Ok(())
        })?;
        tracing::debug!(tables = tables.len(), "recommended indexes ensured");
        Ok(tables.len())
    }

    /// Recompute `optimizer_statistics` for every observation table.
    pub fn refresh_statistics(&self) -> Result<Vec<TableStatistics>> {
        let tables = self.observation_tables()?;
        let refreshed_at = self.clock.wall().timestamp_micros();

        let stats = self.store.with_write_tx(|tx| {
            let mut stats = Vec::with_capacity(tables.len());
            for table in &tables {
                let stat = tx.query_row(
                    &format!(
                        "SELECT COUNT(*), COUNT(DISTINCT dataset_id), COUNT(DISTINCT territory_key),
                                MIN(period_year), MAX(period_year)
                         FROM {table}"
                    ),
                    [],
                    |row| {
                        Ok(TableStatistics {
                            table_name: table.to_string(),
                            row_count: row.get::<_, i64>(0)?.max(0) as u64,
                            distinct_datasets: row.get::<_, i64>(1)?.max(0) as u64,
                            distinct_territories: row.get::<_, i64>(2)?.max(0) as u64,
                            min_year: row.get(3)?,
                            max_year: row.get(4)?,
                        })
                    },
                )?;
                stats.push(stat);
            }

            tx.execute("DELETE FROM optimizer_statistics", [])?;
            for s in &stats {
                tx.execute(
                    "INSERT INTO optimizer_statistics
                         (table_name, row_count, distinct_datasets, distinct_territories, min_year, max_year, refreshed_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        s.table_name,
                        s.row_count as i64,
                        s.distinct_datasets as i64,
                        s.distinct_territories as i64,
                        s.min_year,
                        s.max_year,
                        refreshed_at
                    ],
                )?;
            }
            Ok(stats)
        })?;
        tracing::info!(tables = stats.len(), "optimizer statistics refreshed");
        Ok(stats)
    }

    /// Last persisted statistics, ordered by table.
    pub fn statistics(&self) -> Result<Vec<TableStatistics>> {
        self.store.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT table_name, row_count, distinct_datasets, distinct_territories, min_year, max_year
                 FROM optimizer_statistics ORDER BY table_name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TableStatistics {
                        table_name: row.get(0)?,
                        row_count: row.get::<_, i64>(1)?.max(0) as u64,
                        distinct_datasets: row.get::<_, i64>(2)?.max(0) as u64,
                        distinct_territories: row.get::<_, i64>(3)?.max(0) as u64,
                        min_year: row.get(4)?,
                        max_year: row.get(5)?,
                    })
                })?
                .collect::<duckdb::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

/// Accept one read statement: a query, `EXPLAIN` of a query, or `DESCRIBE`.
pub fn ensure_read_only(query: &str) -> Result<()> {
    parse_read_only(query).map(|_| ())
}

/// Parse `query` with numbered placeholders and reject anything that writes.
fn parse_read_only(query: &str) -> Result<Statement> {
    let numbered = sql::number_placeholders(query)?;
    let statement = sql::parse_single(&numbered.sql)?;
    if !sql::is_read_only(&statement) {
        return Err(StoreError::validation(
            "only read queries are allowed (SELECT, WITH, EXPLAIN, DESCRIBE)",
        ));
    }
    Ok(statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_guard() {
        for ok in [
            "SELECT 1",
            "  select * from observations;",
            "WITH t AS (SELECT 1) SELECT * FROM t",
            "(SELECT 1) UNION ALL (SELECT 2)",
            "EXPLAIN SELECT 1",
            "EXPLAIN ANALYZE SELECT * FROM obs_y2023",
            "DESCRIBE observations",
            "SELECT 'DROP TABLE x; DELETE' AS s",
            "SELECT * FROM observations WHERE dataset_id = ? AND value > ?",
        ] {
            assert!(ensure_read_only(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "DROP TABLE observations_base",
            "SELECT 1; DELETE FROM observations_base",
            "INSERT INTO observations_base VALUES (1)",
            "WITH t AS (SELECT 1) DELETE FROM observations_base",
            "COPY observations_base TO 'x.csv'",
            "EXPLAIN ANALYZE DELETE FROM obs_y2023",
            "EXPLAIN ANALYZE INSERT INTO obs_y2023 SELECT * FROM obs_y2024",
            "EXPLAIN DROP TABLE observations_base",
            "SELECT 1 FROM observations WHERE a = ? AND b = $1",
        ] {
            assert!(ensure_read_only(bad).unwrap_err().is_validation(), "{bad}");
        }
    }
}
