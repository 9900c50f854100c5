//! Physical partitioning of observations.
//!
//! One DuckDB table per partition (`obs_y2023`, `obs_t<hash>`,
//! `obs_y2023_t<hash>`), recorded in `partition_catalog`, behind the
//! `observations` view. The layout strategy is fixed on first use.
//!
//! Pruning rewrites every `observations` table reference in the parsed query
//! into a subquery over only the partitions the filters can match, with the
//! filter predicates applied to each branch.

use crate::analytics::{insert_rows, AnalyticsStore, TableName, BASE_TABLE, OBSERVATIONS_VIEW};
use crate::error::{Result, StoreError};
use duckdb::{params, Connection};
use sqlparser::ast::{Ident, ObjectName, Query, TableAlias, TableFactor, VisitMut, VisitorMut};
use statlake_core::sql;
use statlake_core::{Clock, Observation, PartitionStrategy, SqlValue};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Hex characters of the territory hash in a partition name.
const TERRITORY_HASH_LEN: usize = 12;

/// Catalog row for one partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub table: TableName,
    pub year: Option<i32>,
    pub territory_key: Option<String>,
}

impl PartitionInfo {
    fn matches(&self, filters: &PartitionFilters) -> bool {
        let year_ok = filters.years.is_empty() || self.year.map_or(true, |y| filters.years.contains(&y));
        let territory_ok = filters.territories.is_empty()
            || self
                .territory_key
                .as_ref()
                .map_or(true, |t| filters.territories.contains(t));
        year_ok && territory_ok
    }
}

/// Row filters used for pruning. An empty set leaves that dimension open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilters {
    pub years: BTreeSet<i32>,
    pub territories: BTreeSet<String>,
    pub dataset_ids: BTreeSet<String>,
}

impl PartitionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn year(mut self, year: i32) -> Self {
        self.years.insert(year);
        self
    }

    pub fn territory(mut self, key: impl Into<String>) -> Self {
        self.territories.insert(key.into());
        self
    }

    pub fn dataset(mut self, id: impl Into<String>) -> Self {
        self.dataset_ids.insert(id.into());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.years.is_empty() && self.territories.is_empty() && self.dataset_ids.is_empty()
    }

    /// `WHERE` body and its parameters, numbered from `$first`. `TRUE` when unrestricted.
    fn predicate(&self, first: usize) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if !self.years.is_empty() {
            clauses.push(in_clause("period_year", first + params.len(), self.years.len()));
            params.extend(self.years.iter().map(|y| SqlValue::Int(i64::from(*y))));
        }
        if !self.territories.is_empty() {
            clauses.push(in_clause("territory_key", first + params.len(), self.territories.len()));
            params.extend(self.territories.iter().map(|t| SqlValue::from(t.as_str())));
        }
        if !self.dataset_ids.is_empty() {
            clauses.push(in_clause("dataset_id", first + params.len(), self.dataset_ids.len()));
            params.extend(self.dataset_ids.iter().map(|d| SqlValue::from(d.as_str())));
        }

        if clauses.is_empty() {
            ("TRUE".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }
}

fn in_clause(column: &str, first: usize, n: usize) -> String {
    let placeholders: Vec<String> = (first..first + n).map(|i| format!("${i}")).collect();
    format!("{column} IN ({})", placeholders.join(", "))
}

/// A rewritten query ready for `execute_query`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Partition tables the rewritten query reads.
    pub partitions_scanned: Vec<TableName>,
    pub partitions_total: usize,
}

/// Outcome of an observation insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub rows_written: usize,
    /// Tables that received rows.
    pub partitions: Vec<TableName>,
    /// Tables created by this insert.
    pub created_partitions: Vec<TableName>,
}

/// Rows grouped by destination table.
#[derive(Debug)]
pub struct RoutePlan<'a> {
    pub batches: BTreeMap<TableName, Vec<&'a Observation>>,
    pub created: Vec<TableName>,
}

pub struct PartitionManager {
    store: Arc<AnalyticsStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager").finish_non_exhaustive()
    }
}

impl PartitionManager {
    pub fn new(store: Arc<AnalyticsStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fix the layout strategy. Repeating the same strategy is a no-op;
    /// a different one is a `LayoutConflict`. Returns whether it was created.
    pub fn create_partitioned_layout(&self, strategy: PartitionStrategy) -> Result<bool> {
        let created_at = self.clock.wall().timestamp_micros();
        let created = self.store.with_write_tx(|tx| {
            match layout_in(tx)? {
                Some(existing) if existing == strategy => Ok(false),
                Some(existing) => Err(StoreError::LayoutConflict {
                    existing,
                    requested: strategy,
                }),
                None => {
                    tx.execute(
                        "INSERT INTO partition_layout (strategy, created_at) VALUES (?, ?)",
                        params![strategy.as_str(), created_at],
                    )?;
                    Ok(true)
                }
            }
        })?;
        if created {
            tracing::info!(strategy = %strategy, "partition layout created");
        }
        Ok(created)
    }

    pub fn layout(&self) -> Result<Option<PartitionStrategy>> {
        self.store.with_reader(layout_in)
    }

    /// Every partition table, ordered by name.
    pub fn partitions(&self) -> Result<Vec<PartitionInfo>> {
        self.store.with_reader(catalog_in)
    }

    /// Destination of one observation under `strategy`.
    pub fn partition_for(strategy: PartitionStrategy, obs: &Observation) -> Result<PartitionInfo> {
        let require_year = || {
            obs.year().ok_or_else(|| {
                StoreError::validation(format!(
                    "time_key '{}' has no leading year, required by the {strategy} layout",
                    obs.time_key
                ))
            })
        };
        let (name, year, territory) = match strategy {
            PartitionStrategy::Year => {
                let y = require_year()?;
                (format!("obs_y{y:04}"), Some(y), None)
            }
            PartitionStrategy::Territory => (
                format!("obs_t{}", territory_hash(&obs.territory_key)),
                None,
                Some(obs.territory_key.clone()),
            ),
            PartitionStrategy::Hybrid => {
                let y = require_year()?;
                (
                    format!("obs_y{y:04}_t{}", territory_hash(&obs.territory_key)),
                    Some(y),
                    Some(obs.territory_key.clone()),
                )
            }
        };
        Ok(PartitionInfo {
            table: TableName::parse(name)?,
            year,
            territory_key: territory,
        })
    }

    /// Group rows by partition and create missing partitions inside `tx`.
    pub fn route<'a>(&self, tx: &Connection, rows: &'a [Observation]) -> Result<RoutePlan<'a>> {
        let Some(strategy) = layout_in(tx)? else {
            return Ok(RoutePlan {
                batches: BTreeMap::from([(TableName::base(), rows.iter().collect())]),
                created: Vec::new(),
            });
        };

        let mut known: BTreeMap<TableName, PartitionInfo> =
            catalog_in(tx)?.into_iter().map(|p| (p.table.clone(), p)).collect();
        let mut batches: BTreeMap<TableName, Vec<&'a Observation>> = BTreeMap::new();
        let mut created = Vec::new();
        let created_at = self.clock.wall().timestamp_micros();

        for obs in rows {
            let target = Self::partition_for(strategy, obs)?;
            match known.get(&target.table) {
                Some(existing) if existing.territory_key != target.territory_key => {
                    return Err(StoreError::StorageIntegrity(format!(
                        "partition {} already holds territory {:?}, cannot add {:?}",
                        target.table, existing.territory_key, target.territory_key
                    )));
                }
                Some(_) => {}
                None => {
                    create_partition(tx, &target, created_at)?;
                    created.push(target.table.clone());
                    known.insert(target.table.clone(), target.clone());
                }
            }
            batches.entry(target.table).or_default().push(obs);
        }

        if !created.is_empty() {
            rebuild_view(tx, known.keys())?;
            tracing::debug!(created = created.len(), total = known.len(), "partitions created");
        }
        Ok(RoutePlan { batches, created })
    }

    /// Route and insert observations in one transaction.
    pub fn insert_observations(&self, rows: &[Observation]) -> Result<InsertSummary> {
        if rows.is_empty() {
            return Ok(InsertSummary::default());
        }
        self.store.with_write_tx(|tx| {
            let plan = self.route(tx, rows)?;
            let mut rows_written = 0;
            for (table, batch) in &plan.batches {
                rows_written += insert_rows(tx, table, batch)?;
            }
            Ok(InsertSummary {
                rows_written,
                partitions: plan.batches.keys().cloned().collect(),
                created_partitions: plan.created,
            })
        })
    }

    /// Rewrite `base_query` to read only the partitions `filters` can match.
    ///
    /// `params` are the base query's own positional parameters. The rewritten
    /// SQL uses numbered placeholders: the base parameters keep `$1..$n` and
    /// the filter values follow them.
    pub fn prune_query(&self, base_query: &str, params: &[SqlValue], filters: &PartitionFilters) -> Result<PrunedQuery> {
        let catalog = self.partitions()?;
        let total = catalog.len();
        let scanned: Vec<TableName> = catalog
            .into_iter()
            .filter(|p| p.matches(filters))
            .map(|p| p.table)
            .collect();

        let mut tables = vec![TableName::base()];
        tables.extend(scanned.iter().cloned());
        let (sql, params) = rewrite_relation(base_query, params, filters, &tables)?;
        Ok(PrunedQuery {
            sql,
            params,
            partitions_scanned: scanned,
            partitions_total: total,
        })
    }

    /// The unpruned equivalent of [`prune_query`](Self::prune_query): the
    /// same predicates applied over the full `observations` view.
    pub fn restrict_query(&self, base_query: &str, params: &[SqlValue], filters: &PartitionFilters) -> Result<PrunedQuery> {
        let catalog = self.partitions()?;
        let (sql, params) = rewrite_relation(base_query, params, filters, &[])?;
        Ok(PrunedQuery {
            sql,
            params,
            partitions_scanned: catalog.iter().map(|p| p.table.clone()).collect(),
            partitions_total: catalog.len(),
        })
    }
}

fn territory_hash(territory_key: &str) -> String {
    let hex = blake3::hash(territory_key.as_bytes()).to_hex();
    hex.as_str()[..TERRITORY_HASH_LEN].to_string()
}

fn layout_in(conn: &Connection) -> Result<Option<PartitionStrategy>> {
    let mut stmt = conn.prepare("SELECT strategy FROM partition_layout LIMIT 1")?;
    let mut rows = stmt.query([])?;
    let stored: Option<String> = match rows.next()? {
        Some(row) => Some(row.get(0)?),
        None => None,
    };
    stored
        .map(|s| {
            s.parse::<PartitionStrategy>()
                .map_err(|e| StoreError::StorageIntegrity(format!("stored partition layout: {e}")))
        })
        .transpose()
}

fn catalog_in(conn: &Connection) -> Result<Vec<PartitionInfo>> {
    let mut stmt = conn.prepare("SELECT table_name, year, territory_key FROM partition_catalog ORDER BY table_name")?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i32>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<duckdb::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(name, year, territory_key)| {
            Ok(PartitionInfo {
                table: TableName::parse(name)?,
                year,
                territory_key,
            })
        })
        .collect()
}

fn create_partition(tx: &Connection, partition: &PartitionInfo, created_at: i64) -> Result<()> {
    tx.execute_batch(&crate::analytics::table::observation_table_ddl(&partition.table))?;
    tx.execute(
        "INSERT INTO partition_catalog (table_name, year, territory_key, created_at) VALUES (?, ?, ?, ?)",
        params![
            partition.table.as_str(),
            partition.year,
            partition.territory_key.as_deref(),
            created_at
        ],
    )?;
    Ok(())
}

fn rebuild_view<'a>(tx: &Connection, partitions: impl Iterator<Item = &'a TableName>) -> Result<()> {
    let mut sql = format!("CREATE OR REPLACE VIEW {OBSERVATIONS_VIEW} AS SELECT * FROM {BASE_TABLE}");
    for table in partitions {
        sql.push_str(" UNION ALL SELECT * FROM ");
        sql.push_str(table.as_str());
    }
    tx.execute_batch(&sql)?;
    Ok(())
}

/// Replace each table reference to `observations` with a filtered
/// subquery. An empty `tables` slice filters the view itself.
fn rewrite_relation(
    base_query: &str,
    params: &[SqlValue],
    filters: &PartitionFilters,
    tables: &[TableName],
) -> Result<(String, Vec<SqlValue>)> {
    let numbered = sql::number_placeholders(base_query)?;
    if numbered.params != params.len() {
        return Err(StoreError::validation(format!(
            "query has {} placeholders but {} parameters were supplied",
            numbered.params,
            params.len()
        )));
    }
    let mut statement = sql::parse_single(&numbered.sql)?;

    let (predicate, predicate_params) = filters.predicate(params.len() + 1);
    let branches: Vec<String> = if tables.is_empty() {
        vec![format!("SELECT * FROM {OBSERVATIONS_VIEW} WHERE {predicate}")]
    } else {
        tables
            .iter()
            .map(|t| format!("SELECT * FROM {t} WHERE {predicate}"))
            .collect()
    };
    let mut rewriter = ObservationsRewriter {
        subquery: sql::parse_query(&branches.join(" UNION ALL "))?,
        replaced: 0,
    };
    let _ = statement.visit(&mut rewriter);

    let mut out_params = params.to_vec();
    if rewriter.replaced > 0 {
        out_params.extend(predicate_params);
    }
    Ok((statement.to_string(), out_params))
}

/// Swaps `observations` table factors for a derived table, keeping any alias.
struct ObservationsRewriter {
    subquery: Box<Query>,
    replaced: usize,
}

impl VisitorMut for ObservationsRewriter {
    type Break = ();

    // Post-visit, so the inserted subquery is never walked.
    fn post_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<()> {
        let alias = match factor {
            TableFactor::Table { name, alias, .. } if is_observations(name) => alias.take(),
            _ => return ControlFlow::Continue(()),
        };
        *factor = TableFactor::Derived {
            lateral: false,
            subquery: self.subquery.clone(),
            alias: Some(alias.unwrap_or_else(|| TableAlias {
                name: Ident::new(OBSERVATIONS_VIEW),
                columns: vec![],
            })),
        };
        self.replaced += 1;
        ControlFlow::Continue(())
    }
}

fn is_observations(name: &ObjectName) -> bool {
    matches!(name.0.as_slice(), [ident] if ident.value.eq_ignore_ascii_case(OBSERVATIONS_VIEW))
}
