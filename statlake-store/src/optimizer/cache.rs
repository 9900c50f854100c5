//! LRU cache of query results keyed by fingerprint, with a TTL per entry.

use crate::analytics::ResultSet;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{visit_relations, BinaryOperator, Expr, SetExpr, Statement, TableFactor, Value};
use statlake_core::{sql, Clock, QueryFingerprint, SqlValue};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DATASET_COLUMN: &str = "dataset_id";

/// Datasets a cached result depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    /// Unknown dependencies; dropped on every invalidation.
    Unscoped,
    Datasets(BTreeSet<String>),
}

impl CacheScope {
    /// Scope of raw SQL. Anything that does not parse is unscoped.
    pub fn for_query(query: &str, params: &[SqlValue]) -> Self {
        sql::number_placeholders(query)
            .and_then(|numbered| sql::parse_single(&numbered.sql))
            .map(|statement| Self::for_statement(&statement, params))
            .unwrap_or(Self::Unscoped)
    }

    /// Scoped only when the statement is a plain `SELECT` over a single
    /// relation whose `WHERE` has a top-level `dataset_id = v` or
    /// `dataset_id IN (...)` conjunct, every `v` a string literal or a bound
    /// text parameter. Placeholders must already be numbered.
    pub fn for_statement(statement: &Statement, params: &[SqlValue]) -> Self {
        dataset_filter(statement, params).map_or(Self::Unscoped, Self::Datasets)
    }

    fn touches(&self, dataset_id: &str) -> bool {
        match self {
            Self::Unscoped => true,
            Self::Datasets(ids) => ids.contains(dataset_id),
        }
    }
}

fn dataset_filter(statement: &Statement, params: &[SqlValue]) -> Option<BTreeSet<String>> {
    let Statement::Query(query) = statement else {
        return None;
    };
    if query.with.is_some() {
        return None;
    }
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let [from] = select.from.as_slice() else {
        return None;
    };
    if !from.joins.is_empty() || !matches!(from.relation, TableFactor::Table { .. }) {
        return None;
    }

    // Subqueries anywhere else would read rows the filter does not cover.
    let mut relations = 0usize;
    let _ = visit_relations(statement, |_| {
        relations += 1;
        ControlFlow::<()>::Continue(())
    });
    if relations != 1 {
        return None;
    }

    let mut datasets: Option<BTreeSet<String>> = None;
    for conjunct in conjuncts(select.selection.as_ref()?) {
        if let Some(ids) = dataset_values(conjunct, params) {
            datasets.get_or_insert_with(BTreeSet::new).extend(ids);
        }
    }
    datasets
}

fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        Expr::Nested(inner) => conjuncts(inner),
        other => vec![other],
    }
}

fn dataset_values(expr: &Expr, params: &[SqlValue]) -> Option<Vec<String>> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if is_dataset_column(left) {
                bound_text(right, params).map(|v| vec![v])
            } else if is_dataset_column(right) {
                bound_text(left, params).map(|v| vec![v])
            } else {
                None
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } if is_dataset_column(expr) => list.iter().map(|e| bound_text(e, params)).collect(),
        Expr::Nested(inner) => dataset_values(inner, params),
        _ => None,
    }
}

fn is_dataset_column(expr: &Expr) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(DATASET_COLUMN),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .is_some_and(|ident| ident.value.eq_ignore_ascii_case(DATASET_COLUMN)),
        Expr::Nested(inner) => is_dataset_column(inner),
        _ => false,
    }
}

fn bound_text(expr: &Expr, params: &[SqlValue]) -> Option<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Some(s.clone()),
        Expr::Value(Value::Placeholder(p)) => {
            let index = sql::placeholder_index(p)?.checked_sub(1)?;
            params.get(index)?.as_str().map(str::to_string)
        }
        Expr::Nested(inner) => bound_text(inner, params),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Arc<ResultSet>,
    computed_at: Instant,
    ttl: Duration,
    scope: CacheScope,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.computed_at) < self.ttl
    }
}

/// Why a lookup missed. Never leaves the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheMiss {
    Absent,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 1024,
        }
    }
}

impl From<&statlake_core::config::CacheConfig> for CacheOptions {
    fn from(cfg: &statlake_core::config::CacheConfig) -> Self {
        Self {
            ttl: cfg.ttl(),
            max_entries: cfg.max_entries,
        }
    }
}

pub struct QueryCache {
    entries: Mutex<LruCache<QueryFingerprint, CacheEntry>>,
    /// Bumped by every invalidation, under the entries lock.
    generation: AtomicU64,
    opts: CacheOptions,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("opts", &self.opts)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryCache {
    pub fn new(opts: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(opts.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            opts,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fresh result for `fp`, marked most recently used. An expired entry is dropped.
    pub(crate) fn lookup(&self, fp: &QueryFingerprint) -> Result<Arc<ResultSet>, CacheMiss> {
        let now = self.clock.now();
        let outcome = {
            let mut entries = self.entries.lock();
            let found = entries
                .get(fp)
                .map(|entry| entry.is_fresh(now).then(|| entry.result.clone()));
            match found {
                Some(Some(result)) => Ok(result),
                Some(None) => {
                    entries.pop(fp);
                    Err(CacheMiss::Expired)
                }
                None => Err(CacheMiss::Absent),
            }
        };
        match outcome {
            Ok(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Read before executing a query; pass to [`insert`](Self::insert).
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cache `result` unless an invalidation ran since `generation` was read.
    /// Returns whether the entry was stored.
    pub(crate) fn insert(
        &self,
        fp: QueryFingerprint,
        result: Arc<ResultSet>,
        scope: CacheScope,
        generation: u64,
    ) -> bool {
        if self.opts.max_entries == 0 || self.opts.ttl.is_zero() {
            return false;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }

        if !entries.contains(&fp) && entries.len() >= entries.cap().get() {
            let expired: Vec<QueryFingerprint> = entries
                .iter()
                .filter(|(_, e)| !e.is_fresh(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            self.evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }

        let entry = CacheEntry {
            result,
            computed_at: now,
            ttl: self.opts.ttl,
            scope,
        };
        if let Some((evicted, _)) = entries.push(fp.clone(), entry) {
            if evicted != fp {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Drop entries touching `dataset_id` (and every unscoped entry).
    pub fn invalidate_dataset(&self, dataset_id: &str) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let stale: Vec<QueryFingerprint> = entries
            .iter()
            .filter(|(_, e)| e.scope.touches(dataset_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
