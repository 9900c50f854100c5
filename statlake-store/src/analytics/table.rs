//! Allow-listed analytics table identifiers.

use crate::error::{Result, StoreError};
use std::fmt;

/// Prefix of every partition table.
pub const PARTITION_PREFIX: &str = "obs_";
/// Empty template table that also receives rows with no partition.
pub const BASE_TABLE: &str = "observations_base";
/// Logical relation consumers query.
pub const OBSERVATIONS_VIEW: &str = "observations";

const MAX_TABLE_NAME_LEN: usize = 63;

/// Name of an observation table, validated before it is ever spliced into SQL.
///
/// Only `[A-Za-z0-9_]`, at most 63 characters, and either the base table or
/// an `obs_` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
            return Err(StoreError::validation(format!(
                "table name '{name}' must be 1..={MAX_TABLE_NAME_LEN} characters"
            )));
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(StoreError::validation(format!(
                "table name '{name}' may only contain ASCII letters, digits and '_'"
            )));
        }
        let is_partition = name.len() > PARTITION_PREFIX.len() && name.starts_with(PARTITION_PREFIX);
        if name != BASE_TABLE && !is_partition {
            return Err(StoreError::validation(format!(
                "table name '{name}' is not an observation table"
            )));
        }
        Ok(Self(name))
    }

    pub fn base() -> Self {
        Self(BASE_TABLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_base(&self) -> bool {
        self.0 == BASE_TABLE
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// DDL for an observation table. Base and partitions share one shape.
pub(crate) fn observation_table_ddl(table: &TableName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            dataset_id    VARCHAR NOT NULL,
            territory_key VARCHAR NOT NULL,
            time_key      VARCHAR NOT NULL,
            measure_key   VARCHAR NOT NULL,
            value         DOUBLE,
            quality_score DOUBLE CHECK (quality_score IS NULL OR (quality_score >= 0 AND quality_score <= 1)),
            ingested_at   BIGINT NOT NULL,
            period_year   INTEGER
        )"
    )
}

/// Column list in storage order.
pub(crate) const OBSERVATION_COLUMNS: &str =
    "dataset_id, territory_key, time_key, measure_key, value, quality_score, ingested_at, period_year";
pub(crate) const OBSERVATION_ARITY: usize = 8;
