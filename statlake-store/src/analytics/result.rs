//! Materialized query results.

use serde::{Deserialize, Serialize};
use statlake_core::SqlValue;

/// Column names plus rows of engine-neutral values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Every value of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&SqlValue>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }

    /// First cell of the first row.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first()?.first()
    }

    /// Rows sorted by their display form; for order-insensitive comparison.
    pub fn sorted_rows(&self) -> Vec<Vec<SqlValue>> {
        let mut rows = self.rows.clone();
        rows.sort_by_cached_key(|row| row.iter().map(ToString::to_string).collect::<Vec<_>>());
        rows
    }
}
