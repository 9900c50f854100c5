//! Query fingerprinting: deterministic cache keys for `(sql, params)`.
//!
//! - SQL is whitespace-normalized outside quoted literals and loses trailing `;`.
//! - Parameters are positional (`?`) and serialized with a type tag.
//! - Floats hash by bit pattern, so `0.1 + 0.2` and `0.3` are different keys.
//!
//! The key is BLAKE3 over the canonical JSON of `{sql, params}`.

use crate::domain::SqlValue;
use crate::sql;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Hex-encoded BLAKE3 fingerprint of a query and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryFingerprint(pub String);

impl QueryFingerprint {
    /// Compute the fingerprint of `sql` bound with `params`.
    pub fn compute(query: &str, params: &[SqlValue]) -> Self {
        let canonical = json!({
            "sql": sql::normalize(query),
            "params": params.iter().map(canonical_param).collect::<Vec<_>>(),
        });
        Self(blake3::hash(canonical.to_string().as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn canonical_param(value: &SqlValue) -> serde_json::Value {
    match value {
        SqlValue::Null => json!(["null"]),
        SqlValue::Bool(v) => json!(["bool", v]),
        SqlValue::Int(v) => json!(["int", v]),
        SqlValue::Float(v) => json!(["float", format!("{:016x}", v.to_bits())]),
        SqlValue::Text(v) => json!(["text", v]),
    }
}

/// Content hash of an arbitrary byte payload (hex BLAKE3).
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
