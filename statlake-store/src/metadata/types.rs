//! Metadata entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statlake_core::{DatasetCategory, DatasetId, DatasetStatus};
use std::fmt;
use std::str::FromStr;

/// Who performed a mutating call. Recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Internal maintenance (recovery, migrations).
    pub fn system() -> Self {
        Self::new("system")
    }
}

// ── Dataset registry ────────────────────────────────────────────────

/// Registration input for the metadata side of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistration {
    pub dataset_id: DatasetId,
    pub name: String,
    /// `None` infers the category from the id, then the name.
    pub category: Option<DatasetCategory>,
    pub source: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DatasetRegistration {
    pub fn new(dataset_id: DatasetId, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            dataset_id,
            name: name.into(),
            category: None,
            source: source.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn resolved_category(&self) -> DatasetCategory {
        self.category
            .unwrap_or_else(|| DatasetCategory::infer(self.dataset_id.as_str(), &self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistryEntry {
    pub dataset_id: String,
    pub name: String,
    pub category: DatasetCategory,
    pub source: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: DatasetStatus,
    pub row_count: u64,
    pub invalid_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 1_000;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(100, 0)
    }
}

// ── Preferences ─────────────────────────────────────────────────────

/// A preference value. `Sealed` is what callers see for encrypted values
/// outside `reveal_user_preference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PreferenceValue {
    Text(String),
    Json(serde_json::Value),
    Bool(bool),
    Sealed,
}

impl PreferenceValue {
    pub(crate) fn value_type(&self) -> Option<&'static str> {
        match self {
            Self::Text(_) => Some("text"),
            Self::Json(_) => Some("json"),
            Self::Bool(_) => Some("bool"),
            Self::Sealed => None,
        }
    }

    /// Storage text; `None` for `Sealed`, which cannot be written.
    pub(crate) fn to_storage(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Json(v) => Some(v.to_string()),
            Self::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
            Self::Sealed => None,
        }
    }

    pub(crate) fn from_storage(value_type: &str, text: String) -> Result<Self, String> {
        match value_type {
            "text" => Ok(Self::Text(text)),
            "json" => serde_json::from_str(&text)
                .map(Self::Json)
                .map_err(|e| format!("stored json preference is malformed: {e}")),
            "bool" => match text.as_str() {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                other => Err(format!("stored bool preference is '{other}'")),
            },
            other => Err(format!("unknown preference value type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    pub preference_key: String,
    pub value: PreferenceValue,
    pub encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

// ── Credentials ─────────────────────────────────────────────────────

/// A secret to store. The secret itself is hashed and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub service_name: String,
    pub secret: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("service_name", &self.service_name)
            .field("secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Stored credential record, without its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: i64,
    pub service_name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Result of checking a presented secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid(ApiCredential),
    Expired,
    /// No live credential matches (wrong secret, rotated away, or none stored).
    Invalid,
}

impl CredentialCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

// ── Audit ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub operation: String,
    pub table_name: String,
    pub record_id: String,
    pub user_id: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Audit query filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub table_name: Option<String>,
    pub record_id: Option<String>,
    pub user_id: Option<String>,
    pub operation: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn for_record(table_name: &str, record_id: &str) -> Self {
        Self {
            table_name: Some(table_name.to_string()),
            record_id: Some(record_id.to_string()),
            ..Self::default()
        }
    }
}

// ── Ingestion runs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Completed,
    Compensated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Compensated => "compensated",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "compensated" => Ok(Self::Compensated),
            other => Err(format!("unknown ingestion run status: {other}")),
        }
    }
}

/// One attempt to load a dataset's observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: i64,
    pub dataset_id: String,
    pub status: RunStatus,
    pub rows_expected: u64,
    pub rows_written: Option<u64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final state for a pending dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Active { row_count: u64 },
    Invalid { reason: String },
}
