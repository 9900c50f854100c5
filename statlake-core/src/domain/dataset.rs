//! Dataset identity, category and lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a dataset identifier.
pub const MAX_DATASET_ID_LEN: usize = 64;

/// Rejected dataset identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid dataset id '{id}': {reason}")]
pub struct InvalidDatasetId {
    pub id: String,
    pub reason: &'static str,
}

/// Validated upstream dataset identifier: 1..=64 chars of `[A-Za-z0-9_.-]`.
///
/// Identifiers end up in URLs and cache paths, so anything else is refused
/// before either is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn parse(id: impl Into<String>) -> Result<Self, InvalidDatasetId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidDatasetId {
                id,
                reason: "empty",
            });
        }
        if id.len() > MAX_DATASET_ID_LEN {
            return Err(InvalidDatasetId {
                id,
                reason: "longer than 64 characters",
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(InvalidDatasetId {
                id,
                reason: "only ASCII letters, digits, '_', '.' and '-' are allowed",
            });
        }
        if id == "." || id == ".." {
            return Err(InvalidDatasetId {
                id,
                reason: "reserved path component",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DatasetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DatasetId {
    type Error = InvalidDatasetId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl FromStr for DatasetId {
    type Err = InvalidDatasetId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DatasetId> for String {
    fn from(id: DatasetId) -> Self {
        id.0
    }
}

/// Thematic category of a statistical dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetCategory {
    Population,
    Economy,
    Labour,
    Education,
    Health,
    Environment,
    Tourism,
    Territory,
    Other,
}

/// Identifier/name prefixes that imply a category. Checked in order.
const CATEGORY_PREFIXES: &[(&str, DatasetCategory)] = &[
    ("POP", DatasetCategory::Population),
    ("ECON", DatasetCategory::Economy),
    ("GDP", DatasetCategory::Economy),
    ("PIL", DatasetCategory::Economy),
    ("EMP", DatasetCategory::Labour),
    ("LAB", DatasetCategory::Labour),
    ("OCC", DatasetCategory::Labour),
    ("EDU", DatasetCategory::Education),
    ("HEALTH", DatasetCategory::Health),
    ("SAN", DatasetCategory::Health),
    ("ENV", DatasetCategory::Environment),
    ("AMB", DatasetCategory::Environment),
    ("TOUR", DatasetCategory::Tourism),
    ("TERR", DatasetCategory::Territory),
];

impl DatasetCategory {
    pub const ALL: [DatasetCategory; 9] = [
        Self::Population,
        Self::Economy,
        Self::Labour,
        Self::Education,
        Self::Health,
        Self::Environment,
        Self::Tourism,
        Self::Territory,
        Self::Other,
    ];

    /// Infer a category from the dataset id, falling back to the display name.
    ///
    /// `POP_2023` is `Population`; an id with no known prefix is classified by
    /// its name, and anything unrecognised is `Other`.
    pub fn infer(dataset_id: &str, name: &str) -> Self {
        Self::from_prefix(dataset_id)
            .or_else(|| Self::from_prefix(name))
            .unwrap_or(Self::Other)
    }

    fn from_prefix(text: &str) -> Option<Self> {
        let upper = text.trim().to_ascii_uppercase();
        CATEGORY_PREFIXES
            .iter()
            .find(|(prefix, _)| upper.starts_with(prefix))
            .map(|(_, category)| *category)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Population => "population",
            Self::Economy => "economy",
            Self::Labour => "labour",
            Self::Education => "education",
            Self::Health => "health",
            Self::Environment => "environment",
            Self::Tourism => "tourism",
            Self::Territory => "territory",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DatasetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown dataset category: {s}"))
    }
}

/// Registry lifecycle. Datasets are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetStatus {
    /// Metadata written, analytics rows not yet confirmed.
    Pending,
    Active,
    /// Analytics write failed or was never completed.
    Invalid,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "invalid" => Ok(Self::Invalid),
            other => Err(format!("unknown dataset status: {other}")),
        }
    }
}
