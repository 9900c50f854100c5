//! Store and repository error types.

use statlake_core::PartitionStrategy;
use std::fmt;
use thiserror::Error;

/// Errors from the metadata store, analytics store, partitioning and optimizer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid query: {0}")]
    Sql(#[from] statlake_core::sql::SqlError),

    /// The two stores disagree and automatic repair was not possible.
    #[error("storage integrity violated: {0}")]
    StorageIntegrity(String),

    #[error("connection pool '{pool}' exhausted after waiting {waited_ms}ms")]
    PoolExhausted { pool: &'static str, waited_ms: u64 },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("partition layout conflict: store uses '{existing}', requested '{requested}'")]
    LayoutConflict {
        existing: PartitionStrategy,
        requested: PartitionStrategy,
    },
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Caller error: retrying the same input cannot succeed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Sql(_) | Self::LayoutConflict { .. }
        )
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// What happened to the metadata after a failed analytics write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Dataset marked `Invalid`, ingestion run marked `Compensated`.
    MarkedInvalid,
    /// The compensating write failed too; metadata still says `Pending`.
    StorageIntegrity(String),
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkedInvalid => f.write_str("dataset marked invalid"),
            Self::StorageIntegrity(e) => write!(f, "compensation failed ({e})"),
        }
    }
}

/// Errors from the unified repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingestion of '{dataset_id}' failed: {cause}; {compensation}")]
    IngestionFailed {
        dataset_id: String,
        cause: Box<StoreError>,
        compensation: Compensation,
    },
}

impl RepositoryError {
    /// True when the stores may now disagree and need `recover_interrupted_ingestions`.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            Self::IngestionFailed {
                compensation: Compensation::StorageIntegrity(_),
                ..
            } | Self::Store(StoreError::StorageIntegrity(_))
        )
    }
}
