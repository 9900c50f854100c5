//! statlake store: persistence behind the unified repository.
//!
//! This crate builds on `statlake-core` to provide:
//! - SQLite metadata store (registry, preferences, credentials, audit, ingestion runs)
//! - DuckDB analytics store with allow-listed table names
//! - Year / territory / hybrid partitioning with query pruning
//! - Fingerprinted TTL query cache, index and statistics maintenance
//! - The unified repository and its compensating registration saga

pub mod analytics;
pub mod error;
pub mod metadata;
pub mod optimizer;
pub mod partition;
pub mod pool;
pub mod repository;

pub use analytics::{AnalyticsOptions, AnalyticsStore, ResultSet, TableName};
pub use error::{Compensation, RepositoryError, StoreError};
pub use metadata::{
    Actor, AuditFilter, CredentialCheck, MetadataOptions, MetadataStore, NewCredential, Page,
    PreferenceValue,
};
pub use optimizer::{CacheOptions, CacheStats, QueryOptimizer, TableStatistics};
pub use partition::{PartitionFilters, PartitionManager, PrunedQuery};
pub use repository::{
    PrunedResult, QualityReport, RecoveryReport, RegistrationOutcome, RegistrationRequest, RepositoryOptions,
    UnifiedRepository,
};
