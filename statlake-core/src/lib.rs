//! statlake core: domain types, resilience primitives, and the upstream client.
//!
//! This crate holds everything that does not touch a database:
//! - Domain types (dataset ids and categories, observations, SQL values)
//! - An injectable clock shared by every time-dependent component
//! - Circuit breaker and sliding-window rate limiter
//! - The fault-tolerant upstream client with offline fallback
//! - Query fingerprints and the small SQL lexer behind them
//! - Layered configuration and `tracing` setup

pub mod clock;
pub mod config;
pub mod domain;
pub mod fingerprint;
pub mod logging;
pub mod resilience;
pub mod sql;
pub mod upstream;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PartitionStrategy, StatlakeConfig};
pub use domain::{DatasetCategory, DatasetId, DatasetStatus, Observation, ObservationRow, SqlValue};
pub use fingerprint::QueryFingerprint;
pub use upstream::{Payload, UpstreamClient, UpstreamError};
