//! Transport trait, payload type and structured upstream errors.
//!
//! The `Transport` trait abstracts the raw HTTP exchange so the client's retry,
//! breaker and fallback logic can be driven by a scripted mock in tests.

use crate::domain::InvalidDatasetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Where a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSource {
    Live,
    /// Last good payload from the on-disk fallback cache.
    FallbackCache,
    /// Deterministic generated data.
    Synthetic,
}

/// Raw dataset payload as returned by the upstream source.
///
/// The body is opaque here; parsing the wire format belongs to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub dataset_id: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub source: PayloadSource,
    /// True for any payload not fetched live.
    pub degraded: bool,
    /// Why the live path was not used.
    pub degraded_reason: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Payload {
    pub fn live(
        dataset_id: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            body,
            content_type,
            source: PayloadSource::Live,
            degraded: false,
            degraded_reason: None,
            fetched_at,
        }
    }

    /// Mark this payload as served from `source` because of `reason`.
    pub fn degrade(mut self, source: PayloadSource, reason: impl Into<String>) -> Self {
        self.source = source;
        self.degraded = true;
        self.degraded_reason = Some(reason.into());
        self
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Structured errors for upstream operations.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("upstream unavailable for '{dataset_id}' after {attempts} attempt(s): {last}")]
    Unavailable {
        dataset_id: String,
        attempts: u32,
        last: Box<UpstreamError>,
    },

    #[error("circuit breaker open (retry in {retry_after_ms}ms)")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("rate limit exceeded for '{integration}' (retry in {retry_after_ms}ms)")]
    RateLimitExceeded {
        integration: String,
        retry_after_ms: u64,
    },

    #[error("dataset not found: {dataset_id}")]
    DatasetNotFound { dataset_id: String },

    #[error("HTTP {status} for {dataset_id}")]
    Http { status: u16, dataset_id: String },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("fetch cancelled: {dataset_id}")]
    Cancelled { dataset_id: String },

    #[error(transparent)]
    InvalidDatasetId(#[from] InvalidDatasetId),

    #[error("fallback cache error: {0}")]
    Fallback(String),
}

impl UpstreamError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Raw HTTP response handed back by a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: Some("application/json".into()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_type: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for UpstreamError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(msg) => UpstreamError::Timeout(msg),
            TransportError::Connect(msg) | TransportError::Other(msg) => {
                UpstreamError::Network(msg)
            }
        }
    }
}

/// One outbound HTTP GET.
///
/// Implementations must be shareable across the batch worker pool.
pub trait Transport: Send + Sync {
    /// Human-readable name of this transport.
    fn name(&self) -> &str;

    /// Perform `GET url`, bounded by `timeout`.
    fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, TransportError>;
}
