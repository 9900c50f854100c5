//! Fault-tolerant client for the remote statistical data source.
//!
//! - `provider`: payload type, error taxonomy, `Transport` seam
//! - `http`: blocking `reqwest` transport
//! - `client`: rate limit, circuit breaker, retry with backoff, degradation
//! - `fallback`: on-disk last-good payload cache
//! - `synthetic`: deterministic generated payloads
//! - `batch`: cancellation for bounded-concurrency batch fetches

pub mod batch;
pub mod client;
pub mod fallback;
pub mod http;
pub mod provider;
pub mod synthetic;

pub use batch::BatchCancellation;
pub use client::{ClientOptions, UpstreamClient, UpstreamStatus};
pub use fallback::{FallbackCache, FallbackMeta};
pub use http::HttpTransport;
pub use provider::{
    Payload, PayloadSource, Transport, TransportError, TransportResponse, UpstreamError,
};
pub use synthetic::{generate_synthetic, synthetic_body, SyntheticDataset, SyntheticObservation};
