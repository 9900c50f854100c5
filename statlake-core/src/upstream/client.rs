//! Fault-tolerant upstream client.
//!
//! Every fetch goes through, in order: id validation, the sliding-window rate
//! limiter, then up to `max_attempts` tries, each gated by the circuit
//! breaker, with exponential backoff between them. When the live path fails
//! the client degrades to the fallback cache, then to synthetic data.

use super::batch::BatchCancellation;
use super::fallback::FallbackCache;
use super::http::HttpTransport;
use super::provider::{Payload, PayloadSource, Transport, UpstreamError};
use super::synthetic::synthetic_body;
use crate::clock::{system_clock, Clock};
use crate::config::{ConfigError, StatlakeConfig, UPSTREAM_INTEGRATION};
use crate::domain::DatasetId;
use crate::resilience::{CircuitBreaker, CircuitState, RateLimitRule, RateLimiter};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for [`UpstreamClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    pub base_url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    pub max_concurrency: usize,
    pub rate_limit: RateLimitRule,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub fallback_dir: Option<PathBuf>,
    pub synthetic: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&StatlakeConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(config: &StatlakeConfig) -> Self {
        Self {
            base_url: config.upstream.base_url.clone(),
            timeout: config.upstream.timeout(),
            max_attempts: config.upstream.max_attempts.max(1),
            base_delay: config.upstream.base_delay(),
            max_concurrency: config.upstream.max_concurrency.max(1),
            rate_limit: config.rate_limit(UPSTREAM_INTEGRATION),
            failure_threshold: config.circuit_breaker.failure_threshold,
            recovery_timeout: config.circuit_breaker.recovery_timeout(),
            fallback_dir: config.fallback.cache_dir.clone(),
            synthetic: config.fallback.synthetic,
        }
    }
}

/// Health snapshot of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub requests_in_window: usize,
    /// True while the most recent fetch was served from the fallback cache.
    pub cache_fallback_active: bool,
}

/// Outcome of the live path when no payload was obtained.
struct LiveFailure {
    error: UpstreamError,
    attempts: u32,
}

impl LiveFailure {
    fn new(error: UpstreamError, attempts: u32) -> Self {
        Self { error, attempts }
    }
}

/// Upstream client shared across threads behind an `Arc`.
pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    fallback: Option<FallbackCache>,
    clock: Arc<dyn Clock>,
    cache_fallback_active: AtomicBool,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("transport", &self.transport.name())
            .field("options", &self.options)
            .field("breaker", &self.breaker.snapshot())
            .finish()
    }
}

impl UpstreamClient {
    /// Client over the real HTTP transport, configured from `config`.
    pub fn from_config(config: &StatlakeConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(config.upstream.timeout(), &config.upstream.user_agent)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::new(ClientOptions::from_config(config), Arc::new(transport))
    }

    /// Client with its own breaker and limiter on the system clock.
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::with_clock(options, transport, system_clock())
    }

    pub fn with_clock(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let breaker = Arc::new(CircuitBreaker::with_clock(
            options.failure_threshold,
            options.recovery_timeout,
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        Self::with_parts(options, transport, breaker, limiter, clock)
    }

    /// Client sharing an existing breaker and limiter.
    pub fn with_parts(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_concurrency.max(1))
            .thread_name(|i| format!("statlake-fetch-{i}"))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build fetch pool: {e}")))?;
        let fallback = options.fallback_dir.as_ref().map(FallbackCache::new);
        Ok(Self {
            transport,
            options,
            breaker,
            limiter,
            fallback,
            clock,
            cache_fallback_active: AtomicBool::new(false),
            pool,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn dataset_url(&self, id: &DatasetId) -> String {
        format!("{}/{}", self.options.base_url.trim_end_matches('/'), id)
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some() || self.options.synthetic
    }

    /// Fetch one dataset. Read path: may return a degraded payload.
    pub fn fetch_dataset(&self, dataset_id: &str) -> Result<Payload, UpstreamError> {
        self.fetch_inner(dataset_id, None)
    }

    /// Fetch many datasets on the bounded worker pool.
    ///
    /// One entry per distinct id; a failing id never aborts its siblings.
    pub fn fetch_dataset_batch<S>(&self, ids: &[S]) -> BTreeMap<String, Result<Payload, UpstreamError>>
    where
        S: AsRef<str> + Sync,
    {
        self.fetch_dataset_batch_with(ids, &BatchCancellation::new())
    }

    /// [`fetch_dataset_batch`](Self::fetch_dataset_batch) with cancellation.
    pub fn fetch_dataset_batch_with<S>(
        &self,
        ids: &[S],
        cancel: &BatchCancellation,
    ) -> BTreeMap<String, Result<Payload, UpstreamError>>
    where
        S: AsRef<str> + Sync,
    {
        let mut unique: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        unique.sort_unstable();
        unique.dedup();

        let results: Vec<(String, Result<Payload, UpstreamError>)> = self.pool.install(|| {
            unique
                .par_iter()
                .map(|id| (id.to_string(), self.fetch_inner(id, Some(cancel))))
                .collect()
        });

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        let degraded = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(p) if p.degraded))
            .count();
        tracing::info!(
            total = results.len(),
            failed,
            degraded,
            "batch fetch complete"
        );

        results.into_iter().collect()
    }

    pub fn get_status(&self) -> UpstreamStatus {
        let snapshot = self.breaker.snapshot();
        UpstreamStatus {
            circuit_state: snapshot.state,
            failure_count: snapshot.failure_count,
            requests_in_window: self
                .limiter
                .requests_in_window(UPSTREAM_INTEGRATION, self.options.rate_limit.window),
            cache_fallback_active: self.cache_fallback_active.load(Ordering::SeqCst),
        }
    }

    fn fetch_inner(
        &self,
        dataset_id: &str,
        cancel: Option<&BatchCancellation>,
    ) -> Result<Payload, UpstreamError> {
        let id = DatasetId::parse(dataset_id)?;
        if is_cancelled(cancel, dataset_id) {
            return Err(UpstreamError::Cancelled {
                dataset_id: dataset_id.to_string(),
            });
        }

        match self.fetch_live(&id, cancel) {
            Ok(payload) => {
                self.cache_fallback_active.store(false, Ordering::SeqCst);
                if let Some(cache) = &self.fallback {
                    if let Err(e) = cache.store(&payload) {
                        tracing::warn!(dataset_id = %id, error = %e, "failed to refresh fallback cache");
                    }
                }
                Ok(payload)
            }
            Err(LiveFailure { error, attempts }) => match error {
                UpstreamError::DatasetNotFound { .. } | UpstreamError::Cancelled { .. } => {
                    Err(error)
                }
                _ => self.degrade(&id, error, attempts),
            },
        }
    }

    fn fetch_live(
        &self,
        id: &DatasetId,
        cancel: Option<&BatchCancellation>,
    ) -> Result<Payload, LiveFailure> {
        // An open breaker must not spend a rate-limit slot.
        if !self.breaker.is_allowed() {
            return Err(LiveFailure::new(
                UpstreamError::CircuitOpen {
                    retry_after_ms: self.breaker.remaining_cooldown().as_millis() as u64,
                },
                0,
            ));
        }

        let rule = &self.options.rate_limit;
        if !self.limiter.allow_rule(UPSTREAM_INTEGRATION, rule) {
            let retry_after = self
                .limiter
                .retry_after(UPSTREAM_INTEGRATION, rule.max_requests, rule.window);
            return Err(LiveFailure::new(
                UpstreamError::RateLimitExceeded {
                    integration: UPSTREAM_INTEGRATION.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                },
                0,
            ));
        }

        let url = self.dataset_url(id);
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self
                    .options
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt - 2));
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }

            if is_cancelled(cancel, id.as_str()) {
                return Err(LiveFailure::new(
                    UpstreamError::Cancelled {
                        dataset_id: id.to_string(),
                    },
                    attempts,
                ));
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    // Opened by our own failures: report what failed, not the breaker.
                    tracing::warn!(dataset_id = %id, attempt, "circuit opened during retries");
                    last_error = Some(last_error.unwrap_or(UpstreamError::CircuitOpen {
                        retry_after_ms: open.remaining.as_millis() as u64,
                    }));
                    break;
                }
            };

            attempts += 1;
            match self.transport.get(&url, self.options.timeout) {
                Ok(resp) if resp.is_success() => {
                    permit.success();
                    return Ok(Payload::live(
                        id.as_str(),
                        resp.body,
                        resp.content_type,
                        self.clock.wall(),
                    ));
                }
                Ok(resp) => {
                    let error = UpstreamError::Http {
                        status: resp.status,
                        dataset_id: id.to_string(),
                    };
                    tracing::warn!(
                        dataset_id = %id,
                        attempt,
                        max_attempts,
                        status = resp.status,
                        "upstream request failed"
                    );
                    match resp.status {
                        403 => {
                            // Treated as a ban: stop hammering immediately.
                            self.breaker.trip();
                            drop(permit);
                            last_error = Some(error);
                            break;
                        }
                        404 => {
                            permit.success();
                            return Err(LiveFailure::new(
                                UpstreamError::DatasetNotFound {
                                    dataset_id: id.to_string(),
                                },
                                attempts,
                            ));
                        }
                        _ if error.is_retryable() => {
                            permit.failure();
                            last_error = Some(error);
                        }
                        _ => {
                            drop(permit);
                            last_error = Some(error);
                            break;
                        }
                    }
                }
                Err(e) => {
                    permit.failure();
                    let error = UpstreamError::from(e);
                    tracing::warn!(
                        dataset_id = %id,
                        attempt,
                        max_attempts,
                        error = %error,
                        "upstream request failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(LiveFailure::new(
            last_error.unwrap_or_else(|| UpstreamError::Network("no attempt was made".into())),
            attempts,
        ))
    }

    fn degrade(
        &self,
        id: &DatasetId,
        last: UpstreamError,
        attempts: u32,
    ) -> Result<Payload, UpstreamError> {
        let reason = last.to_string();

        if let Some(cache) = &self.fallback {
            match cache.load(id.as_str()) {
                Ok(Some(payload)) => {
                    self.cache_fallback_active.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        dataset_id = %id,
                        reason = %reason,
                        cached_at = %payload.fetched_at,
                        "serving degraded payload from fallback cache"
                    );
                    return Ok(payload.degrade(PayloadSource::FallbackCache, reason));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(dataset_id = %id, error = %e, "fallback cache read failed");
                }
            }
        }

        if self.options.synthetic {
            let body = synthetic_body(id.as_str())
                .map_err(|e| UpstreamError::Fallback(format!("synthetic serialization: {e}")))?;
            tracing::warn!(
                dataset_id = %id,
                reason = %reason,
                "serving synthetic payload"
            );
            let payload = Payload::live(
                id.as_str(),
                body,
                Some("application/json".into()),
                self.clock.wall(),
            );
            return Ok(payload.degrade(PayloadSource::Synthetic, reason));
        }

        if !self.has_fallback()
            && matches!(
                last,
                UpstreamError::CircuitOpen { .. } | UpstreamError::RateLimitExceeded { .. }
            )
        {
            return Err(last);
        }

        tracing::error!(
            dataset_id = %id,
            attempts,
            error = %last,
            "upstream unavailable and no fallback payload"
        );
        Err(UpstreamError::Unavailable {
            dataset_id: id.to_string(),
            attempts,
            last: Box::new(last),
        })
    }
}

fn is_cancelled(cancel: Option<&BatchCancellation>, dataset_id: &str) -> bool {
    cancel.is_some_and(|c| c.is_cancelled(dataset_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::provider::{TransportError, TransportResponse};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Pops scripted responses; answers 200 once the script runs out.
    struct Scripted {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl Transport for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
            self.calls.lock().push(url.to_string());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::ok(b"{}".to_vec())))
        }
    }

    fn options() -> ClientOptions {
        ClientOptions {
            base_url: "http://upstream.test/data/".into(),
            base_delay: Duration::ZERO,
            max_concurrency: 2,
            ..ClientOptions::default()
        }
    }

    #[test]
    fn builds_url_without_double_slash() {
        let t = Scripted::new(vec![]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        client.fetch_dataset("POP_2023").unwrap();
        assert_eq!(t.calls.lock()[0], "http://upstream.test/data/POP_2023");
    }

    #[test]
    fn retries_transient_failures() {
        let t = Scripted::new(vec![
            Err(TransportError::Timeout("slow".into())),
            Ok(TransportResponse::status(503)),
        ]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        let payload = client.fetch_dataset("POP_2023").unwrap();
        assert!(!payload.degraded);
        assert_eq!(payload.source, PayloadSource::Live);
        assert_eq!(t.call_count(), 3);
    }

    #[test]
    fn not_found_is_not_retried() {
        let t = Scripted::new(vec![Ok(TransportResponse::status(404))]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        let err = client.fetch_dataset("NOPE").unwrap_err();
        assert!(matches!(err, UpstreamError::DatasetNotFound { .. }));
        assert_eq!(t.call_count(), 1);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let t = Scripted::new(vec![Ok(TransportResponse::status(401))]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        let err = client.fetch_dataset("POP_2023").unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { attempts: 1, .. }));
        assert_eq!(t.call_count(), 1);
    }

    #[test]
    fn forbidden_trips_breaker() {
        let t = Scripted::new(vec![Ok(TransportResponse::status(403))]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        assert!(client.fetch_dataset("POP_2023").is_err());
        assert_eq!(client.get_status().circuit_state, CircuitState::Open);

        let err = client.fetch_dataset("POP_2023").unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitOpen { .. }));
        assert_eq!(t.call_count(), 1);
    }

    #[test]
    fn breaker_opening_mid_retry_keeps_transport_error() {
        let t = Scripted::new(vec![
            Ok(TransportResponse::status(503)),
            Ok(TransportResponse::status(503)),
        ]);
        let opts = ClientOptions {
            failure_threshold: 2,
            ..options()
        };
        let client = UpstreamClient::new(opts, t.clone()).unwrap();
        let err = client.fetch_dataset("POP_2023").unwrap_err();
        match err {
            UpstreamError::Unavailable { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, UpstreamError::Http { status: 503, .. }), "{last}");
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(client.get_status().circuit_state, CircuitState::Open);
        assert_eq!(t.call_count(), 2);
    }

    #[test]
    fn open_breaker_does_not_consume_rate_limit() {
        let t = Scripted::new(vec![Ok(TransportResponse::status(403))]);
        let opts = ClientOptions {
            rate_limit: RateLimitRule::new(2, Duration::from_secs(60)),
            ..options()
        };
        let client = UpstreamClient::new(opts, t.clone()).unwrap();
        assert!(client.fetch_dataset("POP_2023").is_err());

        for _ in 0..3 {
            let err = client.fetch_dataset("POP_2023").unwrap_err();
            assert!(matches!(err, UpstreamError::CircuitOpen { .. }), "{err}");
        }
        assert_eq!(client.get_status().requests_in_window, 1);
        assert_eq!(t.call_count(), 1);
    }

    #[test]
    fn invalid_id_never_reaches_transport() {
        let t = Scripted::new(vec![]);
        let client = UpstreamClient::new(options(), t.clone()).unwrap();
        let err = client.fetch_dataset("../../etc/passwd").unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidDatasetId(_)));
        assert_eq!(t.call_count(), 0);
    }

    #[test]
    fn rate_limit_without_fallback_surfaces_directly() {
        let t = Scripted::new(vec![]);
        let opts = ClientOptions {
            rate_limit: RateLimitRule::new(1, Duration::from_secs(60)),
            ..options()
        };
        let client = UpstreamClient::new(opts, t.clone()).unwrap();
        client.fetch_dataset("A").unwrap();
        let err = client.fetch_dataset("B").unwrap_err();
        assert!(matches!(err, UpstreamError::RateLimitExceeded { .. }));
        assert_eq!(t.call_count(), 1);
        assert_eq!(client.get_status().requests_in_window, 1);
    }

    #[test]
    fn synthetic_fallback_is_degraded_and_deterministic() {
        let t = Scripted::new(vec![
            Ok(TransportResponse::status(500)),
            Ok(TransportResponse::status(500)),
            Ok(TransportResponse::status(500)),
        ]);
        let opts = ClientOptions {
            synthetic: true,
            ..options()
        };
        let client = UpstreamClient::new(opts, t).unwrap();
        let payload = client.fetch_dataset("POP_2023").unwrap();
        assert!(payload.degraded);
        assert_eq!(payload.source, PayloadSource::Synthetic);
        assert!(payload.degraded_reason.unwrap().contains("HTTP 500"));
        assert_eq!(payload.body, synthetic_body("POP_2023").unwrap());
    }
}
