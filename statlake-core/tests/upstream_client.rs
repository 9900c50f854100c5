//! Integration tests for the upstream client against a scripted transport.
//!
//! Every test counts network attempts, so "no network attempt" claims are
//! checked directly rather than inferred from timing.

use parking_lot::Mutex;
use statlake_core::clock::ManualClock;
use statlake_core::resilience::{CircuitState, RateLimitRule};
use statlake_core::upstream::{
    BatchCancellation, ClientOptions, Payload, PayloadSource, Transport, TransportError,
    TransportResponse, UpstreamClient, UpstreamError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Mock transport ───────────────────────────────────────────────────

/// Answers per dataset id (last URL segment); unknown ids get 200.
#[derive(Default)]
struct RoutedTransport {
    routes: Mutex<HashMap<String, u16>>,
    attempts: AtomicUsize,
    per_id: Mutex<HashMap<String, usize>>,
    down: std::sync::atomic::AtomicBool,
}

impl RoutedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, id: &str, status: u16) {
        self.routes.lock().insert(id.to_string(), status);
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempts_for(&self, id: &str) -> usize {
        self.per_id.lock().get(id).copied().unwrap_or(0)
    }
}

impl Transport for RoutedTransport {
    fn name(&self) -> &str {
        "routed"
    }

    fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let id = url.rsplit('/').next().unwrap_or_default().to_string();
        *self.per_id.lock().entry(id.clone()).or_default() += 1;

        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        match self.routes.lock().get(&id) {
            Some(status) => Ok(TransportResponse::status(*status)),
            None => Ok(TransportResponse::ok(format!("{{\"dataset\":\"{id}\"}}"))),
        }
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        base_url: "http://upstream.test/rest/data".into(),
        base_delay: Duration::ZERO,
        max_concurrency: 2,
        ..ClientOptions::default()
    }
}

fn client(opts: ClientOptions, transport: Arc<RoutedTransport>) -> (UpstreamClient, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let client = UpstreamClient::with_clock(opts, transport, clock.clone()).unwrap();
    (client, clock)
}

// ── Circuit breaker ──────────────────────────────────────────────────

#[test]
fn sixth_call_rejected_by_breaker_without_network_attempt() {
    let transport = RoutedTransport::new();
    transport.route("POP_2023", 500);
    let opts = ClientOptions {
        max_attempts: 1,
        failure_threshold: 5,
        ..options()
    };
    let (client, _) = client(opts, transport.clone());

    for _ in 0..5 {
        let err = client.fetch_dataset("POP_2023").unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { .. }), "{err}");
    }
    assert_eq!(transport.attempts(), 5);

    let err = client.fetch_dataset("POP_2023").unwrap_err();
    assert!(matches!(err, UpstreamError::CircuitOpen { .. }), "{err}");
    assert_eq!(transport.attempts(), 5);

    let status = client.get_status();
    assert_eq!(status.circuit_state, CircuitState::Open);
    assert_eq!(status.failure_count, 5);
}

#[test]
fn breaker_recovers_through_half_open_trial() {
    let transport = RoutedTransport::new();
    transport.set_down(true);
    let opts = ClientOptions {
        max_attempts: 1,
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(30),
        ..options()
    };
    let (client, clock) = client(opts, transport.clone());

    client.fetch_dataset("ECON_GDP").unwrap_err();
    client.fetch_dataset("ECON_GDP").unwrap_err();
    assert_eq!(client.get_status().circuit_state, CircuitState::Open);

    transport.set_down(false);
    clock.advance(Duration::from_secs(30));
    assert_eq!(client.get_status().circuit_state, CircuitState::HalfOpen);

    let payload = client.fetch_dataset("ECON_GDP").unwrap();
    assert!(!payload.degraded);
    assert_eq!(client.get_status().circuit_state, CircuitState::Closed);
    assert_eq!(client.get_status().failure_count, 0);
}

#[test]
fn retries_stop_when_breaker_opens_mid_fetch() {
    let transport = RoutedTransport::new();
    transport.route("LAB_1", 503);
    let opts = ClientOptions {
        max_attempts: 5,
        failure_threshold: 2,
        ..options()
    };
    let (client, _) = client(opts, transport.clone());

    // Without a fallback the breaker rejection surfaces as-is.
    let err = client.fetch_dataset("LAB_1").unwrap_err();
    assert!(matches!(err, UpstreamError::CircuitOpen { .. }), "{err}");
    assert_eq!(transport.attempts(), 2);
}

// ── Batch ────────────────────────────────────────────────────────────

#[test]
fn batch_of_five_with_two_failures_returns_five_entries() {
    let transport = RoutedTransport::new();
    transport.route("BAD_1", 404);
    transport.route("BAD_2", 404);
    let (client, _) = client(options(), transport.clone());

    let ids = ["POP_1", "BAD_1", "ECON_1", "BAD_2", "EDU_1"];
    let results = client.fetch_dataset_batch(&ids);

    assert_eq!(results.len(), 5);
    let ok: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(ok.len(), 3);
    for bad in ["BAD_1", "BAD_2"] {
        assert!(matches!(
            results[bad],
            Err(UpstreamError::DatasetNotFound { .. })
        ));
    }
    let payload: &Payload = results["ECON_1"].as_ref().unwrap();
    assert_eq!(payload.json().unwrap()["dataset"], "ECON_1");
}

#[test]
fn batch_isolates_invalid_ids_and_deduplicates() {
    let transport = RoutedTransport::new();
    let (client, _) = client(options(), transport.clone());

    let ids = vec!["POP_1".to_string(), "POP_1".to_string(), "bad id".to_string()];
    let results = client.fetch_dataset_batch(&ids);

    assert_eq!(results.len(), 2);
    assert!(results["POP_1"].is_ok());
    assert!(matches!(
        results["bad id"],
        Err(UpstreamError::InvalidDatasetId(_))
    ));
    assert_eq!(transport.attempts_for("POP_1"), 1);
}

#[test]
fn cancelled_ids_resolve_to_cancelled_without_network() {
    let transport = RoutedTransport::new();
    let (client, _) = client(options(), transport.clone());

    let cancel = BatchCancellation::new();
    cancel.cancel("TOUR_2");
    let results = client.fetch_dataset_batch_with(&["TOUR_1", "TOUR_2", "TOUR_3"], &cancel);

    assert_eq!(results.len(), 3);
    assert!(matches!(results["TOUR_2"], Err(UpstreamError::Cancelled { .. })));
    assert!(results["TOUR_1"].is_ok());
    assert!(results["TOUR_3"].is_ok());
    assert_eq!(transport.attempts_for("TOUR_2"), 0);

    let all = BatchCancellation::new();
    all.cancel_all();
    let results = client.fetch_dataset_batch_with(&["TOUR_1", "TOUR_3"], &all);
    assert!(results
        .values()
        .all(|r| matches!(r, Err(UpstreamError::Cancelled { .. }))));
}

// ── Offline fallback ─────────────────────────────────────────────────

#[test]
fn fallback_cache_serves_last_good_payload_when_down() {
    let dir = tempfile::tempdir().unwrap();
    let transport = RoutedTransport::new();
    let opts = ClientOptions {
        fallback_dir: Some(dir.path().to_path_buf()),
        max_attempts: 2,
        ..options()
    };
    let (client, _) = client(opts, transport.clone());

    let live = client.fetch_dataset("HEALTH_1").unwrap();
    assert!(!live.degraded);
    assert!(!client.get_status().cache_fallback_active);
    assert!(dir.path().join("dataset=HEALTH_1").join("meta.json").exists());

    transport.set_down(true);
    let degraded = client.fetch_dataset("HEALTH_1").unwrap();
    assert!(degraded.degraded);
    assert_eq!(degraded.source, PayloadSource::FallbackCache);
    assert_eq!(degraded.body, live.body);
    assert!(degraded
        .degraded_reason
        .as_deref()
        .unwrap()
        .contains("network unreachable"));
    assert!(client.get_status().cache_fallback_active);

    transport.set_down(false);
    client.fetch_dataset("HEALTH_1").unwrap();
    assert!(!client.get_status().cache_fallback_active);
}

#[test]
fn fallback_configured_but_empty_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let transport = RoutedTransport::new();
    transport.set_down(true);
    let opts = ClientOptions {
        fallback_dir: Some(dir.path().to_path_buf()),
        max_attempts: 1,
        ..options()
    };
    let (client, _) = client(opts, transport);

    let err = client.fetch_dataset("ENV_1").unwrap_err();
    assert!(matches!(err, UpstreamError::Unavailable { attempts: 1, .. }));
}

#[test]
fn rate_limited_fetch_degrades_when_fallback_exists() {
    let dir = tempfile::tempdir().unwrap();
    let transport = RoutedTransport::new();
    let opts = ClientOptions {
        fallback_dir: Some(dir.path().to_path_buf()),
        rate_limit: RateLimitRule::new(1, Duration::from_secs(60)),
        ..options()
    };
    let (client, clock) = client(opts, transport.clone());

    client.fetch_dataset("TERR_1").unwrap();
    let second = client.fetch_dataset("TERR_1").unwrap();
    assert!(second.degraded);
    assert!(second
        .degraded_reason
        .as_deref()
        .unwrap()
        .contains("rate limit"));
    assert_eq!(transport.attempts(), 1);

    clock.advance(Duration::from_secs(60));
    assert!(!client.fetch_dataset("TERR_1").unwrap().degraded);
}

#[test]
fn synthetic_fallback_used_after_cache_miss() {
    let dir = tempfile::tempdir().unwrap();
    let transport = RoutedTransport::new();
    transport.set_down(true);
    let opts = ClientOptions {
        fallback_dir: Some(dir.path().to_path_buf()),
        synthetic: true,
        max_attempts: 1,
        ..options()
    };
    let (client, _) = client(opts, transport);

    let payload = client.fetch_dataset("POP_2023").unwrap();
    assert_eq!(payload.source, PayloadSource::Synthetic);
    assert!(payload.degraded);
    let body = payload.json().unwrap();
    assert_eq!(body["synthetic"], true);
    assert_eq!(body["dataset_id"], "POP_2023");
}
