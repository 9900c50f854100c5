//! Criterion benchmarks for the per-request hot paths.
//!
//! 1. Rate limiter admission (single id and many ids)
//! 2. Circuit breaker permit acquire/resolve
//! 3. Query fingerprinting

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use statlake_core::clock::ManualClock;
use statlake_core::domain::SqlValue;
use statlake_core::fingerprint::QueryFingerprint;
use statlake_core::resilience::{CircuitBreaker, RateLimiter};
use std::sync::Arc;
use std::time::Duration;

// ── 1. Rate limiter ──────────────────────────────────────────────────

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    for max_requests in [10u32, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("allow_full_window", max_requests),
            &max_requests,
            |b, &max| {
                let clock = Arc::new(ManualClock::new());
                let limiter = RateLimiter::with_clock(clock.clone());
                let window = Duration::from_secs(60);
                b.iter(|| {
                    clock.advance(Duration::from_millis(1));
                    black_box(limiter.allow("upstream", max, window))
                });
            },
        );
    }

    group.bench_function("allow_many_ids", |b| {
        let limiter = RateLimiter::with_clock(Arc::new(ManualClock::new()));
        let ids: Vec<String> = (0..256).map(|i| format!("integration_{i}")).collect();
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(limiter.allow(&ids[i], 30, Duration::from_secs(60)))
        });
    });

    group.finish();
}

// ── 2. Circuit breaker ───────────────────────────────────────────────

fn bench_breaker(c: &mut Criterion) {
    c.bench_function("breaker_acquire_success", |b| {
        let breaker = CircuitBreaker::with_clock(5, Duration::from_secs(60), Arc::new(ManualClock::new()));
        b.iter(|| {
            if let Ok(permit) = breaker.try_acquire() {
                permit.success();
            }
        });
    });

    c.bench_function("breaker_rejects_when_open", |b| {
        let breaker = CircuitBreaker::with_clock(1, Duration::from_secs(60), Arc::new(ManualClock::new()));
        breaker.trip();
        b.iter(|| black_box(breaker.try_acquire().is_err()));
    });
}

// ── 3. Fingerprinting ────────────────────────────────────────────────

fn bench_fingerprint(c: &mut Criterion) {
    let sql = "SELECT territory_key, time_key, AVG(value)\n  FROM observations\n WHERE dataset_id = ?\n   AND time_key >= ?\n GROUP BY 1, 2\n ORDER BY 1, 2;";
    let params = vec![SqlValue::from("POP_2023"), SqlValue::from("2019")];
    c.bench_function("fingerprint_typical_query", |b| {
        b.iter(|| black_box(QueryFingerprint::compute(black_box(sql), black_box(&params))))
    });
}

criterion_group!(benches, bench_rate_limiter, bench_breaker, bench_fingerprint);
criterion_main!(benches);
