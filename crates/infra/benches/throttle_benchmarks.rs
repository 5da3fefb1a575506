use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

use modbridge_core::{ActorId, ManualClock};
use modbridge_infra::jobs::{Backoff, RetryPolicy};
use modbridge_infra::throttle::{
    CounterStore, InMemoryCounterStore, SlidingWindowLimiter, ThrottleConfig,
};
use modbridge_observability::Metrics;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

/// Raw store throughput: admit into windows of increasing size.
fn bench_window_admit(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("window_admit");
    group.throughput(Throughput::Elements(1));

    for max in [1u32, 10, 100].iter() {
        let store = InMemoryCounterStore::new();
        let mut now_ms = 0i64;

        group.bench_with_input(BenchmarkId::from_parameter(max), max, |b, &max| {
            b.iter(|| {
                now_ms += 1;
                let member = now_ms.to_string();
                rt.block_on(store.admit(
                    black_box("bench:throttle:actor:ban"),
                    now_ms,
                    5_000,
                    max,
                    &member,
                ))
            })
        });
    }

    group.finish();
}

/// Full limiter path including key building and member generation.
fn bench_limiter_check(c: &mut Criterion) {
    let rt = runtime();
    let clock = ManualClock::starting_now();
    let limiter = SlidingWindowLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        ThrottleConfig::default(),
        Arc::new(clock.clone()),
        Metrics::shared(),
    );
    let actors: Vec<ActorId> = (0..1_000)
        .map(|i| ActorId::parse(format!("user-{i}")).expect("valid actor id"))
        .collect();

    let mut group = c.benchmark_group("limiter_check");
    group.bench_function("distinct_actors", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % actors.len();
            clock.advance(Duration::from_millis(1));
            let _ = rt.block_on(limiter.check(black_box(&actors[i]), "kick"));
        })
    });
    group.bench_function("same_actor_throttled", |b| {
        b.iter(|| {
            let _ = rt.block_on(limiter.check(black_box(&actors[0]), "ban"));
        })
    });
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let policy = RetryPolicy::default();
    let linear = Backoff::linear(Duration::from_secs(1), Duration::from_secs(60));

    group.bench_function("exponential_1_to_32", |b| {
        b.iter(|| {
            (1..=32u32)
                .map(|attempt| policy.backoff.delay_for_attempt(black_box(attempt)))
                .sum::<Duration>()
        })
    });
    group.bench_function("linear_1_to_32", |b| {
        b.iter(|| {
            (1..=32u32)
                .map(|attempt| linear.delay_for_attempt(black_box(attempt)))
                .sum::<Duration>()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_window_admit, bench_limiter_check, bench_backoff);
criterion_main!(benches);
