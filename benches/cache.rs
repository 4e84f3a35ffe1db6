use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use recache::testing::Recorder;
use recache::{cache, repeat_on_trigger, CacheConfig, Callbacks, Scheduler, Stream, Subject};

fn bench_cache_hit(c: &mut Criterion) {
    c.bench_function("cache/replay_hit", |b| {
        let scheduler = Scheduler::new();
        let cached = Stream::of(0..16u64).pipe(cache(
            &scheduler,
            CacheConfig::new(Duration::from_secs(3600)).with_buffer_size(16),
        ));
        // Keeps the first run's values buffered.
        let warm = Recorder::subscribe(&cached);
        scheduler.flush();
        assert_eq!(warm.len(), 16);

        b.iter(|| {
            let subscription = cached.subscribe(Callbacks::new(|value| {
                black_box(value);
            }));
            subscription.unsubscribe();
        });
    });
}

fn bench_refresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("manual_refresh", |b| {
        b.iter_custom(|iters| {
            let scheduler = Scheduler::new();
            let refresh = Subject::new();
            let cached = Stream::of([1u64]).pipe(
                cache(&scheduler, CacheConfig::new(Duration::from_secs(3600))).refresher(refresh.stream()),
            );
            let spy = cached.subscribe(Callbacks::new(|value| {
                black_box(value);
            }));

            let start = Instant::now();
            for _ in 0..iters {
                refresh.next(());
                scheduler.flush();
            }
            let elapsed = start.elapsed();
            spy.unsubscribe();
            elapsed
        });
    });

    group.finish();
}

fn bench_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("repeat");
    group.throughput(Throughput::Elements(1));

    group.bench_function("trigger_switch", |b| {
        b.iter_custom(|iters| {
            let trigger = Subject::new();
            let repeated = Stream::of([1u64]).pipe(repeat_on_trigger(trigger.stream()));
            let spy = repeated.subscribe(Callbacks::new(|value| {
                black_box(value);
            }));

            let start = Instant::now();
            for _ in 0..iters {
                trigger.next(());
            }
            let elapsed = start.elapsed();
            spy.unsubscribe();
            elapsed
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cache_hit, bench_refresh, bench_switch);
criterion_main!(benches);
