use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use delay_store::ArenaDelayStore;
use delay_store::DelayStore;
use delay_store::LocalDelayStore;

const KEYS: u64 = 10_000;

fn populate<S: DelayStore>(store: &S) {
    for i in 0..KEYS {
        store.apply_update("api", &format!("10.0.{}.{}", i / 256, i % 256), 1_000 + i);
    }
}

fn bench_single_store<S: DelayStore>(group_name: &str, c: &mut Criterion, store: Arc<S>) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("lookup-hit", |b| {
        b.iter(|| black_box(store.as_ref()).lookup("api", black_box("10.0.3.7")))
    });

    group.bench_function("lookup-miss", |b| {
        b.iter(|| black_box(store.as_ref()).lookup("api", black_box("192.168.1.1")))
    });

    let mut ts = 0u64;
    group.bench_function("apply-update", |b| {
        b.iter(|| {
            ts += 1;
            black_box(store.as_ref()).apply_update("api", "10.0.3.7", ts)
        })
    });

    group.finish();
}

fn bench_parallel_lookup<S: DelayStore + 'static>(
    group_name: &str,
    c: &mut Criterion,
    store: Arc<S>,
) {
    let mut group = c.benchmark_group(group_name);

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for t in 0..n {
                        let s = Arc::clone(&store);
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;

                        handles.push(thread::spawn(move || {
                            let identifier = format!("10.0.0.{t}");
                            bar.wait();
                            for i in 0..iters_per_thread {
                                // One writer in eight, like a busy control feed.
                                if t == 0 && i % 8 == 0 {
                                    s.apply_update("api", &identifier, i);
                                } else {
                                    black_box(s.lookup("api", &identifier));
                                }
                            }
                        }));
                    }

                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn bench_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("Eviction");

    group.bench_function("arena-batch-100", |b| {
        b.iter_batched(
            || {
                let store = ArenaDelayStore::new();
                populate(&store);
                store
            },
            |store| black_box(store.evict_expired(u64::MAX, 100)),
            criterion::BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let arena = Arc::new(ArenaDelayStore::new());
    populate(arena.as_ref());
    let local = Arc::new(LocalDelayStore::new());
    populate(local.as_ref());

    bench_single_store("Arena", c, Arc::clone(&arena));
    bench_parallel_lookup("Arena", c, arena);

    bench_single_store("Local", c, Arc::clone(&local));
    bench_parallel_lookup("Local", c, local);

    bench_eviction(c);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
