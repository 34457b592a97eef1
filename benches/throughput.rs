use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stacktrack::{SkipList, StThread};

fn custom_criterion() -> Criterion {
    Criterion::default()
        .sample_size(10)
        .measurement_time(Duration::from_secs(1))
        .warm_up_time(Duration::from_secs(1))
}

fn prefill(list: &SkipList, st: &StThread, rng: &mut SmallRng, n: i32) {
    for key in 1..=n {
        list.insert_pure(st, rng, key);
    }
}

fn single_thread_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("SkipList single-thread");
    let st = StThread::register(50, 100);
    let mut rng = SmallRng::seed_from_u64(42);

    let list = SkipList::new();
    prefill(&list, st, &mut rng, 512);

    group.bench_function("contains_pure", |b| {
        let mut key = 0;
        b.iter(|| {
            key = key % 512 + 1;
            list.contains_pure(key)
        });
    });

    group.bench_function("contains_hp", |b| {
        let mut key = 0;
        b.iter(|| {
            key = key % 512 + 1;
            list.contains_hp(st, key)
        });
    });

    group.bench_function("contains_stacktrack", |b| {
        let mut key = 0;
        b.iter(|| {
            key = key % 512 + 1;
            list.contains_stacktrack(st, key)
        });
    });

    // Remove-then-insert keeps the set population stable across iterations.
    group.bench_function("update_pair_hp", |b| {
        let mut key = 0;
        b.iter(|| {
            key = key % 512 + 1;
            list.remove_hp(st, key);
            list.insert_hp(st, &mut rng, key)
        });
    });

    group.finish();
}

fn two_thread_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("SkipList two threads");

    // The registry is append-only for the process lifetime, so the worker
    // records are registered once and reused across iterations.
    let workers: Vec<&'static StThread> =
        (0..2).map(|_| StThread::register(50, 32)).collect();

    group.bench_function("hp_disjoint_update_pairs", |b| {
        b.iter(|| {
            let list = Arc::new(SkipList::new());

            let mut handles = Vec::new();
            for (t, &st) in workers.iter().enumerate() {
                let list = Arc::clone(&list);
                handles.push(thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    let base = 1 + t as i32 * 1000;
                    for key in base..base + 64 {
                        list.insert_hp(st, &mut rng, key);
                        list.remove_hp(st, key);
                    }
                }));
            }
            for h in handles {
                h.join().expect("bench worker panicked");
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = custom_criterion();
    targets = single_thread_ops, two_thread_updates
}
criterion_main!(benches);
