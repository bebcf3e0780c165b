use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use stagehand::{Arena, JobFlags, Scheduler, WorkerId};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn submit_and_wait(c: &mut Criterion) {
    let scheduler = Scheduler::builder().build().unwrap();
    let counter = Arc::new(AtomicU64::new(0));

    c.bench_function("submit 1000 jobs and wait", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..1000).map(|_| {
                let counter = counter.clone();
                let body = move |_: WorkerId| { counter.fetch_add(1, Ordering::Relaxed); };
                scheduler.submit(body, JobFlags::NONE).unwrap()
            }).collect();

            for handle in &handles {
                handle.wait().unwrap();
            }
        })
    });

    scheduler.shutdown().wait();
}

fn fan_in_pipeline(c: &mut Criterion) {
    let scheduler = Scheduler::builder().build().unwrap();

    c.bench_function("pipeline 64 -> 1 -> 64 -> 1", |b| {
        b.iter(|| {
            let work = |_: WorkerId| { black_box((0..100u64).sum::<u64>()); };

            scheduler.pipeline()
                .parallel((0..64).map(|_| work)).unwrap()
                .then(work).unwrap()
                .parallel((0..64).map(|_| work)).unwrap()
                .then(work).unwrap()
                .submit().unwrap()
                .wait().unwrap();
        })
    });

    scheduler.shutdown().wait();
}

fn arena_append(c: &mut Criterion) {
    c.bench_function("arena 4 threads x 10k appends", |b| {
        b.iter_batched(
            || Arena::<u64>::with_page_size(1024),
            |arena| {
                std::thread::scope(|s| {
                    for t in 0..4u64 {
                        let arena = &arena;
                        s.spawn(move || {
                            for i in 0..10_000 {
                                black_box(arena.emplace(t * 10_000 + i));
                            }
                        });
                    }
                });
                arena
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, submit_and_wait, fan_in_pipeline, arena_append);
criterion_main!(benches);
