//! Dispatch benchmarks using criterion for historical comparison.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rgb_dispatch::{
    Blittable, Callback, DispatcherConfig, EntityHandle, Job, JobDispatcher, SendMode,
    SendOverlay, TypedDispatcher,
};

#[derive(Blittable, Clone, Copy)]
struct Damage {
    amount: f32,
}

#[derive(Blittable, Clone, Copy, Default)]
struct Health {
    current: f32,
}

impl Job<Damage> for Health {
    fn execute(&mut self, event: &Damage) {
        self.current -= event.amount;
    }
}

fn typed_process_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("typed_process");

    for count in [10_u64, 100, 1000] {
        group.throughput(Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::new("one_event_each", count), &count, |b, &count| {
            let dispatcher = TypedDispatcher::<Damage>::new().unwrap();
            let entities: Vec<_> = (0..count).map(|_| EntityHandle::create()).collect();
            let on_damage = Callback::new(|damage: &Damage| {
                black_box(damage.amount);
            });
            for &entity in &entities {
                dispatcher.subscribe(entity, &on_damage).unwrap();
            }

            b.iter(|| {
                for &entity in &entities {
                    dispatcher.queue(entity, Damage { amount: 1.0 });
                }
                black_box(dispatcher.process());
            });
        });

        group.bench_with_input(BenchmarkId::new("batch_size_8", count), &count, |b, &count| {
            let config = DispatcherConfig::new().with_batch_size(8);
            let dispatcher = TypedDispatcher::<Damage>::with_config(config).unwrap();
            let entities: Vec<_> = (0..count).map(|_| EntityHandle::create()).collect();
            let on_damage = Callback::new(|damage: &Damage| {
                black_box(damage.amount);
            });
            for &entity in &entities {
                dispatcher.subscribe(entity, &on_damage).unwrap();
            }

            b.iter(|| {
                for &entity in &entities {
                    dispatcher.queue(entity, Damage { amount: 1.0 });
                }
                black_box(dispatcher.process());
            });
        });
    }

    group.finish();
}

fn job_process_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_process");

    for count in [10_u64, 100, 1000] {
        group.throughput(Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::new("health", count), &count, |b, &count| {
            let dispatcher = JobDispatcher::<Health, Damage>::new().unwrap();
            let entities: Vec<_> = (0..count).map(|_| EntityHandle::create()).collect();
            let on_complete = Callback::new(|health: &Health| {
                black_box(health.current);
            });
            for &entity in &entities {
                dispatcher
                    .subscribe(entity, Health { current: 100.0 }, &on_complete)
                    .unwrap();
            }

            b.iter(|| {
                for &entity in &entities {
                    dispatcher.queue(entity, Damage { amount: 0.5 });
                }
                black_box(dispatcher.process());
            });
        });
    }

    group.finish();
}

fn overlay_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("overlay");

    for listeners in [1_u64, 10, 100] {
        group.throughput(Throughput::Elements(listeners));

        group.bench_with_input(
            BenchmarkId::new("immediate", listeners),
            &listeners,
            |b, &listeners| {
                let overlay = SendOverlay::new();
                let callbacks: Vec<_> = (0..listeners)
                    .map(|_| {
                        Callback::new(|damage: &Damage| {
                            black_box(damage.amount);
                        })
                    })
                    .collect();
                for callback in &callbacks {
                    overlay.subscribe(callback).unwrap();
                }

                b.iter(|| black_box(overlay.send(Damage { amount: 1.0 }, SendMode::Immediate)));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("deferred_flush", listeners),
            &listeners,
            |b, &listeners| {
                let overlay = SendOverlay::new();
                let callbacks: Vec<_> = (0..listeners)
                    .map(|_| {
                        Callback::new(|damage: &Damage| {
                            black_box(damage.amount);
                        })
                    })
                    .collect();
                for callback in &callbacks {
                    overlay.subscribe(callback).unwrap();
                }

                b.iter(|| {
                    overlay.send(Damage { amount: 1.0 }, SendMode::Deferred);
                    black_box(overlay.flush_deferred())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    typed_process_benchmarks,
    job_process_benchmarks,
    overlay_benchmarks
);
criterion_main!(benches);
