use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pmc_controller::catalog::{CounterBudget, EventId};
use pmc_controller::controller::same_events;
use pmc_controller::selection::SelectionEngine;

const POOL_SIZE: usize = 4096;

fn pool() -> Vec<EventId> {
    (0..POOL_SIZE)
        .map(|i| format!("EVENT_{}:UMASK_{}", i / 8, i % 8))
        .collect()
}

fn engine() -> SelectionEngine {
    let budget = CounterBudget {
        fixed_slots: 3,
        general_slots: 8,
    };
    let fixed = vec![
        "INST_RETIRED:ANY_P".to_string(),
        "CPU_CLK_UNHALTED:THREAD_P".to_string(),
        "CPU_CLK_UNHALTED:REF_P".to_string(),
    ];
    SelectionEngine::with_pool(budget, fixed, pool())
}

fn bench_resolve(c: &mut Criterion) {
    let explicit: Vec<Option<EventId>> = vec![
        Some("MEM_LOAD_RETIRED:L3_MISS".to_string()),
        Some("DTLB_LOAD_MISSES:STLB_HIT".to_string()),
        None,
    ];
    let empty: Vec<Option<EventId>> = Vec::new();

    c.bench_function("resolve/explicit_and_open", |b| {
        b.iter_batched(
            engine,
            |mut engine| black_box(engine.resolve(black_box(&explicit))),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("resolve/fill_from_pool", |b| {
        b.iter_batched(
            engine,
            |mut engine| black_box(engine.resolve(black_box(&empty))),
            BatchSize::SmallInput,
        )
    });
}

fn bench_same_events(c: &mut Criterion) {
    let a: Vec<EventId> = pool().into_iter().take(11).collect();
    let mut b_events = a.clone();
    b_events.reverse();

    c.bench_function("controller/same_events_11", |b| {
        b.iter(|| same_events(black_box(&a), black_box(&b_events)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_resolve(c);
    bench_same_events(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
