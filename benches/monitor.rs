//! Performance benchmarks for loop-guardian
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use loop_guardian::{EmitOptions, Event, EventKind, EventStore, GuardianConfig, Mode, MetricsRegistry};
use std::sync::Arc;

fn bench_event_emit(c: &mut Criterion) {
    let store = EventStore::default();
    c.bench_function("EventStore::emit", |b| {
        b.iter(|| store.emit(EventKind::SystemInfo, Default::default(), EmitOptions::default()));
    });
}

fn bench_event_emit_with_subscribers(c: &mut Criterion) {
    let store = EventStore::default();
    for _ in 0..10 {
        store.subscribe(None, |_e: &Event| {});
    }
    c.bench_function("EventStore::emit (10 subscribers)", |b| {
        b.iter(|| store.emit(EventKind::EventLoopStall, Default::default(), EmitOptions::default()));
    });
}

fn bench_event_serialization(c: &mut Criterion) {
    let store = EventStore::default();
    let event = store.emit(EventKind::MemoryLeak, Default::default(), EmitOptions::default());

    c.bench_function("Event serialize", |b| {
        b.iter(|| serde_json::to_vec(&event).unwrap());
    });

    let bytes = serde_json::to_vec(&event).unwrap();
    c.bench_function("Event deserialize", |b| {
        b.iter(|| serde_json::from_slice::<Event>(&bytes).unwrap());
    });
}

fn bench_metrics_registry(c: &mut Criterion) {
    let registry = MetricsRegistry::new();
    let labels = loop_guardian::labels(&[("bench", "1")]);

    c.bench_function("MetricsRegistry::inc_counter", |b| {
        b.iter(|| registry.inc_counter("bench_counter", &labels, 1.0));
    });

    for i in 0..1000 {
        registry.record_histogram("bench_histogram", &labels, (i % 500) as f64);
    }
    c.bench_function("MetricsRegistry::to_text", |b| {
        b.iter(|| registry.to_text());
    });
}

fn bench_guardian_construction(c: &mut Criterion) {
    c.bench_function("Guardian::new (development preset)", |b| {
        b.iter(|| loop_guardian::Guardian::new(GuardianConfig::for_mode(Mode::Development)).unwrap());
    });
}

fn bench_event_ring_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{count} events"), |b| {
            b.iter(|| {
                let store = Arc::new(EventStore::default());
                for _ in 0..count {
                    store.emit(EventKind::SystemInfo, Default::default(), EmitOptions::default());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_event_emit,
    bench_event_emit_with_subscribers,
    bench_event_serialization,
    bench_metrics_registry,
    bench_guardian_construction,
    bench_event_ring_throughput,
);
criterion_main!(benches);
