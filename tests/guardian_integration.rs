//! End-to-end scenarios exercising the full guardian lifecycle: stall
//! detection, leak detection, deadlock detection, self-filtering, alert
//! dedup/rate limiting, and metrics export.

use async_trait::async_trait;
use loop_guardian::{
    AlertRoute, AlertRouter, AlertSink, CallSite, Event, EventFilter, EventKind, EventStore, GuardianConfig,
    HealthAggregator, MemoryConfig, MemoryMonitor, MemorySnapshot, MemorySource, Mode, PromisesConfig, Severity,
    TaskTracker, UnawaitedPromisesConfig, UnawaitedTaskDetector,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

fn store_with(events: &EventStore) -> Vec<Event> {
    events.events(&EventFilter::default())
}

#[tokio::test(start_paused = true)]
async fn event_loop_monitor_flags_sustained_stall() {
    let store = Arc::new(EventStore::default());
    let health = Arc::new(HealthAggregator::new());
    let cfg = GuardianConfig::for_mode(Mode::Development).event_loop;
    let monitor = Arc::new(loop_guardian::EventLoopMonitor::new(cfg, store.clone(), health));

    for _ in 0..20 {
        monitor.source().record_ms(400.0);
    }
    monitor.tick();

    let events = store_with(&store);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::EventLoopStall);
    assert_eq!(monitor.stall_count(), 1);
}

struct GrowingMemorySource {
    next_heap: AtomicU64,
}

impl MemorySource for GrowingMemorySource {
    fn snapshot(&self) -> MemorySnapshot {
        let heap = self.next_heap.fetch_add(20 * 1024 * 1024, Ordering::SeqCst);
        MemorySnapshot { heap_used: heap, heap_total: heap, external: 0, rss: heap, timestamp_ms: heap }
    }
}

#[test]
fn memory_monitor_flags_leak_on_sustained_growth() {
    let store = Arc::new(EventStore::default());
    let health = Arc::new(HealthAggregator::new());
    let cfg = MemoryConfig { enabled: true, check_interval_ms: 1000, leak_threshold_mb: 5, max_snapshots: 20, consecutive_growth: 3 };
    let source = Arc::new(GrowingMemorySource { next_heap: AtomicU64::new(10 * 1024 * 1024) });
    let monitor = MemoryMonitor::with_source(cfg, source, store.clone(), health);

    for _ in 0..5 {
        monitor.tick();
    }

    let events = store_with(&store);
    assert!(events.iter().any(|e| e.kind == EventKind::MemoryLeak));
}

#[tokio::test(start_paused = true)]
async fn task_tracker_flags_circular_wait_and_self_filters() {
    let store = Arc::new(EventStore::default());
    let health = Arc::new(HealthAggregator::new());
    let cfg = PromisesConfig { enabled: true, check_interval_ms: 1000, deadlock_threshold_ms: 500, max_tracked: 100 };
    let tracker = Arc::new(TaskTracker::new(cfg, store.clone(), health));

    // Internal call sites are invisible to the tracker.
    let internal = tracker.init_task(Some(CallSite { file: "src/monitor/tasks.rs".to_string(), line: 1 }), None, vec![]);
    assert!(internal.is_none());

    // x waits on y; once y is also made to wait on x, the pair is circular.
    let x = tracker
        .init_task(Some(CallSite { file: "app/x.rs".to_string(), line: 1 }), None, vec!["app/x.rs:1".to_string()])
        .unwrap();
    let y = tracker
        .init_task(Some(CallSite { file: "app/y.rs".to_string(), line: 1 }), Some(x), vec!["app/y.rs:1".to_string()])
        .unwrap();
    tracker.set_trigger(x, Some(y));

    tokio::time::advance(Duration::from_millis(600)).await;
    let reports = tracker.watchdog_tick();
    assert!(reports.iter().any(|r| r.task_id == x || r.task_id == y));
    assert!(reports.iter().any(|r| r.is_circular));
}

#[tokio::test(start_paused = true)]
async fn unawaited_task_detector_warns_once_and_honors_self_filter() {
    let store = Arc::new(EventStore::default());
    let health = Arc::new(HealthAggregator::new());
    let cfg = UnawaitedPromisesConfig { enabled: true, check_interval_ms: 1000, warning_threshold_ms: 500 };
    let detector = UnawaitedTaskDetector::new(cfg, store.clone(), health);

    assert!(detector.track(Some(CallSite { file: "src/monitor/unawaited.rs".to_string(), line: 1 }), vec![]).is_none());
    detector.track(Some(CallSite { file: "app/fire_and_forget.rs".to_string(), line: 3 }), vec!["app/fire_and_forget.rs:3".to_string()]);

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(detector.watchdog_tick(), 1);
    assert_eq!(detector.watchdog_tick(), 0);

    let events = store_with(&store);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::UnawaitedTask);
    assert_eq!(events[0].severity, Severity::Warning);
}

struct RecordingSink {
    calls: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, event: &Event) -> loop_guardian::Result<()> {
        self.calls.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn alert_router_dedupes_and_rate_limits_across_a_burst() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = AlertRouter::new();
    router.add_route(
        AlertRoute::new("ops", Arc::new(RecordingSink { calls: calls.clone() }))
            .min_severity(Severity::Error)
            .dedupe_window(Duration::from_secs(60))
            .rate_limit_per_minute(3),
    );

    let store = EventStore::default();
    for _ in 0..10 {
        let event = store.emit(
            EventKind::EventLoopStall,
            Default::default(),
            loop_guardian::EmitOptions { severity: Some(Severity::Error), file: Some("app/worker.rs".to_string()), line: Some(42), ..Default::default() },
        );
        router.dispatch(&event).await;
    }

    // All 10 events share a dedupe key (same kind + file + line), so only
    // the first gets through before the window reopens.
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn alert_router_does_not_collapse_distinct_call_sites() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = AlertRouter::new();
    router.add_route(
        AlertRoute::new("ops", Arc::new(RecordingSink { calls: calls.clone() }))
            .min_severity(Severity::Error)
            .dedupe_window(Duration::from_secs(60))
            .rate_limit_per_minute(10),
    );

    let store = EventStore::default();
    // Same kind and source, but two distinct call sites: neither should
    // suppress the other, since the dedupe key includes file:line.
    let a = store.emit(
        EventKind::TaskDeadlock,
        Default::default(),
        loop_guardian::EmitOptions { severity: Some(Severity::Error), source: Some("tasks".to_string()), file: Some("app/a.rs".to_string()), line: Some(1), ..Default::default() },
    );
    let b = store.emit(
        EventKind::TaskDeadlock,
        Default::default(),
        loop_guardian::EmitOptions { severity: Some(Severity::Error), source: Some("tasks".to_string()), file: Some("app/b.rs".to_string()), line: Some(2), ..Default::default() },
    );
    router.dispatch(&a).await;
    router.dispatch(&b).await;

    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn alert_router_honors_the_per_hour_rate_limit() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = AlertRouter::new();
    router.add_route(
        AlertRoute::new("ops", Arc::new(RecordingSink { calls: calls.clone() }))
            .min_severity(Severity::Error)
            .dedupe_window(Duration::from_millis(1))
            .rate_limit_per_minute(1000)
            .rate_limit_per_hour(2),
    );

    let store = EventStore::default();
    for i in 0u32..5 {
        // Space sends far enough apart to clear the per-minute window and
        // the dedupe window, so only the per-hour cap can suppress them.
        tokio::time::advance(Duration::from_secs(70)).await;
        let event = store.emit(
            EventKind::EventLoopStall,
            Default::default(),
            loop_guardian::EmitOptions { severity: Some(Severity::Error), file: Some("app/worker.rs".to_string()), line: Some(i), ..Default::default() },
        );
        router.dispatch(&event).await;
    }

    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn metrics_export_reflects_emitted_events() {
    let cfg = GuardianConfig::for_mode(Mode::Production);
    let guardian = loop_guardian::Guardian::new(cfg).unwrap();
    guardian.store().emit(EventKind::EventLoopStall, Default::default(), loop_guardian::EmitOptions::default());
    guardian.store().emit(EventKind::EventLoopStall, Default::default(), loop_guardian::EmitOptions::default());

    let text = guardian.metrics().to_text();
    assert!(text.contains("guardian_events_total"));
    assert!(text.contains("kind=\"event_loop_stall\""));

    let label_set = loop_guardian::labels(&[("kind", "event_loop_stall"), ("severity", "error")]);
    assert_eq!(guardian.metrics().counter("guardian_events_total", &label_set), 2.0);
}

#[tokio::test]
async fn health_text_export_reflects_monitor_checks() {
    let health = HealthAggregator::new();
    health.record_monitor_check("memory", true, 10);
    let text = health.to_text(&loop_guardian::EventStats::default());
    assert!(text.contains("guardian_uptime_ms"));
}
