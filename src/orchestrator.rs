//! Guardian — lifecycle orchestration over the event store, the four
//! monitors, the alert router, and the health/metrics aggregates.

use crate::alert::AlertRouter;
use crate::config::GuardianConfig;
use crate::error::{ErrorBudget, Result};
use crate::event::{EmitOptions, Event, EventFilter, EventKind, EventStore, Severity, SubscriptionId};
use crate::health::{HealthAggregator, OverallStatus};
use crate::metrics::{labels, MetricsRegistry};
use crate::monitor::event_loop::EventLoopMonitor;
use crate::monitor::memory::{MemoryMonitor, MemorySnapshot};
use crate::monitor::tasks::{TaskTracker, TrackedTaskSnapshot};
use crate::monitor::unawaited::UnawaitedTaskDetector;
use std::panic::catch_unwind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Runs one watchdog tick behind `catch_unwind`, counting the failure against
/// `budget`. Returns `false` once the budget trips, telling the caller to
/// stop scheduling further ticks for this monitor.
fn guarded_tick(name: &str, health: &HealthAggregator, budget: &ErrorBudget, now_ms: u64, tick: impl FnOnce() + std::panic::UnwindSafe) -> bool {
    if catch_unwind(tick).is_ok() {
        return true;
    }
    health.record_monitor_check(name, false, now_ms);
    if budget.record() {
        tracing::warn!(monitor = name, "monitor self-disabled after exceeding error budget");
        return false;
    }
    true
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn emit_self_disabled(store: &EventStore, monitor: &str) {
    let mut payload = std::collections::HashMap::new();
    payload.insert("monitor".to_string(), serde_json::json!(monitor));
    store.emit(
        EventKind::SystemInfo,
        payload,
        EmitOptions {
            severity: Some(Severity::Critical),
            source: Some("orchestrator".to_string()),
            suggestion: Some(format!("the '{monitor}' monitor exceeded its error budget and disabled itself; restart the guardian to resume it")),
            ..Default::default()
        },
    );
}

/// Waits for the process shutdown signal: SIGINT or SIGTERM on Unix, ctrl-c
/// elsewhere. Logs and returns on a failed install rather than panicking, so
/// a host without permission to install signal handlers still runs.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => return tracing::warn!(error = %err, "failed to install SIGINT handler"),
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => return tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install signal handler");
        }
    }
}

/// Process-wide current instance. `Guardian::create` replaces rather than
/// rejects a prior instance, stopping it first.
static CURRENT: OnceLock<Mutex<Option<Arc<Guardian>>>> = OnceLock::new();

fn registry() -> &'static Mutex<Option<Arc<Guardian>>> {
    CURRENT.get_or_init(|| Mutex::new(None))
}

/// The runtime health monitor: owns the event store, the enabled monitors,
/// and the alert router, and drives their periodic ticks.
pub struct Guardian {
    config: GuardianConfig,
    store: Arc<EventStore>,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthAggregator>,
    event_loop: Option<Arc<EventLoopMonitor>>,
    memory: Option<Arc<MemoryMonitor>>,
    tasks: Option<Arc<TaskTracker>>,
    unawaited: Option<Arc<UnawaitedTaskDetector>>,
    alert_router: Mutex<Option<Arc<AlertRouter>>>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Guardian {
    /// Validate `config` and build every enabled monitor. Construction is
    /// all-or-nothing: an invalid config produces no partially-initialized
    /// guardian.
    pub fn new(config: GuardianConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(EventStore::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let health = Arc::new(HealthAggregator::new());

        let event_loop = config
            .event_loop
            .enabled
            .then(|| Arc::new(EventLoopMonitor::new(config.event_loop.clone(), store.clone(), health.clone())));
        let memory = config
            .memory
            .enabled
            .then(|| Arc::new(MemoryMonitor::new(config.memory.clone(), store.clone(), health.clone())));
        let tasks = config
            .promises
            .enabled
            .then(|| Arc::new(TaskTracker::new(config.promises.clone(), store.clone(), health.clone())));
        let unawaited = config
            .unawaited_promises
            .enabled
            .then(|| Arc::new(UnawaitedTaskDetector::new(config.unawaited_promises.clone(), store.clone(), health.clone())));

        let guardian = Arc::new(Self {
            config,
            store,
            metrics,
            health,
            event_loop,
            memory,
            tasks,
            unawaited,
            alert_router: Mutex::new(None),
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        });

        guardian.wire_metrics();
        Ok(guardian)
    }

    /// Replace the process-singleton guardian, stopping any previous one
    /// first. Returns the new instance.
    pub fn create(config: GuardianConfig) -> Result<Arc<Self>> {
        let guardian = Self::new(config)?;
        let mut guard = registry().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.take() {
            previous.stop();
        }
        *guard = Some(guardian.clone());
        Ok(guardian)
    }

    /// The current process-singleton guardian, if one has been created.
    pub fn current() -> Option<Arc<Self>> {
        registry().lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the current process-singleton guardian, creating one from
    /// `config` via `create` if none exists yet. A convenience constructor;
    /// nothing internal to the crate depends on the registry it reads.
    pub fn get_or_create(config: GuardianConfig) -> Result<Arc<Self>> {
        if let Some(existing) = Self::current() {
            return Ok(existing);
        }
        Self::create(config)
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn event_loop(&self) -> Option<&Arc<EventLoopMonitor>> {
        self.event_loop.as_ref()
    }

    pub fn memory(&self) -> Option<&Arc<MemoryMonitor>> {
        self.memory.as_ref()
    }

    pub fn tasks(&self) -> Option<&Arc<TaskTracker>> {
        self.tasks.as_ref()
    }

    pub fn unawaited(&self) -> Option<&Arc<UnawaitedTaskDetector>> {
        self.unawaited.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wire an alert router into this guardian's event store. Installs a
    /// background subscriber; call once per router.
    pub fn install_alert_router(&self, router: Arc<AlertRouter>) {
        router.install(&self.store);
        *self.alert_router.lock().unwrap_or_else(|e| e.into_inner()) = Some(router);
    }

    /// The installed alert router, if `install_alert_router` has been called.
    pub fn alert_router(&self) -> Option<Arc<AlertRouter>> {
        self.alert_router.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The overall health status, factoring in the most recent memory
    /// snapshot's heap use when the memory monitor is enabled.
    pub fn status(&self) -> OverallStatus {
        let heap_used = self.memory.as_ref().and_then(|m| m.snapshots().last().cloned()).map(|s| s.heap_used).unwrap_or(0);
        self.health.overall_status(heap_used)
    }

    /// Query retained events, passthrough to the event store.
    pub fn events(&self, filter: &EventFilter) -> Vec<Event> {
        self.store.events(filter)
    }

    /// Snapshot of every task currently tracked by the task tracker, or
    /// empty if the task tracker is disabled.
    pub fn pending_tasks(&self) -> Vec<TrackedTaskSnapshot> {
        self.tasks.as_ref().map(|t| t.snapshot()).unwrap_or_default()
    }

    /// Retained memory snapshots, or an empty vec if the memory monitor is
    /// disabled.
    pub fn memory_snapshots(&self) -> Vec<MemorySnapshot> {
        self.memory.as_ref().map(|m| m.snapshots()).unwrap_or_default()
    }

    /// Passthrough to the memory monitor's `force_gc`. Always `false` when
    /// the memory monitor is disabled or the runtime exposes no GC hook.
    pub fn force_gc(&self) -> bool {
        self.memory.as_ref().map(|m| m.force_gc()).unwrap_or(false)
    }

    /// Subscribe to events of a given kind, or every kind (`None`).
    /// Passthrough to the event store.
    pub fn on(&self, kind: Option<EventKind>, handler: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.store.subscribe(kind, handler)
    }

    /// Remove a subscription previously returned by `on`.
    pub fn off(&self, id: SubscriptionId) {
        self.store.unsubscribe(id);
    }

    /// Prometheus-compatible metrics export, passthrough to the metrics
    /// registry.
    pub fn metrics_text(&self) -> String {
        self.metrics.to_text()
    }

    /// Prometheus-compatible health export, passthrough to the health
    /// aggregator.
    pub fn health_text(&self) -> String {
        self.health.to_text(&self.store.stats())
    }

    /// Start every enabled monitor's periodic loop. Idempotent: a second
    /// call on an already-running guardian is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(event_loop) = &self.event_loop {
            event_loop.start();
        }

        if let Some(memory) = self.memory.clone() {
            let interval = Duration::from_millis(self.config.memory.check_interval_ms);
            let health = self.health.clone();
            let store = self.store.clone();
            handles.push(tokio::spawn(async move {
                let budget = ErrorBudget::with_defaults();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let memory = memory.clone();
                    if !guarded_tick("memory", &health, &budget, now_ms(), move || memory.tick()) {
                        emit_self_disabled(&store, "memory");
                        break;
                    }
                }
            }));
        }

        if let Some(tasks) = self.tasks.clone() {
            let interval = Duration::from_millis(self.config.promises.check_interval_ms);
            let health = self.health.clone();
            let store = self.store.clone();
            handles.push(tokio::spawn(async move {
                let budget = ErrorBudget::with_defaults();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let tasks = tasks.clone();
                    if !guarded_tick("tasks", &health, &budget, now_ms(), move || {
                        tasks.watchdog_tick();
                    }) {
                        emit_self_disabled(&store, "tasks");
                        break;
                    }
                }
            }));
        }

        if let Some(unawaited) = self.unawaited.clone() {
            let interval = Duration::from_millis(self.config.unawaited_promises.check_interval_ms);
            let health = self.health.clone();
            let store = self.store.clone();
            handles.push(tokio::spawn(async move {
                let budget = ErrorBudget::with_defaults();
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let unawaited = unawaited.clone();
                    if !guarded_tick("unawaited_promises", &health, &budget, now_ms(), move || {
                        unawaited.watchdog_tick();
                    }) {
                        emit_self_disabled(&store, "unawaited_promises");
                        break;
                    }
                }
            }));
        }

        let store = self.store.clone();
        handles.push(tokio::spawn(async move {
            shutdown_signal().await;
            store.emit(
                EventKind::SystemInfo,
                Default::default(),
                EmitOptions { severity: Some(Severity::Info), suggestion: Some("shutdown signal received".to_string()), ..Default::default() },
            );
        }));
    }

    /// Stop every running monitor loop. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(event_loop) = &self.event_loop {
            event_loop.stop();
        }
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    /// Translate a caught panic into a `SystemInfo` event, mirroring how an
    /// uncaught-exception or unhandled-rejection hook would surface it.
    pub fn report_panic(&self, message: &str) {
        let mut payload = std::collections::HashMap::new();
        payload.insert("message".to_string(), serde_json::json!(message));
        self.store.emit(
            EventKind::SystemInfo,
            payload,
            EmitOptions {
                severity: Some(Severity::Critical),
                suggestion: Some("an uncaught panic was observed; the process may be in an inconsistent state".to_string()),
                source: Some("orchestrator".to_string()),
                ..Default::default()
            },
        );
    }

    /// Install a process-wide panic hook that reports through this guardian
    /// before delegating to the previously-installed hook.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let guardian = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            guardian.report_panic(&info.to_string());
            previous(info);
        }));
    }

    fn wire_metrics(self: &Arc<Self>) {
        let metrics = self.metrics.clone();
        metrics.set_help("guardian_events_total", "events observed, by kind and severity");
        self.store.subscribe(None, move |event| {
            let label_set = labels(&[("kind", event.kind.as_str()), ("severity", &format!("{:?}", event.severity).to_lowercase())]);
            metrics.inc_counter("guardian_events_total", &label_set, 1.0);
        });
    }
}
