//! Task Tracker — a cyclic-wait graph over in-flight tasks, arena-indexed,
//! used to flag deadlocked tasks that have been pending past a threshold.

use super::{clean_stack, is_self_path, CallSite};
use crate::config::PromisesConfig;
use crate::event::{EmitOptions, EventKind, EventStore, Severity};
use crate::health::HealthAggregator;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Observed,
    ReportedStuck,
}

struct TrackedTask {
    origin: Option<CallSite>,
    trigger: Option<TaskId>,
    status: TaskStatus,
    created_at: Instant,
    raw_stack: Vec<String>,
}

enum Slot {
    Occupied(TrackedTask),
    Vacant,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Inner {
    fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied(_))).count()
    }

    fn insert(&mut self, task: TrackedTask) -> TaskId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Slot::Occupied(task);
            idx
        } else {
            self.slots.push(Slot::Occupied(task));
            self.slots.len() - 1
        }
    }

    fn evict_oldest_non_pending(&mut self, cap: usize) {
        if self.occupied_count() < cap {
            return;
        }
        let mut candidates: Vec<(TaskId, Instant)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Slot::Occupied(t) if t.status != TaskStatus::Pending => Some((id, t.created_at)),
                _ => None,
            })
            .collect();
        candidates.sort_by_key(|(_, created_at)| *created_at);
        let evict_count = ((cap as f64) * 0.2).ceil() as usize;
        for (id, _) in candidates.into_iter().take(evict_count.max(1)) {
            self.slots[id] = Slot::Vacant;
            self.free.push(id);
        }
    }
}

/// A point-in-time view of one tracked task, as returned by
/// `TaskTracker::snapshot()`.
#[derive(Debug, Clone)]
pub struct TrackedTaskSnapshot {
    pub task_id: TaskId,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub status: TaskStatus,
    pub trigger: Option<TaskId>,
    pub age_ms: u64,
}

/// Result of a single watchdog pass over pending tasks.
#[derive(Debug, Clone)]
pub struct DeadlockReport {
    pub task_id: TaskId,
    pub age_ms: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub is_circular: bool,
    pub related_count: usize,
    pub stack: Vec<String>,
}

/// Tracks in-flight tasks in an arena and detects circular waits.
pub struct TaskTracker {
    config: PromisesConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    inner: Mutex<Inner>,
}

impl TaskTracker {
    pub fn new(config: PromisesConfig, store: Arc<EventStore>, health: Arc<HealthAggregator>) -> Self {
        Self {
            config,
            store,
            health,
            inner: Mutex::new(Inner { slots: Vec::new(), free: Vec::new() }),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).occupied_count()
    }

    /// Snapshot every currently tracked task: id, origin, status, the task
    /// it's waiting on, and its current age.
    pub fn snapshot(&self) -> Vec<TrackedTaskSnapshot> {
        let now = Instant::now();
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Slot::Occupied(t) => Some(TrackedTaskSnapshot {
                    task_id: id,
                    file: t.origin.as_ref().map(|o| o.file.clone()),
                    line: t.origin.as_ref().map(|o| o.line),
                    status: t.status,
                    trigger: t.trigger,
                    age_ms: now.duration_since(t.created_at).as_millis() as u64,
                }),
                Slot::Vacant => None,
            })
            .collect()
    }

    /// Register a new task. Returns `None` (and tracks nothing) if `origin`
    /// names a location inside this crate's own implementation.
    pub fn init_task(&self, origin: Option<CallSite>, trigger: Option<TaskId>, raw_stack: Vec<String>) -> Option<TaskId> {
        if let Some(o) = &origin {
            if is_self_path(&o.file) {
                return None;
            }
        }
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.evict_oldest_non_pending(self.config.max_tracked);
        let task = TrackedTask { origin, trigger, status: TaskStatus::Pending, created_at: Instant::now(), raw_stack };
        Some(guard.insert(task))
    }

    pub fn mark_observed(&self, id: TaskId) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(Slot::Occupied(task)) = guard.slots.get_mut(id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Observed;
            }
        }
    }

    /// Record that `id` is now (also) waiting on `trigger`, updating the
    /// causal edge used by deadlock classification. A task's wait target is
    /// often only discovered after it starts running, not at creation.
    pub fn set_trigger(&self, id: TaskId, trigger: Option<TaskId>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(Slot::Occupied(task)) = guard.slots.get_mut(id) {
            task.trigger = trigger;
        }
    }

    /// Mark a completed task observed, then schedule its slot's removal 60s
    /// out so a just-finished task doesn't briefly read as orphaned.
    pub fn destroy_task(self: &Arc<Self>, id: TaskId) {
        self.mark_observed(id);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut guard = this.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(Slot::Occupied(task)) = guard.slots.get(id) {
                if task.status != TaskStatus::Pending {
                    guard.slots[id] = Slot::Vacant;
                    guard.free.push(id);
                }
            }
        });
    }

    /// Scan for tasks pending past the deadlock threshold, classify each as
    /// circular or not, emit a `TaskDeadlock` event per stuck task, and mark
    /// it `ReportedStuck` so it isn't re-reported on the next pass.
    pub fn watchdog_tick(&self) -> Vec<DeadlockReport> {
        let now = Instant::now();
        self.health.record_monitor_check("tasks", true, now_ms());

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut children: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (id, slot) in guard.slots.iter().enumerate() {
            if let Slot::Occupied(t) = slot {
                if let Some(parent) = t.trigger {
                    children.entry(parent).or_default().push(id);
                }
            }
        }

        let threshold = Duration::from_millis(self.config.deadlock_threshold_ms);
        let candidates: Vec<TaskId> = guard
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Slot::Occupied(t) if t.status == TaskStatus::Pending && now.duration_since(t.created_at) >= threshold => Some(id),
                _ => None,
            })
            .collect();

        let mut reports = Vec::new();
        for id in candidates {
            let (is_circular, related_count) = classify(id, &children, &guard.slots);
            let (age_ms, file, line, stack) = match &guard.slots[id] {
                Slot::Occupied(t) => (
                    now.duration_since(t.created_at).as_millis() as u64,
                    t.origin.as_ref().map(|o| o.file.clone()),
                    t.origin.as_ref().map(|o| o.line),
                    clean_stack(&t.raw_stack),
                ),
                Slot::Vacant => continue,
            };
            if let Slot::Occupied(t) = &mut guard.slots[id] {
                t.status = TaskStatus::ReportedStuck;
            }
            reports.push(DeadlockReport { task_id: id, age_ms, file, line, is_circular, related_count, stack });
        }
        drop(guard);

        for report in &reports {
            self.emit_deadlock(report);
        }
        reports
    }

    fn emit_deadlock(&self, report: &DeadlockReport) {
        let mut payload = std::collections::HashMap::new();
        payload.insert("ageMs".to_string(), serde_json::json!(report.age_ms));
        payload.insert("isCircular".to_string(), serde_json::json!(report.is_circular));
        payload.insert("relatedCount".to_string(), serde_json::json!(report.related_count));

        self.store.emit(
            EventKind::TaskDeadlock,
            payload,
            EmitOptions {
                severity: Some(Severity::Critical),
                file: report.file.clone(),
                line: report.line,
                stack: if report.stack.is_empty() { None } else { Some(report.stack.join("\n")) },
                suggestion: Some(if report.is_circular {
                    "a circular wait was detected between pending tasks; check for mutual awaits".to_string()
                } else {
                    "a task has been pending past the deadlock threshold; verify it is not waiting on a resource that will never resolve".to_string()
                }),
                source: Some("tasks".to_string()),
                ..Default::default()
            },
        );
    }
}

/// Transitive descendants of `id` (tasks triggered by it, directly or
/// indirectly), depth-capped at 10, and whether any of them can walk its
/// own trigger back-edges to reach `id` again through only pending tasks.
fn classify(id: TaskId, children: &HashMap<TaskId, Vec<TaskId>>, slots: &[Slot]) -> (bool, usize) {
    let mut descendants = HashSet::new();
    let mut frontier = vec![id];
    for _ in 0..10 {
        let mut next = Vec::new();
        for node in &frontier {
            if let Some(kids) = children.get(node) {
                for &k in kids {
                    if descendants.insert(k) {
                        next.push(k);
                    }
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    let mut is_circular = false;
    for &d in &descendants {
        if walks_back_to(d, id, slots) {
            is_circular = true;
            break;
        }
    }

    (is_circular, descendants.len())
}

fn walks_back_to(start: TaskId, target: TaskId, slots: &[Slot]) -> bool {
    let mut current = start;
    for _ in 0..10 {
        let task = match slots.get(current) {
            Some(Slot::Occupied(t)) => t,
            _ => return false,
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        match task.trigger {
            Some(parent) if parent == target => return true,
            Some(parent) => current = parent,
            None => return false,
        }
    }
    false
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PromisesConfig {
        PromisesConfig { enabled: true, check_interval_ms: 1000, deadlock_threshold_ms: 1000, max_tracked: 100 }
    }

    fn tracker() -> Arc<TaskTracker> {
        Arc::new(TaskTracker::new(config(), Arc::new(EventStore::default()), Arc::new(HealthAggregator::new())))
    }

    #[test]
    fn self_origin_is_not_tracked() {
        let t = tracker();
        let id = t.init_task(Some(CallSite { file: "src/monitor/tasks.rs".to_string(), line: 1 }), None, vec![]);
        assert!(id.is_none());
        assert_eq!(t.tracked_count(), 0);
    }

    #[test]
    fn user_task_is_tracked() {
        let t = tracker();
        let id = t.init_task(Some(CallSite { file: "app/worker.rs".to_string(), line: 10 }), None, vec![]);
        assert!(id.is_some());
        assert_eq!(t.tracked_count(), 1);
    }

    #[test]
    fn snapshot_reflects_origin_and_trigger() {
        let t = tracker();
        let a = t.init_task(Some(CallSite { file: "app/a.rs".to_string(), line: 1 }), None, vec![]).unwrap();
        let b = t.init_task(Some(CallSite { file: "app/b.rs".to_string(), line: 2 }), Some(a), vec![]).unwrap();

        let snapshot = t.snapshot();
        assert_eq!(snapshot.len(), 2);
        let task_b = snapshot.iter().find(|s| s.task_id == b).unwrap();
        assert_eq!(task_b.file.as_deref(), Some("app/b.rs"));
        assert_eq!(task_b.line, Some(2));
        assert_eq!(task_b.trigger, Some(a));
        assert_eq!(task_b.status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pending_task_is_reported_once() {
        let t = tracker();
        t.init_task(Some(CallSite { file: "app/worker.rs".to_string(), line: 1 }), None, vec![]);
        tokio::time::advance(Duration::from_millis(1100)).await;
        let first = t.watchdog_tick();
        assert_eq!(first.len(), 1);
        let second = t.watchdog_tick();
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observed_task_is_never_reported() {
        let t = tracker();
        let id = t.init_task(Some(CallSite { file: "app/worker.rs".to_string(), line: 1 }), None, vec![]).unwrap();
        t.mark_observed(id);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(t.watchdog_tick().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mutual_wait_is_flagged_circular() {
        let t = tracker();
        let a = t.init_task(Some(CallSite { file: "app/a.rs".to_string(), line: 1 }), None, vec![]).unwrap();
        let b = t.init_task(Some(CallSite { file: "app/b.rs".to_string(), line: 1 }), Some(a), vec![]).unwrap();
        t.set_trigger(a, Some(b));
        tokio::time::advance(Duration::from_millis(1100)).await;
        let reports = t.watchdog_tick();
        assert!(reports.iter().any(|r| r.is_circular));
    }

    #[test]
    fn eviction_drops_oldest_non_pending_at_cap() {
        let cfg = PromisesConfig { enabled: true, check_interval_ms: 1000, deadlock_threshold_ms: 1000, max_tracked: 10 };
        let t = tracker();
        let t = Arc::new(TaskTracker::new(cfg, t.store.clone(), t.health.clone()));
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(t.init_task(Some(CallSite { file: format!("app/{i}.rs"), line: 1 }), None, vec![]).unwrap());
        }
        for &id in &ids[0..5] {
            t.mark_observed(id);
        }
        let eleventh = t.init_task(Some(CallSite { file: "app/new.rs".to_string(), line: 1 }), None, vec![]);
        assert!(eleventh.is_some());
        assert!(t.tracked_count() <= 10);
    }
}
