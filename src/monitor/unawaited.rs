//! Unawaited-Task Detector — flags spawned tasks that are never joined or
//! polled to completion within a warning threshold.

use super::{clean_stack, is_self_path, CallSite};
use crate::config::UnawaitedPromisesConfig;
use crate::event::{EmitOptions, EventKind, EventStore, Severity};
use crate::health::HealthAggregator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub type TrackId = u64;

struct Entry {
    origin: Option<CallSite>,
    created_at: Instant,
    reported: bool,
    raw_stack: Vec<String>,
}

/// Tracks spawned-but-not-yet-awaited tasks and warns when one outlives the
/// configured threshold without being joined.
pub struct UnawaitedTaskDetector {
    config: UnawaitedPromisesConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    next_id: AtomicU64,
    entries: Mutex<HashMap<TrackId, Entry>>,
}

impl UnawaitedTaskDetector {
    pub fn new(config: UnawaitedPromisesConfig, store: Arc<EventStore>, health: Arc<HealthAggregator>) -> Self {
        Self {
            config,
            store,
            health,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start tracking a spawned task. Returns `None` if `origin` names a
    /// location inside this crate's own implementation.
    pub fn track(&self, origin: Option<CallSite>, raw_stack: Vec<String>) -> Option<TrackId> {
        if let Some(o) = &origin {
            if is_self_path(&o.file) {
                return None;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(id, Entry { origin, created_at: Instant::now(), reported: false, raw_stack });
        Some(id)
    }

    /// Mark a task as awaited/joined, removing it from tracking.
    pub fn mark_awaited(&self, id: TrackId) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&id);
    }

    /// Scan for tasks past the warning threshold that have not been marked
    /// awaited, and emit one `UnawaitedTask` event per newly-stale task.
    pub fn watchdog_tick(&self) -> usize {
        self.health.record_monitor_check("unawaited_promises", true, now_ms());

        let now = Instant::now();
        let threshold = Duration::from_millis(self.config.warning_threshold_ms);

        let mut to_emit: Vec<(TrackId, u64, Option<String>, Option<u32>, Vec<String>)> = Vec::new();
        {
            let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            for (id, entry) in guard.iter_mut() {
                if !entry.reported && now.duration_since(entry.created_at) >= threshold {
                    entry.reported = true;
                    to_emit.push((
                        *id,
                        now.duration_since(entry.created_at).as_millis() as u64,
                        entry.origin.as_ref().map(|o| o.file.clone()),
                        entry.origin.as_ref().map(|o| o.line),
                        clean_stack(&entry.raw_stack),
                    ));
                }
            }
        }

        for (_, age_ms, file, line, stack) in &to_emit {
            let mut payload = HashMap::new();
            payload.insert("ageMs".to_string(), serde_json::json!(age_ms));
            self.store.emit(
                EventKind::UnawaitedTask,
                payload,
                EmitOptions {
                    severity: Some(Severity::Warning),
                    file: file.clone(),
                    line: *line,
                    stack: if stack.is_empty() { None } else { Some(stack.join("\n")) },
                    suggestion: Some("a spawned task has not been awaited or joined; it may be silently abandoned".to_string()),
                    source: Some("unawaited_promises".to_string()),
                    ..Default::default()
                },
            );
        }

        to_emit.len()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
