//! The four monitoring subsystems: event-loop stalls, memory growth, task
//! deadlocks, and unawaited tasks.

pub mod event_loop;
pub mod memory;
pub mod tasks;
pub mod unawaited;

/// A source file + line, parsed from the call-site at task/tick creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
}

/// Path substrings and component names that identify the monitor's own
/// implementation. Any task or tick originating here is invisible to the
/// Task Tracker and Unawaited-Task Detector — this is a correctness
/// requirement (the monitor must never watch itself), not an optimization.
const SELF_PATH_MARKERS: &[&str] = &[
    "loop_guardian",
    "loop-guardian",
    "src/monitor/",
    "src/event/",
    "src/alert/",
    "src/metrics.rs",
    "src/health.rs",
    "src/orchestrator.rs",
    "event_loop_monitor",
    "memory_monitor",
    "task_tracker",
    "unawaited_task_detector",
];

/// Whether `file` names a location inside the monitor's own implementation.
pub fn is_self_path(file: &str) -> bool {
    SELF_PATH_MARKERS.iter().any(|marker| file.contains(marker))
}

/// Trim a raw stack trace to user frames only, top 10, for inclusion in an
/// emitted event. Frames matching `is_self_path` are dropped entirely.
pub fn clean_stack(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| !is_self_path(f))
        .take(10)
        .cloned()
        .collect()
}
