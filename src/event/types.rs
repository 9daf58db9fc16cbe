//! Core event types for the loop-guardian event store

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The class of condition an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    EventLoopStall,
    MemoryLeak,
    TaskDeadlock,
    UnawaitedTask,
    CpuBlock,
    HandleLeak,
    AsyncResourceLeak,
    SystemInfo,
}

impl EventKind {
    /// Severity inferred from kind, per `spec.md` §4.1, unless overridden.
    pub fn default_severity(self) -> Severity {
        match self {
            EventKind::TaskDeadlock | EventKind::MemoryLeak => Severity::Critical,
            EventKind::EventLoopStall | EventKind::CpuBlock | EventKind::HandleLeak => {
                Severity::Error
            }
            EventKind::UnawaitedTask => Severity::Warning,
            EventKind::AsyncResourceLeak => Severity::Error,
            EventKind::SystemInfo => Severity::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::EventLoopStall => "event_loop_stall",
            EventKind::MemoryLeak => "memory_leak",
            EventKind::TaskDeadlock => "task_deadlock",
            EventKind::UnawaitedTask => "unawaited_task",
            EventKind::CpuBlock => "cpu_block",
            EventKind::HandleLeak => "handle_leak",
            EventKind::AsyncResourceLeak => "async_resource_leak",
            EventKind::SystemInfo => "system_info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Immutable diagnostic record emitted by a monitor
///
/// `id` strictly increases within a process lifetime (see
/// `EventStore::emit`); events are never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub source: String,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Optional overrides accepted by `EventStore::emit`
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub severity: Option<Severity>,
    pub stack: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

/// Filter accepted by `EventStore::events`
///
/// Absence of a field means no restriction on that dimension.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub severity: Option<Severity>,
    pub since_ms: Option<u64>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if event.severity != severity {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if event.timestamp_ms < since {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts returned by `EventStore::stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total: u64,
    pub by_kind: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
