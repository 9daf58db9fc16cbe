//! Memory Monitor — tracks heap snapshots and flags sustained growth.

use crate::config::MemoryConfig;
use crate::event::{EmitOptions, EventKind, EventStore, Severity};
use crate::health::HealthAggregator;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A single point-in-time memory reading, in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
    pub timestamp_ms: u64,
}

/// Growth direction derived from the last 5 retained snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Growing,
    Stable,
    Decreasing,
}

/// Source of raw memory readings. The process default reads `/proc/self/statm`
/// on Linux; hosts without per-allocation introspection fall back to RSS for
/// every field, which is the best approximation this runtime can offer.
pub trait MemorySource: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

#[derive(Default)]
pub struct ProcessMemorySource;

impl MemorySource for ProcessMemorySource {
    fn snapshot(&self) -> MemorySnapshot {
        let rss = read_rss_bytes().unwrap_or(0);
        MemorySnapshot {
            heap_used: rss,
            heap_total: rss,
            external: 0,
            rss,
            timestamp_ms: now_ms(),
        }
    }
}

#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Inner {
    snapshots: VecDeque<MemorySnapshot>,
    consecutive_growth: u32,
}

/// Watches heap growth across snapshots and emits `MemoryLeak` on a
/// sustained upward run.
pub struct MemoryMonitor {
    config: MemoryConfig,
    source: Arc<dyn MemorySource>,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    inner: Mutex<Inner>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, store: Arc<EventStore>, health: Arc<HealthAggregator>) -> Self {
        Self::with_source(config, Arc::new(ProcessMemorySource), store, health)
    }

    pub fn with_source(
        config: MemoryConfig,
        source: Arc<dyn MemorySource>,
        store: Arc<EventStore>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            health,
            inner: Mutex::new(Inner { snapshots: VecDeque::new(), consecutive_growth: 0 }),
        }
    }

    pub fn snapshots(&self) -> Vec<MemorySnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).snapshots.iter().copied().collect()
    }

    /// No general-purpose GC hook exists for this runtime; always returns
    /// `false`.
    pub fn force_gc(&self) -> bool {
        false
    }

    pub fn tick(&self) {
        let snapshot = self.source.snapshot();
        self.health.record_monitor_check("memory", true, snapshot.timestamp_ms);

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let previous_heap = guard.snapshots.back().map(|s| s.heap_used);

        guard.snapshots.push_back(snapshot);
        while guard.snapshots.len() > self.config.max_snapshots {
            guard.snapshots.pop_front();
        }

        let growth_bytes = match previous_heap {
            Some(prev) => snapshot.heap_used as i64 - prev as i64,
            None => 0,
        };
        let threshold_bytes = (self.config.leak_threshold_mb * 1024 * 1024) as i64;

        if growth_bytes > threshold_bytes {
            guard.consecutive_growth += 1;
        } else if growth_bytes <= 0 {
            guard.consecutive_growth = 0;
        }

        if guard.consecutive_growth >= self.config.consecutive_growth {
            let first_heap = guard.snapshots.front().map(|s| s.heap_used as i64).unwrap_or(snapshot.heap_used as i64);
            let total_growth_bytes = snapshot.heap_used as i64 - first_heap;
            let trend = trend_of(&guard.snapshots);
            let consecutive = guard.consecutive_growth;
            guard.consecutive_growth = 0;
            drop(guard);
            self.emit_leak(snapshot, growth_bytes, total_growth_bytes, trend, consecutive);
        }
    }

    fn emit_leak(&self, snapshot: MemorySnapshot, growth_bytes: i64, total_growth_bytes: i64, trend: Trend, consecutive: u32) {
        let severity = if total_growth_bytes > 100 * 1024 * 1024 { Severity::Critical } else { Severity::Error };
        let mut payload = HashMap::new();
        payload.insert("recentGrowthMb".to_string(), serde_json::json!(growth_bytes as f64 / (1024.0 * 1024.0)));
        payload.insert("totalGrowthMb".to_string(), serde_json::json!(total_growth_bytes as f64 / (1024.0 * 1024.0)));
        payload.insert("currentHeapBytes".to_string(), serde_json::json!(snapshot.heap_used));
        payload.insert("trend".to_string(), serde_json::json!(format!("{trend:?}").to_lowercase()));
        payload.insert("consecutiveGrowthCount".to_string(), serde_json::json!(consecutive));

        self.store.emit(
            EventKind::MemoryLeak,
            payload,
            EmitOptions {
                severity: Some(severity),
                suggestion: Some("heap usage has grown across consecutive checks; look for unbounded caches or retained listeners".to_string()),
                source: Some("memory".to_string()),
                ..Default::default()
            },
        );
    }
}

fn trend_of(snapshots: &VecDeque<MemorySnapshot>) -> Trend {
    let recent: Vec<&MemorySnapshot> = snapshots.iter().rev().take(5).collect();
    if recent.len() < 2 {
        return Trend::Stable;
    }
    let mut increases = 0;
    for pair in recent.windows(2) {
        // `recent` is newest-first; compare older -> newer.
        if pair[1].heap_used < pair[0].heap_used {
            increases += 1;
        }
    }
    if increases >= 4 {
        Trend::Growing
    } else if increases <= 1 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}
