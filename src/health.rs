//! Health/Status Aggregator — rolls up per-monitor health and uptime.

use crate::event::EventStats;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

const UNHEALTHY_CONSECUTIVE_ERRORS: u32 = 10;
const DEGRADED_CONSECUTIVE_ERRORS: u32 = 3;
const DEGRADED_HEAP_BYTES: u64 = 100 * 1024 * 1024;
const UNHEALTHY_HEAP_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorHealth {
    pub healthy: bool,
    pub last_check_ms: u64,
    pub consecutive_errors: u32,
}

#[derive(Default)]
struct Inner {
    monitors: HashMap<String, MonitorHealth>,
}

/// Tracks uptime, per-monitor self-reports, and derives an overall status.
pub struct HealthAggregator {
    start: Instant,
    inner: RwLock<Inner>,
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// `ok=false` increments `consecutiveErrors`; `ok=true` resets it to 0.
    pub fn record_monitor_check(&self, name: &str, ok: bool, now_ms: u64) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = guard.monitors.entry(name.to_string()).or_default();
        entry.last_check_ms = now_ms;
        entry.healthy = ok;
        if ok {
            entry.consecutive_errors = 0;
        } else {
            entry.consecutive_errors += 1;
        }
    }

    pub fn monitor_health(&self) -> HashMap<String, MonitorHealth> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.monitors.clone()
    }

    /// Overall status, factoring in per-monitor error streaks and heap use.
    pub fn overall_status(&self, heap_used_bytes: u64) -> OverallStatus {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let max_consecutive = guard
            .monitors
            .values()
            .map(|m| m.consecutive_errors)
            .max()
            .unwrap_or(0);

        let mut status = OverallStatus::Healthy;
        if max_consecutive > DEGRADED_CONSECUTIVE_ERRORS {
            status = OverallStatus::Degraded;
        }
        if max_consecutive > UNHEALTHY_CONSECUTIVE_ERRORS {
            status = OverallStatus::Unhealthy;
        }
        if heap_used_bytes > DEGRADED_HEAP_BYTES && status < OverallStatus::Degraded {
            status = OverallStatus::Degraded;
        }
        if heap_used_bytes > UNHEALTHY_HEAP_BYTES {
            status = OverallStatus::Unhealthy;
        }
        status
    }

    /// Prometheus-compatible export with a `monitor` label per entry, plus
    /// event totals rolled up from the event store.
    pub fn to_text(&self, event_stats: &EventStats) -> String {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();

        out.push_str("# HELP guardian_uptime_ms process uptime in milliseconds\n");
        out.push_str("# TYPE guardian_uptime_ms gauge\n");
        out.push_str(&format!("guardian_uptime_ms {}\n", self.uptime_ms()));

        out.push_str("# HELP guardian_events_total total events observed\n");
        out.push_str("# TYPE guardian_events_total counter\n");
        out.push_str(&format!("guardian_events_total {}\n", event_stats.total));

        out.push_str("# HELP guardian_monitor_consecutive_errors consecutive failed self-checks\n");
        out.push_str("# TYPE guardian_monitor_consecutive_errors gauge\n");
        let mut names: Vec<&String> = guard.monitors.keys().collect();
        names.sort();
        for name in names {
            let health = &guard.monitors[name];
            out.push_str(&format!(
                "guardian_monitor_consecutive_errors{{monitor=\"{name}\"}} {}\n",
                health.consecutive_errors
            ));
        }

        out
    }
}
