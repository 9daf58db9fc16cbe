//! Event-Loop Monitor — watches scheduler delay and reports sustained stalls.

use crate::config::EventLoopConfig;
use crate::event::{EmitOptions, EventKind, EventStore, Severity};
use crate::health::HealthAggregator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

const REPEAT_SUPPRESSION_MS: u64 = 5_000;

/// Percentile + moment summary of the delay samples observed since the last
/// reset. `count == 0` means no samples were taken this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DelayStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: u64,
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * pct / 100.0).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn summarize(mut samples: Vec<f64>) -> DelayStats {
    if samples.is_empty() {
        return DelayStats::default();
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = samples.len() as u64;
    let sum: f64 = samples.iter().sum();
    let mean = sum / samples.len() as f64;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    DelayStats {
        min_ms: samples[0],
        max_ms: samples[samples.len() - 1],
        mean_ms: mean,
        stddev_ms: variance.sqrt(),
        p50_ms: percentile(&samples, 50.0),
        p95_ms: percentile(&samples, 95.0),
        p99_ms: percentile(&samples, 99.0),
        count,
    }
}

/// Source of per-tick scheduler-delay samples. The default implementation
/// records drift observed on a tight interval timer; tests supply their own
/// via `HistogramDelaySource::record_ms` for deterministic scenarios.
pub trait SchedulerDelaySource: Send + Sync {
    fn record_ms(&self, delay_ms: f64);
    fn stats_and_reset(&self) -> DelayStats;
}

/// Mutex-protected sample buffer shared by the background sampler and the
/// monitor's own tick.
#[derive(Default)]
pub struct HistogramDelaySource {
    samples: Mutex<Vec<f64>>,
}

impl HistogramDelaySource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerDelaySource for HistogramDelaySource {
    fn record_ms(&self, delay_ms: f64) {
        let mut guard = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(delay_ms);
    }

    fn stats_and_reset(&self) -> DelayStats {
        let mut guard = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let samples = std::mem::take(&mut *guard);
        summarize(samples)
    }
}

/// Watches scheduler delay and emits `EventLoopStall` on sustained stalls.
pub struct EventLoopMonitor {
    config: EventLoopConfig,
    source: Arc<HistogramDelaySource>,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    stall_count: AtomicU64,
    last_emit_ms: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopMonitor {
    pub fn new(config: EventLoopConfig, store: Arc<EventStore>, health: Arc<HealthAggregator>) -> Self {
        Self {
            config,
            source: Arc::new(HistogramDelaySource::new()),
            store,
            health,
            stall_count: AtomicU64::new(0),
            last_emit_ms: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    /// The delay source, exposed so a background sampler (or a test) can
    /// feed it observations.
    pub fn source(&self) -> Arc<HistogramDelaySource> {
        self.source.clone()
    }

    pub fn stall_count(&self) -> u64 {
        self.stall_count.load(Ordering::SeqCst)
    }

    /// Start the periodic sampler and tick loop. A no-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let interval = Duration::from_millis(this.config.sample_interval_ms.max(1));
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.tick();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Evaluate one sampling window. Public so tests can drive it without a
    /// real timer.
    pub fn tick(&self) -> Option<DelayStats> {
        let stats = self.source.stats_and_reset();
        self.health.record_monitor_check("event_loop", true, now_ms());

        if stats.count == 0 {
            return None;
        }

        if stats.mean_ms > self.config.stall_threshold_ms as f64 {
            let now = now_ms();
            let last = self.last_emit_ms.load(Ordering::SeqCst);
            if last != 0 && now.saturating_sub(last) < REPEAT_SUPPRESSION_MS {
                return Some(stats);
            }
            self.last_emit_ms.store(now, Ordering::SeqCst);
            self.stall_count.fetch_add(1, Ordering::SeqCst);
            self.emit_stall(&stats);
        }

        Some(stats)
    }

    fn emit_stall(&self, stats: &DelayStats) {
        let severity = if stats.mean_ms > 500.0 { Severity::Critical } else { Severity::Error };
        let suggestion = if stats.mean_ms > 1000.0 {
            "synchronous I/O or heavy CPU work is blocking the event loop"
        } else if stats.mean_ms > 500.0 {
            "a large synchronous operation or a missing await is blocking the event loop"
        } else {
            "the event loop is experiencing delays; consider reducing synchronous work per tick"
        };

        let mut payload = HashMap::new();
        payload.insert("meanMs".to_string(), json_num(round2(stats.mean_ms)));
        payload.insert("maxMs".to_string(), json_num(round2(stats.max_ms)));
        payload.insert("p95Ms".to_string(), json_num(round2(stats.p95_ms)));
        payload.insert("p99Ms".to_string(), json_num(round2(stats.p99_ms)));
        payload.insert("sampleCount".to_string(), serde_json::json!(stats.count));

        self.store.emit(
            EventKind::EventLoopStall,
            payload,
            EmitOptions {
                severity: Some(severity),
                suggestion: Some(suggestion.to_string()),
                source: Some("event_loop".to_string()),
                ..Default::default()
            },
        );
    }
}

fn json_num(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
}

/// Round to 2 decimal places, matching the precision the payload is
/// documented to carry.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
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
    use crate::config::GuardianConfig;

    fn monitor() -> Arc<EventLoopMonitor> {
        let cfg = GuardianConfig::for_mode(crate::config::Mode::Development).event_loop;
        Arc::new(EventLoopMonitor::new(cfg, Arc::new(EventStore::default()), Arc::new(HealthAggregator::new())))
    }

    #[test]
    fn no_samples_means_no_stall() {
        let m = monitor();
        assert!(m.tick().is_none());
        assert_eq!(m.stall_count(), 0);
    }

    #[test]
    fn mean_above_threshold_emits_stall() {
        let m = monitor();
        for _ in 0..10 {
            m.source().record_ms(300.0);
        }
        let stats = m.tick().unwrap();
        assert!(stats.mean_ms > 150.0);
        assert_eq!(m.stall_count(), 1);
    }

    #[test]
    fn mean_below_threshold_does_not_emit() {
        let m = monitor();
        for _ in 0..10 {
            m.source().record_ms(5.0);
        }
        m.tick();
        assert_eq!(m.stall_count(), 0);
    }

    #[test]
    fn repeat_suppression_skips_immediate_reemit() {
        let m = monitor();
        for _ in 0..5 {
            m.source().record_ms(300.0);
        }
        m.tick();
        for _ in 0..5 {
            m.source().record_ms(300.0);
        }
        m.tick();
        assert_eq!(m.stall_count(), 1);
    }

    #[test]
    fn severity_escalates_past_500ms() {
        let store = Arc::new(EventStore::default());
        let cfg = GuardianConfig::for_mode(crate::config::Mode::Development).event_loop;
        let m = Arc::new(EventLoopMonitor::new(cfg, store.clone(), Arc::new(HealthAggregator::new())));
        for _ in 0..5 {
            m.source().record_ms(700.0);
        }
        m.tick();
        let events = store.events(&crate::event::EventFilter::default());
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn emitted_payload_rounds_delay_stats() {
        let store = Arc::new(EventStore::default());
        let cfg = GuardianConfig::for_mode(crate::config::Mode::Development).event_loop;
        let m = Arc::new(EventLoopMonitor::new(cfg, store.clone(), Arc::new(HealthAggregator::new())));
        for ms in [300.333, 300.111, 300.777] {
            m.source().record_ms(ms);
        }
        m.tick();

        let events = store.events(&crate::event::EventFilter::default());
        let mean = events[0].payload.get("meanMs").and_then(|v| v.as_f64()).unwrap();
        assert_eq!(mean, (mean * 100.0).round() / 100.0);
    }

    #[test]
    fn stats_summary_matches_known_samples() {
        let stats = summarize(vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 40.0);
        assert_eq!(stats.mean_ms, 25.0);
    }
}
