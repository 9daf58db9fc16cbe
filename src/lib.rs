//! # loop-guardian
//!
//! An in-process runtime health monitor for event-driven, task/promise-based
//! executors: event-loop stall detection, memory leak detection, task
//! deadlock detection, and unawaited-task detection, backed by a shared
//! event store, an alert router, a custom metrics registry, and a health
//! aggregator.
//!
//! ## Quick start
//!
//! ```rust
//! use loop_guardian::{Guardian, GuardianConfig, Mode};
//!
//! # async fn example() -> loop_guardian::Result<()> {
//! let guardian = Guardian::create(GuardianConfig::for_mode(Mode::Development))?;
//! guardian.start();
//!
//! let stats = guardian.store().stats();
//! println!("events observed so far: {}", stats.total);
//!
//! guardian.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Event Store** — append-only bounded ring of every observed condition
//! - **Config** — mode presets (`Production`/`Development`/`Debug`) and validation
//! - **Monitors** — event-loop, memory, task tracker, unawaited-task detector
//! - **Alert Router** — routes events to external sinks with dedup and rate limiting
//! - **Metrics Registry** — counters/gauges/histograms with Prometheus export
//! - **Health Aggregator** — per-monitor health rollup and overall status
//! - **Guardian** — orchestrates construction, startup, and shutdown of the above

pub mod alert;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;

pub use config::{EventLoopConfig, GuardianConfig, MemoryConfig, Mode, PromisesConfig, UnawaitedPromisesConfig};
pub use error::{ErrorBudget, GuardianError, Result};
pub use event::{EmitOptions, Event, EventFilter, EventKind, EventStats, EventStore, Severity, SubscriptionId};
pub use health::{HealthAggregator, MonitorHealth, OverallStatus};
pub use metrics::{labels, HistogramStats, Labels, MetricsRegistry};
pub use orchestrator::Guardian;

pub use alert::routes::{ChatWebhookSink, HttpWebhookSink, IncidentWebhookSink};
pub use alert::{AlertRoute, AlertRouter, AlertSink};
pub use monitor::event_loop::{DelayStats, EventLoopMonitor, HistogramDelaySource, SchedulerDelaySource};
pub use monitor::memory::{MemoryMonitor, MemorySnapshot, MemorySource, Trend};
pub use monitor::tasks::{DeadlockReport, TaskId, TaskStatus, TaskTracker, TrackedTaskSnapshot};
pub use monitor::unawaited::{TrackId, UnawaitedTaskDetector};
pub use monitor::CallSite;
