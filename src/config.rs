//! Configuration schema, mode presets, and validation
//!
//! `GuardianConfig::validate` rejects out-of-range, non-finite, or
//! wrong-typed values before any monitor is constructed — construction is
//! all-or-nothing (see `crate::orchestrator`).

use crate::error::{GuardianError, Result};
use serde::{Deserialize, Serialize};

/// Tuning preset selected by `mode`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Low overhead: task tracker and unawaited detector disabled by default,
    /// 30 s intervals, 300 ms stall threshold.
    #[default]
    Production,
    /// Moderate: everything on, 10-15 s intervals, 150 ms stall threshold.
    Development,
    /// Aggressive: 5-10 s intervals, 100 ms stall threshold.
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLoopConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    pub stall_threshold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromisesConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub deadlock_threshold_ms: u64,
    pub max_tracked: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub leak_threshold_mb: u64,
    pub max_snapshots: usize,
    pub consecutive_growth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnawaitedPromisesConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub warning_threshold_ms: u64,
}

/// Top-level monitor configuration
///
/// Construct with `GuardianConfig::for_mode(mode)` and override individual
/// fields, or build a partial value and call `apply_mode_defaults` yourself.
/// Either way, `validate()` must succeed before the config is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianConfig {
    pub mode: Mode,
    pub event_loop: EventLoopConfig,
    pub promises: PromisesConfig,
    pub memory: MemoryConfig,
    pub unawaited_promises: UnawaitedPromisesConfig,
}

impl GuardianConfig {
    /// Build the default configuration for a mode preset
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Production => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval_ms: 30_000,
                    stall_threshold_ms: 300,
                },
                promises: PromisesConfig {
                    enabled: false,
                    check_interval_ms: 30_000,
                    deadlock_threshold_ms: 30_000,
                    max_tracked: 10_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval_ms: 30_000,
                    leak_threshold_mb: 10,
                    max_snapshots: 100,
                    consecutive_growth: 3,
                },
                unawaited_promises: UnawaitedPromisesConfig {
                    enabled: false,
                    check_interval_ms: 30_000,
                    warning_threshold_ms: 10_000,
                },
            },
            Mode::Development => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval_ms: 10_000,
                    stall_threshold_ms: 150,
                },
                promises: PromisesConfig {
                    enabled: true,
                    check_interval_ms: 10_000,
                    deadlock_threshold_ms: 15_000,
                    max_tracked: 10_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval_ms: 10_000,
                    leak_threshold_mb: 5,
                    max_snapshots: 100,
                    consecutive_growth: 3,
                },
                unawaited_promises: UnawaitedPromisesConfig {
                    enabled: true,
                    check_interval_ms: 5_000,
                    warning_threshold_ms: 5_000,
                },
            },
            Mode::Debug => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval_ms: 5_000,
                    stall_threshold_ms: 100,
                },
                promises: PromisesConfig {
                    enabled: true,
                    check_interval_ms: 5_000,
                    deadlock_threshold_ms: 8_000,
                    max_tracked: 10_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval_ms: 5_000,
                    leak_threshold_mb: 1,
                    max_snapshots: 100,
                    consecutive_growth: 3,
                },
                unawaited_promises: UnawaitedPromisesConfig {
                    enabled: true,
                    check_interval_ms: 3_000,
                    warning_threshold_ms: 5_000,
                },
            },
        }
    }

    /// Validate every sub-option against the ranges in `spec.md` §6.
    ///
    /// No monitor state is constructed if this returns `Err`.
    pub fn validate(&self) -> Result<()> {
        let el = &self.event_loop;
        if el.enabled {
            check_finite_range("eventLoop.sampleInterval", el.sample_interval_ms as f64, 1000.0, f64::MAX)?;
            check_finite_range("eventLoop.stallThreshold", el.stall_threshold_ms as f64, 10.0, f64::MAX)?;
        }

        let pr = &self.promises;
        if pr.enabled {
            check_finite_range("promises.checkInterval", pr.check_interval_ms as f64, 1000.0, f64::MAX)?;
            check_finite_range("promises.deadlockThreshold", pr.deadlock_threshold_ms as f64, 5000.0, f64::MAX)?;
            check_finite_range("promises.maxTracked", pr.max_tracked as f64, 10.0, 100_000.0)?;
        }

        let mem = &self.memory;
        if mem.enabled {
            check_finite_range("memory.checkInterval", mem.check_interval_ms as f64, 5000.0, f64::MAX)?;
            check_finite_range("memory.leakThreshold", mem.leak_threshold_mb as f64, 1.0, f64::MAX)?;
            check_finite_range("memory.maxSnapshots", mem.max_snapshots as f64, 3.0, 1000.0)?;
            if mem.consecutive_growth == 0 {
                return Err(GuardianError::Configuration(
                    "memory.consecutiveGrowth must be >= 1".to_string(),
                ));
            }
        }

        let un = &self.unawaited_promises;
        if un.enabled {
            check_finite_range("unawaitedPromises.checkInterval", un.check_interval_ms as f64, 1000.0, f64::MAX)?;
            check_finite_range("unawaitedPromises.warningThreshold", un.warning_threshold_ms as f64, 1000.0, f64::MAX)?;
        }

        Ok(())
    }
}

fn check_finite_range(field: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(GuardianError::Configuration(format!(
            "{field} must be a finite number, got {value}"
        )));
    }
    if value < min || value > max {
        return Err(GuardianError::Configuration(format!(
            "{field} must be within [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}
