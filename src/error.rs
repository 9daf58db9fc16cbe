//! Error taxonomy for loop-guardian
//!
//! Only `Configuration` errors are fatal — they abort construction before any
//! monitor starts. Every other variant represents a runtime failure that the
//! monitor contains internally (logged, counted against the error budget,
//! never propagated to the host).

use thiserror::Error;

/// Errors that can occur in the monitor
#[derive(Debug, Error)]
pub enum GuardianError {
    /// Rejected configuration — fatal to construction
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Failed to install a low-level runtime hook
    #[error("failed to install runtime hook for {monitor}: {reason}")]
    RuntimeHook { monitor: String, reason: String },

    /// A subscriber or alert-route handler raised an error
    #[error("handler error in {context}: {reason}")]
    UserHandler { context: String, reason: String },

    /// An alert route's external sink failed to accept a dispatch
    #[error("external sink error for route '{route}': {reason}")]
    ExternalSink { route: String, reason: String },

    /// Named resource is not found (unknown route, subscription, etc.)
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The monitor disabled itself after exceeding its error budget
    #[error("monitor self-disabled after exceeding error budget")]
    SelfDisabled,
}

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, GuardianError>;

/// Bounded window of recent contained-failure timestamps for one monitor.
/// Crossing `max_errors` within `window` trips self-disable for the owner.
///
/// Grounded in the same ring-with-eviction idiom used by the event ring, the
/// memory-snapshot ring, and the metrics histogram ring: a `VecDeque` capped
/// by dropping everything older than `window` on each `record()`.
pub struct ErrorBudget {
    max_errors: usize,
    window: std::time::Duration,
    timestamps: std::sync::Mutex<std::collections::VecDeque<std::time::Instant>>,
}

impl ErrorBudget {
    pub fn new(max_errors: usize, window: std::time::Duration) -> Self {
        Self { max_errors, window, timestamps: std::sync::Mutex::new(std::collections::VecDeque::new()) }
    }

    /// 100 errors per 60s window, the defaults named in `spec.md` §5.
    pub fn with_defaults() -> Self {
        Self::new(100, std::time::Duration::from_secs(60))
    }

    /// Record one contained failure. Returns `true` the call that pushes the
    /// window's count over `max_errors` — the caller should self-disable.
    pub fn record(&self) -> bool {
        let now = std::time::Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.push_back(now);
        timestamps.len() > self.max_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stays_under_budget_for_few_errors() {
        let budget = ErrorBudget::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(!budget.record());
        }
    }

    #[test]
    fn trips_once_the_window_exceeds_max_errors() {
        let budget = ErrorBudget::new(3, Duration::from_secs(60));
        assert!(!budget.record());
        assert!(!budget.record());
        assert!(!budget.record());
        assert!(budget.record());
    }
}
