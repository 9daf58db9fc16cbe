//! Append-only bounded ring of events with synchronous fan-out
//!
//! `emit` is synchronous and non-blocking: by the time it returns, every
//! subscriber has been invoked in subscription order. A subscriber that
//! panics is caught so it cannot prevent later subscribers from running or
//! poison the store's internal lock.

use super::types::{Event, EventFilter, EventKind, EventStats, EmitOptions, Severity, now_millis};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

const DEFAULT_CAPACITY: usize = 10_000;

/// Append-only bounded ring of typed events; fans out to subscribers.
pub struct EventStore {
    capacity: usize,
    next_id: AtomicU64,
    next_subscription_id: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    events: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
    total: u64,
    by_kind: std::collections::HashMap<String, u64>,
    by_severity: std::collections::HashMap<String, u64>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            next_subscription_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                subscribers: Vec::new(),
                total: 0,
                by_kind: std::collections::HashMap::new(),
                by_severity: std::collections::HashMap::new(),
            }),
        }
    }

    /// Emit a new event, running every matching subscriber synchronously.
    pub fn emit(&self, kind: EventKind, payload: std::collections::HashMap<String, serde_json::Value>, opts: EmitOptions) -> Event {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            kind,
            timestamp_ms: now_millis(),
            severity: opts.severity.unwrap_or_else(|| kind.default_severity()),
            source: opts.source.unwrap_or_default(),
            payload,
            stack: opts.stack,
            file: opts.file,
            line: opts.line,
            suggestion: opts.suggestion,
        };

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.events.push_back(event.clone());
        while guard.events.len() > self.capacity {
            guard.events.pop_front();
        }
        guard.total += 1;
        *guard.by_kind.entry(kind.as_str().to_string()).or_insert(0) += 1;
        *guard
            .by_severity
            .entry(format!("{:?}", event.severity).to_lowercase())
            .or_insert(0) += 1;

        // Clone matching subscribers' handlers out as owned `Arc`s and drop
        // the lock before invoking any of them: a handler that reentrantly
        // calls `emit` or `subscribe` on this store would otherwise deadlock
        // on the std `Mutex`.
        let to_invoke: Vec<Handler> = guard
            .subscribers
            .iter()
            .filter(|s| s.kind.map(|k| k == kind).unwrap_or(true))
            .map(|s| s.handler.clone())
            .collect();
        drop(guard);

        for handler in &to_invoke {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if let Err(panic) = result {
                tracing::warn!(
                    event_id = event.id,
                    kind = kind.as_str(),
                    "event subscriber panicked: {:?}",
                    panic_message(&panic)
                );
            }
        }

        event
    }

    /// Query events, most-recently-emitted last, matching `filter`.
    pub fn events(&self, filter: &EventFilter) -> Vec<Event> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.events.iter().filter(|e| filter.matches(e)).cloned().collect()
    }

    pub fn stats(&self) -> EventStats {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        EventStats {
            total: guard.total,
            by_kind: guard.by_kind.clone(),
            by_severity: guard.by_severity.clone(),
        }
    }

    /// Subscribe to a specific kind, or `None` for every kind ("*").
    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.subscribers.push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.subscribers.retain(|s| s.id != id);
    }

    /// Clear all retained events. Testing only.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.events.clear();
        guard.total = 0;
        guard.by_kind.clear();
        guard.by_severity.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
