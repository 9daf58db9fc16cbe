//! Alert Router — dispatches emitted events to external sinks with
//! per-route deduplication and rate limiting.

pub mod routes;

use crate::error::{GuardianError, Result};
use crate::event::{Event, EventKind, EventStore, Severity};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Something an alert can be sent to: a webhook, a chat integration, an
/// incident-management API. Implementations should treat `send` as
/// best-effort — the router logs and moves on on failure, it never retries.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<()>;
}

/// One named destination with its own filter, dedupe window, and rate caps.
pub struct AlertRoute {
    pub name: String,
    pub min_severity: Severity,
    pub kinds: Option<Vec<EventKind>>,
    pub dedupe_window: Duration,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,
    sink: Arc<dyn AlertSink>,
}

impl AlertRoute {
    pub fn new(name: impl Into<String>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            name: name.into(),
            min_severity: Severity::Error,
            kinds: None,
            dedupe_window: Duration::from_secs(300),
            rate_limit_per_minute: 10,
            rate_limit_per_hour: 100,
            sink,
        }
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn kinds(mut self, kinds: Vec<EventKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    pub fn rate_limit_per_minute(mut self, limit: u32) -> Self {
        self.rate_limit_per_minute = limit;
        self
    }

    pub fn rate_limit_per_hour(mut self, limit: u32) -> Self {
        self.rate_limit_per_hour = limit;
        self
    }

    fn matches(&self, event: &Event) -> bool {
        event.severity >= self.min_severity
            && self.kinds.as_ref().map(|ks| ks.contains(&event.kind)).unwrap_or(true)
    }

    /// `kind:file:line` — the call site is what actually distinguishes two
    /// occurrences of the same kind of problem, not the fixed per-monitor
    /// `source` string every event of a given kind shares.
    fn dedupe_key(event: &Event) -> String {
        format!(
            "{}:{}:{}",
            event.kind.as_str(),
            event.file.as_deref().unwrap_or(""),
            event.line.map(|l| l.to_string()).unwrap_or_default()
        )
    }
}

#[derive(Default)]
struct RouteState {
    last_sent: Mutex<HashMap<String, Instant>>,
    per_minute_window: Mutex<VecDeque<Instant>>,
    per_hour_window: Mutex<VecDeque<Instant>>,
}

impl RouteState {
    fn should_send(&self, route: &AlertRoute, key: &str, now: Instant) -> bool {
        {
            let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = last.get(key) {
                if now.duration_since(*prev) < route.dedupe_window {
                    return false;
                }
            }
            last.insert(key.to_string(), now);
        }

        let mut per_minute = self.per_minute_window.lock().unwrap_or_else(|e| e.into_inner());
        while per_minute.front().map(|t| now.duration_since(*t) > Duration::from_secs(60)).unwrap_or(false) {
            per_minute.pop_front();
        }
        let mut per_hour = self.per_hour_window.lock().unwrap_or_else(|e| e.into_inner());
        while per_hour.front().map(|t| now.duration_since(*t) > Duration::from_secs(3600)).unwrap_or(false) {
            per_hour.pop_front();
        }

        if per_minute.len() as u32 >= route.rate_limit_per_minute || per_hour.len() as u32 >= route.rate_limit_per_hour {
            return false;
        }
        per_minute.push_back(now);
        per_hour.push_back(now);
        true
    }
}

/// Fans matching events out to every registered route, subject to each
/// route's dedupe window and rate limit.
pub struct AlertRouter {
    routes: Vec<(AlertRoute, RouteState)>,
}

impl Default for AlertRouter {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl AlertRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, route: AlertRoute) {
        self.routes.push((route, RouteState::default()));
    }

    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|(r, _)| r.name.as_str()).collect()
    }

    /// Evaluate `event` against every route and send to the ones that match
    /// and aren't currently deduped or rate-limited. Returns the names of
    /// the routes actually dispatched to.
    pub async fn dispatch(&self, event: &Event) -> Vec<String> {
        let now = Instant::now();
        let key = AlertRoute::dedupe_key(event);
        let mut dispatched = Vec::new();

        for (route, state) in &self.routes {
            if !route.matches(event) {
                continue;
            }
            if !state.should_send(route, &key, now) {
                continue;
            }
            match route.sink.send(event).await {
                Ok(()) => dispatched.push(route.name.clone()),
                Err(err) => tracing::warn!(route = route.name.as_str(), error = %err, "alert sink failed"),
            }
        }

        dispatched
    }

    /// Subscribe to `store` so every emitted event is dispatched
    /// asynchronously and non-blockingly in the background.
    pub fn install(self: Arc<Self>, store: &EventStore) {
        store.subscribe(None, move |event| {
            let router = self.clone();
            let event = event.clone();
            tokio::spawn(async move {
                router.dispatch(&event).await;
            });
        });
    }
}

/// Wraps a sink error with its route name for the ambient error type.
pub fn sink_error(route: &str, reason: impl std::fmt::Display) -> GuardianError {
    GuardianError::ExternalSink { route: route.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EmitOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn send(&self, _event: &Event) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_event(store: &EventStore, kind: EventKind, severity: Severity) -> Event {
        store.emit(kind, Default::default(), EmitOptions { severity: Some(severity), ..Default::default() })
    }

    #[tokio::test]
    async fn below_min_severity_is_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(AlertRoute::new("ops", Arc::new(CountingSink(count.clone()))).min_severity(Severity::Critical));

        let store = EventStore::default();
        let event = make_event(&store, EventKind::UnawaitedTask, Severity::Warning);
        router.dispatch(&event).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matching_event_is_dispatched() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(AlertRoute::new("ops", Arc::new(CountingSink(count.clone()))).min_severity(Severity::Error));

        let store = EventStore::default();
        let event = make_event(&store, EventKind::EventLoopStall, Severity::Error);
        let dispatched = router.dispatch(&event).await;
        assert_eq!(dispatched, vec!["ops".to_string()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_within_window_is_suppressed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(
            AlertRoute::new("ops", Arc::new(CountingSink(count.clone())))
                .min_severity(Severity::Error)
                .dedupe_window(Duration::from_secs(60)),
        );

        let store = EventStore::default();
        let event = make_event(&store, EventKind::EventLoopStall, Severity::Error);
        router.dispatch(&event).await;
        router.dispatch(&event).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        router.dispatch(&event).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_caps_sends_per_minute() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(
            AlertRoute::new("ops", Arc::new(CountingSink(count.clone())))
                .min_severity(Severity::Error)
                .dedupe_window(Duration::from_millis(1))
                .rate_limit_per_minute(2),
        );

        let store = EventStore::default();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(2)).await;
            let event = make_event(&store, EventKind::EventLoopStall, Severity::Error);
            router.dispatch(&event).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_caps_sends_per_hour() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(
            AlertRoute::new("ops", Arc::new(CountingSink(count.clone())))
                .min_severity(Severity::Error)
                .dedupe_window(Duration::from_millis(1))
                .rate_limit_per_minute(1000)
                .rate_limit_per_hour(2),
        );

        let store = EventStore::default();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(70)).await;
            let event = make_event(&store, EventKind::EventLoopStall, Severity::Error);
            router.dispatch(&event).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dedupe_key_is_scoped_to_call_site_not_source() {
        let store = EventStore::default();
        let a = make_event(&store, EventKind::TaskDeadlock, Severity::Error);
        let b = store.emit(
            EventKind::TaskDeadlock,
            Default::default(),
            EmitOptions { severity: Some(Severity::Error), file: Some("app/x.rs".to_string()), line: Some(7), ..Default::default() },
        );
        assert_ne!(AlertRoute::dedupe_key(&a), AlertRoute::dedupe_key(&b));
    }

    #[tokio::test]
    async fn kind_filter_excludes_non_matching_kinds() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = AlertRouter::new();
        router.add_route(
            AlertRoute::new("ops", Arc::new(CountingSink(count.clone())))
                .min_severity(Severity::Warning)
                .kinds(vec![EventKind::MemoryLeak]),
        );

        let store = EventStore::default();
        let event = make_event(&store, EventKind::UnawaitedTask, Severity::Warning);
        router.dispatch(&event).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
