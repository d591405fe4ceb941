//! Event Bus - in-process topic pub/sub
//!
//! Fan-out is cooperative: `publish` awaits every matching handler
//! before returning, in registration order. A handler error is logged
//! and does not abort fan-out. All state-changing services publish
//! here; subscribers (persistence, ratings, transport) react.
//!
//! # Patterns
//! - exact: `"orders.created"`
//! - suffix wildcard: `"orders.*"` (exactly one additional segment)
//! - match-all: `"*"` or `"**"`
//!
//! # Event log
//! A bounded ring of recent events (default capacity 10 000, trimmed to
//! 90% when full), mutex-guarded. The subscriber list is copy-on-write
//! so publishing never holds a lock across handler awaits.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::error;

use crate::core_types::{Clock, SubscriptionId, TimestampMs};
use crate::errors::{CoreError, CoreResult};

/// Default bound on the event log ring.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// A published event as delivered to handlers and kept in the log.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub ts: TimestampMs,
}

/// Handlers report failures instead of panicking; the bus logs and
/// continues fan-out.
pub type HandlerResult = anyhow::Result<()>;

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
    once: bool,
    fired: AtomicBool,
}

/// Process-wide topic publisher with wildcard subscription.
pub struct EventBus {
    subs: Mutex<Arc<Vec<Arc<Subscription>>>>,
    log: Mutex<VecDeque<Event>>,
    next_id: AtomicU64,
    capacity: usize,
    clock: Clock,
}

impl EventBus {
    pub fn new(clock: Clock) -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY, clock)
    }

    pub fn with_capacity(capacity: usize, clock: Clock) -> Self {
        Self {
            subs: Mutex::new(Arc::new(Vec::new())),
            log: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicU64::new(1),
            capacity,
            clock,
        }
    }

    // ============================================================
    // SUBSCRIPTION
    // ============================================================

    /// Register a handler for every topic matching `pattern`.
    pub fn subscribe<F, Fut>(&self, pattern: &str, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_subscription(pattern, f, false)
    }

    /// Like [`subscribe`](Self::subscribe) but auto-unsubscribes after
    /// the first delivery.
    pub fn once<F, Fut>(&self, pattern: &str, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_subscription(pattern, f, true)
    }

    fn add_subscription<F, Fut>(&self, pattern: &str, f: F, once: bool) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler =
            Arc::new(move |event| -> BoxFuture<'static, HandlerResult> { Box::pin(f(event)) });
        let sub = Arc::new(Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
            once,
            fired: AtomicBool::new(false),
        });

        let mut guard = self.subs.lock().unwrap();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(sub);
        *guard = Arc::new(next);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut guard = self.subs.lock().unwrap();
        let next: Vec<Arc<Subscription>> =
            guard.iter().filter(|s| s.id != id).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    // ============================================================
    // PUBLISHING
    // ============================================================

    /// Publish a payload, awaiting all matching handlers in
    /// registration order.
    pub async fn publish(&self, topic: &str, payload: Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            ts: self.clock.now_ms(),
        };
        self.append_log(event.clone());

        // Snapshot: handlers may subscribe/unsubscribe while we deliver
        let subs = self.subs.lock().unwrap().clone();
        let mut spent: Vec<SubscriptionId> = Vec::new();

        for sub in subs.iter() {
            if !pattern_matches(&sub.pattern, topic) {
                continue;
            }
            if sub.once {
                // Claim the single delivery before invoking
                if sub.fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                spent.push(sub.id);
            }
            if let Err(e) = (sub.handler)(event.clone()).await {
                error!(topic, sub_id = sub.id, error = %e, "event handler failed");
            }
        }

        for id in spent {
            self.unsubscribe(id);
        }
    }

    /// Wait for the next event matching `pattern`.
    ///
    /// # Errors
    /// `Timeout` once the deadline passes.
    pub async fn wait_for(&self, pattern: &str, timeout: Duration) -> CoreResult<Event> {
        let (tx, rx) = tokio::sync::oneshot::channel::<Event>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let id = self.once(pattern, move |event| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(event);
                }
                Ok(())
            }
        });

        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(id);
        match result {
            Ok(Ok(event)) => Ok(event),
            _ => Err(CoreError::Timeout),
        }
    }

    // ============================================================
    // EVENT LOG
    // ============================================================

    fn append_log(&self, event: Event) {
        let mut log = self.log.lock().unwrap();
        if log.len() >= self.capacity {
            // Trim to 90% so we do not shift on every publish once full
            let keep = self.capacity * 9 / 10;
            let drop = log.len() + 1 - keep;
            log.drain(..drop);
        }
        log.push_back(event);
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Most recent events for a topic pattern, oldest first.
    pub fn recent(&self, pattern: &str, limit: usize) -> Vec<Event> {
        let log = self.log.lock().unwrap();
        log.iter()
            .filter(|e| pattern_matches(pattern, &e.topic))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

/// Topic pattern matching. See the module docs for the grammar.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        if let Some(rest) = topic.strip_prefix(prefix) {
            if let Some(tail) = rest.strip_prefix('.') {
                // Exactly one additional segment
                return !tail.is_empty() && !tail.contains('.');
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(Clock::manual(0))
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("orders.created", "orders.created"));
        assert!(!pattern_matches("orders.created", "orders.cancelled"));

        assert!(pattern_matches("orders.*", "orders.created"));
        assert!(!pattern_matches("orders.*", "orders.created.extra"));
        assert!(!pattern_matches("orders.*", "orders"));
        assert!(!pattern_matches("orders.*", "trades.executed"));

        assert!(pattern_matches("*", "anything.at.all"));
        assert!(pattern_matches("**", "anything"));
    }

    #[tokio::test]
    async fn test_publish_delivers_in_registration_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe("t.a", move |_| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }
            });
        }

        bus.publish("t.a", json!({})).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_abort_fanout() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("t.*", |_| async { anyhow::bail!("boom") });
        let hits2 = hits.clone();
        bus.subscribe("t.*", move |_| {
            let hits = hits2.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish("t.x", json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_fires_exactly_once() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.once("t.a", move |_| {
            let hits = h.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish("t.a", json!(1)).await;
        bus.publish("t.a", json!(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_receives_payload() {
        let bus = Arc::new(bus());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for("markets.resolved", Duration::from_secs(5)).await
            })
        };

        // Give the waiter a chance to subscribe
        tokio::task::yield_now().await;
        bus.publish("markets.resolved", json!({"outcome": "YES"})).await;

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.payload["outcome"], "YES");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let bus = bus();
        let result = bus.wait_for("never.happens", Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), CoreError::Timeout);
        // The ephemeral subscription is cleaned up
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe("t.a", move |_| {
            let hits = h.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish("t.a", json!(1)).await;
        bus.unsubscribe(id);
        bus.publish("t.a", json!(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_log_trims_to_ninety_percent() {
        let bus = EventBus::with_capacity(100, Clock::manual(0));
        for i in 0..100 {
            bus.publish("t.a", json!(i)).await;
        }
        assert_eq!(bus.log_len(), 100);

        // The 101st publish triggers a trim to 90
        bus.publish("t.a", json!(100)).await;
        assert_eq!(bus.log_len(), 90);

        // Newest entry survives the trim
        let recent = bus.recent("t.a", 1);
        assert_eq!(recent[0].payload, json!(100));
    }

    #[tokio::test]
    async fn test_recent_filters_by_pattern() {
        let bus = bus();
        bus.publish("orders.created", json!(1)).await;
        bus.publish("trades.executed", json!(2)).await;
        bus.publish("orders.cancelled", json!(3)).await;

        let events = bus.recent("orders.*", 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, "orders.created");
        assert_eq!(events[1].topic, "orders.cancelled");
    }
}
