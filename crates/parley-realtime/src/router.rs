//! Event router.
//!
//! Decodes inbound hub frames and hands each event to the handlers
//! registered for its kind, in registration order. The router owns no
//! domain state.
//!
//! Handlers run synchronously on the connection's read path and must not
//! block; anything slow belongs on the session's
//! [`TaskScheduler`](crate::scheduler::TaskScheduler).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::RwLock;
use parley_core::events::{Decoded, EventKind, HubEvent, decode_frame};
use tracing::{debug, trace, warn};

/// Receives decoded hub events.
pub trait EventHandler: Send + Sync {
    /// Handle one event. Must return quickly.
    fn handle(&self, event: &HubEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&HubEvent) + Send + Sync,
{
    fn handle(&self, event: &HubEvent) {
        self(event);
    }
}

/// Registration handle returned by [`EventRouter::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What happened to one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and delivered to this many handlers.
    Dispatched(usize),
    /// Event name not known to this client; dropped.
    Unknown(String),
    /// Not a valid envelope, or a known event with a bad payload; dropped.
    Malformed,
}

/// Routes hub events to registered handlers.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Arc<dyn EventHandler>)>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    /// Router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a registration. Returns whether it existed.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Decode one raw frame and dispatch it.
    pub fn dispatch_frame(&self, text: &str) -> DispatchOutcome {
        counter!("hub_frames_total").increment(1);
        match decode_frame(text) {
            Ok(Decoded::Event(event)) => DispatchOutcome::Dispatched(self.dispatch(&event)),
            Ok(Decoded::Unknown { name }) => {
                debug!(event = %name, "dropping unknown hub event");
                counter!("hub_frames_dropped_total", "reason" => "unknown").increment(1);
                DispatchOutcome::Unknown(name)
            }
            Err(error) => {
                warn!(%error, "dropping malformed hub frame");
                counter!("hub_frames_dropped_total", "reason" => "malformed").increment(1);
                DispatchOutcome::Malformed
            }
        }
    }

    /// Deliver an already-decoded event. Returns the number of handlers called.
    pub fn dispatch(&self, event: &HubEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may register or unregister re-entrantly.
        let targets: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(event = %kind, handlers = targets.len(), "dispatching hub event");
        for handler in &targets {
            handler.handle(event);
        }
        targets.len()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventRouter")
            .field("kinds", &handlers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use parley_core::logging::capture_logs;
    use serde_json::json;
    use tracing::Level;

    fn recorder() -> (Arc<Mutex<Vec<EventKind>>>, Arc<dyn EventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> = Arc::new(move |e: &HubEvent| sink.lock().push(e.kind()));
        (seen, handler)
    }

    fn presence_frame(user: &str) -> String {
        json!({"event": "presence-changed", "data": {"userId": user, "status": "online"}}).to_string()
    }

    #[test]
    fn dispatches_to_registered_kind_only() {
        let router = EventRouter::new();
        let (presence_seen, presence) = recorder();
        let (calls_seen, calls) = recorder();
        let _ = router.register(EventKind::PresenceChanged, presence);
        let _ = router.register(EventKind::CallEnded, calls);

        let outcome = router.dispatch_frame(&presence_frame("u1"));
        assert_eq!(outcome, DispatchOutcome::Dispatched(1));
        assert_eq!(presence_seen.lock().as_slice(), &[EventKind::PresenceChanged]);
        assert!(calls_seen.lock().is_empty());
    }

    #[test]
    fn multiple_handlers_in_registration_order() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            let _ = router.register(
                EventKind::PresenceChanged,
                Arc::new(move |_: &HubEvent| order.lock().push(n)),
            );
        }
        let _ = router.dispatch_frame(&presence_frame("u1"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn unknown_event_is_dropped_and_logged() {
        let (logs, _guard) = capture_logs();
        let router = EventRouter::new();
        let outcome = router.dispatch_frame(r#"{"event":"typing-started","data":{}}"#);
        assert_eq!(outcome, DispatchOutcome::Unknown("typing-started".into()));
        assert!(logs.has_event(Level::DEBUG, "unknown hub event"));
    }

    #[test]
    fn malformed_payload_does_not_reach_handlers() {
        let (logs, _guard) = capture_logs();
        let router = EventRouter::new();
        let (seen, handler) = recorder();
        let _ = router.register(EventKind::PresenceChanged, handler);

        let outcome =
            router.dispatch_frame(r#"{"event":"presence-changed","data":{"userId":"u1","status":"invisible"}}"#);
        assert_eq!(outcome, DispatchOutcome::Malformed);
        assert!(seen.lock().is_empty());
        assert!(logs.has_event(Level::WARN, "malformed hub frame"));

        // Later well-formed events still flow.
        let _ = router.dispatch_frame(&presence_frame("u2"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn garbage_frame_is_malformed() {
        let router = EventRouter::new();
        assert_eq!(router.dispatch_frame("}{"), DispatchOutcome::Malformed);
        assert_eq!(router.dispatch_frame("[1,2]"), DispatchOutcome::Malformed);
    }

    #[test]
    fn unregister_stops_delivery() {
        let router = EventRouter::new();
        let (seen, handler) = recorder();
        let id = router.register(EventKind::PresenceChanged, handler);
        assert!(router.unregister(id));
        assert!(!router.unregister(id));
        assert_eq!(router.dispatch_frame(&presence_frame("u1")), DispatchOutcome::Dispatched(0));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn handler_may_register_reentrantly() {
        let router = Arc::new(EventRouter::new());
        let inner = Arc::clone(&router);
        let _ = router.register(
            EventKind::PresenceChanged,
            Arc::new(move |_: &HubEvent| {
                let _ = inner.register(EventKind::CallEnded, Arc::new(|_: &HubEvent| {}));
            }),
        );
        let _ = router.dispatch_frame(&presence_frame("u1"));
        assert_eq!(router.handler_count(EventKind::CallEnded), 1);
    }
}
