//! In-process fan-out point for entity changes.
//!
//! ```text
//! request path ──┐
//!                ├──► EntityChangeBus::publish ──► listener 1 (registry fan-out)
//! reconcile push ┘         (synchronous)       ──► listener 2 ...
//! ```
//!
//! Publishing is fire-and-forget. Nothing is queued: with no listener, or
//! no live connection behind it, the event is dropped and clients pick the
//! change up through the catch-up pull instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use serde_json::Value;
use thiserror::Error;

use greencycle_core::{ChangeEvent, ChangeType, EntityType, MonotonicClock};

#[derive(Debug, Clone, Error)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receiver of published change events.
pub trait ChangeListener: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &str;

    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError>;
}

/// Synchronous change fan-out.
pub struct EntityChangeBus {
    clock: Arc<MonotonicClock>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    published: AtomicU64,
    listener_failures: AtomicU64,
}

impl EntityChangeBus {
    /// Create a bus stamping events from `clock`.
    ///
    /// Pass the same clock the record store writes with, so an event is
    /// always stamped at or after the records it describes.
    pub fn new(clock: Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            listeners: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        log::debug!("Change listener '{}' subscribed", listener.name());
        listeners.push(listener);
    }

    /// Stamp and deliver a change to every listener.
    pub fn publish(
        &self,
        entity_type: EntityType,
        change_type: ChangeType,
        changes: Vec<Value>,
        origin_user_id: Option<&str>,
    ) -> ChangeEvent {
        let event = ChangeEvent {
            entity_type,
            change_type,
            changes,
            timestamp: self.clock.tick(),
            origin_user_id: origin_user_id.map(str::to_string),
        };
        self.publish_event(&event);
        event
    }

    /// Deliver an already stamped event.
    ///
    /// A failing or panicking listener is logged and skipped; the remaining
    /// listeners still receive the event.
    pub fn publish_event(&self, event: &ChangeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_change(event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "listener panicked".to_string(),
            };
            self.listener_failures.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Change listener '{}' failed on {} {}: {failure}",
                listener.name(),
                event.entity_type,
                event.change_type
            );
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl ChangeListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            Err(ListenerError("socket gone".into()))
        }
    }

    struct Panicking;

    impl ChangeListener for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_change(&self, _event: &ChangeEvent) -> Result<(), ListenerError> {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_publish_reaches_all_listeners() {
        let bus = EntityChangeBus::new(Arc::new(MonotonicClock::new()));
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        let event = bus.publish(
            EntityType::Collections,
            ChangeType::Create,
            vec![json!({ "id": "c1" })],
            Some("u1"),
        );

        assert_eq!(a.seen.lock().unwrap().as_slice(), &[event.clone()]);
        assert_eq!(b.seen.lock().unwrap().as_slice(), &[event.clone()]);
        assert_eq!(event.origin_user_id.as_deref(), Some("u1"));
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let bus = EntityChangeBus::new(Arc::new(MonotonicClock::new()));
        let after = Arc::new(Recorder::default());
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(after.clone());

        bus.publish(EntityType::Users, ChangeType::Update, vec![], None);

        assert_eq!(after.seen.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_failures(), 2);
    }

    #[test]
    fn test_publish_without_listeners_is_dropped() {
        let bus = EntityChangeBus::new(Arc::new(MonotonicClock::new()));
        let event = bus.publish(EntityType::Marketplace, ChangeType::Delete, vec![json!("m1")], None);
        assert_eq!(bus.listener_count(), 0);
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_event_timestamps_follow_shared_clock() {
        let clock = Arc::new(MonotonicClock::new());
        let bus = EntityChangeBus::new(clock.clone());
        let record_ts = clock.tick();
        let event = bus.publish(EntityType::Transactions, ChangeType::Create, vec![], None);
        assert!(event.timestamp > record_ts);
        assert_eq!(clock.last(), event.timestamp);
    }
}
