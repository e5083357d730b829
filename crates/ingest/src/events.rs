use futures::future::BoxFuture;
use futures::FutureExt;
use shared::{AppError, Event, EventType};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, shared::Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = shared::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    handler: EventHandler,
}

/// In-process typed pub/sub. No durability and no backpressure beyond
/// handler cost; a panicking handler never takes down the bus or its
/// siblings.
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventType, Vec<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .write()
            .unwrap()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, handler });
        debug!(event_type = event_type.as_str(), id, "subscribed");
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) {
        let mut guard = self.subscriptions.write().unwrap();
        if let Some(subs) = guard.get_mut(&event_type) {
            subs.retain(|s| s.id != id.0);
        }
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<EventHandler> {
        self.subscriptions
            .read()
            .unwrap()
            .get(&event_type)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default()
    }

    /// Fire-and-forget delivery. Each subscriber runs in its own task, so
    /// ordering across subscribers is not guaranteed and a panicking or
    /// failing handler cannot affect its siblings. Fails only when the bus
    /// has been closed.
    pub fn publish(&self, event: Event) -> shared::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Event("event bus is closed".to_string()));
        }
        let handlers = self.handlers_for(event.event_type);
        for h in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                let event_type = event.event_type;
                match AssertUnwindSafe(h(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(event_type = event_type.as_str(), error = %e, "event handler failed")
                    }
                    Err(_) => {
                        error!(event_type = event_type.as_str(), "event handler panicked")
                    }
                }
            });
        }
        Ok(())
    }

    /// Inline delivery in registration order; the first handler error stops
    /// the dispatch and is propagated to the caller. A panic is recovered
    /// and surfaced as an error.
    pub async fn publish_sync(&self, event: Event) -> shared::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Event("event bus is closed".to_string()));
        }
        let handlers = self.handlers_for(event.event_type);
        for h in handlers {
            match AssertUnwindSafe(h(event.clone())).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    error!(
                        event_type = event.event_type.as_str(),
                        "event handler panicked"
                    );
                    return Err(AppError::Event(format!(
                        "handler for {} panicked",
                        event.event_type.as_str()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop every subscription and refuse further publishes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.write().unwrap().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording_handler(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> EventHandler {
        handler(move |_event| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_sync_runs_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::JobProgress, recording_handler(Arc::clone(&log), "first"));
        bus.subscribe(EventType::JobProgress, recording_handler(Arc::clone(&log), "second"));

        bus.publish_sync(Event::new(EventType::JobProgress))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_publish_sync_stops_on_first_error() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::JobProgress,
            handler(|_| async { Err(AppError::Internal("boom".to_string())) }),
        );
        bus.subscribe(EventType::JobProgress, recording_handler(Arc::clone(&log), "after"));

        let result = bus.publish_sync(Event::new(EventType::JobProgress)).await;
        assert!(result.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_recovered() {
        let bus = EventBus::new();
        bus.subscribe(
            EventType::JobProgress,
            handler(|_| async { panic!("handler exploded") }),
        );
        let result = bus.publish_sync(Event::new(EventType::JobProgress)).await;
        assert!(matches!(result, Err(AppError::Event(_))));
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_despite_panic() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::JobProgress,
            handler(|_| async { panic!("handler exploded") }),
        );
        bus.subscribe(EventType::JobProgress, recording_handler(Arc::clone(&log), "sibling"));

        bus.publish(Event::new(EventType::JobProgress)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["sibling"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(EventType::KeyUpdated, recording_handler(Arc::clone(&log), "a"));
        bus.unsubscribe(EventType::KeyUpdated, id);
        bus.publish_sync(Event::new(EventType::KeyUpdated))
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_and_rejects() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventType::KeyUpdated, recording_handler(Arc::clone(&log), "a"));
        bus.close();
        assert!(bus.publish(Event::new(EventType::KeyUpdated)).is_err());
        assert!(bus
            .publish_sync(Event::new(EventType::KeyUpdated))
            .await
            .is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
