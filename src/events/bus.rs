//! In-process event bus.
//!
//! Subscriptions are indexed by `EventKind`. `publish` snapshots the
//! subscriber list under a short lock, then runs every handler concurrently
//! and waits for all of them; individual failures are logged with the owning
//! handler's name and swallowed. There is no queue behind the bus — slow
//! subscribers must dispatch to their own channels.

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{Event, EventKind};

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    name: String,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `kind`. `name` identifies the owner in error
    /// logs (service + method).
    pub fn subscribe(&self, kind: EventKind, name: impl Into<String>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!("📝 Subscribed {} to {}", name, kind);
        self.subscribers.lock().entry(kind).or_default().push(Registration {
            id,
            name,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&kind) {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                let removed = list.remove(pos);
                debug!("🗑️ Unsubscribed {} from {}", removed.name, kind);
            }
        }
    }

    /// Fan the event out to every subscriber of its kind, concurrently, and
    /// return once all of them have completed (or failed).
    pub async fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        let kind = event.kind();

        // Snapshot under the lock; handlers run without it so they can
        // subscribe/unsubscribe (request_and_wait) or publish recursively.
        let handlers: Vec<(String, EventHandler)> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&kind) {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                    .collect(),
                _ => return,
            }
        };

        debug!("📨 Publishing {} to {} subscriber(s)", kind, handlers.len());

        let futures = handlers.into_iter().map(|(name, handler)| {
            let event = event.clone();
            async move {
                if let Err(e) = handler(event).await {
                    error!("Error in subscriber {}: {:#}", name, e);
                }
            }
        });
        join_all(futures).await;
    }

    /// Publish a request and wait for the first event of `response_kind`,
    /// bounded by `timeout`. The one-shot subscription is installed before
    /// the request is published so the response cannot be missed. Expiry
    /// returns None, never an error.
    pub async fn request_and_wait(
        &self,
        request: impl Into<Event>,
        response_kind: EventKind,
        timeout: Duration,
    ) -> Option<Event> {
        let (tx, rx) = oneshot::channel::<Event>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let handler_slot = Arc::clone(&slot);
        let id = self.subscribe(
            response_kind,
            "EventBus::request_and_wait",
            Arc::new(move |event| {
                let slot = Arc::clone(&handler_slot);
                Box::pin(async move {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(event);
                    }
                    Ok(())
                })
            }),
        );

        self.publish(request).await;

        let result = tokio::time::timeout(timeout, rx).await;
        self.unsubscribe(response_kind, id);

        match result {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// Drop every subscription. Called once during shutdown.
    pub fn clear(&self) {
        debug!("🔌 Clearing all event subscribers");
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::service::{RequestInventoryEvent, StatsControlAction, StatsControlEvent};
    use crate::events::{now, ServiceEvent, ServiceEventKind};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn control_event() -> ServiceEvent {
        ServiceEvent::StatsControl(StatsControlEvent {
            timestamp: now(),
            action: StatsControlAction::Restart,
        })
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_of_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe(
                EventKind::Service(ServiceEventKind::StatsControl),
                "test::counter",
                Arc::new(move |_| {
                    let hits = Arc::clone(&hits);
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }

        bus.publish(control_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn subscribers_run_concurrently_not_serially() {
        let bus = EventBus::new();

        // Four handlers sleeping 50 ms each: serial execution would take
        // ~200 ms, concurrent ~50 ms.
        for _ in 0..4 {
            bus.subscribe(
                EventKind::Service(ServiceEventKind::StatsControl),
                "test::sleeper",
                Arc::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                }),
            );
        }

        let start = Instant::now();
        bus.publish(control_event()).await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::Service(ServiceEventKind::StatsControl),
            "test::failing",
            Arc::new(|_| Box::pin(async { anyhow::bail!("boom") })),
        );
        let counter = Arc::clone(&hits);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::StatsControl),
            "test::counter",
            Arc::new(move |_| {
                let hits = Arc::clone(&counter);
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.publish(control_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let kind = EventKind::Service(ServiceEventKind::StatsControl);

        let counter = Arc::clone(&hits);
        let id = bus.subscribe(
            kind,
            "test::counter",
            Arc::new(move |_| {
                let hits = Arc::clone(&counter);
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.publish(control_event()).await;
        bus.unsubscribe(kind, id);
        bus.publish(control_event()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_and_wait_receives_response() {
        let bus = Arc::new(EventBus::new());

        // Responder: answers RequestInventory-kind requests with a snapshot.
        let responder_bus = Arc::clone(&bus);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::RequestInventory),
            "test::responder",
            Arc::new(move |_| {
                let bus = Arc::clone(&responder_bus);
                Box::pin(async move {
                    bus.publish(ServiceEvent::InventorySnapshot(
                        crate::events::service::InventorySnapshotEvent {
                            timestamp: now(),
                            snapshot: crate::services::model::InventorySnapshot::from_inventory(
                                &crate::services::model::Inventory::new(),
                            ),
                        },
                    ))
                    .await;
                    Ok(())
                })
            }),
        );

        let response = bus
            .request_and_wait(
                ServiceEvent::RequestInventory(RequestInventoryEvent { timestamp: now() }),
                EventKind::Service(ServiceEventKind::InventorySnapshot),
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(
            response,
            Some(Event::Service(ServiceEvent::InventorySnapshot(_)))
        ));
    }

    #[tokio::test]
    async fn request_and_wait_times_out_to_none() {
        let bus = EventBus::new();
        let response = bus
            .request_and_wait(
                ServiceEvent::RequestInventory(RequestInventoryEvent { timestamp: now() }),
                EventKind::Service(ServiceEventKind::InventorySnapshot),
                Duration::from_millis(20),
            )
            .await;
        assert!(response.is_none());

        // The one-shot subscription must be gone after expiry.
        assert!(bus
            .subscribers
            .lock()
            .get(&EventKind::Service(ServiceEventKind::InventorySnapshot))
            .map(|l| l.is_empty())
            .unwrap_or(true));
    }
}
