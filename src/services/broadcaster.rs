//! WebSocket broadcast service.
//!
//! Keeps the registry of connected clients and forwards the outward-facing
//! events as JSON text frames. Each client is an unbounded channel drained
//! by its socket task; a failed send means the client is gone and it is
//! evicted.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{subscribe, Service, ServiceDescriptor};
use crate::events::parser::ParserEventKind;
use crate::events::{Event, EventBus, EventKind, ServiceEventKind};

/// Event kinds forwarded to clients.
const OUTBOUND: &[EventKind] = &[
    EventKind::Service(ServiceEventKind::MapStarted),
    EventKind::Service(ServiceEventKind::MapFinished),
    EventKind::Service(ServiceEventKind::MapRecord),
    EventKind::Service(ServiceEventKind::StatsUpdate),
    EventKind::Service(ServiceEventKind::SessionStarted),
    EventKind::Service(ServiceEventKind::SessionFinished),
    EventKind::Service(ServiceEventKind::SessionRestore),
    EventKind::Service(ServiceEventKind::MarketAction),
    EventKind::Service(ServiceEventKind::MarketTransaction),
    EventKind::Service(ServiceEventKind::Notification),
    EventKind::Service(ServiceEventKind::LevelProgress),
    EventKind::Parser(ParserEventKind::PlayerJoin),
];

#[derive(Default)]
pub struct BroadcastService {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
}

impl BroadcastService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "WebSocketService",
        version: "1.0.0",
        requires: &[],
    };

    pub fn new() -> Self {
        info!("🕸️  WebSocketService initialized");
        Self::default()
    }

    /// Register a connected client; the returned receiver feeds its socket.
    pub fn register_client(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock();
        clients.insert(id, tx);
        info!("🕸️ Client connected: #{id} - Total clients: {}", clients.len());
        (id, rx)
    }

    pub fn remove_client(&self, id: u64) {
        let mut clients = self.clients.lock();
        if clients.remove(&id).is_some() {
            info!("🕸️ Client disconnected: #{id} - Total clients: {}", clients.len());
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    async fn on_event(&self, event: Event) -> Result<()> {
        let Some(json) = event.to_client_json() else {
            return Ok(());
        };
        let text = json.to_string();

        let mut dead = Vec::new();
        {
            let clients = self.clients.lock();
            debug!(
                "🕸️ Broadcasting {} to {} client(s)",
                event.kind(),
                clients.len()
            );
            for (id, tx) in clients.iter() {
                if tx.send(text.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.remove_client(id);
        }
        Ok(())
    }
}

#[async_trait]
impl Service for BroadcastService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        for kind in OUTBOUND {
            subscribe!(bus, self, *kind, on_event);
        }
    }

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Dropping the senders closes every client's channel; the socket tasks
    /// then shut their connections down cleanly.
    async fn shutdown(&self) -> Result<()> {
        let count = self.client_count();
        info!("🕸️ Shutting down WebSocketService ({count} clients)");
        self.clients.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::service::{NotificationEvent, NotificationSeverity, ServiceEvent};

    fn notification() -> Event {
        Event::Service(ServiceEvent::Notification(NotificationEvent {
            timestamp: crate::events::now(),
            title: "t".to_string(),
            content: "c".to_string(),
            severity: NotificationSeverity::Info,
            duration: None,
        }))
    }

    #[tokio::test]
    async fn broadcasts_to_all_registered_clients() {
        let service = BroadcastService::default();
        let (_id1, mut rx1) = service.register_client();
        let (_id2, mut rx2) = service.register_client();

        service.on_event(notification()).await.unwrap();

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        let json: serde_json::Value = serde_json::from_str(&a).unwrap();
        assert_eq!(json["type"], "notification");
    }

    #[tokio::test]
    async fn dead_clients_are_evicted() {
        let service = BroadcastService::default();
        let (_id1, rx1) = service.register_client();
        let (_id2, _rx2) = service.register_client();
        drop(rx1);

        service.on_event(notification()).await.unwrap();
        assert_eq!(service.client_count(), 1);
    }

    #[tokio::test]
    async fn internal_events_are_not_forwarded() {
        let service = BroadcastService::default();
        let (_id, mut rx) = service.register_client();

        let internal = Event::Service(ServiceEvent::RequestInventory(
            crate::events::service::RequestInventoryEvent {
                timestamp: crate::events::now(),
            },
        ));
        service.on_event(internal).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
