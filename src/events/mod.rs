//! Event model: parser events, service events, and the bus that carries both.

pub mod bus;
pub mod parser;
pub mod service;

pub use bus::EventBus;
pub use parser::{ParserEvent, ParserEventKind};
pub use service::{ServiceEvent, ServiceEventKind};

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;

/// Union of everything that travels over the bus.
#[derive(Debug, Clone)]
pub enum Event {
    Parser(ParserEvent),
    Service(ServiceEvent),
}

/// Subscription token. One enum for parser events, one for service events,
/// unified at the bus surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Parser(ParserEventKind),
    Service(ServiceEventKind),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Parser(e) => EventKind::Parser(e.kind()),
            Event::Service(e) => EventKind::Service(e.kind()),
        }
    }
}

impl From<ParserEvent> for Event {
    fn from(event: ParserEvent) -> Self {
        Event::Parser(event)
    }
}

impl From<ServiceEvent> for Event {
    fn from(event: ServiceEvent) -> Self {
        Event::Service(event)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Parser(k) => f.write_str(k.as_str()),
            EventKind::Service(k) => f.write_str(k.as_str()),
        }
    }
}

/// Wall-clock timestamp used for events that are not anchored to a log line.
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn envelope<T: Serialize>(kind: &str, payload: &T) -> Option<Value> {
    let mut value = serde_json::to_value(payload).ok()?;
    if let Value::Object(ref mut map) = value {
        map.insert("type".to_string(), Value::String(kind.to_string()));
    }
    Some(value)
}

impl Event {
    /// Project the event into the client wire format: a flat JSON object
    /// with a `type` field. Returns None for event types that are internal
    /// to the service mesh and never leave the process.
    pub fn to_client_json(&self) -> Option<Value> {
        let kind = self.kind().to_string();
        match self {
            Event::Service(event) => match event {
                ServiceEvent::MapStarted(e) => envelope(&kind, e),
                ServiceEvent::MapFinished(e) => envelope(&kind, e),
                ServiceEvent::MapRecord(e) => envelope(&kind, e),
                ServiceEvent::StatsUpdate(e) => envelope(&kind, e),
                ServiceEvent::SessionStarted(e) => envelope(&kind, e),
                ServiceEvent::SessionFinished(e) => envelope(&kind, e),
                ServiceEvent::SessionRestore(e) => envelope(&kind, e),
                ServiceEvent::MarketAction(e) => envelope(&kind, e),
                ServiceEvent::MarketTransaction(e) => envelope(&kind, e),
                ServiceEvent::Notification(e) => envelope(&kind, e),
                ServiceEvent::LevelProgress(e) => envelope(&kind, e),
                _ => None,
            },
            Event::Parser(ParserEvent::PlayerJoin(e)) => envelope(&kind, e),
            Event::Parser(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::service::{NotificationEvent, NotificationSeverity};

    #[test]
    fn client_json_carries_type_and_iso_timestamp() {
        let event = Event::Service(ServiceEvent::Notification(NotificationEvent {
            timestamp: NaiveDateTime::parse_from_str(
                "2025-11-26 20:02:54.023",
                "%Y-%m-%d %H:%M:%S%.3f",
            )
            .unwrap(),
            title: "Stats Reset".to_string(),
            content: "All statistics have been reset.".to_string(),
            severity: NotificationSeverity::Info,
            duration: Some(3000),
        }));

        let json = event.to_client_json().unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["severity"], "info");
        assert!(json["timestamp"]
            .as_str()
            .unwrap()
            .starts_with("2025-11-26T20:02:54"));
    }

    #[test]
    fn internal_events_are_not_projected() {
        let event = Event::Service(ServiceEvent::RequestInventory(
            crate::events::service::RequestInventoryEvent { timestamp: now() },
        ));
        assert!(event.to_client_json().is_none());
    }
}
