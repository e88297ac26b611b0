//! Domain services and their container.
//!
//! Every service is a singleton holding private state behind short-lived
//! locks. Handlers are registered explicitly on the bus during `register`;
//! the container instantiates services from a static factory table, checks
//! declared version constraints, and drives the
//! startup -> post_startup -> shutdown lifecycle.

pub mod broadcaster;
pub mod experience;
pub mod inventory;
pub mod map;
pub mod market;
pub mod model;
pub mod session;
pub mod stats;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind, ServiceEvent, ServiceEventKind};
use crate::items::ItemCatalog;
use crate::maps::MapTable;
use crate::prices::PriceBook;
use crate::storage::Database;

/// Collaborators injected into every service at construction. The
/// broadcaster is constructed up front because the HTTP layer registers
/// WebSocket clients on it directly.
#[derive(Clone)]
pub struct ServiceContext {
    pub bus: Arc<EventBus>,
    pub db: Arc<Database>,
    pub prices: Arc<PriceBook>,
    pub catalog: Arc<ItemCatalog>,
    pub maps: Arc<MapTable>,
    pub config: Arc<Config>,
    pub broadcaster: Arc<broadcaster::BroadcastService>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    /// `(service name, version constraint)` pairs, e.g. `(">=0.1.0")`.
    pub requires: &'static [(&'static str, &'static str)],
}

#[async_trait]
pub trait Service: Send + Sync {
    fn descriptor(&self) -> ServiceDescriptor;

    /// Subscribe the service's handlers. Called before `startup`.
    fn register(self: Arc<Self>, bus: &EventBus);

    async fn startup(&self) -> Result<()>;

    /// Runs after every service has started, so cross-service restores find
    /// all handlers subscribed.
    async fn post_startup(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()>;
}

/// Subscribe an `async fn(&self, Event) -> Result<()>` method of a service
/// to an event kind. The handler name (service::method) shows up in bus
/// error logs.
macro_rules! subscribe {
    ($bus:expr, $service:expr, $kind:expr, $method:ident) => {{
        let service = ::std::sync::Arc::clone(&$service);
        let name = format!("{}::{}", service.descriptor().name, stringify!($method));
        $bus.subscribe(
            $kind,
            name,
            ::std::sync::Arc::new(move |event| {
                let service = ::std::sync::Arc::clone(&service);
                Box::pin(async move { service.$method(event).await })
            }),
        );
    }};
}
pub(crate) use subscribe;

// ----------------------------------------------------------------------
// Version constraints
// ----------------------------------------------------------------------

fn parse_version(raw: &str) -> Vec<u64> {
    raw.split('.')
        .map(|part| part.trim().parse().unwrap_or(0))
        .collect()
}

/// Check a dotted version against a constraint like `>=0.1.0`, `==1.0`,
/// `!=2.0`. A bare version means exact equality.
pub fn version_satisfies(installed: &str, constraint: &str) -> bool {
    let constraint = constraint.trim();
    let (op, required) = constraint
        .find(|c: char| c.is_ascii_digit())
        .map(|idx| (constraint[..idx].trim(), &constraint[idx..]))
        .unwrap_or(("==", constraint));
    let op = if op.is_empty() { "==" } else { op };

    let installed = parse_version(installed);
    let required = parse_version(required);

    match op {
        "==" => installed == required,
        "!=" => installed != required,
        ">" => installed > required,
        ">=" => installed >= required,
        "<" => installed < required,
        "<=" => installed <= required,
        other => {
            warn!("Unknown version operator: {other}");
            false
        }
    }
}

// ----------------------------------------------------------------------
// Player/session tracking shared by all services
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    player_name: Option<String>,
    session_id: Option<i64>,
}

/// Tracks the current player and session from the session lifecycle events.
/// Each service owns one so lookups never cross service boundaries.
#[derive(Default)]
pub struct PlayerTracker {
    state: Mutex<TrackerState>,
}

impl PlayerTracker {
    pub fn register(self: &Arc<Self>, bus: &EventBus, owner: &'static str) {
        let on_started = Arc::clone(self);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::SessionStarted),
            format!("{owner}::track_session_started"),
            Arc::new(move |event| {
                let tracker = Arc::clone(&on_started);
                Box::pin(async move {
                    if let Event::Service(ServiceEvent::SessionStarted(e)) = event {
                        let mut state = tracker.state.lock();
                        state.session_id = Some(e.session_id);
                        state.player_name = Some(e.player_name);
                    }
                    Ok(())
                })
            }),
        );

        let on_finished = Arc::clone(self);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::SessionFinished),
            format!("{owner}::track_session_finished"),
            Arc::new(move |event| {
                let tracker = Arc::clone(&on_finished);
                Box::pin(async move {
                    if let Event::Service(ServiceEvent::SessionFinished(_)) = event {
                        tracker.state.lock().session_id = None;
                    }
                    Ok(())
                })
            }),
        );

        let on_restored = Arc::clone(self);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::SessionRestore),
            format!("{owner}::track_session_restore"),
            Arc::new(move |event| {
                let tracker = Arc::clone(&on_restored);
                Box::pin(async move {
                    if let Event::Service(ServiceEvent::SessionRestore(e)) = event {
                        let mut state = tracker.state.lock();
                        state.session_id = Some(e.session_id);
                        state.player_name = Some(e.player_name);
                    }
                    Ok(())
                })
            }),
        );
    }

    pub fn player_name(&self) -> Option<String> {
        self.state.lock().player_name.clone()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.state.lock().session_id
    }

    pub fn set_player(&self, name: &str) {
        self.state.lock().player_name = Some(name.to_string());
    }
}

// ----------------------------------------------------------------------
// Container
// ----------------------------------------------------------------------

pub struct ServiceRegistration {
    pub descriptor: ServiceDescriptor,
    pub factory: fn(&ServiceContext) -> Arc<dyn Service>,
}

/// The built-in service table; the compile-time replacement for runtime
/// discovery.
pub fn builtin_services() -> Vec<ServiceRegistration> {
    vec![
        ServiceRegistration {
            descriptor: inventory::InventoryService::DESCRIPTOR,
            factory: |ctx| Arc::new(inventory::InventoryService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: map::MapService::DESCRIPTOR,
            factory: |ctx| Arc::new(map::MapService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: session::SessionService::DESCRIPTOR,
            factory: |ctx| Arc::new(session::SessionService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: stats::StatsService::DESCRIPTOR,
            factory: |ctx| Arc::new(stats::StatsService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: market::MarketService::DESCRIPTOR,
            factory: |ctx| Arc::new(market::MarketService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: experience::ExperienceService::DESCRIPTOR,
            factory: |ctx| Arc::new(experience::ExperienceService::new(ctx)),
        },
        ServiceRegistration {
            descriptor: broadcaster::BroadcastService::DESCRIPTOR,
            factory: |ctx| Arc::clone(&ctx.broadcaster) as Arc<dyn Service>,
        },
    ]
}

pub struct ServiceContainer {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceContainer {
    /// Instantiate every registration whose declared dependencies are
    /// present with satisfying versions; register handlers and start each
    /// accepted service, then run the post-startup pass.
    pub async fn start(ctx: &ServiceContext, registrations: Vec<ServiceRegistration>) -> Self {
        info!("Loading services...");

        let registry: HashMap<&str, &str> = registrations
            .iter()
            .map(|r| (r.descriptor.name, r.descriptor.version))
            .collect();
        info!(
            "Registered {} services, checking dependencies...",
            registry.len()
        );

        let mut services: Vec<Arc<dyn Service>> = Vec::new();
        for registration in &registrations {
            let descriptor = registration.descriptor;
            if !Self::dependencies_met(&descriptor, &registry) {
                warn!("⚠️  Skipped service {} due to unmet dependencies", descriptor.name);
                continue;
            }

            let service = (registration.factory)(ctx);
            Arc::clone(&service).register(&ctx.bus);
            match service.startup().await {
                Ok(()) => {
                    info!("🔧 Loaded service: {} v{}", descriptor.name, descriptor.version);
                    services.push(service);
                }
                Err(e) => error!("Failed to start {}: {e:#}", descriptor.name),
            }
        }
        info!("✅ Loaded {} services", services.len());

        for service in &services {
            if let Err(e) = service.post_startup().await {
                error!(
                    "Error in post-startup for {}: {e:#}",
                    service.descriptor().name
                );
            } else {
                debug!("✅ Post-startup complete: {}", service.descriptor().name);
            }
        }

        Self { services }
    }

    fn dependencies_met(descriptor: &ServiceDescriptor, registry: &HashMap<&str, &str>) -> bool {
        for (dep_name, constraint) in descriptor.requires {
            match registry.get(dep_name) {
                None => {
                    error!(
                        "Service {} requires {dep_name} {constraint} but it's not registered",
                        descriptor.name
                    );
                    return false;
                }
                Some(version) if !version_satisfies(version, constraint) => {
                    error!(
                        "Service {} requires {dep_name} {constraint}, but version {version} is registered",
                        descriptor.name
                    );
                    return false;
                }
                _ => {}
            }
        }
        true
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.descriptor().name).collect()
    }

    /// Shutdown every service; errors logged, never propagated.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down all services...");
        for service in &self.services {
            if let Err(e) = service.shutdown().await {
                error!("Error shutting down {}: {e:#}", service.descriptor().name);
            } else {
                debug!("✅ Shutdown: {}", service.descriptor().name);
            }
        }
        info!("✅ All services shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_constraint_operators() {
        assert!(version_satisfies("0.1.0", ">=0.1.0"));
        assert!(version_satisfies("0.2.0", ">=0.1.0"));
        assert!(!version_satisfies("0.0.9", ">=0.1.0"));
        assert!(version_satisfies("1.0.0", "==1.0.0"));
        assert!(version_satisfies("1.0.0", "1.0.0"));
        assert!(!version_satisfies("1.0.1", "==1.0.0"));
        assert!(version_satisfies("1.0.1", "!=1.0.0"));
        assert!(version_satisfies("0.9.0", "<1.0"));
        assert!(version_satisfies("1.0", "<=1.0.0"));
        assert!(version_satisfies("2.1", ">2.0.5"));
    }

    #[test]
    fn unmet_dependency_is_detected() {
        let mut registry: HashMap<&str, &str> = HashMap::new();
        registry.insert("InventoryService", "0.1.0");

        let ok = ServiceDescriptor {
            name: "A",
            version: "0.1.0",
            requires: &[("InventoryService", ">=0.1.0")],
        };
        assert!(ServiceContainer::dependencies_met(&ok, &registry));

        let missing = ServiceDescriptor {
            name: "B",
            version: "0.1.0",
            requires: &[("GhostService", ">=0.1.0")],
        };
        assert!(!ServiceContainer::dependencies_met(&missing, &registry));

        let too_old = ServiceDescriptor {
            name: "C",
            version: "0.1.0",
            requires: &[("InventoryService", ">=2.0.0")],
        };
        assert!(!ServiceContainer::dependencies_met(&too_old, &registry));
    }
}
