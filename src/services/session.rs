//! Session service: farming session lifecycle.
//!
//! At most one session is active at a time. Shutdown intentionally leaves
//! the active session open so it can be restored on the next start.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{subscribe, PlayerTracker, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::ParserEventKind;
use crate::events::service::{
    NotificationEvent, NotificationSeverity, PlayerChangedEvent, SessionControlAction,
    SessionFinishedEvent, SessionRestoreEvent, SessionSnapshotEvent, SessionStartedEvent,
};
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent, ServiceEventKind};
use crate::storage::{Database, SessionRow};

pub struct SessionService {
    bus: Arc<EventBus>,
    db: Arc<Database>,
    tracker: Arc<PlayerTracker>,
    current: Mutex<Option<SessionRow>>,
}

impl SessionService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "SessionService",
        version: "0.1.0",
        requires: &[],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        info!("📋 SessionService initialized");
        Self {
            bus: Arc::clone(&ctx.bus),
            db: Arc::clone(&ctx.db),
            tracker: Arc::new(PlayerTracker::default()),
            current: Mutex::new(None),
        }
    }

    fn restore_event(session: &SessionRow) -> SessionRestoreEvent {
        SessionRestoreEvent {
            timestamp: crate::events::now(),
            session_id: session.id,
            player_name: session
                .player_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            started_at: session.started_at,
            total_maps: session.total_maps,
            total_time: session.total_time,
            currency_total: session.currency_total,
            currency_per_hour: session.currency_per_hour,
            currency_per_map: session.currency_per_map,
            exp_total: session.exp_total,
            exp_per_hour: session.exp_per_hour,
            exp_gained_total: 0.0,
            exp_lost_total: 0.0,
        }
    }

    async fn start_session(&self, player_name: Option<String>) -> Result<()> {
        let Some(player_name) = player_name else {
            info!("📋 No player name provided, aborting session start");
            return Ok(());
        };

        if self.current.lock().is_some() {
            self.close_session().await?;
        }

        let player = self.db.touch_player(&player_name)?;
        let session = self
            .db
            .create_session(player.id, &player_name, crate::events::now())?;
        info!("📋 Started new session {} for player: {player_name}", session.id);

        let started = SessionStartedEvent {
            timestamp: crate::events::now(),
            session_id: session.id,
            player_name: player_name.clone(),
            started_at: session.started_at,
            description: session.description.clone(),
        };
        *self.current.lock() = Some(session);
        self.bus.publish(ServiceEvent::SessionStarted(started)).await;
        Ok(())
    }

    async fn close_session(&self) -> Result<()> {
        let closed = {
            let mut current = self.current.lock();
            let Some(mut session) = current.take() else {
                warn!("📋 No active session to close");
                return Ok(());
            };
            session.ended_at = Some(crate::events::now());
            session.is_active = false;
            session
        };
        self.db.save_session(&closed)?;

        info!(
            "📋 Closed session {} - Maps: {}, Currency: {:.2}, Currency/hr: {:.2}",
            closed.id, closed.total_maps, closed.total_currency_delta, closed.currency_per_hour
        );

        self.bus
            .publish(ServiceEvent::SessionFinished(SessionFinishedEvent {
                timestamp: crate::events::now(),
                session_id: closed.id,
                player_name: closed
                    .player_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                started_at: closed.started_at,
                ended_at: closed.ended_at.unwrap_or_else(crate::events::now),
                total_maps: closed.total_maps,
                total_currency_delta: closed.total_currency_delta,
                currency_per_hour: closed.currency_per_hour,
                currency_per_map: closed.currency_per_map,
                description: closed.description,
            }))
            .await;
        Ok(())
    }

    /// Fold the latest rates into the active session row. Auto-starts a
    /// session on first activity when a player is already known.
    async fn on_stats_update(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::StatsUpdate(e)) = event else {
            return Ok(());
        };

        if self.current.lock().is_none() {
            match self.tracker.player_name() {
                Some(name) => self.start_session(Some(name)).await?,
                None => {
                    debug!("📋 Skipping session start - no player name available yet");
                    return Ok(());
                }
            }
        }

        let session = {
            let mut current = self.current.lock();
            let Some(session) = current.as_mut() else {
                return Ok(());
            };
            session.total_maps = e.total_maps;
            session.total_currency_delta = e.currency_per_map * e.total_maps as f64;
            session.currency_per_hour = e.currency_per_hour;
            session.currency_per_map = e.currency_per_map;
            session.total_time = e.total_time;
            // Stored as the restore seed; exp/hour doubles as the total.
            session.exp_total = e.exp_per_hour;
            session.exp_per_hour = e.exp_per_hour;
            session.currency_total = e.currency_total;
            session.clone()
        };
        self.db.save_session(&session)?;
        debug!("📋 Updated session {} with latest stats", session.id);
        Ok(())
    }

    async fn on_session_control(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::SessionControl(e)) = event else {
            return Ok(());
        };
        info!("📋 Session control action: {:?}", e.action);

        match e.action {
            SessionControlAction::Start => {
                let name = e.player_name.or_else(|| self.tracker.player_name());
                self.start_session(name).await?;
            }
            SessionControlAction::Close => self.close_session().await?,
            SessionControlAction::Next => {
                self.close_session().await?;
                let name = e.player_name.or_else(|| self.tracker.player_name());
                self.start_session(name).await?;
            }
        }
        Ok(())
    }

    /// Derives PLAYER_CHANGED and adopts a persisted active session for the
    /// joining player when it differs from the one in memory.
    async fn on_player_join(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::PlayerJoin(e)) = event else {
            return Ok(());
        };

        let previous = self.tracker.player_name();
        if previous.as_deref() != Some(e.player_name.as_str()) {
            self.bus
                .publish(ServiceEvent::PlayerChanged(PlayerChangedEvent {
                    timestamp: crate::events::now(),
                    old_player: previous,
                    new_player: e.player_name.clone(),
                }))
                .await;
        }
        self.tracker.set_player(&e.player_name);

        let stored = self.db.find_active_session(Some(&e.player_name))?;
        let adopt = {
            let current = self.current.lock();
            match (&stored, current.as_ref()) {
                (Some(stored), Some(current)) if stored.id == current.id => {
                    debug!("📋 Active session {} already loaded, skipping restore", current.id);
                    None
                }
                (Some(stored), _) => Some(stored.clone()),
                (None, _) => None,
            }
        };

        if let Some(session) = adopt {
            info!("📋 Found different active session in DB (id={}), restoring...", session.id);
            let restore = Self::restore_event(&session);
            *self.current.lock() = Some(session);
            self.bus.publish(ServiceEvent::SessionRestore(restore)).await;
        }
        Ok(())
    }

    async fn on_player_changed(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::PlayerChanged(e)) = event else {
            return Ok(());
        };
        info!("📋 Player changed: {:?} → {}", e.old_player, e.new_player);

        if self.current.lock().is_some() {
            self.close_session().await?;
        }
        self.start_session(Some(e.new_player)).await
    }

    async fn on_request_session(&self, event: Event) -> Result<()> {
        if !matches!(event, Event::Service(ServiceEvent::RequestSession(_))) {
            return Ok(());
        }
        let snapshot = {
            let current = self.current.lock();
            SessionSnapshotEvent {
                timestamp: crate::events::now(),
                session_id: current.as_ref().map(|s| s.id),
                player_name: self.tracker.player_name(),
                started_at: current.as_ref().map(|s| s.started_at),
                is_active: current.is_some(),
            }
        };
        debug!(
            "📋 Published session snapshot: session_id={:?}, active={}",
            snapshot.session_id, snapshot.is_active
        );
        self.bus
            .publish(ServiceEvent::SessionSnapshot(snapshot))
            .await;
        Ok(())
    }

    /// On the login screen, warn the user when a session is still running.
    async fn on_game_view(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::GameView(e)) = event else {
            return Ok(());
        };
        if !e.view.contains("Login") {
            return Ok(());
        }

        info!("📋 Login screen detected, checking for active sessions...");
        if let Some(session) = self.db.find_active_session(None)? {
            let player = session
                .player_name
                .unwrap_or_else(|| "Unknown".to_string());
            info!("📋 Sent notification about active session for player: {player}");
            self.bus
                .publish(ServiceEvent::Notification(NotificationEvent {
                    timestamp: crate::events::now(),
                    title: "Active Session Found".to_string(),
                    content: format!("There is an active session for player: {player}"),
                    severity: NotificationSeverity::Warning,
                    duration: Some(8000),
                }))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for SessionService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        self.tracker.register(bus, "SessionService");
        subscribe!(bus, self, EventKind::Service(ServiceEventKind::StatsUpdate), on_stats_update);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::SessionControl),
            on_session_control
        );
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::PlayerJoin), on_player_join);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::PlayerChanged),
            on_player_changed
        );
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::RequestSession),
            on_request_session
        );
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::GameView), on_game_view);
    }

    async fn startup(&self) -> Result<()> {
        info!("📋 SessionService started");
        Ok(())
    }

    /// Rehydrate the persisted active session, if any, with every handler
    /// already subscribed.
    async fn post_startup(&self) -> Result<()> {
        match self.db.find_active_session(None)? {
            Some(session) => {
                info!("📋 Found active session {}, restoring...", session.id);
                let restore = Self::restore_event(&session);
                *self.current.lock() = Some(session);
                self.bus.publish(ServiceEvent::SessionRestore(restore)).await;
            }
            None => info!("📋 No active session found, ready to start new session"),
        }
        Ok(())
    }

    /// The active session is deliberately left open across restarts.
    async fn shutdown(&self) -> Result<()> {
        info!("📋 SessionService shutdown - preserving active session for restore");
        Ok(())
    }
}
