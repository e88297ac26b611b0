//! Stats service: session rate accounting.
//!
//! Prices inventory deltas into currency totals and per-hour/per-map rates,
//! splits experience into gains and losses, and raises the priced MAP_STATS
//! event when a run finishes. Two gates protect the numbers: deltas only
//! count while the combat view is active, and the first snapshot after a
//! database load is a baseline only (diffing against it would re-count
//! everything the player already owned).

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::model::InventorySnapshot;
use super::{subscribe, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::ParserEventKind;
use crate::events::service::{
    MapStatsEvent, NotificationEvent, NotificationSeverity, RequestInventoryEvent,
    StatsControlAction, StatsUpdateEvent,
};
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent, ServiceEventKind};
use crate::prices::PriceBook;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// Rough exp credit for a level-up mid-map; the real per-level requirement
/// lives in ExperienceService and is not tracked here.
const LEVEL_UP_EXP_ESTIMATE: f64 = 10_000.0;

struct StatsState {
    last_snapshot: Option<InventorySnapshot>,
    baseline_set: bool,
    items_total: HashMap<i64, f64>,
    items_per_hour: HashMap<i64, f64>,

    currency_total: f64,
    currency_per_map: f64,
    currency_per_hour: f64,
    currency_current_per_hour: f64,
    currency_current_raw: f64,
    current_map_entry_cost: f64,

    exp_gained_total: f64,
    exp_lost_total: f64,
    last_exp: Option<i64>,
    last_level: Option<i64>,
    exp_per_hour: f64,

    map_start_exp: i64,
    map_start_level: i64,

    session_start: NaiveDateTime,
    map_start: NaiveDateTime,
    total_maps: i64,
    total_time: f64,

    last_snapshot_time: Option<Instant>,
    current_view: String,
}

impl StatsState {
    fn fresh() -> Self {
        Self {
            last_snapshot: None,
            baseline_set: false,
            items_total: HashMap::new(),
            items_per_hour: HashMap::new(),
            currency_total: 0.0,
            currency_per_map: 0.0,
            currency_per_hour: 0.0,
            currency_current_per_hour: 0.0,
            currency_current_raw: 0.0,
            current_map_entry_cost: 0.0,
            exp_gained_total: 0.0,
            exp_lost_total: 0.0,
            last_exp: None,
            last_level: None,
            exp_per_hour: 0.0,
            map_start_exp: 0,
            map_start_level: 1,
            session_start: crate::events::now(),
            map_start: crate::events::now(),
            total_maps: 0,
            total_time: 0.0,
            last_snapshot_time: None,
            current_view: "unknown".to_string(),
        }
    }

    fn hours_since_session_start(&self) -> f64 {
        (crate::events::now() - self.session_start).num_milliseconds() as f64 / 3_600_000.0
    }

    fn build_update(&mut self) -> StatsUpdateEvent {
        let now = crate::events::now();
        let session_duration = (now - self.session_start).num_milliseconds() as f64 / 1000.0;
        let map_duration = (now - self.map_start).num_milliseconds() as f64 / 1000.0;
        let current_per_hour = if map_duration > 0.0 {
            self.currency_current_raw / (map_duration / 3600.0)
        } else {
            0.0
        };
        self.currency_current_per_hour = current_per_hour;

        StatsUpdateEvent {
            timestamp: now,
            total_maps: self.total_maps,
            total_time: self.total_time,
            session_duration,
            items_per_hour: self.items_per_hour.clone(),
            exp_per_hour: self.exp_per_hour,
            exp_gained_total: self.exp_gained_total,
            exp_lost_total: self.exp_lost_total,
            currency_per_map: self.currency_per_map,
            currency_per_hour: self.currency_per_hour,
            currency_total: self.currency_total,
            currency_current_per_hour: current_per_hour,
            currency_current_raw: self.currency_current_raw,
            map_timer: map_duration,
        }
    }
}

pub struct StatsService {
    bus: Arc<EventBus>,
    prices: Arc<PriceBook>,
    snapshot_interval: Duration,
    state: Mutex<StatsState>,
}

impl StatsService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "StatsService",
        version: "0.1.0",
        requires: &[
            ("InventoryService", ">=0.1.0"),
            ("MapService", ">=0.1.0"),
            ("SessionService", ">=0.1.0"),
        ],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        info!("📊 StatsService initialized");
        Self {
            bus: Arc::clone(&ctx.bus),
            prices: Arc::clone(&ctx.prices),
            snapshot_interval: Duration::from_secs_f64(ctx.config.stats.snapshot_interval),
            state: Mutex::new(StatsState::fresh()),
        }
    }

    async fn publish_stats(&self) {
        let update = self.state.lock().build_update();
        info!(
            "📊 Publishing stats update - Total: {:.2}/h, Current: {:.2} | {:.2}/h, Per Map: {:.2}/map",
            update.currency_per_hour,
            update.currency_current_raw,
            update.currency_current_per_hour,
            update.currency_per_map
        );
        self.bus.publish(ServiceEvent::StatsUpdate(update)).await;
    }

    /// Entry cost accounting: consumed items are paid up front, so the
    /// session total drops and the current map starts in the red.
    async fn on_map_started(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::MapStarted(e)) = event else {
            return Ok(());
        };
        info!("📊 Map started: {}", e.level_id);
        if let Some(map) = &e.map {
            info!("📊 Map details: {} [{:?}]", map.name, map.difficulty);
        }

        let mut entry_cost = 0.0;
        for item in &e.consumed_items {
            let price = self.prices.get_price(item.item_id);
            let cost = price * item.quantity as f64;
            info!(
                "📊 Consumed item {} {:?} x{} (-{cost:.2})",
                item.item_id, item.name, item.quantity
            );
            entry_cost += cost;
        }
        info!("📊 Total map entry cost: {entry_cost:.2}");

        let mut state = self.state.lock();
        state.map_start = e.timestamp;
        state.map_start_exp = state.last_exp.unwrap_or(0);
        state.map_start_level = state.last_level.unwrap_or(1);
        state.current_map_entry_cost = entry_cost;
        state.currency_total -= entry_cost;
        state.currency_current_raw = -entry_cost;
        debug!("📊 Currency after entry cost: {:.2}", state.currency_total);
        Ok(())
    }

    async fn on_map_finished(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::MapFinished(e)) = event else {
            return Ok(());
        };
        debug!(
            "📊 Map finished - Duration: {:.2}s, Changes: {}",
            e.duration,
            e.inventory_changes.len()
        );

        {
            let mut state = self.state.lock();
            state.total_maps += 1;
            state.total_time += e.duration;
        }

        // One more snapshot to catch trailing pickups; the response flows
        // through on_inventory_snapshot before the wait returns.
        self.bus
            .request_and_wait(
                ServiceEvent::RequestInventory(RequestInventoryEvent {
                    timestamp: crate::events::now(),
                }),
                EventKind::Service(ServiceEventKind::InventorySnapshot),
                REQUEST_TIMEOUT,
            )
            .await;

        let stats_event = {
            let state = self.state.lock();
            let current_exp = state.last_exp.unwrap_or(0);
            let current_level = state.last_level.unwrap_or(1);
            let map_exp_gained = if current_level > state.map_start_level {
                current_exp as f64
                    + (current_level - state.map_start_level) as f64 * LEVEL_UP_EXP_ESTIMATE
            } else if current_level == state.map_start_level {
                (current_exp - state.map_start_exp).max(0) as f64
            } else {
                0.0
            };

            let currency_drops: f64 = e
                .inventory_changes
                .iter()
                .map(|(&item_id, &delta)| self.prices.get_price(item_id) * delta as f64)
                .sum();
            let currency_gained = currency_drops - state.current_map_entry_cost;

            MapStatsEvent {
                timestamp: crate::events::now(),
                duration: e.duration,
                item_changes: e.inventory_changes.clone(),
                currency_gained,
                exp_gained: map_exp_gained,
                affixes: e.affixes.clone(),
            }
        };

        let (total_maps, total_time) = {
            let state = self.state.lock();
            (state.total_maps, state.total_time)
        };
        info!(
            "📊 Map finished: {} - Duration: {:.2}s, Currency: {:.2} - Total: {} maps, {:.2}s",
            e.map.as_ref().map(|m| m.name.as_str()).unwrap_or("Unknown"),
            e.duration,
            stats_event.currency_gained,
            total_maps,
            total_time
        );

        self.bus.publish(ServiceEvent::MapStats(stats_event)).await;
        self.publish_stats().await;
        Ok(())
    }

    async fn on_game_view(&self, event: Event) -> Result<()> {
        if let Event::Parser(ParserEvent::GameView(e)) = event {
            self.state.lock().current_view = e.view;
        }
        Ok(())
    }

    /// Item changes trigger snapshot requests, throttled to one per
    /// interval.
    async fn on_item_change(&self, event: Event) -> Result<()> {
        if !matches!(event, Event::Parser(ParserEvent::ItemChange(_))) {
            return Ok(());
        }

        let should_snapshot = {
            let mut state = self.state.lock();
            let due = match state.last_snapshot_time {
                None => true,
                Some(last) => last.elapsed() >= self.snapshot_interval,
            };
            if due {
                state.last_snapshot_time = Some(Instant::now());
            }
            due
        };

        if should_snapshot {
            debug!("📊 Item changed, requesting snapshot");
            self.bus
                .publish(ServiceEvent::RequestInventory(RequestInventoryEvent {
                    timestamp: crate::events::now(),
                }))
                .await;
        }
        Ok(())
    }

    async fn on_inventory_snapshot(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::InventorySnapshot(e)) = event else {
            return Ok(());
        };

        let publish = {
            let mut state = self.state.lock();
            let snapshot = e.snapshot;

            if state.last_snapshot.is_none() {
                debug!("📊 First snapshot received - setting as baseline");
                state.last_snapshot = Some(snapshot);
                return Ok(());
            }

            if !state.baseline_set {
                // First comparison after a database load would count every
                // stored item as a drop; skip it.
                debug!("📊 Skipping first comparison after baseline (loaded from DB)");
                state.baseline_set = true;
                state.last_snapshot = Some(snapshot);
                return Ok(());
            }

            if !state.current_view.contains("FightCtrl") {
                debug!("📊 Not in fighting view - skipping snapshot processing");
                state.last_snapshot = Some(snapshot);
                return Ok(());
            }

            let changes = snapshot.compare_with(state.last_snapshot.as_ref().unwrap());
            let mut publish = false;
            if !changes.is_empty() {
                let mut currency_gained = 0.0;
                for (&item_id, &delta) in &changes {
                    *state.items_total.entry(item_id).or_insert(0.0) += delta as f64;
                    currency_gained += self.prices.get_price(item_id) * delta as f64;
                }
                state.currency_total += currency_gained;
                state.currency_current_raw += currency_gained;

                let hours = state.hours_since_session_start();
                if hours > 0.0 {
                    let totals: Vec<(i64, f64)> =
                        state.items_total.iter().map(|(k, v)| (*k, *v)).collect();
                    for (item_id, total) in totals {
                        state.items_per_hour.insert(item_id, total / hours);
                    }
                    state.currency_per_hour = state.currency_total / hours;
                }
                if state.total_maps > 0 {
                    state.currency_per_map = state.currency_total / state.total_maps as f64;
                }

                debug!(
                    "📊 Snapshot diff: currency={currency_gained:.2}, items={}",
                    changes.len()
                );
                publish = true;
            }
            state.last_snapshot = Some(snapshot);
            publish
        };

        if publish {
            self.publish_stats().await;
        }
        Ok(())
    }

    /// Gains and losses are tracked separately; a level decrease is a loss.
    async fn on_exp_update(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::ExpUpdate(e)) = event else {
            return Ok(());
        };

        let mut state = self.state.lock();
        if let (Some(last_exp), Some(last_level)) = (state.last_exp, state.last_level) {
            let exp_change: i64 = if e.level > last_level {
                // Level up resets the counter; credit the new level's exp.
                e.experience
            } else if e.level == last_level {
                e.experience - last_exp
            } else {
                -(last_exp - e.experience)
            };

            if exp_change > 0 {
                state.exp_gained_total += exp_change as f64;
                debug!(
                    "📊 EXP: +{exp_change} gained (total gained: {:.0})",
                    state.exp_gained_total
                );
            } else if exp_change < 0 {
                state.exp_lost_total += (-exp_change) as f64;
                warn!(
                    "💀 EXP LOSS: {exp_change} (total lost: {:.0})",
                    state.exp_lost_total
                );
            }

            let net = state.exp_gained_total - state.exp_lost_total;
            let hours = state.hours_since_session_start();
            if hours > 0.0 {
                state.exp_per_hour = net / hours;
            }
        }
        state.last_exp = Some(e.experience);
        state.last_level = Some(e.level);
        Ok(())
    }

    /// A database-loaded inventory becomes the new baseline; the next
    /// snapshot must not contribute to rates.
    async fn on_inventory_update(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::InventoryUpdate(e)) = event else {
            return Ok(());
        };
        info!("📊 Inventory loaded from DB");
        let mut state = self.state.lock();
        state.last_snapshot = Some(InventorySnapshot::from_inventory(&e.inventory));
        state.baseline_set = true;
        info!("📊 New baseline: {} slots", e.inventory.len());
        Ok(())
    }

    async fn on_stats_control(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::StatsControl(e)) = event else {
            return Ok(());
        };
        info!("📊 Control action: {:?}", e.action);
        if e.action == StatsControlAction::Restart {
            self.restart_tracking().await;
        }
        Ok(())
    }

    async fn on_session_started(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::SessionStarted(e)) = event else {
            return Ok(());
        };
        info!("📊 Session started for {} - Resetting stats", e.player_name);
        self.restart_tracking().await;
        Ok(())
    }

    async fn on_session_restore(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::SessionRestore(e)) = event else {
            return Ok(());
        };
        info!("📊 Restoring stats from session {}...", e.session_id);

        {
            let mut state = self.state.lock();
            state.total_maps = e.total_maps;
            state.total_time = e.total_time;
            state.currency_total = e.currency_total;
            state.currency_per_hour = e.currency_per_hour;
            state.currency_per_map = e.currency_per_map;
            state.exp_per_hour = e.exp_per_hour;
            state.exp_gained_total = e.exp_gained_total;
            state.exp_lost_total = e.exp_lost_total;
            state.session_start = e.started_at;
        }

        info!(
            "📊 Restored stats - {} maps, {:.2}s, {:.2}/h, {:.0} exp/h",
            e.total_maps, e.total_time, e.currency_per_hour, e.exp_per_hour
        );
        self.publish_stats().await;
        Ok(())
    }

    async fn restart_tracking(&self) {
        *self.state.lock() = StatsState::fresh();
        info!("📊 Stats tracking restarted - All data reset");

        self.bus
            .publish(ServiceEvent::Notification(NotificationEvent {
                timestamp: crate::events::now(),
                title: "Stats Reset".to_string(),
                content: "All statistics have been reset. Starting fresh tracking.".to_string(),
                severity: NotificationSeverity::Info,
                duration: Some(3000),
            }))
            .await;
        self.publish_stats().await;
    }

    /// Current counters, for the query layer and diagnostics.
    pub fn get_stats(&self) -> StatsSummary {
        let state = self.state.lock();
        StatsSummary {
            total_maps: state.total_maps,
            total_time: state.total_time,
            currency_total: state.currency_total,
            currency_per_hour: state.currency_per_hour,
            currency_per_map: state.currency_per_map,
            exp_per_hour: state.exp_per_hour,
            exp_gained_total: state.exp_gained_total,
            exp_lost_total: state.exp_lost_total,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSummary {
    pub total_maps: i64,
    pub total_time: f64,
    pub currency_total: f64,
    pub currency_per_hour: f64,
    pub currency_per_map: f64,
    pub exp_per_hour: f64,
    pub exp_gained_total: f64,
    pub exp_lost_total: f64,
}

#[async_trait]
impl Service for StatsService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        subscribe!(bus, self, EventKind::Service(ServiceEventKind::MapStarted), on_map_started);
        subscribe!(bus, self, EventKind::Service(ServiceEventKind::MapFinished), on_map_finished);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::GameView), on_game_view);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ItemChange), on_item_change);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::InventorySnapshot),
            on_inventory_snapshot
        );
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ExpUpdate), on_exp_update);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::InventoryUpdate),
            on_inventory_update
        );
        subscribe!(bus, self, EventKind::Service(ServiceEventKind::StatsControl), on_stats_control);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::SessionStarted),
            on_session_started
        );
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::SessionRestore),
            on_session_restore
        );
    }

    async fn startup(&self) -> Result<()> {
        info!("📊 StatsService started, waiting for session...");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let state = self.state.lock();
        info!(
            "📊 StatsService shutdown - Maps: {}, Time: {:.2}s",
            state.total_maps, state.total_time
        );
        Ok(())
    }
}
