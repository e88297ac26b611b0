//! Map service: frames map runs and persists their outcome.
//!
//! Level ids below 1000 are hubs/zones; the guardrails keep hub traffic from
//! opening or closing runs. The pre-entry snapshot (taken when the map
//! selection UI opens) is the baseline for consumed-item (entry fee)
//! accounting.

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::model::{InventoryItem, InventorySnapshot};
use super::{subscribe, PlayerTracker, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::{AffixInfo, ParserEventKind};
use crate::events::service::{
    MapFinishedEvent, MapRecordEvent, MapStartedEvent, MapStatsEvent, RequestInventoryEvent,
    RequestSessionEvent,
};
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent, ServiceEventKind};
use crate::items::ItemCatalog;
use crate::maps::{MapData, MapTable};
use crate::prices::PriceBook;
use crate::storage::Database;

lazy_static! {
    static ref HTML_TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const HUB_LEVEL_THRESHOLD: i64 = 1000;

/// Map run FSM. `Paused` is reserved: no parser currently drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Farming,
    #[allow(dead_code)]
    Paused,
}

struct MapRunState {
    state: RunState,
    current_map_id: Option<i64>,
    current_map_uuid: Option<i64>,
    current_map: Option<MapData>,
    /// Map id of the run being recorded; survives until the completion row
    /// is written.
    last_level_id: Option<i64>,
    map_start_time: Option<chrono::NaiveDateTime>,
    /// Inventory at map start, baseline for the finish diff.
    inventory: Option<InventorySnapshot>,
    /// Inventory when the map selection UI opened.
    pre_enter: Option<InventorySnapshot>,
    consumed_items: Vec<InventoryItem>,
    /// First affix batch of the current run; later batches are ignored.
    current_affixes: Option<Vec<AffixInfo>>,
}

pub struct MapService {
    bus: Arc<EventBus>,
    db: Arc<Database>,
    prices: Arc<PriceBook>,
    catalog: Arc<ItemCatalog>,
    maps: Arc<MapTable>,
    tracker: Arc<PlayerTracker>,
    state: Mutex<MapRunState>,
}

impl MapService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "MapService",
        version: "0.1.0",
        requires: &[("InventoryService", ">=0.1.0")],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            bus: Arc::clone(&ctx.bus),
            db: Arc::clone(&ctx.db),
            prices: Arc::clone(&ctx.prices),
            catalog: Arc::clone(&ctx.catalog),
            maps: Arc::clone(&ctx.maps),
            tracker: Arc::new(PlayerTracker::default()),
            state: Mutex::new(MapRunState {
                state: RunState::Idle,
                current_map_id: None,
                current_map_uuid: None,
                current_map: None,
                last_level_id: None,
                map_start_time: None,
                inventory: None,
                pre_enter: None,
                consumed_items: Vec::new(),
                current_affixes: None,
            }),
        }
    }

    async fn request_snapshot(&self) -> Option<InventorySnapshot> {
        let response = self
            .bus
            .request_and_wait(
                ServiceEvent::RequestInventory(RequestInventoryEvent {
                    timestamp: crate::events::now(),
                }),
                EventKind::Service(ServiceEventKind::InventorySnapshot),
                REQUEST_TIMEOUT,
            )
            .await;
        match response {
            Some(Event::Service(ServiceEvent::InventorySnapshot(e))) => Some(e.snapshot),
            _ => None,
        }
    }

    async fn start_map(&self, level_id: i64, level_uid: i64, level_type: i64) {
        debug!("🗺️ Starting map: {level_id} (UID: {level_uid})");
        let map = self.maps.get(level_id);
        let start_time = crate::events::now();
        {
            let mut state = self.state.lock();
            state.state = RunState::Farming;
            state.current_map_id = Some(level_id);
            state.current_map_uuid = Some(level_uid);
            state.last_level_id = Some(level_id);
            state.map_start_time = Some(start_time);
            state.current_map = map.clone();
            state.current_affixes = None;
        }

        let snapshot = self.request_snapshot().await;
        let consumed = {
            let mut state = self.state.lock();
            state.inventory = snapshot;
            let consumed = self.consumed_between(&state);
            state.consumed_items = consumed.clone();
            consumed
        };

        self.bus
            .publish(ServiceEvent::MapStarted(MapStartedEvent {
                timestamp: start_time,
                level_id,
                level_uid,
                level_type,
                map,
                consumed_items: consumed,
            }))
            .await;
        debug!("🗺️ Published map started for {level_id}");
    }

    async fn end_map(&self) {
        let end_time = crate::events::now();
        let (duration, map, affixes) = {
            let mut state = self.state.lock();
            debug!("🗺️ Ending map: {:?}", state.current_map_id);
            let duration = state
                .map_start_time
                .map(|start| (end_time - start).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0)
                .max(0.0);
            state.state = RunState::Idle;
            state.current_map_id = None;
            state.current_map_uuid = None;
            (duration, state.current_map.clone(), state.current_affixes.clone())
        };

        let end_inventory = self.request_snapshot().await;
        let inventory_changes: HashMap<i64, i64> = {
            let state = self.state.lock();
            match (&end_inventory, &state.inventory) {
                (Some(end), Some(start)) => end.compare_with(start),
                _ => HashMap::new(),
            }
        };

        self.bus
            .publish(ServiceEvent::MapFinished(MapFinishedEvent {
                timestamp: end_time,
                duration,
                inventory_changes,
                map,
                affixes,
            }))
            .await;

        // Cleared only after the finish chain (including MAP_STATS handling)
        // has fully run.
        let mut state = self.state.lock();
        state.map_start_time = None;
        state.current_map = None;
        state.current_affixes = None;
        state.pre_enter = None;
        debug!("🗺️ Published map finished - Duration: {duration:.2}s");
    }

    /// Slots where the start-of-map total is below the pre-entry total are
    /// entry costs.
    fn consumed_between(&self, state: &MapRunState) -> Vec<InventoryItem> {
        let (Some(pre_enter), Some(inventory)) = (&state.pre_enter, &state.inventory) else {
            return Vec::new();
        };

        let mut consumed = Vec::new();
        for (item_id, delta) in inventory.compare_with(pre_enter) {
            if delta < 0 {
                let info = self.catalog.lookup(item_id);
                consumed.push(InventoryItem {
                    item_id,
                    quantity: -delta,
                    name: info.name,
                    category: info.category,
                });
            }
        }
        if !consumed.is_empty() {
            let summary: Vec<String> = consumed
                .iter()
                .map(|c| format!("{} x{}", c.name.as_deref().unwrap_or("?"), c.quantity))
                .collect();
            debug!("🗺️ Consumed items: {}", summary.join(", "));
        }
        consumed
    }

    async fn current_session_id(&self) -> Option<i64> {
        let response = self
            .bus
            .request_and_wait(
                ServiceEvent::RequestSession(RequestSessionEvent {
                    timestamp: crate::events::now(),
                }),
                EventKind::Service(ServiceEventKind::SessionSnapshot),
                REQUEST_TIMEOUT,
            )
            .await;
        match response {
            Some(Event::Service(ServiceEvent::SessionSnapshot(e))) if e.is_active => e.session_id,
            _ => None,
        }
    }

    async fn on_inventory_update(&self, event: Event) -> Result<()> {
        if let Event::Service(ServiceEvent::InventoryUpdate(e)) = event {
            let mut state = self.state.lock();
            state.inventory = Some(InventorySnapshot::from_inventory(&e.inventory));
            debug!(
                "🗺️ Inventory updated from database - {} items",
                e.inventory.len()
            );
        }
        Ok(())
    }

    async fn on_stage_affix(&self, event: Event) -> Result<()> {
        if let Event::Parser(ParserEvent::StageAffix(e)) = event {
            let mut state = self.state.lock();
            if state.current_affixes.is_none() {
                info!("🗺️ Captured {} affixes", e.affixes.len());
                state.current_affixes = Some(e.affixes);
            } else {
                debug!("🗺️ Ignoring subsequent affix event");
            }
        }
        Ok(())
    }

    /// The map selection UI is the last stop before entering: snapshot the
    /// inventory as the consumed-item baseline.
    async fn on_game_view(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::GameView(e)) = event else {
            return Ok(());
        };
        if e.view.ends_with("MysteryAreaCtrl") {
            debug!("🗺️ Map selection opened, capturing pre-enter snapshot");
            let snapshot = self.request_snapshot().await;
            let mut state = self.state.lock();
            if let Some(snapshot) = snapshot {
                debug!("🗺️ Pre-enter snapshot captured - {} items", snapshot.data.len());
                state.pre_enter = Some(snapshot);
            }
        }
        Ok(())
    }

    async fn on_enter_level(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::EnterLevel(e)) = event else {
            return Ok(());
        };

        enum Action {
            Start,
            End,
            Ignore,
        }
        let action = {
            let state = self.state.lock();
            match state.current_map_id {
                None if e.level_id >= HUB_LEVEL_THRESHOLD => Action::Start,
                Some(current) if current == e.level_id => Action::Ignore,
                Some(current)
                    if current < HUB_LEVEL_THRESHOLD && e.level_id >= HUB_LEVEL_THRESHOLD =>
                {
                    Action::Start
                }
                Some(_)
                    if e.level_id < HUB_LEVEL_THRESHOLD && state.state == RunState::Farming =>
                {
                    Action::End
                }
                _ => Action::Ignore,
            }
        };

        match action {
            Action::Start => self.start_map(e.level_id, e.level_uid, e.level_type).await,
            Action::End => self.end_map().await,
            Action::Ignore => debug!("🗺️ Ignoring level entry {}", e.level_id),
        }
        Ok(())
    }

    async fn on_exit_level(&self, event: Event) -> Result<()> {
        if !matches!(event, Event::Parser(ParserEvent::ExitLevel(_))) {
            return Ok(());
        }
        let farming = self.state.lock().state == RunState::Farming;
        if farming {
            self.end_map().await;
        }
        Ok(())
    }

    /// MAP_STATS carries the priced outcome of the finished run; persist the
    /// completion row with its items and affixes, then publish the record.
    async fn on_map_stats(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::MapStats(e)) = event else {
            return Ok(());
        };
        let Some(player_name) = self.tracker.player_name() else {
            debug!("🗺️ Ignoring map stats - no player");
            return Ok(());
        };
        let player = self.db.touch_player(&player_name)?;
        let session_id = self.current_session_id().await;

        let (map_id, map_info, started_at, consumed) = {
            let state = self.state.lock();
            (
                state.last_level_id.unwrap_or(0),
                state.current_map.clone(),
                state.map_start_time.unwrap_or_else(crate::events::now),
                state.consumed_items.clone(),
            )
        };

        let items_gained = e.item_changes.values().filter(|delta| **delta > 0).count() as i64;
        let completion_id = self.db.insert_map_completion(
            player.id,
            &player.name,
            session_id,
            map_id,
            map_info.as_ref().map(|m| m.name.as_str()),
            map_info
                .as_ref()
                .and_then(|m| m.difficulty)
                .map(|d| d.as_str()),
            started_at,
            e.timestamp,
            e.duration,
            e.currency_gained,
            e.exp_gained,
            items_gained,
        )?;

        self.save_affixes(completion_id, e.affixes.as_deref())?;
        self.save_item_changes(completion_id, &e.item_changes, false)?;
        if !consumed.is_empty() {
            let consumed_changes: HashMap<i64, i64> = consumed
                .iter()
                .map(|item| (item.item_id, -item.quantity))
                .collect();
            self.save_item_changes(completion_id, &consumed_changes, true)?;
        }

        let record = match self.db.get_map_completion(completion_id)? {
            Some(row) => serde_json::to_value(&row)?,
            None => serde_json::Value::Null,
        };
        self.bus
            .publish(ServiceEvent::MapRecord(MapRecordEvent {
                timestamp: crate::events::now(),
                map_record: record,
            }))
            .await;

        info!(
            "🗺️ Saved map completion: {} - {:.2}s, {:.2} currency, {items_gained} items",
            map_info.as_ref().map(|m| m.name.as_str()).unwrap_or("Unknown"),
            e.duration,
            e.currency_gained
        );
        Ok(())
    }

    fn save_affixes(&self, completion_id: i64, affixes: Option<&[AffixInfo]>) -> Result<()> {
        let Some(affixes) = affixes else {
            debug!("🗺️ No affixes to save for completion {completion_id}");
            return Ok(());
        };
        for affix in affixes {
            let description = affix
                .description
                .as_deref()
                .map(|raw| HTML_TAG_RE.replace_all(raw, "").to_string());
            let affix_row = self.db.upsert_affix(affix.affix_id, description.as_deref())?;
            self.db.link_map_affix(completion_id, affix_row)?;
        }
        info!("🗺️ Saved {} affixes for completion {completion_id}", affixes.len());
        Ok(())
    }

    fn save_item_changes(
        &self,
        completion_id: i64,
        changes: &HashMap<i64, i64>,
        consumed: bool,
    ) -> Result<()> {
        for (&item_id, &delta) in changes {
            if delta == 0 {
                continue;
            }
            let info = self.catalog.lookup(item_id);
            self.db
                .ensure_item(item_id, info.name.as_deref(), info.category.as_deref())?;
            let total_price = self.prices.get_price(item_id) * delta as f64;
            self.db
                .insert_map_completion_item(completion_id, item_id, delta, total_price, consumed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for MapService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        self.tracker.register(bus, "MapService");
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::EnterLevel), on_enter_level);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ExitLevel), on_exit_level);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::StageAffix), on_stage_affix);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::GameView), on_game_view);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::InventoryUpdate),
            on_inventory_update
        );
        subscribe!(bus, self, EventKind::Service(ServiceEventKind::MapStats), on_map_stats);
    }

    async fn startup(&self) -> Result<()> {
        info!("🗺️ MapService initialized - State: Idle");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("🗺️ MapService shutdown");
        Ok(())
    }
}

impl MapService {
    pub fn run_state(&self) -> RunState {
        self.state.lock().state
    }
}

impl std::fmt::Debug for MapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MapService")
            .field("state", &state.state)
            .field("current_map_id", &state.current_map_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_tags_are_stripped_from_affix_descriptions() {
        let cleaned = HTML_TAG_RE
            .replace_all("<p>Monsters deal <e id=507>extra</e> damage</p>", "")
            .to_string();
        assert_eq!(cleaned, "Monsters deal extra damage");
    }
}
