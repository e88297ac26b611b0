//! Inventory service: the live projection of the player's bags.
//!
//! Applies every observed slot change, tracks dirty slots, and flushes them
//! to storage on a throttle (or immediately when menus close into combat).
//! Other services read the inventory exclusively through snapshot events.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::model::{Inventory, InventoryItem, InventorySnapshot};
use super::{subscribe, PlayerTracker, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::ParserEventKind;
use crate::events::service::{InventorySnapshotEvent, InventoryUpdateEvent};
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent, ServiceEventKind};
use crate::storage::Database;

struct InventoryState {
    inventory: Inventory,
    dirty_slots: HashSet<(i64, i64)>,
    last_change: Instant,
}

pub struct InventoryService {
    bus: Arc<EventBus>,
    db: Arc<Database>,
    update_interval: Duration,
    tracker: Arc<PlayerTracker>,
    state: Mutex<InventoryState>,
}

impl InventoryService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "InventoryService",
        version: "0.1.0",
        requires: &[],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        info!("🧱 InventoryService initialized");
        Self {
            bus: Arc::clone(&ctx.bus),
            db: Arc::clone(&ctx.db),
            update_interval: Duration::from_secs_f64(ctx.config.inventory.update_interval),
            tracker: Arc::new(PlayerTracker::default()),
            state: Mutex::new(InventoryState {
                inventory: Inventory::new(),
                dirty_slots: HashSet::new(),
                last_change: Instant::now(),
            }),
        }
    }

    /// Rebuild the in-memory inventory from storage for `player_name`.
    async fn load_inventory(&self, player_name: &str) -> Result<Inventory> {
        let player = self.db.touch_player(player_name)?;
        let rows = self.db.load_inventory(player.id)?;

        let mut inventory = Inventory::new();
        for row in &rows {
            inventory.change_item(
                row.page,
                row.slot,
                row.item_id,
                row.quantity,
                row.name.clone(),
                row.category.clone(),
            );
        }
        info!(
            "🧱 Loaded inventory for {player_name} with {} items",
            inventory.len()
        );

        let mut state = self.state.lock();
        state.inventory = inventory.clone();
        state.dirty_slots.clear();
        Ok(inventory)
    }

    /// Copy-and-clear the dirty set, then upsert or delete each slot's row.
    /// Unknown items are created on the fly.
    async fn persist_dirty(&self) -> Result<()> {
        let Some(player_name) = self.tracker.player_name() else {
            warn!("🧱 Cannot persist inventory: no player name");
            return Ok(());
        };
        let player = self.db.touch_player(&player_name)?;

        let dirty: Vec<((i64, i64), Option<InventoryItem>)> = {
            let mut state = self.state.lock();
            if state.dirty_slots.is_empty() {
                return Ok(());
            }
            let slots = std::mem::take(&mut state.dirty_slots);
            slots
                .into_iter()
                .map(|key| (key, state.inventory.slots.get(&key).cloned()))
                .collect()
        };

        debug!("🧱 Persisting {} dirty slots", dirty.len());
        for ((page, slot), item) in &dirty {
            match item {
                Some(item) => {
                    self.db
                        .ensure_item(item.item_id, item.name.as_deref(), item.category.as_deref())?;
                    self.db
                        .upsert_inventory_slot(player.id, *page, *slot, item.item_id, item.quantity)?;
                }
                None => self.db.delete_inventory_slot(player.id, *page, *slot)?,
            }
        }
        info!("🧱 Saved {} inventory changes", dirty.len());
        Ok(())
    }

    /// BAG_MODIFY and ITEM_CHANGE both land here: apply the slot, mark it
    /// dirty, and flush when enough wall time has passed.
    async fn on_slot_change(&self, event: Event) -> Result<()> {
        let (page, slot, item_id, quantity, name, category) = match event {
            Event::Parser(ParserEvent::BagModify(e)) => {
                (e.page, e.slot, e.item_id, e.quantity, e.name, e.category)
            }
            Event::Parser(ParserEvent::ItemChange(e)) => {
                (e.page, e.slot, e.item_id, e.amount, e.name, e.category)
            }
            _ => return Ok(()),
        };

        let should_flush = {
            let mut state = self.state.lock();
            state
                .inventory
                .change_item(page, slot, item_id, quantity, name, category);
            state.dirty_slots.insert((page, slot));
            debug!("🧱 Updated slot P@{page}:S@{slot} -> {item_id}:{quantity}");

            let elapsed = state.last_change.elapsed();
            state.last_change = Instant::now();
            elapsed >= self.update_interval && !state.dirty_slots.is_empty()
        };

        if should_flush {
            self.persist_dirty().await?;
        }
        Ok(())
    }

    /// Menus closed, combat entered: force a flush.
    async fn on_game_view(&self, event: Event) -> Result<()> {
        if let Event::Parser(ParserEvent::GameView(e)) = event {
            if e.view.contains("FightCtrl") {
                debug!("🧱 Menus closed, persisting inventory");
                self.persist_dirty().await?;
            }
        }
        Ok(())
    }

    async fn on_inventory_request(&self, event: Event) -> Result<()> {
        if !matches!(event, Event::Service(ServiceEvent::RequestInventory(_))) {
            return Ok(());
        }
        let snapshot = {
            let state = self.state.lock();
            InventorySnapshot::from_inventory(&state.inventory)
        };
        self.bus
            .publish(ServiceEvent::InventorySnapshot(InventorySnapshotEvent {
                timestamp: crate::events::now(),
                snapshot,
            }))
            .await;
        Ok(())
    }

    async fn on_player_changed(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::PlayerChanged(e)) = event else {
            return Ok(());
        };
        info!("🧱 Player changed: {}, loading inventory", e.new_player);
        self.tracker.set_player(&e.new_player);
        let inventory = self.load_inventory(&e.new_player).await?;
        self.bus
            .publish(ServiceEvent::InventoryUpdate(InventoryUpdateEvent {
                timestamp: crate::events::now(),
                inventory,
            }))
            .await;
        Ok(())
    }

    async fn on_session_restore(&self, event: Event) -> Result<()> {
        let Event::Service(ServiceEvent::SessionRestore(e)) = event else {
            return Ok(());
        };
        info!("🧱 Restoring session for {}, loading inventory", e.player_name);
        let inventory = self.load_inventory(&e.player_name).await?;
        self.bus
            .publish(ServiceEvent::InventoryUpdate(InventoryUpdateEvent {
                timestamp: crate::events::now(),
                inventory,
            }))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Service for InventoryService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        self.tracker.register(bus, "InventoryService");
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::BagModify), on_slot_change);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ItemChange), on_slot_change);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::GameView), on_game_view);
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::RequestInventory),
            on_inventory_request
        );
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::PlayerChanged),
            on_player_changed
        );
        subscribe!(
            bus,
            self,
            EventKind::Service(ServiceEventKind::SessionRestore),
            on_session_restore
        );
    }

    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("🧱 Shutting down, persisting remaining inventory changes");
        self.persist_dirty().await
    }
}
