//! Market service: auction house transaction tracking.
//!
//! While the market view is open, every item change runs through a private
//! copy of the inventory whose per-slot update returns the net cross-slot
//! quantity delta. The game shuffles stacks between slots freely; only that
//! net delta is a real sale or purchase. Consecutive changes to the same
//! item are batched into one transaction.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::model::Inventory;
use super::{subscribe, PlayerTracker, Service, ServiceContext, ServiceDescriptor};
use crate::events::parser::{ItemChangeEvent, ParserEventKind};
use crate::events::service::{
    MarketAction, MarketActionEvent, MarketTransactionEvent, RequestInventoryEvent,
    TransactionAction,
};
use crate::events::{Event, EventBus, EventKind, ParserEvent, ServiceEvent, ServiceEventKind};
use crate::storage::Database;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// Same-item changes further apart than this flush the pending batch.
const BATCH_WINDOW_SECS: i64 = 1;

#[derive(Default)]
struct MarketState {
    open: bool,
    inventory: Option<Inventory>,
    total_quantity: i64,
    last_event: Option<ItemChangeEvent>,
}

pub struct MarketService {
    bus: Arc<EventBus>,
    db: Arc<Database>,
    tracker: Arc<PlayerTracker>,
    state: Mutex<MarketState>,
}

impl MarketService {
    pub const DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "MarketService",
        version: "0.1.0",
        requires: &[],
    };

    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            bus: Arc::clone(&ctx.bus),
            db: Arc::clone(&ctx.db),
            tracker: Arc::new(PlayerTracker::default()),
            state: Mutex::new(MarketState::default()),
        }
    }

    async fn save_transaction(
        &self,
        item_id: i64,
        name: Option<String>,
        category: Option<String>,
        signed_quantity: i64,
    ) -> Result<()> {
        let action = if signed_quantity > 0 {
            TransactionAction::Gained
        } else {
            TransactionAction::Lost
        };
        let quantity = signed_quantity.abs();
        let session_id = self.tracker.session_id();

        self.db
            .ensure_item(item_id, name.as_deref(), category.as_deref())?;
        let transaction_id = self.db.insert_market_transaction(
            session_id,
            crate::events::now(),
            item_id,
            quantity,
            action,
        )?;
        debug!("🏪 Saved market transaction {transaction_id}");

        self.bus
            .publish(ServiceEvent::MarketTransaction(MarketTransactionEvent {
                timestamp: crate::events::now(),
                item_id,
                quantity,
                action,
                transaction_id: Some(transaction_id),
                session_id,
            }))
            .await;
        Ok(())
    }

    /// Take the pending batch out of the state, if any.
    fn take_pending(&self) -> Option<(i64, Option<String>, Option<String>, i64)> {
        let mut state = self.state.lock();
        let total = state.total_quantity;
        let last = state.last_event.take()?;
        state.total_quantity = 0;
        if total == 0 {
            return None;
        }
        Some((last.item_id, last.name, last.category, total))
    }

    async fn handle_open(&self) {
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
        if let Some(Event::Service(ServiceEvent::InventorySnapshot(e))) = response {
            self.state.lock().inventory = Some(e.snapshot.data);
        }
    }

    async fn handle_close(&self) -> Result<()> {
        if let Some((item_id, name, category, total)) = self.take_pending() {
            self.save_transaction(item_id, name, category, total).await?;
        }
        let mut state = self.state.lock();
        state.inventory = None;
        state.total_quantity = 0;
        state.last_event = None;
        Ok(())
    }

    async fn on_game_view(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::GameView(e)) = event else {
            return Ok(());
        };
        // Purchase confirmation dialogs are not a view change.
        if e.view.contains("Confirm") {
            return Ok(());
        }

        if e.view.contains("AuctionHouse") {
            let newly_opened = {
                let mut state = self.state.lock();
                if state.open {
                    false
                } else {
                    state.open = true;
                    true
                }
            };

            if newly_opened {
                info!("🏪 Market opened");
                self.handle_open().await;
                self.bus
                    .publish(ServiceEvent::MarketAction(MarketActionEvent {
                        timestamp: crate::events::now(),
                        action: MarketAction::Open,
                    }))
                    .await;
            } else {
                // Still open; flush a stale batch.
                let stale = {
                    let state = self.state.lock();
                    match &state.last_event {
                        Some(last) if state.total_quantity != 0 => {
                            (crate::events::now() - last.timestamp).num_seconds()
                                > BATCH_WINDOW_SECS
                        }
                        _ => false,
                    }
                };
                if stale {
                    if let Some((item_id, name, category, total)) = self.take_pending() {
                        self.save_transaction(item_id, name, category, total).await?;
                    }
                }
            }
        } else {
            let was_open = {
                let mut state = self.state.lock();
                let was = state.open;
                state.open = false;
                was
            };
            if was_open {
                info!("🏪 Market closed");
                self.handle_close().await?;
                self.bus
                    .publish(ServiceEvent::MarketAction(MarketActionEvent {
                        timestamp: crate::events::now(),
                        action: MarketAction::Close,
                    }))
                    .await;
            }
        }
        Ok(())
    }

    async fn on_item_change(&self, event: Event) -> Result<()> {
        let Event::Parser(ParserEvent::ItemChange(e)) = event else {
            return Ok(());
        };

        enum Outcome {
            Skip,
            Accumulated,
            Flush(i64, Option<String>, Option<String>, i64),
        }

        let outcome = {
            let mut state = self.state.lock();
            if !state.open || state.inventory.is_none() {
                return Ok(());
            }
            debug!(
                "🏪 Item change during market: {} ({:?}) {}:{} Qty:{}",
                e.item_id, e.action, e.page, e.slot, e.amount
            );

            let delta = state.inventory.as_mut().unwrap().change_item(
                e.page,
                e.slot,
                e.item_id,
                e.amount,
                e.name.clone(),
                e.category.clone(),
            );
            if delta == 0 {
                debug!("🏪 No quantity change for item {}, skipping", e.item_id);
                Outcome::Skip
            } else {
                info!(
                    "🏪 Market transaction: {} {}x {:?} (delta: {delta:+})",
                    if delta > 0 { "gained" } else { "lost" },
                    delta.abs(),
                    e.name
                );

                match &state.last_event {
                    Some(last) if last.item_id == e.item_id => {
                        state.total_quantity += delta;
                        state.last_event = Some(e.clone());
                        Outcome::Accumulated
                    }
                    Some(last) if state.total_quantity != 0 => {
                        // Different item: the previous batch is complete.
                        let flush = (
                            last.item_id,
                            last.name.clone(),
                            last.category.clone(),
                            state.total_quantity,
                        );
                        state.total_quantity = delta;
                        state.last_event = Some(e.clone());
                        Outcome::Flush(flush.0, flush.1, flush.2, flush.3)
                    }
                    _ => {
                        state.total_quantity = delta;
                        state.last_event = Some(e.clone());
                        Outcome::Accumulated
                    }
                }
            }
        };

        if let Outcome::Flush(item_id, name, category, total) = outcome {
            self.save_transaction(item_id, name, category, total).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for MarketService {
    fn descriptor(&self) -> ServiceDescriptor {
        Self::DESCRIPTOR
    }

    fn register(self: Arc<Self>, bus: &EventBus) {
        self.tracker.register(bus, "MarketService");
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::GameView), on_game_view);
        subscribe!(bus, self, EventKind::Parser(ParserEventKind::ItemChange), on_item_change);
    }

    async fn startup(&self) -> Result<()> {
        info!("🏪 MarketService started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.lock().open = false;
        info!("🏪 MarketService shutdown");
        Ok(())
    }
}
