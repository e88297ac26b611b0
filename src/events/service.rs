//! Typed events exchanged between the domain services.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;

use crate::events::parser::AffixInfo;
use crate::maps::MapData;
use crate::services::model::{Inventory, InventoryItem, InventorySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventKind {
    RequestInventory,
    InventorySnapshot,
    InventoryUpdate,
    MapStarted,
    MapFinished,
    MapStats,
    MapRecord,
    MarketAction,
    MarketTransaction,
    StatsUpdate,
    StatsControl,
    SessionControl,
    SessionStarted,
    SessionFinished,
    SessionRestore,
    RequestSession,
    SessionSnapshot,
    PlayerChanged,
    Notification,
    ItemDataChanged,
    LevelProgress,
}

impl ServiceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestInventory => "request_inventory",
            Self::InventorySnapshot => "inventory_snapshot",
            Self::InventoryUpdate => "inventory_update",
            Self::MapStarted => "map_started",
            Self::MapFinished => "map_finished",
            Self::MapStats => "map_stats",
            Self::MapRecord => "map_record",
            Self::MarketAction => "market_action",
            Self::MarketTransaction => "market_transaction",
            Self::StatsUpdate => "stats_update",
            Self::StatsControl => "stats_control",
            Self::SessionControl => "session_control",
            Self::SessionStarted => "session_started",
            Self::SessionFinished => "session_finished",
            Self::SessionRestore => "session_restore",
            Self::RequestSession => "request_session",
            Self::SessionSnapshot => "session_snapshot",
            Self::PlayerChanged => "player_changed",
            Self::Notification => "notification",
            Self::ItemDataChanged => "item_data_changed",
            Self::LevelProgress => "level_progress",
        }
    }
}

impl std::fmt::Display for ServiceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ask InventoryService for a snapshot of the live inventory.
#[derive(Debug, Clone)]
pub struct RequestInventoryEvent {
    pub timestamp: NaiveDateTime,
}

/// Response to `RequestInventoryEvent`; carries a deep copy.
#[derive(Debug, Clone)]
pub struct InventorySnapshotEvent {
    pub timestamp: NaiveDateTime,
    pub snapshot: InventorySnapshot,
}

/// Full inventory replacement, published after a database load.
#[derive(Debug, Clone)]
pub struct InventoryUpdateEvent {
    pub timestamp: NaiveDateTime,
    pub inventory: Inventory,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapStartedEvent {
    pub timestamp: NaiveDateTime,
    pub level_id: i64,
    pub level_uid: i64,
    pub level_type: i64,
    pub map: Option<MapData>,
    /// Items spent between the pre-entry snapshot and the map start (entry
    /// fees), quantities positive.
    pub consumed_items: Vec<InventoryItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapFinishedEvent {
    pub timestamp: NaiveDateTime,
    /// Seconds from map start to map end.
    pub duration: f64,
    /// item_id -> net quantity delta over the run.
    pub inventory_changes: HashMap<i64, i64>,
    pub map: Option<MapData>,
    pub affixes: Option<Vec<AffixInfo>>,
}

/// Priced statistics for a completed map, raised by StatsService.
#[derive(Debug, Clone, Serialize)]
pub struct MapStatsEvent {
    pub timestamp: NaiveDateTime,
    pub duration: f64,
    pub item_changes: HashMap<i64, i64>,
    pub currency_gained: f64,
    pub exp_gained: f64,
    pub affixes: Option<Vec<AffixInfo>>,
}

/// The serialised MapCompletion row, as the query API would return it.
#[derive(Debug, Clone, Serialize)]
pub struct MapRecordEvent {
    pub timestamp: NaiveDateTime,
    pub map_record: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketAction {
    #[serde(rename = "market_open")]
    Open,
    #[serde(rename = "market_close")]
    Close,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketActionEvent {
    pub timestamp: NaiveDateTime,
    pub action: MarketAction,
}

/// Direction of a market transaction; the quantity is always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionAction {
    Gained,
    Lost,
}

impl TransactionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gained => "gained",
            Self::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketTransactionEvent {
    pub timestamp: NaiveDateTime,
    pub item_id: i64,
    pub quantity: i64,
    pub action: TransactionAction,
    pub transaction_id: Option<i64>,
    pub session_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsUpdateEvent {
    pub timestamp: NaiveDateTime,
    pub total_maps: i64,
    /// Accumulated in-map time, seconds.
    pub total_time: f64,
    pub session_duration: f64,
    pub items_per_hour: HashMap<i64, f64>,
    pub exp_per_hour: f64,
    pub exp_gained_total: f64,
    pub exp_lost_total: f64,
    pub currency_per_map: f64,
    pub currency_per_hour: f64,
    pub currency_total: f64,
    pub currency_current_per_hour: f64,
    pub currency_current_raw: f64,
    pub map_timer: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsControlAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsControlEvent {
    pub timestamp: NaiveDateTime,
    pub action: StatsControlAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionControlAction {
    Start,
    Close,
    /// Close the current session and start a new one atomically.
    Next,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionControlEvent {
    pub timestamp: NaiveDateTime,
    pub action: SessionControlAction,
    pub player_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStartedEvent {
    pub timestamp: NaiveDateTime,
    pub session_id: i64,
    pub player_name: String,
    pub started_at: NaiveDateTime,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionFinishedEvent {
    pub timestamp: NaiveDateTime,
    pub session_id: i64,
    pub player_name: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub total_maps: i64,
    pub total_currency_delta: f64,
    pub currency_per_hour: f64,
    pub currency_per_map: f64,
    pub description: Option<String>,
}

/// Rehydrates service state from a persisted active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRestoreEvent {
    pub timestamp: NaiveDateTime,
    pub session_id: i64,
    pub player_name: String,
    pub started_at: NaiveDateTime,
    pub total_maps: i64,
    pub total_time: f64,
    pub currency_total: f64,
    pub currency_per_hour: f64,
    pub currency_per_map: f64,
    pub exp_total: f64,
    pub exp_per_hour: f64,
    pub exp_gained_total: f64,
    pub exp_lost_total: f64,
}

#[derive(Debug, Clone)]
pub struct RequestSessionEvent {
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshotEvent {
    pub timestamp: NaiveDateTime,
    pub session_id: Option<i64>,
    pub player_name: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerChangedEvent {
    pub timestamp: NaiveDateTime,
    /// None for the first player seen after startup.
    pub old_player: Option<String>,
    pub new_player: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// User-visible message, broadcast to every WebSocket client.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub timestamp: NaiveDateTime,
    pub title: String,
    pub content: String,
    pub severity: NotificationSeverity,
    /// Display duration in milliseconds; None = client default.
    pub duration: Option<i64>,
}

/// Administrative item edit; the price book patches its cache from this.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDataChangedEvent {
    pub timestamp: NaiveDateTime,
    pub item_id: i64,
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelProgressEvent {
    pub timestamp: NaiveDateTime,
    pub level: i64,
    pub current: i64,
    pub remaining: i64,
    pub level_total: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    RequestInventory(RequestInventoryEvent),
    InventorySnapshot(InventorySnapshotEvent),
    InventoryUpdate(InventoryUpdateEvent),
    MapStarted(MapStartedEvent),
    MapFinished(MapFinishedEvent),
    MapStats(MapStatsEvent),
    MapRecord(MapRecordEvent),
    MarketAction(MarketActionEvent),
    MarketTransaction(MarketTransactionEvent),
    StatsUpdate(StatsUpdateEvent),
    StatsControl(StatsControlEvent),
    SessionControl(SessionControlEvent),
    SessionStarted(SessionStartedEvent),
    SessionFinished(SessionFinishedEvent),
    SessionRestore(SessionRestoreEvent),
    RequestSession(RequestSessionEvent),
    SessionSnapshot(SessionSnapshotEvent),
    PlayerChanged(PlayerChangedEvent),
    Notification(NotificationEvent),
    ItemDataChanged(ItemDataChangedEvent),
    LevelProgress(LevelProgressEvent),
}

impl ServiceEvent {
    pub fn kind(&self) -> ServiceEventKind {
        match self {
            Self::RequestInventory(_) => ServiceEventKind::RequestInventory,
            Self::InventorySnapshot(_) => ServiceEventKind::InventorySnapshot,
            Self::InventoryUpdate(_) => ServiceEventKind::InventoryUpdate,
            Self::MapStarted(_) => ServiceEventKind::MapStarted,
            Self::MapFinished(_) => ServiceEventKind::MapFinished,
            Self::MapStats(_) => ServiceEventKind::MapStats,
            Self::MapRecord(_) => ServiceEventKind::MapRecord,
            Self::MarketAction(_) => ServiceEventKind::MarketAction,
            Self::MarketTransaction(_) => ServiceEventKind::MarketTransaction,
            Self::StatsUpdate(_) => ServiceEventKind::StatsUpdate,
            Self::StatsControl(_) => ServiceEventKind::StatsControl,
            Self::SessionControl(_) => ServiceEventKind::SessionControl,
            Self::SessionStarted(_) => ServiceEventKind::SessionStarted,
            Self::SessionFinished(_) => ServiceEventKind::SessionFinished,
            Self::SessionRestore(_) => ServiceEventKind::SessionRestore,
            Self::RequestSession(_) => ServiceEventKind::RequestSession,
            Self::SessionSnapshot(_) => ServiceEventKind::SessionSnapshot,
            Self::PlayerChanged(_) => ServiceEventKind::PlayerChanged,
            Self::Notification(_) => ServiceEventKind::Notification,
            Self::ItemDataChanged(_) => ServiceEventKind::ItemDataChanged,
            Self::LevelProgress(_) => ServiceEventKind::LevelProgress,
        }
    }
}
