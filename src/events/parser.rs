//! Typed events emitted by the log parsers.
//!
//! One struct per parser output; the `ParserEvent` enum is the bus-facing
//! union and `ParserEventKind` is the subscription token.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::maps::MapData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserEventKind {
    ItemChange,
    BagModify,
    GameView,
    EnterLevel,
    ExitLevel,
    StageAffix,
    ExpUpdate,
    PlayerJoin,
    WorldTransition,
    MapLoaded,
    GameMessage,
    GamePause,
    LoadingProgress,
    Ping,
    S12Gameplay,
    TransitionStyle,
}

impl ParserEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemChange => "item_change",
            Self::BagModify => "bag_modify",
            Self::GameView => "game_view",
            Self::EnterLevel => "enter_level",
            Self::ExitLevel => "exit_level",
            Self::StageAffix => "stage_affix",
            Self::ExpUpdate => "exp_update",
            Self::PlayerJoin => "player_join",
            Self::WorldTransition => "world_transition",
            Self::MapLoaded => "map_loaded",
            Self::GameMessage => "game_message",
            Self::GamePause => "game_pause",
            Self::LoadingProgress => "loading_progress",
            Self::Ping => "ping",
            Self::S12Gameplay => "s12_gameplay",
            Self::TransitionStyle => "transition_style",
        }
    }
}

impl std::fmt::Display for ParserEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item change action as logged by the game client. `Delete` lines carry no
/// quantity; the event's `amount` is 0 in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemChangeEvent {
    pub timestamp: NaiveDateTime,
    pub action: ItemAction,
    pub item_id: i64,
    pub amount: i64,
    pub page: i64,
    pub slot: i64,
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BagModifyEvent {
    pub timestamp: NaiveDateTime,
    pub page: i64,
    pub slot: i64,
    pub item_id: i64,
    pub quantity: i64,
    pub name: Option<String>,
    pub category: Option<String>,
}

/// UI view change (e.g. FightCtrl, PCBagCtrl, AuctionHouseCtrl).
#[derive(Debug, Clone, Serialize)]
pub struct GameViewEvent {
    pub timestamp: NaiveDateTime,
    pub view: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnterLevelEvent {
    pub timestamp: NaiveDateTime,
    pub level_id: i64,
    pub level_uid: i64,
    pub level_type: i64,
    pub map: Option<MapData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitLevelEvent {
    pub timestamp: NaiveDateTime,
}

/// One map modifier: numeric id plus the human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffixInfo {
    pub affix_id: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageAffixEvent {
    pub timestamp: NaiveDateTime,
    pub level_id: i64,
    pub affixes: Vec<AffixInfo>,
}

/// Experience is the raw value for the current level, not a percentage.
#[derive(Debug, Clone, Serialize)]
pub struct ExpUpdateEvent {
    pub timestamp: NaiveDateTime,
    pub experience: i64,
    pub level: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerJoinEvent {
    pub timestamp: NaiveDateTime,
    pub player_name: String,
    pub mode: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldTransitionEvent {
    pub timestamp: NaiveDateTime,
    pub back_flow_step: i64,
    pub is_switching_to_main_world: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapLoadedEvent {
    pub timestamp: NaiveDateTime,
    pub map_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameMessageEvent {
    pub timestamp: NaiveDateTime,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GamePauseEvent {
    pub timestamp: NaiveDateTime,
    pub is_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadingProgressEvent {
    pub timestamp: NaiveDateTime,
    pub primary: i64,
    pub secondary_type: String,
    pub secondary_progress: i64,
}

/// TCP ping result in milliseconds. No service consumes this; it is kept for
/// parity with the log format.
#[derive(Debug, Clone, Serialize)]
pub struct PingEvent {
    pub timestamp: NaiveDateTime,
    pub ping: i64,
}

/// Season 12 gameplay BGM layer. Stored on the event only.
#[derive(Debug, Clone, Serialize)]
pub struct S12GameplayEvent {
    pub timestamp: NaiveDateTime,
    pub layer: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionStyleEvent {
    pub timestamp: NaiveDateTime,
    pub transition_style: String,
}

#[derive(Debug, Clone)]
pub enum ParserEvent {
    ItemChange(ItemChangeEvent),
    BagModify(BagModifyEvent),
    GameView(GameViewEvent),
    EnterLevel(EnterLevelEvent),
    ExitLevel(ExitLevelEvent),
    StageAffix(StageAffixEvent),
    ExpUpdate(ExpUpdateEvent),
    PlayerJoin(PlayerJoinEvent),
    WorldTransition(WorldTransitionEvent),
    MapLoaded(MapLoadedEvent),
    GameMessage(GameMessageEvent),
    GamePause(GamePauseEvent),
    LoadingProgress(LoadingProgressEvent),
    Ping(PingEvent),
    S12Gameplay(S12GameplayEvent),
    TransitionStyle(TransitionStyleEvent),
}

impl ParserEvent {
    pub fn kind(&self) -> ParserEventKind {
        match self {
            Self::ItemChange(_) => ParserEventKind::ItemChange,
            Self::BagModify(_) => ParserEventKind::BagModify,
            Self::GameView(_) => ParserEventKind::GameView,
            Self::EnterLevel(_) => ParserEventKind::EnterLevel,
            Self::ExitLevel(_) => ParserEventKind::ExitLevel,
            Self::StageAffix(_) => ParserEventKind::StageAffix,
            Self::ExpUpdate(_) => ParserEventKind::ExpUpdate,
            Self::PlayerJoin(_) => ParserEventKind::PlayerJoin,
            Self::WorldTransition(_) => ParserEventKind::WorldTransition,
            Self::MapLoaded(_) => ParserEventKind::MapLoaded,
            Self::GameMessage(_) => ParserEventKind::GameMessage,
            Self::GamePause(_) => ParserEventKind::GamePause,
            Self::LoadingProgress(_) => ParserEventKind::LoadingProgress,
            Self::Ping(_) => ParserEventKind::Ping,
            Self::S12Gameplay(_) => ParserEventKind::S12Gameplay,
            Self::TransitionStyle(_) => ParserEventKind::TransitionStyle,
        }
    }
}
