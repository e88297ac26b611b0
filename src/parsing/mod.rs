//! Line-oriented parsing fabric.
//!
//! Every parser owns precompiled regexes and private state, consumes the
//! shared stream of log lines, and emits typed events into its own queue.
//! The registry fans lines out and drains the queues toward the event bus.

pub mod registry;

mod bag_modify;
mod enter_level;
mod exit_level;
mod exp_update;
mod game_message;
mod game_pause;
mod game_view;
mod item_change;
mod loading_progress;
mod map_loaded;
mod ping;
mod player_join;
mod s12_gameplay;
mod stage_affix;
mod transition_style;
mod world_transition;

pub use registry::ParserRegistry;

use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::events::ParserEvent;
use crate::items::ItemCatalog;
use crate::maps::MapTable;

#[derive(Debug, Clone, Copy)]
pub struct ParserDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
}

/// A log line parser. `feed_line` is called for every line in file order;
/// matches push events into the parser's queue, mismatches are silently
/// skipped, malformed content is an error the registry logs and drops.
pub trait Parser: Send {
    fn descriptor(&self) -> ParserDescriptor;
    fn feed_line(&mut self, line: &str) -> anyhow::Result<()>;
}

/// Log timestamps without milliseconds: `2025.11.26-20.02.54`.
pub(crate) fn parse_log_ts(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y.%m.%d-%H.%M.%S").ok()
}

/// Log timestamps with the millisecond field split out by the bracket
/// pattern: (`2025.11.26`, `20.02.54`, `023`).
pub(crate) fn parse_log_ts_millis(date: &str, time: &str, millis: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(
        &format!("{date} {time}.{millis}"),
        "%Y.%m.%d %H.%M.%S%.3f",
    )
    .ok()
}

/// Construct every known parser wired to a fresh queue; returns the parsers
/// together with their queue receivers, index-aligned.
pub fn build_parsers(
    catalog: &Arc<ItemCatalog>,
    maps: &Arc<MapTable>,
) -> Vec<(Box<dyn Parser>, mpsc::UnboundedReceiver<ParserEvent>)> {
    macro_rules! with_queue {
        ($make:expr) => {{
            let (tx, rx) = mpsc::unbounded_channel();
            (Box::new($make(tx)) as Box<dyn Parser>, rx)
        }};
    }

    vec![
        with_queue!(|tx| item_change::ItemChangeParser::new(tx, Arc::clone(catalog))),
        with_queue!(|tx| bag_modify::BagModifyParser::new(tx, Arc::clone(catalog))),
        with_queue!(game_view::GameViewParser::new),
        with_queue!(|tx| enter_level::EnterLevelParser::new(tx, Arc::clone(maps))),
        with_queue!(exit_level::ExitLevelParser::new),
        with_queue!(stage_affix::StageAffixParser::new),
        with_queue!(exp_update::ExpUpdateParser::new),
        with_queue!(player_join::PlayerJoinParser::new),
        with_queue!(world_transition::WorldTransitionParser::new),
        with_queue!(map_loaded::MapLoadedParser::new),
        with_queue!(game_message::GameMessageParser::new),
        with_queue!(game_pause::GamePauseParser::new),
        with_queue!(loading_progress::LoadingProgressParser::new),
        with_queue!(ping::PingParser::new),
        with_queue!(s12_gameplay::S12GameplayParser::new),
        with_queue!(transition_style::TransitionStyleParser::new),
    ]
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Feed lines through a parser and collect whatever it emitted.
    pub fn drain(
        parser: &mut dyn Parser,
        rx: &mut mpsc::UnboundedReceiver<ParserEvent>,
        lines: &[&str],
    ) -> Vec<ParserEvent> {
        for line in lines {
            parser.feed_line(line).unwrap();
        }
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
