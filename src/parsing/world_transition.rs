//! World transition (BackFlow) lines.
//!
//! ```text
//! [2025.11.26-20.04.52:426][228]GameLog: Display: [Game] PageApplyBase@ BackFlow4 IsSwitchingSubWorldToMainWorld = false
//! [2025.11.26-20.04.57:010][746]GameLog: Display: [Game] PageApplyBase@ BackFlow0 IsSwitchingSubWorldToMainWorld = true
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::WorldTransitionEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref WORLD_TRANSITION_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] PageApplyBase@ BackFlow(\d+) IsSwitchingSubWorldToMainWorld = (true|false)"
    )
    .unwrap();
}

pub struct WorldTransitionParser {
    out: UnboundedSender<ParserEvent>,
}

impl WorldTransitionParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for WorldTransitionParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "WorldTransitionParser",
            version: "0.1.0",
            description: "Parses world/zone transition events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = WORLD_TRANSITION_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in world transition line");
        };

        let _ = self
            .out
            .send(ParserEvent::WorldTransition(WorldTransitionEvent {
                timestamp,
                back_flow_step: m[2].parse()?,
                is_switching_to_main_world: &m[3] == "true",
            }));
        Ok(())
    }
}
