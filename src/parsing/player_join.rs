//! Player join lines.
//!
//! ```text
//! [2025.12.10-15.30.45:123][456]GameLog: Display: [Game] SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100
//! ```
//!
//! The bracketed frame counter may carry leading spaces (`[ 23]`).

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::PlayerJoinEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref PLAYER_JOIN_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\s*\d+\]\s*GameLog: Display: \[Game\]\s+SwitchBattleAreaUtil:_JoinFight\s+([^:]+):(\d+)"
    )
    .unwrap();
}

pub struct PlayerJoinParser {
    out: UnboundedSender<ParserEvent>,
}

impl PlayerJoinParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for PlayerJoinParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "PlayerJoinParser",
            version: "0.1.0",
            description: "Parses player join events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = PLAYER_JOIN_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in player join line");
        };

        let _ = self.out.send(ParserEvent::PlayerJoin(PlayerJoinEvent {
            timestamp,
            player_name: m[2].to_string(),
            mode: m[3].parse()?,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::testutil::drain;
    use tokio::sync::mpsc;

    #[test]
    fn parses_player_name_and_mode() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = PlayerJoinParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.12.10-15.30.45:123][456]GameLog: Display: [Game] SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::PlayerJoin(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.player_name, "Eryndor#7291");
        assert_eq!(e.mode, 1100);
    }

    #[test]
    fn accepts_padded_frame_counter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = PlayerJoinParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.12.10-15.30.45:123][ 23]GameLog: Display: [Game] SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100"],
        );
        assert_eq!(events.len(), 1);
    }
}
