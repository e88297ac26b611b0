//! Game pause/resume lines.
//!
//! ```text
//! [2025.11.26-20.02.33:692][200]GameLog: Display: [Game] UGameMgr::AddGamePausedForUI()
//! [2025.11.26-20.02.28:877][586]GameLog: Display: [Game] UGameMgr::RemovePausedForUI()
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::GamePauseEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref GAME_PAUSE_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] UGameMgr::(AddGamePausedForUI|RemovePausedForUI)\(\)"
    )
    .unwrap();
}

pub struct GamePauseParser {
    out: UnboundedSender<ParserEvent>,
}

impl GamePauseParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for GamePauseParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "GamePauseParser",
            version: "0.1.0",
            description: "Parses game pause/resume events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = GAME_PAUSE_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in game pause line");
        };

        let _ = self.out.send(ParserEvent::GamePause(GamePauseEvent {
            timestamp,
            is_paused: &m[2] == "AddGamePausedForUI",
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
    fn pause_and_resume_map_to_flag() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = GamePauseParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &[
                "[2025.11.26-20.02.33:692][200]GameLog: Display: [Game] UGameMgr::AddGamePausedForUI()",
                "[2025.11.26-20.02.28:877][586]GameLog: Display: [Game] UGameMgr::RemovePausedForUI()",
            ],
        );

        assert_eq!(events.len(), 2);
        let ParserEvent::GamePause(first) = &events[0] else {
            panic!("wrong event");
        };
        assert!(first.is_paused);
        let ParserEvent::GamePause(second) = &events[1] else {
            panic!("wrong event");
        };
        assert!(!second.is_paused);
    }
}
