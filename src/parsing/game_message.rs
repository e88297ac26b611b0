//! In-game system messages.
//!
//! ```text
//! [2025.11.26-20.14.26:204][192]GameLog: Display: [Game] MsgMgr@:Show MsgValue = Switched to another pact configuration plan (Normal)
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::GameMessageEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref GAME_MESSAGE_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] MsgMgr@:Show MsgValue = (.+)"
    )
    .unwrap();
}

pub struct GameMessageParser {
    out: UnboundedSender<ParserEvent>,
}

impl GameMessageParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for GameMessageParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "GameMessageParser",
            version: "0.1.0",
            description: "Parses in-game messages and notifications",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = GAME_MESSAGE_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in game message line");
        };

        let _ = self.out.send(ParserEvent::GameMessage(GameMessageEvent {
            timestamp,
            message: m[2].trim().to_string(),
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
    fn parses_message_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = GameMessageParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.14.26:204][192]GameLog: Display: [Game] MsgMgr@:Show MsgValue = Switched to another pact configuration plan (Normal)"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::GameMessage(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.message, "Switched to another pact configuration plan (Normal)");
    }
}
