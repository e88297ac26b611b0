//! UI view changes.
//!
//! ```text
//! [..] PageStack@ CurRunView = 3216_SettingCtrl
//! [..] PageStack@                  CurRunView == 1321_FightCtrl Calling OnLeaveHide!
//! ```
//!
//! Consecutive duplicates are suppressed.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{Parser, ParserDescriptor};
use crate::events::parser::GameViewEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref GAME_VIEW_RE: Regex = Regex::new(r"CurRunView\s*=?=?\s*(?P<view>\w+)").unwrap();
}

pub struct GameViewParser {
    out: UnboundedSender<ParserEvent>,
    last_view: Option<String>,
}

impl GameViewParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self {
            out,
            last_view: None,
        }
    }
}

impl Parser for GameViewParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "GameViewParser",
            version: "0.1.0",
            description: "Parses UI view and menu changes",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = GAME_VIEW_RE.captures(line) else {
            return Ok(());
        };
        let view = m.name("view").map(|v| v.as_str().to_string()).unwrap_or_default();

        if self.last_view.as_deref() == Some(view.as_str()) {
            return Ok(());
        }
        self.last_view = Some(view.clone());

        let _ = self.out.send(ParserEvent::GameView(GameViewEvent {
            timestamp: crate::events::now(),
            view,
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
    fn emits_view_changes_and_suppresses_duplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = GameViewParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &[
                "[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] PageStack@ CurRunView = 3216_SettingCtrl",
                "[2025.11.26-20.02.55:100][714]GameLog: Display: [Game] PageStack@ CurRunView = 3216_SettingCtrl",
                "[2025.11.26-20.02.56:200][715]GameLog: Display: [Game] PageStack@                  CurRunView == 1321_FightCtrl Calling OnLeaveHide!",
            ],
        );

        assert_eq!(events.len(), 2);
        let ParserEvent::GameView(first) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(first.view, "3216_SettingCtrl");
        let ParserEvent::GameView(second) = &events[1] else {
            panic!("wrong event");
        };
        assert_eq!(second.view, "1321_FightCtrl");
    }
}
