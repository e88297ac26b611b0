//! Season 12 gameplay BGM layer lines.
//!
//! ```text
//! [2025.11.29-02.06.37:848][ 29]GameLog: Display: [Game] UGamePlayMgr::PlayS12GamePlayBGM layer=1
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::S12GameplayEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref S12_GAMEPLAY_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\s*\d+\]GameLog: Display: \[Game\] UGamePlayMgr::PlayS12GamePlayBGM layer=(\d+)"
    )
    .unwrap();
}

pub struct S12GameplayParser {
    out: UnboundedSender<ParserEvent>,
}

impl S12GameplayParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for S12GameplayParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "S12GameplayParser",
            version: "0.1.0",
            description: "Parses seasonal gameplay layer events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = S12_GAMEPLAY_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in s12 gameplay line");
        };

        let _ = self.out.send(ParserEvent::S12Gameplay(S12GameplayEvent {
            timestamp,
            layer: m[2].parse()?,
        }));
        Ok(())
    }
}
