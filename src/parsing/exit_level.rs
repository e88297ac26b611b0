//! Level exit lines: `UGameMgr::ExitLevel()`.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts_millis, Parser, ParserDescriptor};
use crate::events::parser::ExitLevelEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\]").unwrap();
    static ref EXIT_RE: Regex = Regex::new(r"UGameMgr::ExitLevel\(\)").unwrap();
}

pub struct ExitLevelParser {
    out: UnboundedSender<ParserEvent>,
}

impl ExitLevelParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for ExitLevelParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "ExitLevelParser",
            version: "0.1.0",
            description: "Parses level/map exit events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        if !EXIT_RE.is_match(line) {
            return Ok(());
        }
        let Some(ts) = TIMESTAMP_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts_millis(&ts[1], &ts[2], &ts[3]) else {
            anyhow::bail!("bad timestamp in exit level line");
        };

        let _ = self
            .out
            .send(ParserEvent::ExitLevel(ExitLevelEvent { timestamp }));
        Ok(())
    }
}
