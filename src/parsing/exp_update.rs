//! Experience updates.
//!
//! ```text
//! [2025.11.26-20.14.26:268][200]GameLog: Display: [Game] ExpMgr@UpdateExp Percent:10272028 97
//! ```
//!
//! Despite the `Percent:` label the first number is the raw experience value
//! for the current level; the second is the level itself.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::ExpUpdateEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref EXP_UPDATE_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] ExpMgr@UpdateExp Percent:(\d+) (\d+)"
    )
    .unwrap();
}

pub struct ExpUpdateParser {
    out: UnboundedSender<ParserEvent>,
}

impl ExpUpdateParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for ExpUpdateParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "ExpUpdateParser",
            version: "0.1.0",
            description: "Parses experience point updates",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = EXP_UPDATE_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in exp update line");
        };

        let _ = self.out.send(ParserEvent::ExpUpdate(ExpUpdateEvent {
            timestamp,
            experience: m[2].parse()?,
            level: m[3].parse()?,
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
    fn parses_experience_and_level() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = ExpUpdateParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.14.26:268][200]GameLog: Display: [Game] ExpMgr@UpdateExp Percent:10272028 97"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::ExpUpdate(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.experience, 10272028);
        assert_eq!(e.level, 97);
    }
}
