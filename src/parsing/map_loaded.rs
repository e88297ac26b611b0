//! Main-world map load completion lines.
//!
//! ```text
//! [2025.11.26-20.05.36:998][406]GameLog: Display: [Game] SceneLevelMgr@ OpenMainWorld END! InMainLevelPath = /Game/Art/Maps/01SD/XZ_YuJinZhiXiBiNanSuo200/XZ_YuJinZhiXiBiNanSuo200
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::MapLoadedEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref MAP_LOADED_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] SceneLevelMgr@ OpenMainWorld END! InMainLevelPath = (.+)"
    )
    .unwrap();
}

pub struct MapLoadedParser {
    out: UnboundedSender<ParserEvent>,
}

impl MapLoadedParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for MapLoadedParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "MapLoadedParser",
            version: "0.1.0",
            description: "Parses map loaded and ready events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = MAP_LOADED_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in map loaded line");
        };

        let _ = self.out.send(ParserEvent::MapLoaded(MapLoadedEvent {
            timestamp,
            map_path: m[2].trim().to_string(),
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
    fn parses_map_path() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = MapLoadedParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.05.36:998][406]GameLog: Display: [Game] SceneLevelMgr@ OpenMainWorld END! InMainLevelPath = /Game/Art/Maps/01SD/XZ_YuJinZhiXiBiNanSuo200/XZ_YuJinZhiXiBiNanSuo200"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::MapLoaded(e) = &events[0] else {
            panic!("wrong event");
        };
        assert!(e.map_path.ends_with("XZ_YuJinZhiXiBiNanSuo200"));
    }
}
