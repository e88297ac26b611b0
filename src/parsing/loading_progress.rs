//! Loading screen progress lines: `Loading@ P=42,S=Stream 87%`.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts_millis, Parser, ParserDescriptor};
use crate::events::parser::LoadingProgressEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\]").unwrap();
    static ref LOADING_RE: Regex =
        Regex::new(r"Loading@\s+P=(\d+),S=([A-Za-z]+)\s+(\d+)%").unwrap();
}

pub struct LoadingProgressParser {
    out: UnboundedSender<ParserEvent>,
}

impl LoadingProgressParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for LoadingProgressParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "LoadingProgressParser",
            version: "0.1.0",
            description: "Parses loading screen progress events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let (Some(ts), Some(m)) = (TIMESTAMP_RE.captures(line), LOADING_RE.captures(line)) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts_millis(&ts[1], &ts[2], &ts[3]) else {
            anyhow::bail!("bad timestamp in loading progress line");
        };

        let _ = self
            .out
            .send(ParserEvent::LoadingProgress(LoadingProgressEvent {
                timestamp,
                primary: m[1].parse()?,
                secondary_type: m[2].to_string(),
                secondary_progress: m[3].parse()?,
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
    fn parses_progress_fields() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = LoadingProgressParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.05.12:100][300]GameLog: Display: [Game] Loading@ P=42,S=Stream 87%"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::LoadingProgress(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!((e.primary, e.secondary_progress), (42, 87));
        assert_eq!(e.secondary_type, "Stream");
    }
}
