//! Screen transition style lines.
//!
//! ```text
//! [2025.11.29-02.06.37:287][970]GameLog: Display: [Game] TransitionMgr@ShowTransition TransitionStyle = S12TransitionBlackItem
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::TransitionStyleEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref TRANSITION_STYLE_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\s*\d+\]GameLog: Display: \[Game\] TransitionMgr@ShowTransition TransitionStyle = (\S+)"
    )
    .unwrap();
}

pub struct TransitionStyleParser {
    out: UnboundedSender<ParserEvent>,
}

impl TransitionStyleParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for TransitionStyleParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "TransitionStyleParser",
            version: "0.1.0",
            description: "Parses screen transition style events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = TRANSITION_STYLE_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in transition style line");
        };

        let _ = self
            .out
            .send(ParserEvent::TransitionStyle(TransitionStyleEvent {
                timestamp,
                transition_style: m[2].to_string(),
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
    fn parses_style_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = TransitionStyleParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.29-02.06.37:287][970]GameLog: Display: [Game] TransitionMgr@ShowTransition TransitionStyle = S12TransitionBlackItem"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::TransitionStyle(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.transition_style, "S12TransitionBlackItem");
    }
}
