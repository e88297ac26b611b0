//! TCP ping result lines: `TCP Ping Result: 34`.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::PingEvent;
use crate::events::ParserEvent;

lazy_static! {
    static ref PING_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] TCP Ping Result: (\d+)"
    )
    .unwrap();
}

pub struct PingParser {
    out: UnboundedSender<ParserEvent>,
}

impl PingParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self { out }
    }
}

impl Parser for PingParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "PingParser",
            version: "0.1.0",
            description: "Parses network ping events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = PING_RE.captures(line) else {
            return Ok(());
        };
        let Some(timestamp) = parse_log_ts(&m[1]) else {
            anyhow::bail!("bad timestamp in ping line");
        };

        let _ = self.out.send(ParserEvent::Ping(PingEvent {
            timestamp,
            ping: m[2].parse()?,
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
    fn parses_ping_millis() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = PingParser::new(tx);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] TCP Ping Result: 34"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::Ping(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.ping, 34);
    }
}
