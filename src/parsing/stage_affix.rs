//! Stage affix block parser.
//!
//! Affix lists arrive as a block:
//!
//! ```text
//! [..] EnterLevel(5302)
//! [..] AffixInfos
//! [..] +DangerNumbers
//! [..] +Id [507]
//! [..] +Description [<p>Monsters deal extra damage</p>]
//! [..] +DangerNumbers
//! [..] +Id [512]
//! [..] +Description [Players take chaos damage]
//! [..] OnEnterAreaEnd()
//! ```
//!
//! One event per block, carrying every collected affix and the last-seen
//! level id.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts_millis, Parser, ParserDescriptor};
use crate::events::parser::{AffixInfo, StageAffixEvent};
use crate::events::ParserEvent;

lazy_static! {
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\]").unwrap();
    static ref ENTER_LEVEL_RE: Regex = Regex::new(r"EnterLevel\((\d+)\)").unwrap();
    static ref AFFIX_LIST_START_RE: Regex = Regex::new(r"AffixInfos").unwrap();
    static ref DANGER_NUMBERS_RE: Regex = Regex::new(r"\+DangerNumbers").unwrap();
    static ref AFFIX_ID_RE: Regex = Regex::new(r"\+Id\s*\[(\d+)\]").unwrap();
    static ref DESCRIPTION_RE: Regex = Regex::new(r"\+Description\s*\[(.*?)\]").unwrap();
    static ref AFFIX_LIST_END_RE: Regex = Regex::new(r"OnEnterAreaEnd\(\)").unwrap();
}

pub struct StageAffixParser {
    out: UnboundedSender<ParserEvent>,
    pending: Vec<AffixInfo>,
    current_level_id: Option<i64>,
    collecting: bool,
    block_timestamp: Option<chrono::NaiveDateTime>,
    current_affix_id: Option<i64>,
    current_description: Option<String>,
}

impl StageAffixParser {
    pub fn new(out: UnboundedSender<ParserEvent>) -> Self {
        Self {
            out,
            pending: Vec::new(),
            current_level_id: None,
            collecting: false,
            block_timestamp: None,
            current_affix_id: None,
            current_description: None,
        }
    }

    fn push_current(&mut self) {
        if let Some(affix_id) = self.current_affix_id.take() {
            self.pending.push(AffixInfo {
                affix_id,
                description: self.current_description.take(),
            });
        }
        self.current_description = None;
    }

    fn reset_block(&mut self) {
        self.collecting = false;
        self.pending.clear();
        self.block_timestamp = None;
        self.current_affix_id = None;
        self.current_description = None;
    }
}

impl Parser for StageAffixParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "StageAffixParser",
            version: "0.1.0",
            description: "Parses stage modifiers and affixes",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        if let Some(m) = ENTER_LEVEL_RE.captures(line) {
            self.current_level_id = Some(m[1].parse()?);
        }

        let ts = TIMESTAMP_RE
            .captures(line)
            .and_then(|m| parse_log_ts_millis(&m[1], &m[2], &m[3]));

        if AFFIX_LIST_START_RE.is_match(line) {
            self.collecting = true;
            self.pending.clear();
            self.block_timestamp = ts;
            self.current_affix_id = None;
            self.current_description = None;
            return Ok(());
        }

        if AFFIX_LIST_END_RE.is_match(line) {
            if self.collecting {
                self.push_current();
                if let (false, Some(level_id), Some(timestamp)) = (
                    self.pending.is_empty(),
                    self.current_level_id,
                    self.block_timestamp,
                ) {
                    let _ = self.out.send(ParserEvent::StageAffix(StageAffixEvent {
                        timestamp,
                        level_id,
                        affixes: self.pending.clone(),
                    }));
                }
                self.reset_block();
            }
            return Ok(());
        }

        if !self.collecting {
            return Ok(());
        }

        if DANGER_NUMBERS_RE.is_match(line) {
            // New affix group; bank the previous one.
            self.push_current();
            return Ok(());
        }

        if let Some(m) = DESCRIPTION_RE.captures(line) {
            self.current_description = Some(m[1].to_string());
            return Ok(());
        }

        if let Some(m) = AFFIX_ID_RE.captures(line) {
            self.current_affix_id = Some(m[1].parse()?);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::testutil::drain;
    use tokio::sync::mpsc;

    fn ts(line: &str) -> String {
        format!("[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] {line}")
    }

    fn parser() -> (StageAffixParser, mpsc::UnboundedReceiver<ParserEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StageAffixParser::new(tx), rx)
    }

    #[test]
    fn collects_full_affix_block() {
        let (mut p, mut rx) = parser();
        let lines: Vec<String> = vec![
            ts("LevelMgr@ EnterLevel(5302)"),
            ts("AffixInfos"),
            ts("+DangerNumbers"),
            ts("+Id [507]"),
            ts("+Description [<p>Monsters deal extra damage</p>]"),
            ts("+DangerNumbers"),
            ts("+Id [512]"),
            ts("+Description [Players take chaos damage]"),
            ts("OnEnterAreaEnd()"),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let events = drain(&mut p, &mut rx, &refs);

        assert_eq!(events.len(), 1);
        let ParserEvent::StageAffix(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.level_id, 5302);
        assert_eq!(e.affixes.len(), 2);
        assert_eq!(e.affixes[0].affix_id, 507);
        assert_eq!(
            e.affixes[0].description.as_deref(),
            Some("<p>Monsters deal extra damage</p>")
        );
        assert_eq!(e.affixes[1].affix_id, 512);
    }

    #[test]
    fn block_without_level_id_is_dropped() {
        let (mut p, mut rx) = parser();
        let lines: Vec<String> = vec![
            ts("AffixInfos"),
            ts("+DangerNumbers"),
            ts("+Id [507]"),
            ts("OnEnterAreaEnd()"),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        assert!(drain(&mut p, &mut rx, &refs).is_empty());
    }

    #[test]
    fn lines_outside_a_block_are_ignored() {
        let (mut p, mut rx) = parser();
        let lines: Vec<String> = vec![
            ts("LevelMgr@ EnterLevel(5302)"),
            ts("+Id [507]"),
            ts("OnEnterAreaEnd()"),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        assert!(drain(&mut p, &mut rx, &refs).is_empty());
    }

    #[test]
    fn consecutive_blocks_emit_separately() {
        let (mut p, mut rx) = parser();
        let lines: Vec<String> = vec![
            ts("LevelMgr@ EnterLevel(5302)"),
            ts("AffixInfos"),
            ts("+DangerNumbers"),
            ts("+Id [507]"),
            ts("OnEnterAreaEnd()"),
            ts("LevelMgr@ EnterLevel(5314)"),
            ts("AffixInfos"),
            ts("+DangerNumbers"),
            ts("+Id [600]"),
            ts("OnEnterAreaEnd()"),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let events = drain(&mut p, &mut rx, &refs);

        assert_eq!(events.len(), 2);
        let ParserEvent::StageAffix(second) = &events[1] else {
            panic!("wrong event");
        };
        assert_eq!(second.level_id, 5314);
        assert_eq!(second.affixes[0].affix_id, 600);
    }
}
