//! Enter-level sequence parser.
//!
//! A level entry spans three consecutive log lines:
//!
//! ```text
//! [..]GameLog: Display: [Game] LevelMgr@ EnterLevel
//! [..]GameLog: Display: [Game] LevelMgr@ LevelUid, LevelType, LevelId = 1121002 3 5302
//! [..]GameLog: Display: [Game] LevelMgr@:LevelPath, Model = /Game/Art/Maps/.. SomeModel
//! ```
//!
//! The second line has a known variant (`LeevelLinkData： 1121102 3 5314` —
//! the game's spelling). One event is emitted per complete sequence. Two
//! safety nets keep the machine from wedging: a timeout on time spent
//! outside IDLE, and a cap of 6 consecutive non-matching lines.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use super::{parse_log_ts_millis, Parser, ParserDescriptor};
use crate::events::parser::EnterLevelEvent;
use crate::events::ParserEvent;
use crate::maps::MapTable;

lazy_static! {
    static ref ENTER_LEVEL_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\].*GameLog: Display: \[Game\] LevelMgr@ EnterLevel$"
    )
    .unwrap();
    static ref LEVEL_INFO_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\].*GameLog: Display: \[Game\] LevelMgr@ LevelUid, LevelType, LevelId = (\d+) (\d+) (\d+)"
    )
    .unwrap();
    static ref LEVEL_INFO_ALT_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\].*GameLog: Display: \[Game\] LeevelLinkData[：:]\s*(\d+)\s+(\d+)\s+(\d+)"
    )
    .unwrap();
    static ref LEVEL_PATH_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2}):(\d{3})\].*GameLog: Display: \[Game\] LevelMgr@:LevelPath, Model = (.+)"
    )
    .unwrap();
}

const MAX_NON_MATCHING_LINES: u32 = 6;
const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    GotEnter,
    GotLevelInfo,
}

pub struct EnterLevelParser {
    out: UnboundedSender<ParserEvent>,
    maps: Arc<MapTable>,
    state: ParseState,
    timestamp: Option<chrono::NaiveDateTime>,
    level_uid: Option<i64>,
    level_type: Option<i64>,
    level_id: Option<i64>,
    non_matching: u32,
    state_entered_at: Option<Instant>,
    state_timeout: Duration,
}

impl EnterLevelParser {
    pub fn new(out: UnboundedSender<ParserEvent>, maps: Arc<MapTable>) -> Self {
        Self::with_timeout(out, maps, DEFAULT_STATE_TIMEOUT)
    }

    pub fn with_timeout(
        out: UnboundedSender<ParserEvent>,
        maps: Arc<MapTable>,
        state_timeout: Duration,
    ) -> Self {
        Self {
            out,
            maps,
            state: ParseState::Idle,
            timestamp: None,
            level_uid: None,
            level_type: None,
            level_id: None,
            non_matching: 0,
            state_entered_at: None,
            state_timeout,
        }
    }

    fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.timestamp = None;
        self.level_uid = None;
        self.level_type = None;
        self.level_id = None;
        self.non_matching = 0;
        self.state_entered_at = None;
    }

    fn miss(&mut self) {
        self.non_matching += 1;
        if self.non_matching >= MAX_NON_MATCHING_LINES {
            self.reset();
        }
    }
}

impl Parser for EnterLevelParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "EnterLevelParser",
            version: "0.1.0",
            description: "Parses level/map entry sequences",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        if self.state != ParseState::Idle {
            if let Some(entered) = self.state_entered_at {
                if entered.elapsed() > self.state_timeout {
                    warn!(
                        "Timeout reset - stuck in {:?} for {:.1}s (limit: {:.1}s)",
                        self.state,
                        entered.elapsed().as_secs_f64(),
                        self.state_timeout.as_secs_f64()
                    );
                    self.reset();
                    // The current line is still processed, from IDLE.
                }
            }
        }

        match self.state {
            ParseState::Idle => {
                if let Some(m) = ENTER_LEVEL_RE.captures(line) {
                    self.timestamp = parse_log_ts_millis(&m[1], &m[2], &m[3]);
                    self.state = ParseState::GotEnter;
                    self.non_matching = 0;
                    self.state_entered_at = Some(Instant::now());
                }
            }
            ParseState::GotEnter => {
                let m = LEVEL_INFO_RE
                    .captures(line)
                    .or_else(|| LEVEL_INFO_ALT_RE.captures(line));
                if let Some(m) = m {
                    self.level_uid = Some(m[4].parse()?);
                    self.level_type = Some(m[5].parse()?);
                    self.level_id = Some(m[6].parse()?);
                    self.state = ParseState::GotLevelInfo;
                    self.non_matching = 0;
                } else {
                    self.miss();
                }
            }
            ParseState::GotLevelInfo => {
                if LEVEL_PATH_RE.is_match(line) {
                    let level_id = self.level_id.unwrap_or(0);
                    let event = EnterLevelEvent {
                        timestamp: self.timestamp.unwrap_or_else(crate::events::now),
                        level_id,
                        level_uid: self.level_uid.unwrap_or(0),
                        level_type: self.level_type.unwrap_or(0),
                        map: self.maps.get(level_id),
                    };
                    let _ = self.out.send(ParserEvent::EnterLevel(event));
                    self.reset();
                } else {
                    self.miss();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::testutil::drain;
    use std::path::Path;
    use tokio::sync::mpsc;

    const SEQUENCE: [&str; 3] = [
        "[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] LevelMgr@ EnterLevel",
        "[2025.11.26-20.02.54:100][714]GameLog: Display: [Game] LevelMgr@ LevelUid, LevelType, LevelId = 1121002 3 5302",
        "[2025.11.26-20.02.54:200][715]GameLog: Display: [Game] LevelMgr@:LevelPath, Model = /Game/Art/Maps/XZ_GW SomeModel",
    ];

    fn parser_with_timeout(
        timeout: Duration,
    ) -> (EnterLevelParser, mpsc::UnboundedReceiver<ParserEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let maps = Arc::new(MapTable::load(Path::new("/nonexistent.json")).unwrap());
        (EnterLevelParser::with_timeout(tx, maps, timeout), rx)
    }

    fn parser() -> (EnterLevelParser, mpsc::UnboundedReceiver<ParserEvent>) {
        parser_with_timeout(DEFAULT_STATE_TIMEOUT)
    }

    #[test]
    fn full_sequence_emits_one_event() {
        let (mut p, mut rx) = parser();
        let events = drain(&mut p, &mut rx, &SEQUENCE);

        assert_eq!(events.len(), 1);
        let ParserEvent::EnterLevel(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.level_uid, 1121002);
        assert_eq!(e.level_type, 3);
        assert_eq!(e.level_id, 5302);
        assert_eq!(
            e.timestamp.format("%H:%M:%S%.3f").to_string(),
            "20:02:54.023"
        );
    }

    #[test]
    fn alternate_level_info_line_is_accepted() {
        let (mut p, mut rx) = parser();
        let events = drain(
            &mut p,
            &mut rx,
            &[
                SEQUENCE[0],
                "[2025.11.26-20.02.54:100][714]GameLog: Display: [Game] LeevelLinkData： 1121102 3 5314",
                SEQUENCE[2],
            ],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::EnterLevel(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.level_id, 5314);
    }

    #[test]
    fn interleaved_noise_is_tolerated() {
        let (mut p, mut rx) = parser();
        let events = drain(
            &mut p,
            &mut rx,
            &[
                SEQUENCE[0],
                "[2025.11.26-20.02.54:050][713]GameLog: Display: [Game] Unrelated chatter",
                SEQUENCE[1],
                "[2025.11.26-20.02.54:150][714]GameLog: Display: [Game] More chatter",
                SEQUENCE[2],
            ],
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn six_non_matching_lines_reset_to_idle() {
        let (mut p, mut rx) = parser();
        let mut lines = vec![SEQUENCE[0]];
        let noise = "[2025.11.26-20.02.54:050][713]GameLog: Display: [Game] noise";
        lines.extend([noise; 6]);
        // A fresh, complete sequence afterwards parses normally.
        lines.extend(SEQUENCE);

        let events = drain(&mut p, &mut rx, &lines);
        assert_eq!(events.len(), 1);
        assert_eq!(p.state, ParseState::Idle);
    }

    #[test]
    fn timeout_resets_and_next_sequence_parses() {
        let (mut p, mut rx) = parser_with_timeout(Duration::from_millis(20));
        p.feed_line(SEQUENCE[0]).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        // Stale state is discarded; the line after the sleep is processed
        // from IDLE, so no event for the old fragment.
        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.02.56:000][716]GameLog: Display: [Game] unrelated"],
        );
        assert!(events.is_empty());
        assert_eq!(p.state, ParseState::Idle);

        let events = drain(&mut p, &mut rx, &SEQUENCE);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn incomplete_sequence_emits_nothing() {
        let (mut p, mut rx) = parser();
        let events = drain(&mut p, &mut rx, &[SEQUENCE[0], SEQUENCE[1]]);
        assert!(events.is_empty());
    }
}
