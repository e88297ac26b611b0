//! Item change lines.
//!
//! ```text
//! [2025.11.26-20.02.54:023][713]GameLog: Display: [Game] ItemChange@ Update Id=5028_50acee19-c8e1-11f0-8ac6-000000000015 BagNum=796 in PageId=102 SlotId=21
//! [2025.11.27-01.03.06:492][750]GameLog: Display: [Game] ItemChange@ Add Id=261005_27c4f38a-ac22-11f0-b152-000000000188 BagNum=1 in PageId=100 SlotId=9
//! [2025.11.27-01.03.01:952][ 97]GameLog: Display: [Game] ItemChange@ Delete Id=261005_3dc0c281-ba2e-11f0-b761-000000000174 in PageId=100 SlotId=9
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::{ItemAction, ItemChangeEvent};
use crate::events::ParserEvent;
use crate::items::ItemCatalog;

lazy_static! {
    static ref ITEM_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\s*\d+\]GameLog:\s*Display:\s*\[Game\]\s*ItemChange@\s+(Add|Update|Delete)\s+Id=(\d+)_\S+(?:\s+BagNum=(\d+))?\s+in\s+PageId=(\d+)\s+SlotId=(\d+)"
    )
    .unwrap();
}

pub struct ItemChangeParser {
    out: UnboundedSender<ParserEvent>,
    catalog: Arc<ItemCatalog>,
}

impl ItemChangeParser {
    pub fn new(out: UnboundedSender<ParserEvent>, catalog: Arc<ItemCatalog>) -> Self {
        Self { out, catalog }
    }
}

impl Parser for ItemChangeParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "ItemChangeParser",
            version: "0.1.0",
            description: "Parses item quantity and state changes",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = ITEM_RE.captures(line) else {
            return Ok(());
        };

        let timestamp = parse_log_ts(&m[1])
            .ok_or_else(|| anyhow::anyhow!("bad timestamp in item change line"))?;
        let action = match &m[2] {
            "Add" => ItemAction::Add,
            "Update" => ItemAction::Update,
            _ => ItemAction::Delete,
        };
        let item_id: i64 = m[3].parse()?;
        // BagNum is absent on Delete lines.
        let amount: i64 = m.get(4).map(|v| v.as_str().parse()).transpose()?.unwrap_or(0);
        let page: i64 = m[5].parse()?;
        let slot: i64 = m[6].parse()?;

        let info = self.catalog.lookup(item_id);
        let _ = self.out.send(ParserEvent::ItemChange(ItemChangeEvent {
            timestamp,
            action,
            item_id,
            amount,
            page,
            slot,
            name: info.name,
            category: info.category,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::testutil::drain;
    use std::path::Path;
    use tokio::sync::mpsc;

    fn parser() -> (ItemChangeParser, mpsc::UnboundedReceiver<ParserEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let catalog = Arc::new(ItemCatalog::load(Path::new("/nonexistent.json")));
        (ItemChangeParser::new(tx, catalog), rx)
    }

    #[test]
    fn parses_update_with_quantity() {
        let (mut p, mut rx) = parser();
        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] ItemChange@ Update Id=5028_50acee19-c8e1-11f0-8ac6-000000000015 BagNum=796 in PageId=102 SlotId=21"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::ItemChange(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.action, ItemAction::Update);
        assert_eq!(e.item_id, 5028);
        assert_eq!(e.amount, 796);
        assert_eq!(e.page, 102);
        assert_eq!(e.slot, 21);
        assert_eq!(e.timestamp.format("%H:%M:%S").to_string(), "20:02:54");
    }

    #[test]
    fn delete_carries_amount_zero() {
        let (mut p, mut rx) = parser();
        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.27-01.03.01:952][ 97]GameLog: Display: [Game] ItemChange@ Delete Id=261005_3dc0c281-ba2e-11f0-b761-000000000174 in PageId=100 SlotId=9"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::ItemChange(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!(e.action, ItemAction::Delete);
        assert_eq!(e.amount, 0);
    }

    #[test]
    fn unrelated_lines_are_skipped() {
        let (mut p, mut rx) = parser();
        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] Something else entirely"],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn replay_from_reset_is_deterministic() {
        let line = "[2025.11.27-01.03.06:492][750]GameLog: Display: [Game] ItemChange@ Add Id=261005_27c4f38a-ac22-11f0-b152-000000000188 BagNum=1 in PageId=100 SlotId=9";
        let (mut p1, mut rx1) = parser();
        let (mut p2, mut rx2) = parser();
        let a = drain(&mut p1, &mut rx1, &[line, line]);
        let b = drain(&mut p2, &mut rx2, &[line, line]);
        assert_eq!(a.len(), 2);
        assert_eq!(a.len(), b.len());
    }
}
