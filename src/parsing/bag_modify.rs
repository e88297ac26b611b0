//! Bag slot modification lines.
//!
//! ```text
//! [2025.11.26-20.02.54:023][713]GameLog: Display: [Game] BagMgr@:Modfy BagItem PageId = 102 SlotId = 21 ConfigBaseId = 5028 Num = 796
//! ```
//!
//! "Modfy" is the game's own spelling.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use super::{parse_log_ts, Parser, ParserDescriptor};
use crate::events::parser::BagModifyEvent;
use crate::events::ParserEvent;
use crate::items::ItemCatalog;

lazy_static! {
    static ref BAG_MODIFY_RE: Regex = Regex::new(
        r"\[(\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}):\d+\]\[\d+\]GameLog: Display: \[Game\] BagMgr@:Modfy BagItem PageId = (\d+) SlotId = (\d+) ConfigBaseId = (\d+) Num = (\d+)"
    )
    .unwrap();
}

pub struct BagModifyParser {
    out: UnboundedSender<ParserEvent>,
    catalog: Arc<ItemCatalog>,
}

impl BagModifyParser {
    pub fn new(out: UnboundedSender<ParserEvent>, catalog: Arc<ItemCatalog>) -> Self {
        Self { out, catalog }
    }
}

impl Parser for BagModifyParser {
    fn descriptor(&self) -> ParserDescriptor {
        ParserDescriptor {
            name: "BagModifyParser",
            version: "0.1.0",
            description: "Parses bag/inventory modification events",
        }
    }

    fn feed_line(&mut self, line: &str) -> anyhow::Result<()> {
        let Some(m) = BAG_MODIFY_RE.captures(line) else {
            return Ok(());
        };

        let timestamp = parse_log_ts(&m[1])
            .ok_or_else(|| anyhow::anyhow!("bad timestamp in bag modify line"))?;
        let page: i64 = m[2].parse()?;
        let slot: i64 = m[3].parse()?;
        let item_id: i64 = m[4].parse()?;
        let quantity: i64 = m[5].parse()?;

        let info = self.catalog.lookup(item_id);
        let _ = self.out.send(ParserEvent::BagModify(BagModifyEvent {
            timestamp,
            page,
            slot,
            item_id,
            quantity,
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

    #[test]
    fn parses_bag_modify_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let catalog = Arc::new(ItemCatalog::load(Path::new("/nonexistent.json")));
        let mut p = BagModifyParser::new(tx, catalog);

        let events = drain(
            &mut p,
            &mut rx,
            &["[2025.11.26-20.02.54:023][713]GameLog: Display: [Game] BagMgr@:Modfy BagItem PageId = 102 SlotId = 21 ConfigBaseId = 5028 Num = 796"],
        );

        assert_eq!(events.len(), 1);
        let ParserEvent::BagModify(e) = &events[0] else {
            panic!("wrong event");
        };
        assert_eq!((e.page, e.slot, e.item_id, e.quantity), (102, 21, 5028, 796));
    }
}
