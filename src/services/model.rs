//! In-memory inventory projection shared between services.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;

/// One occupied bag slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryItem {
    pub item_id: i64,
    pub quantity: i64,
    pub name: Option<String>,
    pub category: Option<String>,
}

/// Live bag state: `(page, slot) -> item`. A slot is either present with
/// quantity >= 1 or absent.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub slots: HashMap<(i64, i64), InventoryItem>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total quantity of `item_id` summed over every slot.
    pub fn total_quantity(&self, item_id: i64) -> i64 {
        self.slots
            .values()
            .filter(|item| item.item_id == item_id)
            .map(|item| item.quantity)
            .sum()
    }

    /// Replace the contents of one slot and return the change in total
    /// quantity of `item_id` across all slots. A move between slots nets to
    /// zero; only a real gain or loss produces a non-zero delta. This is the
    /// primitive market tracking is built on.
    pub fn change_item(
        &mut self,
        page: i64,
        slot: i64,
        item_id: i64,
        quantity: i64,
        name: Option<String>,
        category: Option<String>,
    ) -> i64 {
        let previous_total = self.total_quantity(item_id);

        let key = (page, slot);
        if quantity <= 0 {
            self.slots.remove(&key);
        } else {
            self.slots.insert(
                key,
                InventoryItem {
                    item_id,
                    quantity,
                    name,
                    category,
                },
            );
        }

        self.total_quantity(item_id) - previous_total
    }

    /// item_id -> total quantity over all slots.
    pub fn item_totals(&self) -> HashMap<i64, i64> {
        let mut totals: HashMap<i64, i64> = HashMap::new();
        for item in self.slots.values() {
            *totals.entry(item.item_id).or_insert(0) += item.quantity;
        }
        totals
    }
}

/// Immutable copy of the inventory at a moment in time, produced on demand
/// via the bus request/response idiom.
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    pub timestamp: NaiveDateTime,
    pub data: Inventory,
}

impl InventorySnapshot {
    pub fn from_inventory(inventory: &Inventory) -> Self {
        Self {
            timestamp: crate::events::now(),
            data: inventory.clone(),
        }
    }

    /// Per-item total-quantity deltas relative to `older`. Zero deltas are
    /// omitted; slot positions are not considered.
    pub fn compare_with(&self, older: &InventorySnapshot) -> HashMap<i64, i64> {
        let old_totals = older.data.item_totals();
        let new_totals = self.data.item_totals();

        let mut diff = HashMap::new();
        for item_id in old_totals.keys().chain(new_totals.keys()) {
            let delta = new_totals.get(item_id).copied().unwrap_or(0)
                - old_totals.get(item_id).copied().unwrap_or(0);
            if delta != 0 {
                diff.insert(*item_id, delta);
            }
        }
        diff
    }
}
