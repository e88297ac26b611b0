//! Read-only item reference lookup.
//!
//! `price_table.json` doubles as the item catalogue: alongside each price it
//! carries the item's display name and category. Parsers and services use
//! this to attach metadata to raw item ids.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ItemInfo {
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Default)]
pub struct ItemCatalog {
    items: RwLock<HashMap<i64, ItemInfo>>,
}

impl ItemCatalog {
    /// Load the catalogue. A missing or malformed file is not fatal; lookups
    /// simply return empty metadata.
    pub fn load(path: &Path) -> Self {
        let items = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, CatalogEntry>>(&raw) {
                Ok(entries) => entries
                    .into_iter()
                    .filter_map(|(id, entry)| {
                        id.parse::<i64>().ok().map(|item_id| {
                            (
                                item_id,
                                ItemInfo {
                                    name: entry.name,
                                    category: entry.category,
                                },
                            )
                        })
                    })
                    .collect(),
                Err(e) => {
                    warn!("🎁 Invalid item catalogue {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => {
                warn!("🎁 Item catalogue not found at {}", path.display());
                HashMap::new()
            }
        };

        info!("🎁 Loaded item catalogue with {} entries", items.len());
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn lookup(&self, item_id: i64) -> ItemInfo {
        self.items.read().get(&item_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lookup_returns_metadata_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("price_table.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(
            br#"{"5028": {"name": "Flux Crystal", "category": "currency", "price": 1.0}}"#,
        )
        .unwrap();

        let catalog = ItemCatalog::load(&path);
        assert_eq!(catalog.lookup(5028).name.as_deref(), Some("Flux Crystal"));
        assert_eq!(catalog.lookup(5028).category.as_deref(), Some("currency"));
        assert!(catalog.lookup(999).name.is_none());
    }

    #[test]
    fn missing_catalogue_is_empty() {
        let catalog = ItemCatalog::load(Path::new("/nonexistent/price_table.json"));
        assert!(catalog.lookup(1).name.is_none());
    }
}
