//! Map reference table.
//!
//! `map_table.json` maps level ids to display data. Ids missing from the
//! table get their difficulty tier inferred from the nearest known map above
//! them: sibling maps sit 100 ids apart, one tier per step.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Map difficulty tiers, hardest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    #[serde(rename = "T8+")]
    T8Plus,
    #[serde(rename = "T8_2")]
    T8_2,
    #[serde(rename = "T8_1")]
    T8_1,
    #[serde(rename = "T8_0")]
    T8_0,
    #[serde(rename = "T7_2")]
    T7_2,
    #[serde(rename = "T7_1")]
    T7_1,
    #[serde(rename = "T7_0")]
    T7_0,
    T6,
    T5,
    T4,
    T3,
    T2,
    T1,
    DS,
}

impl Difficulty {
    pub const ORDERED: [Difficulty; 14] = [
        Difficulty::T8Plus,
        Difficulty::T8_2,
        Difficulty::T8_1,
        Difficulty::T8_0,
        Difficulty::T7_2,
        Difficulty::T7_1,
        Difficulty::T7_0,
        Difficulty::T6,
        Difficulty::T5,
        Difficulty::T4,
        Difficulty::T3,
        Difficulty::T2,
        Difficulty::T1,
        Difficulty::DS,
    ];

    pub fn index(&self) -> usize {
        Self::ORDERED.iter().position(|d| d == self).unwrap_or(0)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::T8Plus => "T8+",
            Difficulty::T8_2 => "T8_2",
            Difficulty::T8_1 => "T8_1",
            Difficulty::T8_0 => "T8_0",
            Difficulty::T7_2 => "T7_2",
            Difficulty::T7_1 => "T7_1",
            Difficulty::T7_0 => "T7_0",
            Difficulty::T6 => "T6",
            Difficulty::T5 => "T5",
            Difficulty::T4 => "T4",
            Difficulty::T3 => "T3",
            Difficulty::T2 => "T2",
            Difficulty::T1 => "T1",
            Difficulty::DS => "DS",
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapData {
    pub map_id: i64,
    pub name: String,
    pub asset: String,
    pub area: String,
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug, Deserialize)]
struct MapEntry {
    name: String,
    asset: String,
    area: String,
    #[serde(default)]
    difficulty: Option<Difficulty>,
}

/// Loaded map table plus a cache of inferred entries.
#[derive(Default)]
pub struct MapTable {
    maps: Mutex<HashMap<i64, MapData>>,
}

impl MapTable {
    /// Load from `map_table.json`. A missing file yields an empty table:
    /// lookups then return None and completions record the raw id only.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("🗺️ Map table not found at {}", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read map table {}", path.display()))?;
        let entries: HashMap<String, MapEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid map table {}", path.display()))?;

        let mut maps = HashMap::with_capacity(entries.len());
        for (id, entry) in entries {
            let Ok(map_id) = id.parse::<i64>() else {
                warn!("🗺️ Skipping non-numeric map id {id:?}");
                continue;
            };
            maps.insert(
                map_id,
                MapData {
                    map_id,
                    name: entry.name,
                    asset: entry.asset,
                    area: entry.area,
                    difficulty: entry.difficulty.or(Some(Difficulty::T8Plus)),
                },
            );
        }

        info!("🗺️ Loaded map table with {} entries", maps.len());
        Ok(Self {
            maps: Mutex::new(maps),
        })
    }

    pub fn get(&self, map_id: i64) -> Option<MapData> {
        if let Some(found) = self.maps.lock().get(&map_id).cloned() {
            return Some(found);
        }
        self.infer(map_id)
    }

    /// Derive an entry for an unknown id. Scan upward in +100 steps until a
    /// known map is found; each step is one tier below the found map's
    /// difficulty. The synthesized entry is cached.
    fn infer(&self, map_id: i64) -> Option<MapData> {
        let mut maps = self.maps.lock();

        let mut search_id = map_id;
        for step in 1..=Difficulty::ORDERED.len() {
            search_id += 100;
            if let Some(reference) = maps.get(&search_id).cloned() {
                let base_index = reference
                    .difficulty
                    .map(|d| d.index())
                    .unwrap_or(0);
                let index = (base_index + step).min(Difficulty::ORDERED.len() - 1);
                let difficulty = Difficulty::ORDERED[index];
                debug!(
                    "🗺️ Inferred difficulty {} for map {} from {}",
                    difficulty, map_id, search_id
                );

                let derived = MapData {
                    map_id,
                    difficulty: Some(difficulty),
                    ..reference
                };
                maps.insert(map_id, derived.clone());
                return Some(derived);
            }
        }

        None
    }
}
