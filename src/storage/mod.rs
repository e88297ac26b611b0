//! Relational store on rusqlite.
//!
//! One connection behind a parking_lot mutex, WAL mode, schema applied as a
//! single batch at open. All timestamps are stored as ISO-8601 TEXT with
//! millisecond precision. Foreign references to items use the game's
//! `item_id`, which is globally unique.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::events::service::TransactionAction;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS players (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    level INTEGER NOT NULL DEFAULT 1,
    experience INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL UNIQUE,
    name TEXT,
    category TEXT,
    rarity TEXT,
    price REAL NOT NULL DEFAULT 0.0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inventory_items (
    id INTEGER PRIMARY KEY,
    player_id INTEGER NOT NULL REFERENCES players(id),
    item_id INTEGER NOT NULL REFERENCES items(item_id),
    page INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL,
    UNIQUE(player_id, page, slot)
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    player_id INTEGER REFERENCES players(id),
    player_name TEXT,
    is_active INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_maps INTEGER NOT NULL DEFAULT 0,
    total_currency_delta REAL NOT NULL DEFAULT 0.0,
    currency_per_hour REAL NOT NULL DEFAULT 0.0,
    currency_per_map REAL NOT NULL DEFAULT 0.0,
    total_time REAL NOT NULL DEFAULT 0.0,
    exp_total REAL NOT NULL DEFAULT 0.0,
    exp_per_hour REAL NOT NULL DEFAULT 0.0,
    currency_total REAL NOT NULL DEFAULT 0.0,
    title TEXT,
    description TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_active
    ON sessions(is_active, player_name);

CREATE TABLE IF NOT EXISTS map_completions (
    id INTEGER PRIMARY KEY,
    player_id INTEGER NOT NULL REFERENCES players(id),
    player_name TEXT,
    session_id INTEGER REFERENCES sessions(id),
    map_id INTEGER NOT NULL,
    map_name TEXT,
    map_difficulty TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    duration REAL NOT NULL,
    currency_gained REAL NOT NULL DEFAULT 0.0,
    exp_gained REAL NOT NULL DEFAULT 0.0,
    items_gained INTEGER NOT NULL DEFAULT 0,
    description TEXT
);

CREATE INDEX IF NOT EXISTS idx_map_completions_session
    ON map_completions(session_id, completed_at DESC);

CREATE TABLE IF NOT EXISTS map_completion_items (
    id INTEGER PRIMARY KEY,
    map_completion_id INTEGER NOT NULL REFERENCES map_completions(id),
    item_id INTEGER NOT NULL REFERENCES items(item_id),
    delta INTEGER NOT NULL,
    total_price REAL NOT NULL DEFAULT 0.0,
    consumed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_map_completion_items_completion
    ON map_completion_items(map_completion_id);

CREATE TABLE IF NOT EXISTS affixes (
    id INTEGER PRIMARY KEY,
    affix_id INTEGER NOT NULL UNIQUE,
    description TEXT
);

CREATE TABLE IF NOT EXISTS map_affixes (
    id INTEGER PRIMARY KEY,
    map_completion_id INTEGER NOT NULL REFERENCES map_completions(id),
    affix_id INTEGER NOT NULL REFERENCES affixes(id),
    UNIQUE(map_completion_id, affix_id)
);

CREATE TABLE IF NOT EXISTS market_transactions (
    id INTEGER PRIMARY KEY,
    session_id INTEGER REFERENCES sessions(id),
    timestamp TEXT NOT NULL,
    item_id INTEGER NOT NULL REFERENCES items(item_id),
    quantity INTEGER NOT NULL,
    action TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_market_transactions_session
    ON market_transactions(session_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS price_revisions (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    item_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_price_revisions_source
    ON price_revisions(source, timestamp DESC);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct PlayerRow {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub experience: i64,
    pub last_seen: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemRow {
    pub item_id: i64,
    pub name: Option<String>,
    pub category: Option<String>,
    pub rarity: Option<String>,
    pub price: f64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryRow {
    pub player_name: String,
    pub page: i64,
    pub slot: i64,
    pub item_id: i64,
    pub quantity: i64,
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: i64,
    pub player_id: Option<i64>,
    pub player_name: Option<String>,
    pub is_active: bool,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub total_maps: i64,
    pub total_currency_delta: f64,
    pub currency_per_hour: f64,
    pub currency_per_map: f64,
    pub total_time: f64,
    pub exp_total: f64,
    pub exp_per_hour: f64,
    pub currency_total: f64,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapCompletionRow {
    pub id: i64,
    pub player_id: i64,
    pub player_name: Option<String>,
    pub session_id: Option<i64>,
    pub map_id: i64,
    pub map_name: Option<String>,
    pub map_difficulty: Option<String>,
    pub started_at: NaiveDateTime,
    pub completed_at: NaiveDateTime,
    pub duration: f64,
    pub currency_gained: f64,
    pub exp_gained: f64,
    pub items_gained: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapCompletionItemRow {
    pub id: i64,
    pub map_completion_id: i64,
    pub item_id: i64,
    pub delta: i64,
    pub total_price: f64,
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffixRow {
    pub id: i64,
    pub affix_id: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketTransactionRow {
    pub id: i64,
    pub session_id: Option<i64>,
    pub timestamp: NaiveDateTime,
    pub item_id: i64,
    pub quantity: i64,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Local,
    Remote,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Local => "LOCAL",
            PriceSource::Remote => "REMOTE",
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) and apply the schema. A database locked by
    /// another instance is fatal with a clear message.
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;

        if let Err(e) = conn.execute_batch(SCHEMA_SQL) {
            if let rusqlite::Error::SqliteFailure(code, _) = &e {
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) {
                    anyhow::bail!(
                        "Database {} is locked - is another instance already running?",
                        path.display()
                    );
                }
            }
            return Err(e).context("Failed to initialize database schema");
        }

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("📊 Database initialized at: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Get-or-create the player and refresh its last_seen timestamp.
    pub fn touch_player(&self, name: &str) -> Result<PlayerRow> {
        let now = fmt_ts(crate::events::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO players (name, last_seen, created_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(name) DO UPDATE SET last_seen = ?2",
            params![name, now],
        )?;
        Self::player_by_name(&conn, name)?
            .ok_or_else(|| anyhow::anyhow!("player {name} vanished after upsert"))
    }

    pub fn get_player(&self, name: &str) -> Result<Option<PlayerRow>> {
        Self::player_by_name(&self.conn.lock(), name)
    }

    pub fn update_player_progress(&self, name: &str, level: i64, experience: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE players SET level = ?2, experience = ?3, last_seen = ?4 WHERE name = ?1",
            params![name, level, experience, fmt_ts(crate::events::now())],
        )?;
        Ok(())
    }

    pub fn list_players(&self) -> Result<Vec<PlayerRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, level, experience, last_seen, created_at FROM players ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], Self::map_player)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn player_by_name(conn: &Connection, name: &str) -> Result<Option<PlayerRow>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, level, experience, last_seen, created_at FROM players WHERE name = ?1",
        )?;
        Ok(stmt.query_row(params![name], Self::map_player).optional()?)
    }

    fn map_player(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerRow> {
        Ok(PlayerRow {
            id: row.get(0)?,
            name: row.get(1)?,
            level: row.get(2)?,
            experience: row.get(3)?,
            last_seen: parse_ts(&row.get::<_, String>(4)?).unwrap_or_default(),
            created_at: parse_ts(&row.get::<_, String>(5)?).unwrap_or_default(),
        })
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Create the item on first sight; fills name/category only when they
    /// are still NULL so administrative edits are not clobbered.
    pub fn ensure_item(&self, item_id: i64, name: Option<&str>, category: Option<&str>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO items (item_id, name, category, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                 name = COALESCE(items.name, excluded.name),
                 category = COALESCE(items.category, excluded.category)",
            params![item_id, name, category, fmt_ts(crate::events::now())],
        )?;
        Ok(())
    }

    /// Price-book load path: upsert the item with its refreshed price.
    pub fn upsert_item_price(
        &self,
        item_id: i64,
        price: f64,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO items (item_id, name, category, price, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(item_id) DO UPDATE SET
                 price = excluded.price,
                 name = COALESCE(excluded.name, items.name),
                 category = COALESCE(excluded.category, items.category),
                 updated_at = excluded.updated_at",
            params![item_id, name, category, price, fmt_ts(crate::events::now())],
        )?;
        Ok(())
    }

    /// Administrative edit. Returns false when the item does not exist.
    pub fn update_item(
        &self,
        item_id: i64,
        name: Option<&str>,
        category: Option<&str>,
        rarity: Option<&str>,
        price: Option<f64>,
    ) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE items SET
                 name = COALESCE(?2, name),
                 category = COALESCE(?3, category),
                 rarity = COALESCE(?4, rarity),
                 price = COALESCE(?5, price),
                 updated_at = ?6
             WHERE item_id = ?1",
            params![
                item_id,
                name,
                category,
                rarity,
                price,
                fmt_ts(crate::events::now())
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_item(&self, item_id: i64) -> Result<Option<ItemRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT item_id, name, category, rarity, price, updated_at FROM items WHERE item_id = ?1",
        )?;
        Ok(stmt.query_row(params![item_id], Self::map_item).optional()?)
    }

    pub fn list_items(&self, limit: i64, offset: i64) -> Result<Vec<ItemRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT item_id, name, category, rarity, price, updated_at
             FROM items ORDER BY item_id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], Self::map_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// item_id -> price for every item with a positive price. Used to
    /// hydrate the price cache without re-reading the local file.
    pub fn load_item_prices(&self) -> Result<HashMap<i64, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT item_id, price FROM items WHERE price > 0")?;
        let mut prices = HashMap::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))?;
        for row in rows {
            let (item_id, price) = row?;
            prices.insert(item_id, price);
        }
        Ok(prices)
    }

    fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
        Ok(ItemRow {
            item_id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            rarity: row.get(3)?,
            price: row.get(4)?,
            updated_at: parse_ts(&row.get::<_, String>(5)?).unwrap_or_default(),
        })
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    pub fn upsert_inventory_slot(
        &self,
        player_id: i64,
        page: i64,
        slot: i64,
        item_id: i64,
        quantity: i64,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO inventory_items (player_id, item_id, page, slot, quantity, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(player_id, page, slot) DO UPDATE SET
                 item_id = excluded.item_id,
                 quantity = excluded.quantity,
                 updated_at = excluded.updated_at",
            params![player_id, item_id, page, slot, quantity, fmt_ts(crate::events::now())],
        )?;
        Ok(())
    }

    pub fn delete_inventory_slot(&self, player_id: i64, page: i64, slot: i64) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM inventory_items WHERE player_id = ?1 AND page = ?2 AND slot = ?3",
            params![player_id, page, slot],
        )?;
        Ok(())
    }

    /// Load a player's persisted inventory joined with item metadata.
    pub fn load_inventory(&self, player_id: i64) -> Result<Vec<InventoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT p.name, inv.page, inv.slot, inv.item_id, inv.quantity, i.name, i.category
             FROM inventory_items inv
             JOIN players p ON p.id = inv.player_id
             LEFT JOIN items i ON i.item_id = inv.item_id
             WHERE inv.player_id = ?1
             ORDER BY inv.page, inv.slot",
        )?;
        let rows = stmt
            .query_map(params![player_id], Self::map_inventory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_inventory(&self, player_name: Option<&str>) -> Result<Vec<InventoryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT p.name, inv.page, inv.slot, inv.item_id, inv.quantity, i.name, i.category
             FROM inventory_items inv
             JOIN players p ON p.id = inv.player_id
             LEFT JOIN items i ON i.item_id = inv.item_id
             WHERE (?1 IS NULL OR p.name = ?1)
             ORDER BY p.name, inv.page, inv.slot",
        )?;
        let rows = stmt
            .query_map(params![player_name], Self::map_inventory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_inventory(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryRow> {
        Ok(InventoryRow {
            player_name: row.get(0)?,
            page: row.get(1)?,
            slot: row.get(2)?,
            item_id: row.get(3)?,
            quantity: row.get(4)?,
            name: row.get(5)?,
            category: row.get(6)?,
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn create_session(
        &self,
        player_id: i64,
        player_name: &str,
        started_at: NaiveDateTime,
    ) -> Result<SessionRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (player_id, player_name, is_active, started_at)
             VALUES (?1, ?2, 1, ?3)",
            params![player_id, player_name, fmt_ts(started_at)],
        )?;
        let id = conn.last_insert_rowid();
        Self::session_by_id(&conn, id)?.context("session vanished after insert")
    }

    pub fn save_session(&self, session: &SessionRow) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET
                 is_active = ?2, ended_at = ?3,
                 total_maps = ?4, total_currency_delta = ?5,
                 currency_per_hour = ?6, currency_per_map = ?7,
                 total_time = ?8, exp_total = ?9, exp_per_hour = ?10,
                 currency_total = ?11, title = ?12, description = ?13
             WHERE id = ?1",
            params![
                session.id,
                session.is_active,
                session.ended_at.map(fmt_ts),
                session.total_maps,
                session.total_currency_delta,
                session.currency_per_hour,
                session.currency_per_map,
                session.total_time,
                session.exp_total,
                session.exp_per_hour,
                session.currency_total,
                session.title,
                session.description,
            ],
        )?;
        Ok(())
    }

    /// Most recent active session, optionally restricted to one player.
    pub fn find_active_session(&self, player_name: Option<&str>) -> Result<Option<SessionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, player_id, player_name, is_active, started_at, ended_at,
                    total_maps, total_currency_delta, currency_per_hour, currency_per_map,
                    total_time, exp_total, exp_per_hour, currency_total, title, description
             FROM sessions
             WHERE is_active = 1 AND (?1 IS NULL OR player_name = ?1)
             ORDER BY started_at DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![player_name], Self::map_session)
            .optional()?)
    }

    pub fn get_session(&self, id: i64) -> Result<Option<SessionRow>> {
        Self::session_by_id(&self.conn.lock(), id)
    }

    pub fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<SessionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, player_id, player_name, is_active, started_at, ended_at,
                    total_maps, total_currency_delta, currency_per_hour, currency_per_map,
                    total_time, exp_total, exp_per_hour, currency_total, title, description
             FROM sessions ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], Self::map_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn session_by_id(conn: &Connection, id: i64) -> Result<Option<SessionRow>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, player_id, player_name, is_active, started_at, ended_at,
                    total_maps, total_currency_delta, currency_per_hour, currency_per_map,
                    total_time, exp_total, exp_per_hour, currency_total, title, description
             FROM sessions WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id], Self::map_session).optional()?)
    }

    fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
        Ok(SessionRow {
            id: row.get(0)?,
            player_id: row.get(1)?,
            player_name: row.get(2)?,
            is_active: row.get(3)?,
            started_at: parse_ts(&row.get::<_, String>(4)?).unwrap_or_default(),
            ended_at: row
                .get::<_, Option<String>>(5)?
                .and_then(|raw| parse_ts(&raw)),
            total_maps: row.get(6)?,
            total_currency_delta: row.get(7)?,
            currency_per_hour: row.get(8)?,
            currency_per_map: row.get(9)?,
            total_time: row.get(10)?,
            exp_total: row.get(11)?,
            exp_per_hour: row.get(12)?,
            currency_total: row.get(13)?,
            title: row.get(14)?,
            description: row.get(15)?,
        })
    }

    // ------------------------------------------------------------------
    // Map completions
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_map_completion(
        &self,
        player_id: i64,
        player_name: &str,
        session_id: Option<i64>,
        map_id: i64,
        map_name: Option<&str>,
        map_difficulty: Option<&str>,
        started_at: NaiveDateTime,
        completed_at: NaiveDateTime,
        duration: f64,
        currency_gained: f64,
        exp_gained: f64,
        items_gained: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO map_completions
                 (player_id, player_name, session_id, map_id, map_name, map_difficulty,
                  started_at, completed_at, duration, currency_gained, exp_gained, items_gained)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                player_id,
                player_name,
                session_id,
                map_id,
                map_name,
                map_difficulty,
                fmt_ts(started_at),
                fmt_ts(completed_at),
                duration,
                currency_gained,
                exp_gained,
                items_gained,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_map_completion_item(
        &self,
        map_completion_id: i64,
        item_id: i64,
        delta: i64,
        total_price: f64,
        consumed: bool,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO map_completion_items (map_completion_id, item_id, delta, total_price, consumed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![map_completion_id, item_id, delta, total_price, consumed],
        )?;
        Ok(())
    }

    /// Get-or-create the affix row, returning its id. The description is
    /// written on first sight only.
    pub fn upsert_affix(&self, affix_id: i64, description: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO affixes (affix_id, description) VALUES (?1, ?2)
             ON CONFLICT(affix_id) DO UPDATE SET
                 description = COALESCE(affixes.description, excluded.description)",
            params![affix_id, description],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM affixes WHERE affix_id = ?1",
            params![affix_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn link_map_affix(&self, map_completion_id: i64, affix_row_id: i64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO map_affixes (map_completion_id, affix_id) VALUES (?1, ?2)",
            params![map_completion_id, affix_row_id],
        )?;
        Ok(())
    }

    pub fn get_map_completion(&self, id: i64) -> Result<Option<MapCompletionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, player_id, player_name, session_id, map_id, map_name, map_difficulty,
                    started_at, completed_at, duration, currency_gained, exp_gained,
                    items_gained, description
             FROM map_completions WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![id], Self::map_completion)
            .optional()?)
    }

    pub fn list_map_completions(
        &self,
        limit: i64,
        offset: i64,
        session_id: Option<i64>,
    ) -> Result<Vec<MapCompletionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, player_id, player_name, session_id, map_id, map_name, map_difficulty,
                    started_at, completed_at, duration, currency_gained, exp_gained,
                    items_gained, description
             FROM map_completions
             WHERE (?3 IS NULL OR session_id = ?3)
             ORDER BY completed_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset, session_id], Self::map_completion)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn map_completion_items(&self, map_completion_id: i64) -> Result<Vec<MapCompletionItemRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, map_completion_id, item_id, delta, total_price, consumed
             FROM map_completion_items WHERE map_completion_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![map_completion_id], |row| {
                Ok(MapCompletionItemRow {
                    id: row.get(0)?,
                    map_completion_id: row.get(1)?,
                    item_id: row.get(2)?,
                    delta: row.get(3)?,
                    total_price: row.get(4)?,
                    consumed: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn map_completion_affixes(&self, map_completion_id: i64) -> Result<Vec<AffixRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.affix_id, a.description
             FROM map_affixes ma JOIN affixes a ON a.id = ma.affix_id
             WHERE ma.map_completion_id = ?1 ORDER BY a.affix_id",
        )?;
        let rows = stmt
            .query_map(params![map_completion_id], |row| {
                Ok(AffixRow {
                    id: row.get(0)?,
                    affix_id: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_completion(row: &rusqlite::Row<'_>) -> rusqlite::Result<MapCompletionRow> {
        Ok(MapCompletionRow {
            id: row.get(0)?,
            player_id: row.get(1)?,
            player_name: row.get(2)?,
            session_id: row.get(3)?,
            map_id: row.get(4)?,
            map_name: row.get(5)?,
            map_difficulty: row.get(6)?,
            started_at: parse_ts(&row.get::<_, String>(7)?).unwrap_or_default(),
            completed_at: parse_ts(&row.get::<_, String>(8)?).unwrap_or_default(),
            duration: row.get(9)?,
            currency_gained: row.get(10)?,
            exp_gained: row.get(11)?,
            items_gained: row.get(12)?,
            description: row.get(13)?,
        })
    }

    // ------------------------------------------------------------------
    // Market transactions
    // ------------------------------------------------------------------

    pub fn insert_market_transaction(
        &self,
        session_id: Option<i64>,
        timestamp: NaiveDateTime,
        item_id: i64,
        quantity: i64,
        action: TransactionAction,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_transactions (session_id, timestamp, item_id, quantity, action)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, fmt_ts(timestamp), item_id, quantity, action.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_market_transactions(
        &self,
        limit: i64,
        offset: i64,
        session_id: Option<i64>,
    ) -> Result<Vec<MarketTransactionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, timestamp, item_id, quantity, action
             FROM market_transactions
             WHERE (?3 IS NULL OR session_id = ?3)
             ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset, session_id], |row| {
                Ok(MarketTransactionRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    timestamp: parse_ts(&row.get::<_, String>(2)?).unwrap_or_default(),
                    item_id: row.get(3)?,
                    quantity: row.get(4)?,
                    action: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Price revisions
    // ------------------------------------------------------------------

    pub fn insert_price_revision(&self, source: PriceSource, item_count: i64) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO price_revisions (timestamp, source, item_count) VALUES (?1, ?2, ?3)",
            params![fmt_ts(crate::events::now()), source.as_str(), item_count],
        )?;
        Ok(())
    }

    pub fn latest_revision_time(&self, source: PriceSource) -> Result<Option<NaiveDateTime>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM price_revisions WHERE source = ?1
                 ORDER BY timestamp DESC LIMIT 1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|r| parse_ts(&r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn player_upsert_is_idempotent() {
        let (_dir, db) = test_db();
        let first = db.touch_player("Eryndor#7291").unwrap();
        let second = db.touch_player("Eryndor#7291").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_players().unwrap().len(), 1);
    }

    #[test]
    fn inventory_round_trips_through_storage() {
        let (_dir, db) = test_db();
        let player = db.touch_player("Eryndor#7291").unwrap();

        db.ensure_item(5028, Some("Flux Crystal"), Some("currency")).unwrap();
        db.ensure_item(9000, None, None).unwrap();
        db.upsert_inventory_slot(player.id, 100, 1, 5028, 796).unwrap();
        db.upsert_inventory_slot(player.id, 102, 21, 9000, 2).unwrap();
        // Re-writing a slot replaces it.
        db.upsert_inventory_slot(player.id, 102, 21, 9000, 1).unwrap();

        let rows = db.load_inventory(player.id).unwrap();
        assert_eq!(rows.len(), 2);
        let crystal = rows.iter().find(|r| r.item_id == 5028).unwrap();
        assert_eq!(crystal.quantity, 796);
        assert_eq!(crystal.name.as_deref(), Some("Flux Crystal"));
        let entry = rows.iter().find(|r| r.item_id == 9000).unwrap();
        assert_eq!(entry.quantity, 1);

        db.delete_inventory_slot(player.id, 100, 1).unwrap();
        assert_eq!(db.load_inventory(player.id).unwrap().len(), 1);
    }

    #[test]
    fn only_one_active_session_per_player() {
        let (_dir, db) = test_db();
        let player = db.touch_player("Eryndor#7291").unwrap();

        let mut first = db
            .create_session(player.id, &player.name, crate::events::now())
            .unwrap();
        assert!(first.is_active);

        // Close-then-create, as SessionService does on NEXT.
        first.is_active = false;
        first.ended_at = Some(crate::events::now());
        db.save_session(&first).unwrap();
        let second = db
            .create_session(player.id, &player.name, crate::events::now())
            .unwrap();

        let active = db.find_active_session(Some("Eryndor#7291")).unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let all = db.list_sessions(10, 0).unwrap();
        assert_eq!(all.iter().filter(|s| s.is_active).count(), 1);
    }

    #[test]
    fn session_counters_survive_save_and_reload() {
        let (_dir, db) = test_db();
        let player = db.touch_player("Eryndor#7291").unwrap();
        let mut session = db
            .create_session(player.id, &player.name, crate::events::now())
            .unwrap();

        session.total_maps = 7;
        session.currency_total = 123.5;
        session.total_time = 1800.0;
        db.save_session(&session).unwrap();

        let reloaded = db.get_session(session.id).unwrap().unwrap();
        assert_eq!(reloaded.total_maps, 7);
        assert_eq!(reloaded.currency_total, 123.5);
        assert!(reloaded.is_active);
    }

    #[test]
    fn map_completion_with_items_and_affixes() {
        let (_dir, db) = test_db();
        let player = db.touch_player("Eryndor#7291").unwrap();
        let session = db
            .create_session(player.id, &player.name, crate::events::now())
            .unwrap();

        db.ensure_item(5028, Some("Flux Crystal"), None).unwrap();
        let started = crate::events::now();
        let id = db
            .insert_map_completion(
                player.id,
                &player.name,
                Some(session.id),
                5302,
                Some("Grimwind Woods"),
                Some("T7_0"),
                started,
                started + chrono::Duration::seconds(30),
                30.0,
                3.0,
                500.0,
                1,
            )
            .unwrap();

        db.insert_map_completion_item(id, 5028, 3, 3.0, false).unwrap();
        let affix = db.upsert_affix(507, Some("Monsters deal extra damage")).unwrap();
        db.link_map_affix(id, affix).unwrap();
        // Duplicate link is ignored.
        db.link_map_affix(id, affix).unwrap();

        let row = db.get_map_completion(id).unwrap().unwrap();
        assert_eq!(row.map_name.as_deref(), Some("Grimwind Woods"));
        assert_eq!(db.map_completion_items(id).unwrap().len(), 1);
        assert_eq!(db.map_completion_affixes(id).unwrap().len(), 1);
    }

    #[test]
    fn affix_descriptions_write_once() {
        let (_dir, db) = test_db();
        let first = db.upsert_affix(507, Some("original")).unwrap();
        let second = db.upsert_affix(507, Some("changed")).unwrap();
        assert_eq!(first, second);

        let conn = db.conn.lock();
        let description: String = conn
            .query_row(
                "SELECT description FROM affixes WHERE affix_id = 507",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(description, "original");
    }

    #[test]
    fn price_revision_ordering() {
        let (_dir, db) = test_db();
        assert!(db.latest_revision_time(PriceSource::Local).unwrap().is_none());
        db.insert_price_revision(PriceSource::Local, 10).unwrap();
        db.insert_price_revision(PriceSource::Remote, 12).unwrap();
        assert!(db.latest_revision_time(PriceSource::Local).unwrap().is_some());
    }

    #[test]
    fn market_transactions_filter_by_session() {
        let (_dir, db) = test_db();
        let player = db.touch_player("Eryndor#7291").unwrap();
        let session = db
            .create_session(player.id, &player.name, crate::events::now())
            .unwrap();
        db.ensure_item(42, None, None).unwrap();

        db.insert_market_transaction(
            Some(session.id),
            crate::events::now(),
            42,
            5,
            TransactionAction::Gained,
        )
        .unwrap();
        db.insert_market_transaction(None, crate::events::now(), 42, 2, TransactionAction::Lost)
            .unwrap();

        assert_eq!(db.list_market_transactions(10, 0, None).unwrap().len(), 2);
        let scoped = db
            .list_market_transactions(10, 0, Some(session.id))
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].action, "gained");
    }
}
