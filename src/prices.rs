//! Item price book.
//!
//! A read-mostly `item_id -> price` cache refreshed from a remote JSON URL
//! when configured, falling back to the local `price_table.json`. Every
//! refresh writes a `PriceRevision` audit row; the local path skips the file
//! when it has not changed since the latest LOCAL revision and hydrates the
//! cache from storage instead.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::events::service::ItemDataChangedEvent;
use crate::events::{Event, EventBus, EventKind, ServiceEvent, ServiceEventKind};
use crate::items::ItemCatalog;
use crate::storage::{Database, PriceSource};

#[derive(Debug, Deserialize)]
struct PriceEntry {
    #[serde(default)]
    price: f64,
}

pub struct PriceBook {
    cache: RwLock<HashMap<i64, f64>>,
    loaded: AtomicBool,
    db: Arc<Database>,
    catalog: Arc<ItemCatalog>,
    http: reqwest::Client,
    remote_url: Option<String>,
    local_path: PathBuf,
}

impl PriceBook {
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<ItemCatalog>,
        remote_url: Option<String>,
        local_path: PathBuf,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            cache: RwLock::new(HashMap::new()),
            loaded: AtomicBool::new(false),
            db,
            catalog,
            http,
            remote_url,
            local_path,
        })
    }

    /// Patch the cache in place when an item is edited through the API,
    /// without a full reload.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let book = Arc::clone(self);
        bus.subscribe(
            EventKind::Service(ServiceEventKind::ItemDataChanged),
            "PriceBook::on_item_data_changed",
            Arc::new(move |event| {
                let book = Arc::clone(&book);
                Box::pin(async move {
                    if let Event::Service(ServiceEvent::ItemDataChanged(e)) = event {
                        book.on_item_data_changed(&e);
                    }
                    Ok(())
                })
            }),
        );
    }

    /// Refresh policy: remote first when configured, local fallback.
    pub async fn refresh(&self) -> Result<bool> {
        if let Some(url) = self.remote_url.clone() {
            info!("💰 Attempting to fetch prices from remote: {}", url);
            match self.load_remote(&url).await {
                Ok(count) => {
                    self.db.insert_price_revision(PriceSource::Remote, count as i64)?;
                    info!("💰 Loaded {} item prices from remote", count);
                    return Ok(true);
                }
                Err(e) => warn!("💰 Remote price fetch failed, falling back to local: {e:#}"),
            }
        }

        info!("💰 Loading prices from local file");
        self.load_local()
    }

    async fn load_remote(&self, url: &str) -> Result<usize> {
        let response = self.http.get(url).send().await.context("price request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("remote returned status {}", response.status());
        }
        let data: HashMap<String, PriceEntry> =
            response.json().await.context("invalid price JSON")?;

        let mut cache = HashMap::with_capacity(data.len());
        for (item_id_str, entry) in data {
            match item_id_str.parse::<i64>() {
                Ok(item_id) => {
                    cache.insert(item_id, entry.price);
                }
                Err(_) => warn!("💰 Invalid item id in remote price data: {item_id_str:?}"),
            }
        }

        let count = cache.len();
        *self.cache.write() = cache;
        self.loaded.store(true, Ordering::Release);
        Ok(count)
    }

    fn load_local(&self) -> Result<bool> {
        if !self.local_path.exists() {
            warn!("💰 Price table not found at {}", self.local_path.display());
            return Ok(false);
        }

        let mtime = std::fs::metadata(&self.local_path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| chrono::DateTime::<chrono::Local>::from(t).naive_local());

        // Unchanged file since the last LOCAL revision: hydrate from the
        // Item table and do not write a new revision.
        if let (Some(mtime), Some(revision)) =
            (mtime, self.db.latest_revision_time(PriceSource::Local)?)
        {
            if mtime <= revision {
                info!("💰 Local price file unchanged since last load ({revision})");
                self.load_from_db()?;
                return Ok(false);
            }
        }

        let raw = std::fs::read_to_string(&self.local_path)
            .with_context(|| format!("Failed to read {}", self.local_path.display()))?;
        let data: HashMap<String, PriceEntry> =
            serde_json::from_str(&raw).context("invalid local price JSON")?;

        let mut cache = HashMap::with_capacity(data.len());
        for (item_id_str, entry) in data {
            let Ok(item_id) = item_id_str.parse::<i64>() else {
                warn!("💰 Invalid item id in price table: {item_id_str:?}");
                continue;
            };
            let info = self.catalog.lookup(item_id);
            self.db.upsert_item_price(
                item_id,
                entry.price,
                info.name.as_deref(),
                info.category.as_deref(),
            )?;
            cache.insert(item_id, entry.price);
        }

        let count = cache.len();
        *self.cache.write() = cache;
        self.loaded.store(true, Ordering::Release);
        self.db.insert_price_revision(PriceSource::Local, count as i64)?;
        info!("💰 Loaded {} item prices from local file and updated database", count);
        Ok(true)
    }

    fn load_from_db(&self) -> Result<()> {
        let prices = self.db.load_item_prices()?;
        info!("💰 Loaded {} prices from database", prices.len());
        *self.cache.write() = prices;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Synchronous lookup; unknown or unloaded items price at 0.
    pub fn get_price(&self, item_id: i64) -> f64 {
        if !self.loaded.load(Ordering::Acquire) {
            warn!("💰 Price book not loaded yet, returning 0.0");
            return 0.0;
        }
        self.cache.read().get(&item_id).copied().unwrap_or(0.0)
    }

    fn on_item_data_changed(&self, event: &ItemDataChangedEvent) {
        match event.price {
            Some(price) if price >= 0.0 => {
                self.cache.write().insert(event.item_id, price);
                info!("💰 Updated cache for item {}: {price}", event.item_id);
            }
            _ => {
                if self.cache.write().remove(&event.item_id).is_some() {
                    info!("💰 Removed item {} from cache", event.item_id);
                }
            }
        }
        debug!("💰 Cache size now {}", self.cache.read().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn fixture(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("price_table.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn book_at(dir: &Path, body: &str) -> (Arc<Database>, PriceBook) {
        let db = Arc::new(Database::open(&dir.join("test.db")).unwrap());
        let path = fixture(dir, body);
        let catalog = Arc::new(ItemCatalog::load(&path));
        let book = PriceBook::new(Arc::clone(&db), catalog, None, path).unwrap();
        (db, book)
    }

    #[tokio::test]
    async fn local_load_fills_cache_and_writes_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (db, book) = book_at(
            dir.path(),
            r#"{"5028": {"name": "Flux Crystal", "category": "currency", "price": 1.5}}"#,
        );

        assert!(book.refresh().await.unwrap());
        assert_eq!(book.get_price(5028), 1.5);
        assert_eq!(book.get_price(404), 0.0);
        assert!(db.latest_revision_time(PriceSource::Local).unwrap().is_some());
        // The item row was created with catalogue metadata.
        let item = db.get_item(5028).unwrap().unwrap();
        assert_eq!(item.name.as_deref(), Some("Flux Crystal"));
        assert_eq!(item.price, 1.5);
    }

    #[tokio::test]
    async fn unchanged_file_hydrates_from_db_without_new_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (db, book) = book_at(dir.path(), r#"{"5028": {"price": 2.0}}"#);

        assert!(book.refresh().await.unwrap());
        // Second refresh: mtime is not newer than the revision just written.
        assert!(!book.refresh().await.unwrap());
        assert_eq!(book.get_price(5028), 2.0);

        let conn_count: i64 = {
            let rows = db.list_items(10, 0).unwrap();
            rows.len() as i64
        };
        assert_eq!(conn_count, 1);
    }

    #[tokio::test]
    async fn unloaded_book_prices_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, book) = book_at(dir.path(), r#"{"5028": {"price": 2.0}}"#);
        assert_eq!(book.get_price(5028), 0.0);
    }

    #[tokio::test]
    async fn item_data_changed_patches_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, book) = book_at(dir.path(), r#"{"5028": {"price": 2.0}}"#);
        book.refresh().await.unwrap();

        book.on_item_data_changed(&ItemDataChangedEvent {
            timestamp: crate::events::now(),
            item_id: 5028,
            name: None,
            category: None,
            price: Some(9.0),
        });
        assert_eq!(book.get_price(5028), 9.0);

        book.on_item_data_changed(&ItemDataChangedEvent {
            timestamp: crate::events::now(),
            item_id: 5028,
            name: None,
            category: None,
            price: None,
        });
        assert_eq!(book.get_price(5028), 0.0);
    }
}
