//! Parser registry: line fan-out and event collection.
//!
//! Every inbound line is offered to every parser in sequence; a failing
//! parser is logged and the rest still run. Each parser's queue is drained
//! by its own task into one bounded buffer, and a publisher task pushes the
//! buffered events onto the bus in arrival order (best-effort FIFO per
//! parser). Optionally every published event is appended to a rotating log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{build_parsers, Parser};
use crate::events::{EventBus, ParserEvent};
use crate::items::ItemCatalog;
use crate::maps::MapTable;

const BUFFER_CAPACITY: usize = 1000;
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;

pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ParserRegistry {
    /// Build all parsers and spawn the drain/publish pipeline. Dropping the
    /// registry tears the pipeline down: parser queues close, drains end,
    /// and the publisher exits once the buffer runs dry.
    pub fn spawn(
        bus: Arc<EventBus>,
        catalog: &Arc<ItemCatalog>,
        maps: &Arc<MapTable>,
        event_log_dir: Option<PathBuf>,
    ) -> Self {
        let built = build_parsers(catalog, maps);
        let (buffer_tx, buffer_rx) = mpsc::channel::<ParserEvent>(BUFFER_CAPACITY);

        let mut parsers = Vec::with_capacity(built.len());
        let mut tasks = Vec::with_capacity(built.len() + 1);

        for (parser, mut queue_rx) in built {
            let descriptor = parser.descriptor();
            info!("🛠️  Loaded parser: {} v{}", descriptor.name, descriptor.version);
            parsers.push(parser);

            let tx = buffer_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = queue_rx.recv().await {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(buffer_tx);

        let event_log = event_log_dir.map(|dir| {
            info!("📝 Parser event logging enabled");
            EventLog::new(dir)
        });
        tasks.push(tokio::spawn(publish_events(bus, buffer_rx, event_log)));

        info!("✅ Loaded {} parsers", parsers.len());
        Self { parsers, tasks }
    }

    /// Feed one line to every parser. Parsers run independently; one failing
    /// does not affect the rest.
    pub fn feed_line(&mut self, line: &str) {
        for parser in &mut self.parsers {
            if let Err(e) = parser.feed_line(line) {
                error!("Parser {}: {e:#}", parser.descriptor().name);
            }
        }
    }

    pub fn parser_names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.descriptor().name).collect()
    }

    pub async fn shutdown(self) {
        debug!("🛑 Shutting down parser registry");
        drop(self.parsers);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn publish_events(
    bus: Arc<EventBus>,
    mut buffer_rx: mpsc::Receiver<ParserEvent>,
    mut event_log: Option<EventLog>,
) {
    while let Some(event) = buffer_rx.recv().await {
        if let Some(log) = event_log.as_mut() {
            log.append(&event);
        }
        bus.publish(event).await;
    }
}

/// Size-capped, rotating append log of published parser events.
struct EventLog {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
    size: u64,
}

impl EventLog {
    fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("📝 Could not create parser log dir {}: {e}", dir.display());
        }
        Self {
            dir,
            writer: None,
            size: 0,
        }
    }

    fn append(&mut self, event: &ParserEvent) {
        let line = format!(
            "[{}] [{}] {:?}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            event.kind(),
            event
        );

        if self.writer.is_none() || self.size >= MAX_LOG_SIZE {
            self.rotate();
        }
        if let Some(writer) = self.writer.as_mut() {
            let written = writer.write_all(line.as_bytes()).and_then(|_| writer.flush());
            if written.is_ok() {
                self.size += line.len() as u64;
            }
        }
    }

    fn rotate(&mut self) {
        self.writer = None;
        self.size = 0;

        let name = format!(
            "parser_events_{}.log",
            chrono::Local::now().format("%d_%m_%y_%H_%M_%S")
        );
        match File::create(self.dir.join(&name)) {
            Ok(file) => self.writer = Some(BufWriter::new(file)),
            Err(e) => warn!("📝 Could not open parser event log {name}: {e}"),
        }

        // Keep only the newest files.
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            let mut logs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("parser_events_") && n.ends_with(".log"))
                        .unwrap_or(false)
                })
                .collect();
            logs.sort();
            while logs.len() > MAX_LOG_FILES {
                let old = logs.remove(0);
                let _ = std::fs::remove_file(old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind, ParserEventKind};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry_on(bus: Arc<EventBus>, dir: Option<PathBuf>) -> ParserRegistry {
        let catalog = Arc::new(ItemCatalog::load(Path::new("/nonexistent.json")));
        let maps = Arc::new(MapTable::load(Path::new("/nonexistent.json")).unwrap());
        ParserRegistry::spawn(bus, &catalog, &maps, dir)
    }

    #[tokio::test]
    async fn lines_flow_through_to_the_bus() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        bus.subscribe(
            EventKind::Parser(ParserEventKind::GamePause),
            "test::counter",
            Arc::new(move |event| {
                let hits = Arc::clone(&counter);
                Box::pin(async move {
                    assert!(matches!(event, Event::Parser(_)));
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let mut registry = registry_on(Arc::clone(&bus), None);
        registry.feed_line(
            "[2025.11.26-20.02.33:692][200]GameLog: Display: [Game] UGameMgr::AddGamePausedForUI()",
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn event_log_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let mut registry = registry_on(Arc::clone(&bus), Some(dir.path().to_path_buf()));

        registry.feed_line(
            "[2025.11.26-20.02.33:692][200]GameLog: Display: [Game] UGameMgr::AddGamePausedForUI()",
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.shutdown().await;

        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(logs[0].path()).unwrap();
        assert!(content.contains("game_pause"));
    }

    #[tokio::test]
    async fn all_parsers_load() {
        let bus = Arc::new(EventBus::new());
        let registry = registry_on(bus, None);
        assert_eq!(registry.parser_names().len(), 16);
        registry.shutdown().await;
    }
}
