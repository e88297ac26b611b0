//! Game log tailer.
//!
//! Polls the log file and forwards every newly appended line exactly once.
//! Truncation or rotation (size shrink, identity change) resets the read
//! position to zero after a short settle delay. Startup seeks to EOF so
//! historical content is never replayed. Transient I/O errors are logged and
//! retried; nothing propagates out of the task.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub path: PathBuf,
    pub poll_interval: Duration,
    /// How long to wait for the file to appear before failing.
    pub wait_timeout: Duration,
    /// Seek to EOF on open instead of replaying existing content.
    pub start_at_end: bool,
}

impl TailerConfig {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(300),
            start_at_end: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FileState {
    size: u64,
    mtime_ms: i64,
    identity: u64,
}

fn stat(path: &PathBuf) -> std::io::Result<FileState> {
    let meta = std::fs::metadata(path)?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(FileState {
        size: meta.len(),
        mtime_ms,
        identity: identity_of(&meta),
    })
}

#[cfg(unix)]
fn identity_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn identity_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

pub struct LogTailer {
    config: TailerConfig,
    position: u64,
    last: FileState,
    carry: String,
}

impl LogTailer {
    /// Wait for the file to exist (bounded), open it, and return the tailer
    /// positioned per config.
    pub async fn open(config: TailerConfig) -> Result<Self> {
        info!(
            "Waiting for: {} (timeout: {:?})",
            config.path.display(),
            config.wait_timeout
        );

        let deadline = tokio::time::Instant::now() + config.wait_timeout;
        while !config.path.exists() {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("File not found after {:?}: {}", config.wait_timeout, config.path.display());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let last = stat(&config.path)
            .with_context(|| format!("Failed to stat {}", config.path.display()))?;
        let position = if config.start_at_end { last.size } else { 0 };

        info!("File found: {} (reading @ {})", config.path.display(), position);
        Ok(Self {
            config,
            position,
            last,
            carry: String::new(),
        })
    }

    /// Run the poll loop, sending complete lines until `shutdown` flips.
    /// An already-read line is always delivered before exit.
    pub async fn run(
        mut self,
        lines: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Log tailer stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll(&lines).await {
                        error!("Error reading log: {e:#}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    if lines.is_closed() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll(&mut self, lines: &mpsc::Sender<String>) -> Result<()> {
        let current = match stat(&self.config.path) {
            Ok(state) => state,
            Err(_) => {
                // File briefly missing (rotation in progress): retry next tick.
                warn!("Log file disappeared: {}", self.config.path.display());
                return Ok(());
            }
        };

        let truncated =
            current.size < self.position || current.identity != self.last.identity;

        if truncated {
            debug!(
                "Log file truncated or recreated (size: {} -> {})",
                self.last.size, current.size
            );
            self.position = 0;
            self.carry.clear();
            // Let the game finish writing its initial burst.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let settled = stat(&self.config.path).unwrap_or(current);
            self.last = settled;
            info!("Reading from start after truncation (new size: {})", settled.size);
            self.read_chunk(lines).await?;
            return Ok(());
        }

        if current != self.last && current.size >= self.position {
            self.last = current;
            self.read_chunk(lines).await?;
        }

        Ok(())
    }

    async fn read_chunk(&mut self, lines: &mpsc::Sender<String>) -> Result<()> {
        let mut file = File::open(&self.config.path)
            .with_context(|| format!("Failed to open {}", self.config.path.display()))?;
        file.seek(SeekFrom::Start(self.position))?;

        let mut chunk = String::new();
        file.read_to_string(&mut chunk)?;
        self.position = file.stream_position()?;

        if chunk.is_empty() {
            return Ok(());
        }

        // A write can end mid-line; hold the tail until its newline arrives.
        let buffered = std::mem::take(&mut self.carry) + &chunk;
        let mut rest = buffered.as_str();
        while let Some(idx) = rest.find('\n') {
            let line = rest[..idx].trim_end_matches('\r');
            rest = &rest[idx + 1..];
            if lines.send(line.to_string()).await.is_err() {
                return Ok(());
            }
        }
        self.carry = rest.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_for(path: PathBuf) -> TailerConfig {
        TailerConfig {
            path,
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(200),
            start_at_end: true,
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(line)) => out.push(line),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn emits_appended_lines_not_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.log");
        std::fs::write(&path, "old line\n").unwrap();

        let tailer = LogTailer::open(config_for(path.clone())).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tailer.run(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"line one\r\nline two\n").unwrap();
        }

        let lines = collect(&mut rx, 2).await;
        assert_eq!(lines, vec!["line one", "line two"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn partial_line_is_held_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.log");
        std::fs::write(&path, "").unwrap();

        let tailer = LogTailer::open(config_for(path.clone())).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tailer.run(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"incompl").unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"ete line\n").unwrap();
        }

        let lines = collect(&mut rx, 1).await;
        assert_eq!(lines, vec!["incomplete line"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn truncation_resets_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.log");
        std::fs::write(&path, "a much longer original content line\n").unwrap();

        let tailer = LogTailer::open(config_for(path.clone())).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tailer.run(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Game restart: the file is rewritten from scratch, shorter.
        std::fs::write(&path, "fresh\n").unwrap();

        let lines = collect(&mut rx, 1).await;
        assert_eq!(lines, vec!["fresh"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path().join("never.log"));
        assert!(LogTailer::open(config).await.is_err());
    }
}
