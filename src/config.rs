//! TOML configuration.
//!
//! All recognised sections live in `config.toml`. Relative paths (database,
//! reference tables, parser event logs) are resolved against the config
//! file's directory so the process can be launched from anywhere.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub parser: ParserConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub price_db: PriceDbConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logger: LoggerConfig,

    /// Directory of the loaded config file; anchors every relative path.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// Absolute path to the game's log file.
    pub log_path: PathBuf,
    /// Append every published parser event to a rotating log file.
    #[serde(default)]
    pub log: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Relational store file, relative to the config directory.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("farmtrack.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriceDbConfig {
    /// Optional remote URL for price refresh; local file fallback otherwise.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Minimum seconds between inventory flushes to storage.
    pub update_interval: f64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            update_interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Minimum seconds between inventory snapshot requests.
    pub snapshot_interval: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level (trace/debug/info/warn/error).
    pub level: String,
    /// Per-component overrides, keyed by module path relative to the crate
    /// with dots as separators (e.g. `"services.stats" = "debug"`).
    #[serde(flatten)]
    pub overrides: BTreeMap<String, String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load and validate the configuration. Missing or invalid files are
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;

        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Invalid configuration: {}", path.display()))?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(config)
    }

    /// Resolve a possibly-relative path against the config directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database.path)
    }

    pub fn price_table_path(&self) -> PathBuf {
        self.base_dir.join("price_table.json")
    }

    pub fn map_table_path(&self) -> PathBuf {
        self.base_dir.join("map_table.json")
    }

    pub fn experience_table_path(&self) -> PathBuf {
        self.base_dir.join("experience.json")
    }

    pub fn parser_log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Build the tracing env-filter directive string from `logger.level` and
    /// the per-component overrides. `RUST_LOG` still wins at init time.
    pub fn env_filter(&self) -> String {
        let mut directives = vec![format!("farmtrack_backend={}", self.logger.level)];
        for (component, level) in &self.logger.overrides {
            let target = component.replace('.', "::");
            directives.push(format!("farmtrack_backend::{target}={level}"));
        }
        directives.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[parser]
log_path = "/games/client/Game.log"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.parser.log_path, PathBuf::from("/games/client/Game.log"));
        assert!(!config.parser.log);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.inventory.update_interval, 5.0);
        assert_eq!(config.stats.snapshot_interval, 1.0);
        assert_eq!(config.database_path(), dir.path().join("farmtrack.db"));
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(Config::load(Path::new("/nonexistent/config.toml")).is_err());
    }

    #[test]
    fn invalid_toml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[parser\nlog_path = 3");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn env_filter_includes_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[parser]
log_path = "/tmp/Game.log"

[logger]
level = "info"
"services.stats" = "debug"
"#,
        );

        let config = Config::load(&path).unwrap();
        let filter = config.env_filter();
        assert!(filter.contains("farmtrack_backend=info"));
        assert!(filter.contains("farmtrack_backend::services::stats=debug"));
    }

    #[test]
    fn absolute_paths_are_not_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[parser]
log_path = "/tmp/Game.log"

[database]
path = "/var/lib/farmtrack/data.db"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/farmtrack/data.db")
        );
    }
}
