//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Logsearch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub search: SearchSettings,
    pub cache: CacheSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file; `None` uses the platform default location
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

/// Limits and defaults applied by the parser and the search service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub max_query_length: usize,
    pub max_query_nodes: usize,
    pub max_regex_length: usize,
    pub regex_timeout_ms: u64,
    pub history_limit: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Include the event target (module path) in log lines
    pub with_target: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_query_length: 10_000,
            max_query_nodes: 100,
            max_regex_length: 200,
            regex_timeout_ms: 1000,
            history_limit: 50,
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

impl SearchSettings {
    pub fn regex_timeout(&self) -> Duration {
        Duration::from_millis(self.regex_timeout_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            max_capacity: 1000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "logsearch_core=info".to_string(),
            with_target: true,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("LOGSEARCH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("logsearch")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or fall back to defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be at least 1"));
        }
        let search = &self.search;
        if search.max_query_length == 0 || search.max_query_nodes == 0 {
            return Err(anyhow!("search limits must be positive"));
        }
        if search.max_regex_length == 0 || search.regex_timeout_ms == 0 {
            return Err(anyhow!("regex limits must be positive"));
        }
        if search.history_limit == 0 {
            return Err(anyhow!("search.history_limit must be at least 1"));
        }
        if search.default_page_size == 0 || search.default_page_size > search.max_page_size {
            return Err(anyhow!(
                "search.default_page_size must be between 1 and search.max_page_size ({})",
                search.max_page_size
            ));
        }
        if self.cache.max_capacity == 0 {
            return Err(anyhow!("cache.max_capacity must be at least 1"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "database.path" => Ok(self
                .database
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),

            "search.max_query_length" => Ok(self.search.max_query_length.to_string()),
            "search.max_query_nodes" => Ok(self.search.max_query_nodes.to_string()),
            "search.max_regex_length" => Ok(self.search.max_regex_length.to_string()),
            "search.regex_timeout_ms" => Ok(self.search.regex_timeout_ms.to_string()),
            "search.history_limit" => Ok(self.search.history_limit.to_string()),
            "search.default_page_size" => Ok(self.search.default_page_size.to_string()),
            "search.max_page_size" => Ok(self.search.max_page_size.to_string()),

            "cache.ttl_secs" => Ok(self.cache.ttl_secs.to_string()),
            "cache.max_capacity" => Ok(self.cache.max_capacity.to_string()),

            "logging.level" => Ok(self.logging.level.clone()),
            "logging.with_target" => Ok(self.logging.with_target.to_string()),

            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
            value
                .parse()
                .map_err(|_| anyhow!("Invalid {} value: {}", key, value))
        }

        match key {
            "database.path" => self.database.path = Some(PathBuf::from(value)),
            "database.max_connections" => self.database.max_connections = parse(key, value)?,

            "search.max_query_length" => self.search.max_query_length = parse(key, value)?,
            "search.max_query_nodes" => self.search.max_query_nodes = parse(key, value)?,
            "search.max_regex_length" => self.search.max_regex_length = parse(key, value)?,
            "search.regex_timeout_ms" => self.search.regex_timeout_ms = parse(key, value)?,
            "search.history_limit" => self.search.history_limit = parse(key, value)?,
            "search.default_page_size" => self.search.default_page_size = parse(key, value)?,
            "search.max_page_size" => self.search.max_page_size = parse(key, value)?,

            "cache.ttl_secs" => self.cache.ttl_secs = parse(key, value)?,
            "cache.max_capacity" => self.cache.max_capacity = parse(key, value)?,

            "logging.level" => self.logging.level = value.to_string(),
            "logging.with_target" => self.logging.with_target = parse(key, value)?,

            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "database.path",
            "database.max_connections",
            "search.max_query_length",
            "search.max_query_nodes",
            "search.max_regex_length",
            "search.regex_timeout_ms",
            "search.history_limit",
            "search.default_page_size",
            "search.max_page_size",
            "cache.ttl_secs",
            "cache.max_capacity",
            "logging.level",
            "logging.with_target",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
