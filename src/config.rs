use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::{EngineOptions, RetryPolicy, DEFAULT_MAX_PULL_ITERATIONS};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Remote authority settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server URL (e.g., "https://sync.example.com")
    pub server_url: Option<String>,
    /// API key sent as a bearer token
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Upload status polls before a round gives up
    pub poll_attempts: u32,
    /// Delay before each upload status poll
    pub poll_interval_ms: u64,
    /// Bound on change requests per round
    pub max_pull_iterations: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            poll_attempts: 60,
            poll_interval_ms: 1000,
            max_pull_iterations: DEFAULT_MAX_PULL_ITERATIONS,
        }
    }
}

impl SyncConfig {
    /// Returns true if a server URL is set
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            retry: RetryPolicy::new(
                self.poll_attempts,
                Duration::from_millis(self.poll_interval_ms),
            ),
            max_pull_iterations: self.max_pull_iterations,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite replica
    pub database_path: ConfigValue<PathBuf>,
    /// User the offline session and sync rounds run as
    pub user: ConfigValue<String>,
    /// Tables kept in sync, in dependency order
    pub synced_tables: ConfigValue<Vec<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    user: Option<String>,
    synced_tables: Option<Vec<String>>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let default_db_path = Self::default_data_dir().join("replica.db");

        // Start with defaults
        let mut database_path = ConfigValue::new(default_db_path, ConfigSource::Default);
        let mut user = ConfigValue::new("default".to_string(), ConfigSource::Default);
        let mut synced_tables = ConfigValue::new(Vec::new(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(name) = file_config.user {
                user = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(tables) = file_config.synced_tables {
                synced_tables = ConfigValue::new(tables, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("REPLICA_SYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("REPLICA_SYNC_USER") {
            user = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(tables) = std::env::var("REPLICA_SYNC_TABLES") {
            let tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            synced_tables = ConfigValue::new(tables, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("REPLICA_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("REPLICA_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            user,
            synced_tables,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/replica-sync/
    /// - macOS: ~/Library/Application Support/replica-sync/
    /// - Windows: %APPDATA%/replica-sync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica-sync")
    }

    /// Default data directory (platform-specific)
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica-sync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("replica.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.user.source, ConfigSource::Default);
        assert!(config.synced_tables.value.is_empty());
        assert_eq!(config.config_file, None);
        assert_eq!(config.sync, SyncConfig::default());
        assert!(!config.sync.is_configured());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/db.sqlite").unwrap();
        writeln!(file, "user: alice").unwrap();
        writeln!(file, "synced_tables: [publishers, books]").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: https://sync.example.com").unwrap();
        writeln!(file, "  poll_attempts: 5").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/db.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.user.value, "alice");
        assert_eq!(config.synced_tables.value, vec!["publishers", "books"]);
        assert_eq!(config.config_file, Some(config_path));

        // Unset sync fields keep their defaults
        assert!(config.sync.is_configured());
        assert_eq!(config.sync.poll_attempts, 5);
        assert_eq!(config.sync.poll_interval_ms, 1000);
        assert_eq!(config.sync.max_pull_iterations, 200);
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/replica.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/replica.db")
        );
    }

    #[test]
    fn test_engine_options_from_sync_config() {
        let sync = SyncConfig {
            poll_attempts: 3,
            poll_interval_ms: 250,
            max_pull_iterations: 10,
            ..Default::default()
        };
        let options = sync.engine_options();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.interval, Duration::from_millis(250));
        assert_eq!(options.max_pull_iterations, 10);
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "user: fromfile").unwrap();

        std::env::set_var("REPLICA_SYNC_USER", "fromenv");
        std::env::set_var("REPLICA_SYNC_TABLES", "publishers, books,");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.user.value, "fromenv");
        assert_eq!(config.user.source, ConfigSource::Environment);
        assert_eq!(config.synced_tables.value, vec!["publishers", "books"]);

        // Clean up
        std::env::remove_var("REPLICA_SYNC_USER");
        std::env::remove_var("REPLICA_SYNC_TABLES");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
