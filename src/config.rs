use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database backing the queue and entity cache
    pub database_path: PathBuf,
    /// Entity id this device reports samples under
    pub device_id: String,
    pub sampler: SamplerConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
}

/// Position sampler tuning (§ adaptive cadence and accuracy filtering)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Fixes with a reported accuracy radius above this are discarded as noise
    pub accuracy_threshold_m: f64,
    /// Sampling interval while moving, seconds
    pub dense_interval_secs: u64,
    /// Sampling interval while stationary, seconds
    pub sparse_interval_secs: u64,
    /// Estimated speed above which the dense interval applies, m/s
    pub speed_threshold_mps: f64,
}

/// Durable queue bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum records retained; overflow triggers oldest-first eviction
    pub capacity: i64,
}

/// Sync coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend base URL, e.g. "http://localhost:8080"
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    /// Entity ids to pull remote updates for
    pub watched_entities: Vec<String>,
    /// Records pushed per sync cycle
    pub batch_size: i64,
    /// Idle delay between push cycles when the queue is empty, seconds
    pub push_interval_secs: u64,
    /// Long-poll wait passed to the pull endpoint, seconds
    pub pull_wait_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Failed attempts after which a batch is parked
    pub max_attempts: i64,
    /// In-flight records older than this revert to pending on startup, seconds
    pub resumption_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            database_path: PathBuf::from(&home).join(".fleettrack").join("fleettrack.db"),
            device_id: "device-local".to_string(),
            sampler: SamplerConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            dense_interval_secs: 5,
            sparse_interval_secs: 60,
            speed_threshold_mps: 1.5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            watched_entities: Vec::new(),
            batch_size: 50,
            push_interval_secs: 10,
            pull_wait_secs: 25,
            backoff_base_secs: 1,
            backoff_cap_secs: 60,
            max_attempts: 8,
            resumption_timeout_secs: 120,
        }
    }
}

impl SyncConfig {
    /// True when both a server URL and an API key are present.
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }

    pub fn resumption_timeout(&self) -> Duration {
        Duration::from_secs(self.resumption_timeout_secs)
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("FLEETTRACK_DATABASE_PATH") {
            config.database_path = PathBuf::from(db_path);
        }
        if let Ok(device_id) = std::env::var("FLEETTRACK_DEVICE_ID") {
            config.device_id = device_id;
        }
        if let Ok(url) = std::env::var("FLEETTRACK_SERVER_URL") {
            config.sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("FLEETTRACK_API_KEY") {
            config.sync.api_key = Some(key);
        }

        Ok(config)
    }

    /// Default config file path: ~/.config/fleettrack/config.yaml
    pub fn default_config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("fleettrack")
            .join("config.yaml")
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
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
