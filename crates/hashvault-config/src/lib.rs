//! # hashvault-config
//!
//! Configuration for applications embedding a hashvault store.
//!
//! Loads configuration from:
//! 1. `~/.hashvault/config.toml` (global)
//! 2. `.hashvault/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Stores themselves take their options explicitly at construction; this
//! crate only assembles those options from files and the environment. There
//! is no process-wide mutable config.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use hashvault_hybrid::{HybridOptions, DEFAULT_FLUSH_EVERY_WRITES, DEFAULT_MAX_INLINE_BLOB_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Storage knobs, mirroring [`HybridOptions`] plus the root location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the hybrid store.
    pub root: PathBuf,
    /// Content at or below this size is inlined into the index.
    pub max_inline_blob_size: u64,
    /// Commit the open index transaction after this many writes.
    pub flush_every_writes: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .map(|h| h.join(".hashvault/store"))
            .unwrap_or_else(|| PathBuf::from(".hashvault/store"));
        Self {
            root,
            max_inline_blob_size: DEFAULT_MAX_INLINE_BLOB_SIZE,
            flush_every_writes: DEFAULT_FLUSH_EVERY_WRITES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter ("error" | "warn" | "info" | "debug" | "trace").
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.hashvault/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                config = Self::load_from(&global_path)?;
            }
        }

        // 2. Project config (.hashvault/config.toml) - overrides global
        let project_path = Path::new(".hashvault/config.toml");
        if project_path.exists() {
            debug!("loading project config from {:?}", project_path);
            config = Self::load_from(project_path)?;
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.hashvault/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hashvault/config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HASHVAULT_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("HASHVAULT_MAX_INLINE") {
            if let Ok(n) = size.parse() {
                self.storage.max_inline_blob_size = n;
            }
        }
        if let Ok(every) = std::env::var("HASHVAULT_FLUSH_EVERY") {
            if let Ok(n) = every.parse() {
                self.storage.flush_every_writes = n;
            }
        }
        if let Ok(level) = std::env::var("HASHVAULT_LOG") {
            self.logging.level = level;
        }
    }

    /// Store options assembled from this config.
    pub fn hybrid_options(&self) -> HybridOptions {
        HybridOptions {
            max_inline_blob_size: self.storage.max_inline_blob_size,
            flush_every_writes: self.storage.flush_every_writes,
        }
    }
}
