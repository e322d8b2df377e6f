//! Persisted configuration store.
//!
//! The cart keeps its settings in a key/value store that survives restarts.
//! Handlers only see the [`ConfigStore`] trait so tests can point it at a
//! temporary directory.

use std::path::PathBuf;
use tracing::{info, warn};

use super::{BotConfig, ConfigError};

/// Durable home of the bot configuration.
pub trait ConfigStore: Send + Sync + 'static {
    /// Read the stored config. `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<BotConfig>, ConfigError>;

    /// Replace the stored config.
    fn save(&self, config: &BotConfig) -> Result<(), ConfigError>;

    /// Forget everything so the next start uses built-in defaults.
    fn clear(&self) -> Result<(), ConfigError>;

    /// Human-readable location for logs.
    fn location(&self) -> String;

    /// The stored config, or built-in defaults when nothing usable is stored.
    fn load_or_default(&self) -> BotConfig {
        match self.load() {
            Ok(Some(config)) => {
                info!(
                    location = %self.location(),
                    backend = %config.backend_base_url(),
                    "Loaded bot config"
                );
                config
            }
            Ok(None) => {
                info!(location = %self.location(), "No stored config, using built-in defaults");
                BotConfig::default()
            }
            Err(e) => {
                warn!(location = %self.location(), error = %e, "Failed to load config, using defaults");
                BotConfig::default()
            }
        }
    }
}

/// TOML file backed store.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Option<BotConfig>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }
        BotConfig::load_from_file(&self.path).map(Some)
    }

    fn save(&self, config: &BotConfig) -> Result<(), ConfigError> {
        config.save_to_file(&self.path)
    }

    fn clear(&self) -> Result<(), ConfigError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Stored config cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::Io(self.path.clone(), e)),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
