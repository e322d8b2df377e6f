//! Bot Configuration - every endpoint, identifier and timing as TOML values
//!
//! Each section implements `Default` with the values the cart shipped with,
//! so a missing file or a missing key never changes behaviour.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "DELIVERY_BOT_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "bot_config.toml";

const DEFAULT_BACKEND_HOST: &str = "oxxultus.kro.kr";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one cart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Order backend endpoints
    #[serde(default)]
    pub backend: BackendConfig,

    /// Stand actuator notified after a confirmed scan
    #[serde(default)]
    pub stand: StandConfig,

    /// Inbound control server
    #[serde(default)]
    pub server: ServerConfig,

    /// Administrator and test card identifiers
    #[serde(default)]
    pub cards: CardConfig,

    /// RFID reader
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Serial command link to the motor controller
    #[serde(default)]
    pub link: LinkConfig,

    /// Payment ledger refresh policy
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Control surface behaviour
    #[serde(default)]
    pub control: ControlConfig,
}

impl BotConfig {
    /// Resolve which file this process reads and persists its config to:
    /// 1. an explicit path (CLI flag)
    /// 2. `$DELIVERY_BOT_CONFIG`
    /// 3. `./bot_config.toml`
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => PathBuf::from(LOCAL_CONFIG_FILE),
        }
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Save config to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(parent.to_path_buf(), e))?;
        }
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Bot config saved");
        Ok(())
    }

    /// Check identifiers, ports, paths and retry bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = super::validation::validate_ranges(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// `http://host:port` of the order backend.
    pub fn backend_base_url(&self) -> String {
        format!("http://{}:{}", self.backend.host, self.backend.port)
    }

    /// `http://host:port` of the stand actuator.
    pub fn stand_base_url(&self) -> String {
        format!("http://{}:{}", self.stand.host, self.stand.port)
    }

    /// Socket address the control server binds to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Order backend host and the paths of its working-list API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Creates the working list for the active order before START.
    pub first_set_working_list: String,
    /// Clears the working list on reset.
    pub reset_working_list: String,
    /// Returns the payment snapshot the ledger is built from.
    pub get_payment: String,
    /// Prefix the scanned tag id is appended to, e.g. `/bot/add-working-list?uid=`.
    pub add_working_list: String,
    /// Target of `POST /post` forwarding. The route is absent when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_path: Option<String>,
    pub timeout_ms: u64,
    pub markers: SuccessMarkers,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BACKEND_HOST.to_string(),
            port: 8080,
            first_set_working_list: "/bot/first-set-working-list".to_string(),
            reset_working_list: "/bot/reset-working-list".to_string(),
            get_payment: "/bot/payment".to_string(),
            add_working_list: "/bot/add-working-list?uid=".to_string(),
            forward_path: None,
            timeout_ms: defaults::BACKEND_TIMEOUT_MS,
            markers: SuccessMarkers::default(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Phrases the backend puts in a body when a working-list call succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessMarkers {
    pub working_list_initialized: String,
    pub working_list_reset: String,
    pub working_list_added: String,
}

impl Default for SuccessMarkers {
    fn default() -> Self {
        Self {
            working_list_initialized: "초기 작업 리스트 생성 완료".to_string(),
            working_list_reset: "초기화했습니다".to_string(),
            working_list_added: "작업 리스트에 추가".to_string(),
        }
    }
}

// ============================================================================
// Stand
// ============================================================================

/// Which stand endpoint a confirmed scan triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StandAction {
    /// `GET /up-rfid?uid=`: lift the scanned card off the shelf.
    UpRfid,
    /// `GET /start-stand?uid=`: start the stand for the scanned item.
    StartStand,
}

impl StandAction {
    pub fn path(self) -> &'static str {
        match self {
            StandAction::UpRfid => "/up-rfid",
            StandAction::StartStand => "/start-stand",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandConfig {
    pub host: String,
    pub port: u16,
    pub action: StandAction,
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BACKEND_HOST.to_string(),
            port: 8082,
            action: StandAction::UpRfid,
            attempts: defaults::STAND_ATTEMPTS,
            retry_delay_ms: defaults::STAND_RETRY_DELAY_MS,
        }
    }
}

impl StandConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ============================================================================
// Control Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

// ============================================================================
// Cards
// ============================================================================

/// Card identifiers with special meaning. All lowercase hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    pub admin_uid: String,
    pub master_key: String,
    pub test_key: String,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            admin_uid: "a1b2c3d4".to_string(),
            master_key: "c3a27b28".to_string(),
            test_key: "34e0ef03".to_string(),
        }
    }
}

impl CardConfig {
    /// Both the admin card and the master key refresh the ledger.
    pub fn is_admin(&self, tag_id: &str) -> bool {
        tag_id == self.admin_uid || tag_id == self.master_key
    }

    pub fn is_test(&self, tag_id: &str) -> bool {
        tag_id == self.test_key
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// When false the tag loop is not started (no reader hardware).
    pub use_rfid: bool,
    /// Reader bridge streaming one hex UID line per card presentation.
    pub address: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            use_rfid: true,
            address: "127.0.0.1:7001".to_string(),
            reconnect_attempts: defaults::READER_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: defaults::READER_RECONNECT_DELAY_MS,
        }
    }
}

// ============================================================================
// Command Link
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkTransport {
    /// TCP serial bridge (ser2net or similar) at `link.address`.
    Tcp,
    /// Local UART at `link.device`. Requires the `serial` feature.
    Serial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub transport: LinkTransport,
    pub address: String,
    pub device: String,
    pub baud_rate: u32,
    pub attempts: u32,
    pub ack_window_ms: u64,
    pub backoff_ms: u64,
    /// Bridge reconnects tried before a command is given up (tcp only).
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: LinkTransport::Tcp,
            address: "127.0.0.1:7000".to_string(),
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: defaults::LINK_BAUD_RATE,
            attempts: defaults::LINK_ATTEMPTS,
            ack_window_ms: defaults::LINK_ACK_WINDOW_MS,
            backoff_ms: defaults::LINK_BACKOFF_MS,
            reconnect_attempts: defaults::LINK_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: defaults::LINK_RECONNECT_DELAY_MS,
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub refresh_retries: u32,
    pub start_refresh_retries: u32,
    pub refresh_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            refresh_retries: defaults::LEDGER_REFRESH_RETRIES,
            start_refresh_retries: defaults::LEDGER_START_REFRESH_RETRIES,
            refresh_delay_ms: defaults::LEDGER_REFRESH_DELAY_MS,
        }
    }
}

impl LedgerConfig {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Make `/stop` behave like `/reset` (clear ledger, reset working list, STOP).
    pub stop_resets_order: bool,
    pub restart_delay_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            stop_resets_order: false,
            restart_delay_ms: defaults::RESTART_DELAY_MS,
        }
    }
}

impl ControlConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid config field '{field}': {message}")]
    Field { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = BotConfig::from_toml_str(
            r#"
            [backend]
            host = "10.0.0.5"

            [link]
            ack_window_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.host, "10.0.0.5");
        assert_eq!(config.backend.port, 8080);
        assert_eq!(config.backend.get_payment, "/bot/payment");
        assert_eq!(config.link.ack_window_ms, 50);
        assert_eq!(config.link.attempts, 3);
        assert_eq!(config.cards, CardConfig::default());
    }

    #[test]
    fn test_stand_action_kebab_case() {
        let config = BotConfig::from_toml_str("[stand]\naction = \"start-stand\"\n").unwrap();
        assert_eq!(config.stand.action, StandAction::StartStand);
        assert_eq!(config.stand.action.path(), "/start-stand");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = BotConfig::from_toml_str("[link]\nattempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot_config.toml");

        let mut config = BotConfig::default();
        config.cards.admin_uid = "deadbeef".to_string();
        config.backend.forward_path = Some("/bot/report".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = BotConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }


    #[test]
    fn test_resolve_path_prefers_explicit() {
        let explicit = Path::new("/tmp/cart.toml");
        assert_eq!(BotConfig::resolve_path(Some(explicit)), explicit.to_path_buf());
    }

    #[test]
    fn test_admin_and_master_key_are_admin() {
        let cards = CardConfig::default();
        assert!(cards.is_admin("a1b2c3d4"));
        assert!(cards.is_admin("c3a27b28"));
        assert!(!cards.is_admin("34e0ef03"));
        assert!(cards.is_test("34e0ef03"));
    }
}
