//! Bot Configuration Module
//!
//! Per-cart configuration loaded from TOML: backend endpoints, card
//! identifiers, link timing and retry bounds.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` CLI flag
//! 2. `DELIVERY_BOT_CONFIG` environment variable
//! 3. `bot_config.toml` in the current working directory
//! 4. Built-in defaults
//!
//! There is no global instance. `main` loads one `BotConfig` per runtime
//! generation and hands it to the orchestrator inside an `Arc`. Changes
//! made through `/update-config` go to the [`ConfigStore`] and take effect
//! after the restart that follows.

mod bot_config;
pub mod defaults;
pub mod flat;
pub mod store;
pub mod validation;

pub use bot_config::*;
pub use store::{ConfigStore, FileConfigStore};
pub use validation::ValidationWarning;
