//! Delivery Bot: cart controller for picked-order delivery
//!
//! Reads RFID tags as items are taken off the cart, checks them against the
//! active order, drives the motor controller over an acknowledged serial
//! line protocol, and reports every pick to the order backend.
//!
//! ## Architecture
//!
//! - **Command Link**: `START`/`GO`/`STOP`/`TEST` over a line protocol with `ACK` receipts
//! - **Tag Reader**: one normalized tag event per card presentation
//! - **Payment Ledger**: the active order and the remaining quantity per item
//! - **Dispatch Gateway**: fail-closed HTTP calls to the backend and the stand
//! - **Control Server**: operator routes (`/start`, `/status`, `/update-config`, ...)
//! - **Orchestrator**: the decision loop tying them together

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod link;
pub mod orchestrator;
pub mod reader;
pub mod reconnect;
pub mod server;

pub use config::{BotConfig, ConfigError, ConfigStore, FileConfigStore};
pub use gateway::{BackendReply, DispatchGateway, GatewayError};
pub use ledger::{LedgerEntry, LedgerError, PaymentLedger};
pub use link::{send_with_retry, AckPolicy, Command, CommandLink, LinkError};
pub use orchestrator::{ActionError, Orchestrator, RestartHandle, TagClass, TagOutcome};
pub use reader::{CardEvent, CardSource, TagEvent, TagReader};
pub use reconnect::ReconnectPolicy;
pub use server::{ControlHandlers, HandlerReply};
