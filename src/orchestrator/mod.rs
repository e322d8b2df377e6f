//! Orchestrator — the cart's decision loop
//!
//! Owns everything a decision touches: the config of this runtime
//! generation, the backend gateway, the config store, the restart handle,
//! and, behind one async mutex, the ledger and the command link.
//!
//! Every tag event and every HTTP command takes that mutex and runs to
//! completion while holding it, waits included. Tag handling and operator
//! commands therefore never interleave, and a ledger refresh is atomic with
//! respect to matching and consuming.
//!
//! ## Tag decisions
//!
//! | Class | Action |
//! |---|---|
//! | Administrator | clear and refresh the ledger |
//! | Test | `TEST` |
//! | Matched | `STOP`, add to working list, consume, notify stand |
//! | Unmatched | nothing (logged) |

mod restart;

pub use restart::RestartHandle;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BotConfig, CardConfig, ConfigError, ConfigStore};
use crate::gateway::{DispatchGateway, GatewayError};
use crate::ledger::PaymentLedger;
use crate::link::{send_with_retry, AckPolicy, Command, CommandLink, LinkError};
use crate::reader::{TagEvent, TagReader};
use crate::server::{self, ControlHandlers, HandlerReply};

// ============================================================================
// Classification
// ============================================================================

/// What a tag means right now. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagClass {
    Administrator,
    Test,
    Matched(String),
    Unmatched,
}

impl TagClass {
    pub fn label(&self) -> &'static str {
        match self {
            TagClass::Administrator => "administrator",
            TagClass::Test => "test",
            TagClass::Matched(_) => "matched",
            TagClass::Unmatched => "unmatched",
        }
    }
}

/// Admin and test identifiers win over ledger entries.
pub fn classify(cards: &CardConfig, ledger: &PaymentLedger, tag_id: &str) -> TagClass {
    if cards.is_admin(tag_id) {
        TagClass::Administrator
    } else if cards.is_test(tag_id) {
        TagClass::Test
    } else if let Some(entry) = ledger.match_tag(tag_id) {
        TagClass::Matched(entry.item_name.clone())
    } else {
        TagClass::Unmatched
    }
}

/// Result of one handled tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Refreshed { order_id: String },
    TestSent,
    Picked { item: String, stand_notified: bool },
    Ignored,
}

// ============================================================================
// Errors
// ============================================================================

/// Broad failure classes, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    TransportTimeout,
    MalformedPayload,
    RemoteRejection,
    ConfigurationInvalid,
    NoActiveOrder,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Command link: {0}")]
    Link(#[from] LinkError),

    #[error("Ledger refresh failed after {attempts} attempts: {last}")]
    RefreshExhausted { attempts: u32, last: String },

    #[error("Backend gate: {0}")]
    Remote(#[from] GatewayError),

    #[error("No active order")]
    NoActiveOrder,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Link(_) => ErrorKind::TransportTimeout,
            ActionError::RefreshExhausted { .. } => ErrorKind::MalformedPayload,
            ActionError::Remote(_) => ErrorKind::RemoteRejection,
            ActionError::NoActiveOrder => ErrorKind::NoActiveOrder,
            ActionError::Config(_) => ErrorKind::ConfigurationInvalid,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone)]
struct LastTag {
    tag_id: String,
    class: &'static str,
    read_at: DateTime<Utc>,
}

/// State guarded by the control lock.
struct ControlState {
    ledger: PaymentLedger,
    link: CommandLink,
    last_tag: Option<LastTag>,
}

pub struct Orchestrator {
    config: Arc<BotConfig>,
    gateway: DispatchGateway,
    store: Arc<dyn ConfigStore>,
    restart: RestartHandle,
    policy: AckPolicy,
    state: Mutex<ControlState>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<BotConfig>,
        link: CommandLink,
        store: Arc<dyn ConfigStore>,
        restart: RestartHandle,
    ) -> Result<Arc<Self>, GatewayError> {
        let gateway = DispatchGateway::new(&config)?;
        let policy = AckPolicy::from(&config.link);

        Ok(Arc::new(Self {
            config,
            gateway,
            store,
            restart,
            policy,
            state: Mutex::new(ControlState {
                ledger: PaymentLedger::new(),
                link,
                last_tag: None,
            }),
        }))
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Snapshot of the ledger.
    pub async fn ledger(&self) -> PaymentLedger {
        self.state.lock().await.ledger.clone()
    }

    // ------------------------------------------------------------------------
    // Tag events
    // ------------------------------------------------------------------------

    pub async fn handle_tag(&self, event: &TagEvent) -> Result<TagOutcome, ActionError> {
        let mut state = self.state.lock().await;
        let tag_id = event.tag_id.as_str();
        let class = classify(&self.config.cards, &state.ledger, tag_id);

        info!(tag = %tag_id, class = class.label(), "[Orchestrator] Tag detected");
        state.last_tag = Some(LastTag {
            tag_id: tag_id.to_string(),
            class: class.label(),
            read_at: event.read_at,
        });

        match class {
            TagClass::Administrator => {
                let retries = self.config.ledger.refresh_retries;
                if let Err(e) = self.refresh(&mut state, retries).await {
                    error!("[Orchestrator] Administrator refresh failed: {e}");
                    return Err(e);
                }
                Ok(TagOutcome::Refreshed {
                    order_id: state.ledger.order_id().to_string(),
                })
            }
            TagClass::Test => {
                send_with_retry(&mut state.link, Command::Test, &self.policy).await?;
                Ok(TagOutcome::TestSent)
            }
            TagClass::Matched(item) => self.pick(&mut state, tag_id, item).await,
            TagClass::Unmatched => {
                info!(tag = %tag_id, "[Orchestrator] Tag not in ledger, ignoring");
                Ok(TagOutcome::Ignored)
            }
        }
    }

    async fn pick(
        &self,
        state: &mut ControlState,
        tag_id: &str,
        item: String,
    ) -> Result<TagOutcome, ActionError> {
        if let Err(e) = send_with_retry(&mut state.link, Command::Stop, &self.policy).await {
            error!(tag = %tag_id, item = %item, "[Orchestrator] STOP failed, item not handled: {e}");
            return Err(e.into());
        }

        if let Err(e) = self.gateway.add_working_list(tag_id).await {
            error!(tag = %tag_id, item = %item, "[Orchestrator] Working list addition failed: {e}");
            return Err(e.into());
        }

        if let Some(entry) = state.ledger.consume(tag_id) {
            info!(item = %entry.item_name, remaining = entry.remaining_qty, "[Orchestrator] Item picked");
        } else {
            warn!(tag = %tag_id, item = %item, "[Orchestrator] Item picked beyond ordered quantity");
        }

        let stand_notified = match self.gateway.notify_stand(tag_id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(tag = %tag_id, "[Orchestrator] Stand notification failed: {e}");
                false
            }
        };

        Ok(TagOutcome::Picked {
            item,
            stand_notified,
        })
    }

    /// Clear the ledger, then fetch and parse until one snapshot is accepted.
    ///
    /// The delay is applied between attempts. On exhaustion the ledger
    /// stays empty.
    async fn refresh(&self, state: &mut ControlState, attempts: u32) -> Result<(), ActionError> {
        state.ledger.clear();
        let attempts = attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let parsed = match self.gateway.fetch_payment().await {
                Ok(body) => state.ledger.parse(&body).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match parsed {
                Ok(()) => {
                    info!(
                        order_id = %state.ledger.order_id(),
                        entries = state.ledger.entries().len(),
                        "[Orchestrator] Ledger refreshed (attempt {attempt}/{attempts})"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("[Orchestrator] Ledger fetch attempt {attempt}/{attempts} failed: {e}");
                    last = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.ledger.refresh_delay()).await;
            }
        }

        Err(ActionError::RefreshExhausted { attempts, last })
    }

    // ------------------------------------------------------------------------
    // Operator commands
    // ------------------------------------------------------------------------

    /// Start a run. Needs an active order and a confirmed working list.
    pub async fn start(&self) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;

        if !state.ledger.is_active() {
            info!("[Orchestrator] No active order, refreshing before START");
            let retries = self.config.ledger.start_refresh_retries;
            self.refresh(&mut state, retries).await?;
            if !state.ledger.is_active() {
                return Err(ActionError::NoActiveOrder);
            }
        }

        self.gateway.init_working_list().await?;
        send_with_retry(&mut state.link, Command::Start, &self.policy).await?;
        info!(order_id = %state.ledger.order_id(), "[Orchestrator] Run started");
        Ok(())
    }

    pub async fn go(&self) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        send_with_retry(&mut state.link, Command::Go, &self.policy).await?;
        Ok(())
    }

    /// Plain STOP, or the reset variant when `control.stop_resets_order` is set.
    pub async fn stop(&self) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        if self.config.control.stop_resets_order {
            return self.reset_order(&mut state).await;
        }
        send_with_retry(&mut state.link, Command::Stop, &self.policy).await?;
        Ok(())
    }

    /// Drop the order locally and remotely, then STOP.
    pub async fn reset(&self) -> Result<(), ActionError> {
        let mut state = self.state.lock().await;
        self.reset_order(&mut state).await
    }

    async fn reset_order(&self, state: &mut ControlState) -> Result<(), ActionError> {
        state.ledger.clear();
        info!("[Orchestrator] Ledger cleared");
        self.gateway.reset_working_list().await?;
        send_with_retry(&mut state.link, Command::Stop, &self.policy).await?;
        Ok(())
    }

    /// Flat config plus order and last-tag fields.
    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        let mut doc = self.config.to_flat();

        doc.insert("order_id".to_string(), state.ledger.order_id().into());
        doc.insert("ledger_entries".to_string(), json!(state.ledger.entries()));
        let (tag, class, at) = match &state.last_tag {
            Some(t) => (
                Value::from(t.tag_id.clone()),
                Value::from(t.class),
                Value::from(t.read_at.to_rfc3339()),
            ),
            None => (Value::Null, Value::Null, Value::Null),
        };
        doc.insert("last_tag".to_string(), tag);
        doc.insert("last_tag_class".to_string(), class);
        doc.insert("last_tag_at".to_string(), at);

        Value::Object(doc)
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Merge a flat config body, persist it, and schedule a restart.
    pub async fn update_config(&self, body: &[u8]) -> HandlerReply {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                warn!("[Orchestrator] update-config body rejected: {e}");
                return HandlerReply::message(StatusCode::BAD_REQUEST, "JSON parse failed");
            }
        };

        let next = match self.config.apply_flat_update(&parsed) {
            Ok((next, warnings)) => {
                for w in &warnings {
                    warn!("[Orchestrator] update-config: {w}");
                }
                next
            }
            Err(ConfigError::Validation(errors)) => {
                warn!("[Orchestrator] update-config invalid: {}", errors.join("; "));
                return HandlerReply::new(
                    StatusCode::BAD_REQUEST,
                    json!({ "message": "Configuration invalid", "errors": errors }),
                );
            }
            Err(e) => {
                warn!("[Orchestrator] update-config body rejected: {e}");
                return HandlerReply::message(StatusCode::BAD_REQUEST, "JSON parse failed");
            }
        };

        if let Err(e) = self.store.save(&next) {
            error!("[Orchestrator] Failed to persist config to {}: {e}", self.store.location());
            return HandlerReply::message(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save configuration");
        }

        let delay = self.config.control.restart_delay();
        info!("[Orchestrator] Config saved to {}, restarting in {delay:?}", self.store.location());
        self.restart.schedule(delay);
        HandlerReply::message(
            StatusCode::OK,
            format!("Configuration saved. Restarting in {} seconds.", delay.as_secs()),
        )
    }

    /// Forget the stored config and restart on defaults.
    ///
    /// Nothing is restarted when the store cannot be cleared.
    pub async fn reset_config(&self) -> HandlerReply {
        if let Err(e) = self.store.clear() {
            let e = ActionError::from(e);
            error!(kind = ?e.kind(), "[Orchestrator] Failed to clear config at {}: {e}", self.store.location());
            return HandlerReply::message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to clear configuration",
            );
        }
        info!("[Orchestrator] Stored config cleared, restarting");
        self.restart.schedule(self.config.control.restart_delay());
        HandlerReply::message(StatusCode::OK, "Configuration cleared. Restarting.")
    }

    /// Relay a raw body to the backend forward path.
    pub async fn forward_post(&self, body: Bytes) -> HandlerReply {
        let text = String::from_utf8_lossy(&body).into_owned();
        match self.gateway.forward_post(text).await {
            Ok(reply) => HandlerReply::new(
                StatusCode::OK,
                json!({ "message": "Handled POST /post", "backend_status": reply.status.as_u16() }),
            ),
            Err(e) => {
                warn!("[Orchestrator] Forward failed: {e}");
                HandlerReply::message(StatusCode::BAD_GATEWAY, "Forward failed")
            }
        }
    }

    // ------------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------------

    /// Control server handlers backed by this orchestrator.
    ///
    /// `/post` is only offered when a forward path is configured.
    pub fn handlers(self: &Arc<Self>) -> ControlHandlers {
        fn logged<F, Fut>(this: &Arc<Orchestrator>, route: &'static str, f: F) -> server::CommandFn
        where
            F: Fn(Arc<Orchestrator>) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = Result<(), ActionError>> + Send + 'static,
        {
            let this = this.clone();
            server::command(move || {
                let fut = f(this.clone());
                async move {
                    if let Err(e) = fut.await {
                        warn!(kind = ?e.kind(), "[Orchestrator] {route} abandoned: {e}");
                    }
                }
            })
        }

        let status = {
            let this = self.clone();
            server::status(move || {
                let this = this.clone();
                async move { this.status().await }
            })
        };
        let update_config = {
            let this = self.clone();
            server::body(move |bytes| {
                let this = this.clone();
                async move { this.update_config(&bytes).await }
            })
        };
        let reset_config = {
            let this = self.clone();
            server::reply(move || {
                let this = this.clone();
                async move { this.reset_config().await }
            })
        };
        let post = self.gateway.has_forward_path().then(|| {
            let this = self.clone();
            server::body(move |bytes| {
                let this = this.clone();
                async move { this.forward_post(bytes).await }
            })
        });

        ControlHandlers {
            start: Some(logged(self, "/start", |o| async move { o.start().await })),
            go: Some(logged(self, "/go", |o| async move { o.go().await })),
            stop: Some(logged(self, "/stop", |o| async move { o.stop().await })),
            reset: Some(logged(self, "/reset", |o| async move { o.reset().await })),
            status: Some(status),
            update_config: Some(update_config),
            reset_config: Some(reset_config),
            post,
        }
    }

    /// Feed tag events into the decision loop until the source ends or
    /// `cancel` fires.
    pub async fn run_tag_loop(
        self: Arc<Self>,
        mut reader: TagReader,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("[TagLoop] Reading cards from {}", reader.source_name());
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[TagLoop] Received shutdown signal");
                    return Ok(());
                }
                event = reader.next_tag() => event?,
            };

            let Some(event) = event else {
                info!("[TagLoop] Card source finished");
                return Ok(());
            };

            match self.handle_tag(&event).await {
                Ok(outcome) => info!(tag = %event.tag_id, ?outcome, "[TagLoop] Tag handled"),
                Err(e) => warn!(tag = %event.tag_id, kind = ?e.kind(), "[TagLoop] Tag abandoned: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> PaymentLedger {
        let mut ledger = PaymentLedger::new();
        ledger
            .parse(r#"{"orderId":"p1","apple":["abcd1234",2],"admin":["a1b2c3d4",1]}"#)
            .unwrap();
        ledger
    }

    #[test]
    fn test_classify_order() {
        let cards = CardConfig::default();
        let ledger = ledger();

        assert_eq!(classify(&cards, &ledger, "a1b2c3d4"), TagClass::Administrator);
        assert_eq!(classify(&cards, &ledger, "c3a27b28"), TagClass::Administrator);
        assert_eq!(classify(&cards, &ledger, "34e0ef03"), TagClass::Test);
        assert_eq!(
            classify(&cards, &ledger, "abcd1234"),
            TagClass::Matched("apple".to_string())
        );
        assert_eq!(classify(&cards, &ledger, "0000"), TagClass::Unmatched);
        assert_eq!(
            classify(&cards, &PaymentLedger::new(), "abcd1234"),
            TagClass::Unmatched
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ActionError::NoActiveOrder.kind(), ErrorKind::NoActiveOrder);
        assert_eq!(
            ActionError::Link(LinkError::Closed).kind(),
            ErrorKind::TransportTimeout
        );
        assert_eq!(
            ActionError::RefreshExhausted {
                attempts: 3,
                last: String::new()
            }
            .kind(),
            ErrorKind::MalformedPayload
        );
        assert_eq!(
            ActionError::Config(ConfigError::Validation(vec![])).kind(),
            ErrorKind::ConfigurationInvalid
        );
    }
}
