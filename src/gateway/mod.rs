//! Dispatch Gateway — outbound HTTP to the order backend and the stand
//!
//! Every backend call whose outcome gates an action is fail-closed: a reply
//! confirms only with `200 OK` or with the call's configured success marker
//! somewhere in the body. Transport errors never confirm.

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, BotConfig, StandConfig};

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {0}")]
    Status(StatusCode),

    #[error("{call} not confirmed (status {status})")]
    Unconfirmed { call: &'static str, status: StatusCode },

    #[error("Stand did not answer 200 after {0} attempts")]
    StandUnreachable(u32),

    #[error("No forward path configured")]
    NoForwardPath,
}

/// Status and body of one backend response.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: StatusCode,
    pub body: String,
}

impl BackendReply {
    /// `200 OK`, or `marker` appears in the body.
    pub fn confirms(&self, marker: &str) -> bool {
        self.status == StatusCode::OK || (!marker.is_empty() && self.body.contains(marker))
    }
}

/// HTTP client for the order backend and the stand actuator.
#[derive(Clone)]
pub struct DispatchGateway {
    http: reqwest::Client,
    backend_url: String,
    stand_url: String,
    backend: BackendConfig,
    stand: StandConfig,
}

impl DispatchGateway {
    pub fn new(config: &BotConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.backend.timeout())
            .build()?;

        Ok(Self {
            http,
            backend_url: config.backend_base_url(),
            stand_url: config.stand_base_url(),
            backend: config.backend.clone(),
            stand: config.stand.clone(),
        })
    }

    pub fn has_forward_path(&self) -> bool {
        self.backend.forward_path.is_some()
    }

    async fn get(&self, path: &str) -> Result<BackendReply, GatewayError> {
        let url = format!("{}{}", self.backend_url, path);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%url, %status, "[Gateway] GET");
        Ok(BackendReply { status, body })
    }

    async fn confirmed_get(
        &self,
        call: &'static str,
        path: &str,
        marker: &str,
    ) -> Result<BackendReply, GatewayError> {
        let reply = self.get(path).await?;
        if reply.confirms(marker) {
            info!("[Gateway] {call} confirmed");
            Ok(reply)
        } else {
            warn!(status = %reply.status, body = %reply.body, "[Gateway] {call} not confirmed");
            Err(GatewayError::Unconfirmed {
                call,
                status: reply.status,
            })
        }
    }

    /// Fetch the raw payment snapshot. Anything but a 2xx is an error.
    pub async fn fetch_payment(&self) -> Result<String, GatewayError> {
        let reply = self.get(&self.backend.get_payment).await?;
        if !reply.status.is_success() {
            return Err(GatewayError::Status(reply.status));
        }
        Ok(reply.body)
    }

    /// Create the working list for the current order.
    pub async fn init_working_list(&self) -> Result<BackendReply, GatewayError> {
        self.confirmed_get(
            "first-set-working-list",
            &self.backend.first_set_working_list,
            &self.backend.markers.working_list_initialized,
        )
        .await
    }

    pub async fn reset_working_list(&self) -> Result<BackendReply, GatewayError> {
        self.confirmed_get(
            "reset-working-list",
            &self.backend.reset_working_list,
            &self.backend.markers.working_list_reset,
        )
        .await
    }

    /// Record a scanned item. The tag id is appended to the configured path.
    pub async fn add_working_list(&self, tag_id: &str) -> Result<BackendReply, GatewayError> {
        let path = format!("{}{}", self.backend.add_working_list, tag_id);
        self.confirmed_get(
            "add-working-list",
            &path,
            &self.backend.markers.working_list_added,
        )
        .await
    }

    /// POST `body` unchanged to the configured forward path.
    pub async fn forward_post(&self, body: String) -> Result<BackendReply, GatewayError> {
        let path = self
            .backend
            .forward_path
            .as_deref()
            .ok_or(GatewayError::NoForwardPath)?;
        let url = format!("{}{}", self.backend_url, path);

        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%url, %status, "[Gateway] POST");
        Ok(BackendReply { status, body })
    }

    /// Tell the stand a tag was handled. Up to `stand.attempts` tries, 200 wins.
    ///
    /// Returns the attempt that succeeded.
    pub async fn notify_stand(&self, tag_id: &str) -> Result<u32, GatewayError> {
        let url = format!("{}{}?uid={}", self.stand_url, self.stand.action.path(), tag_id);
        let attempts = self.stand.attempts.max(1);

        for attempt in 1..=attempts {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    info!(tag = %tag_id, "[Gateway] Stand notified (attempt {attempt}/{attempts})");
                    return Ok(attempt);
                }
                Ok(resp) => {
                    warn!(tag = %tag_id, status = %resp.status(), "[Gateway] Stand attempt {attempt}/{attempts} rejected");
                }
                Err(e) => {
                    warn!(tag = %tag_id, error = %e, "[Gateway] Stand attempt {attempt}/{attempts} failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.stand.retry_delay()).await;
            }
        }

        Err(GatewayError::StandUnreachable(attempts))
    }
}
