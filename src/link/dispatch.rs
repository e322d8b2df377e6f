//! Reliable dispatch: bounded ACK retries for one command.
//!
//! Delivery is at-least-once. If the controller's `ACK` is lost, the retry
//! delivers the same command again; the commands are idempotent on the cart.
//!
//! A reconnectable link whose bridge dropped is reconnected before the next
//! attempt. A link that cannot reconnect gives up as soon as it is closed.

use std::time::Duration;

use tracing::{error, info, warn};

use super::{Command, CommandLink, LinkError};
use crate::config::{defaults, LinkConfig};
use crate::reconnect::ReconnectPolicy;

/// Attempt count and timing for [`send_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub attempts: u32,
    pub ack_window: Duration,
    /// Pause between attempts. Not applied after the last one.
    pub backoff: Duration,
    /// Used when the bridge behind the link has dropped.
    pub reconnect: ReconnectPolicy,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::LINK_ATTEMPTS,
            ack_window: Duration::from_millis(defaults::LINK_ACK_WINDOW_MS),
            backoff: Duration::from_millis(defaults::LINK_BACKOFF_MS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&LinkConfig> for AckPolicy {
    fn from(config: &LinkConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            ack_window: Duration::from_millis(config.ack_window_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            reconnect: ReconnectPolicy::from(config),
        }
    }
}

/// Send `command` until it is acknowledged or the attempts run out.
///
/// Returns the attempt number that got the `ACK`. On exhaustion the caller
/// must abandon whatever action needed the command.
pub async fn send_with_retry(
    link: &mut CommandLink,
    command: Command,
    policy: &AckPolicy,
) -> Result<u32, LinkError> {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        if link.is_closed() {
            reopen_or_abandon(link, command, policy).await?;
        }

        info!("[CommandLink] {command} sent (attempt {attempt}/{attempts})");

        match link.send_with_ack(command.as_str(), policy.ack_window).await {
            Ok(()) => {
                info!("[CommandLink] {command} acknowledged");
                return Ok(attempt);
            }
            Err(e @ (LinkError::Closed | LinkError::Io(_))) if link.can_reconnect() => {
                warn!("[CommandLink] {command} attempt {attempt}/{attempts} lost the bridge: {e}");
                reopen_or_abandon(link, command, policy).await?;
                continue;
            }
            Err(LinkError::Closed) => {
                error!("[CommandLink] {command} abandoned: link closed");
                return Err(LinkError::Closed);
            }
            Err(e) => {
                warn!("[CommandLink] {command} attempt {attempt}/{attempts} failed: {e}");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    error!("[CommandLink] {command} not acknowledged after {attempts} attempts, giving up");
    Err(LinkError::Exhausted { command, attempts })
}

async fn reopen_or_abandon(
    link: &mut CommandLink,
    command: Command,
    policy: &AckPolicy,
) -> Result<(), LinkError> {
    if !link.can_reconnect() {
        error!("[CommandLink] {command} abandoned: link closed");
        return Err(LinkError::Closed);
    }
    link.reconnect(&policy.reconnect).await.map_err(|e| {
        error!("[CommandLink] {command} abandoned: {e}");
        e
    })
}
