//! Command Link — line protocol to the motor controller
//!
//! One text line per message, `\n` terminated. The controller answers every
//! line it receives with the literal `ACK`. That token is a transport receipt
//! only; it does not say the command was executed.
//!
//! ## Ownership
//!
//! [`CommandLink`] owns the write half of the transport. The read half lives
//! on a reader (a blocking thread for UART/TCP, a channel for the in-memory
//! pair) which forwards complete lines over an unbounded channel. Waiting for
//! an `ACK` is a timed suspension on that channel, so nothing spins and a
//! timeout never loses a half-read line.
//!
//! A link built with a reopen function (the TCP bridge) can replace its
//! transport in place with [`CommandLink::reconnect`]. Retries are not done
//! here; see [`dispatch::send_with_retry`].

pub mod dispatch;
pub mod transport;

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use dispatch::{send_with_retry, AckPolicy};
pub use transport::{from_tcp_stream, open, open_serial, pair};

use crate::reconnect::ReconnectPolicy;

/// Acknowledgement token, compared after trimming.
pub const ACK: &str = "ACK";

/// Commands the motor controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Start,
    Go,
    Stop,
    Test,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Go => "GO",
            Command::Stop => "STOP",
            Command::Test => "TEST",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No ACK within {0:?}")]
    AckTimeout(Duration),

    #[error("Link closed by peer")]
    Closed,

    #[error("{command} not acknowledged after {attempts} attempts")]
    Exhausted { command: Command, attempts: u32 },

    #[error("Failed to open link {target}: {message}")]
    Open { target: String, message: String },
}

/// Opens a fresh transport to the same peer.
pub type ReopenFn =
    Box<dyn Fn() -> BoxFuture<'static, Result<CommandLink, LinkError>> + Send + Sync>;

/// Line-oriented, acknowledged message exchange over one serial channel.
pub struct CommandLink {
    name: String,
    writer: Box<dyn Write + Send>,
    lines: mpsc::UnboundedReceiver<String>,
    /// Lines already pulled off the channel by `has_line`.
    pending: VecDeque<String>,
    closed: bool,
    reopen: Option<ReopenFn>,
}

impl CommandLink {
    /// Build a link from a writer and the channel its reader feeds.
    pub fn new(
        name: impl Into<String>,
        writer: Box<dyn Write + Send>,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            name: name.into(),
            writer,
            lines,
            pending: VecDeque::new(),
            closed: false,
            reopen: None,
        }
    }

    /// Allow [`reconnect`](Self::reconnect) through `reopen`.
    pub fn with_reopen(mut self, reopen: ReopenFn) -> Self {
        self.reopen = Some(reopen);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_reconnect(&self) -> bool {
        self.reopen.is_some()
    }

    /// Replace the transport with a fresh one, backing off between tries.
    ///
    /// Buffered lines from the old transport are dropped.
    pub async fn reconnect(&mut self, policy: &ReconnectPolicy) -> Result<(), LinkError> {
        let Some(reopen) = self.reopen.as_ref() else {
            return Err(LinkError::Closed);
        };
        let fresh = policy.run(&self.name, || reopen()).await?;

        self.writer = fresh.writer;
        self.lines = fresh.lines;
        self.pending.clear();
        self.closed = false;
        Ok(())
    }

    /// True once the reader side has gone away and no buffered lines remain.
    pub fn is_closed(&mut self) -> bool {
        self.drain_channel();
        self.closed && self.pending.is_empty()
    }

    /// Write `text` plus the line terminator and flush before returning.
    pub fn send_line(&mut self, text: &str) -> Result<(), LinkError> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        debug!(link = %self.name, line = text, "[CommandLink] Sent");
        Ok(())
    }

    /// Next complete line if one has arrived. Never blocks.
    pub fn receive_line(&mut self) -> Option<String> {
        self.drain_channel();
        self.pending.pop_front()
    }

    /// Whether a complete line is waiting.
    pub fn has_line(&mut self) -> bool {
        self.drain_channel();
        !self.pending.is_empty()
    }

    /// Suspend until a line is pending. Returns false when the link closed.
    pub async fn wait_for_line(&mut self) -> bool {
        if self.has_line() {
            return true;
        }
        match self.lines.recv().await {
            Some(line) => {
                self.pending.push_back(line);
                true
            }
            None => {
                self.closed = true;
                false
            }
        }
    }

    /// Send `message`, then wait up to `window` for a trimmed `ACK`.
    ///
    /// Lines other than `ACK` are discarded and waiting continues.
    pub async fn send_with_ack(&mut self, message: &str, window: Duration) -> Result<(), LinkError> {
        self.send_line(message)?;

        let wait = async {
            loop {
                match self.next_line().await {
                    Some(line) if line.trim() == ACK => return Ok(()),
                    Some(line) => {
                        debug!(link = %self.name, reply = %line.trim(), "[CommandLink] Discarding non-ACK reply");
                    }
                    None => return Err(LinkError::Closed),
                }
            }
        };

        match tokio::time::timeout(window, wait).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::AckTimeout(window)),
        }
    }

    /// Receiver role: if a line is pending, read it and reply `ACK`.
    ///
    /// The reply is unconditional. Returns the trimmed line that was acknowledged.
    pub fn wait_and_ack(&mut self) -> Result<Option<String>, LinkError> {
        let Some(line) = self.receive_line() else {
            return Ok(None);
        };
        let msg = line.trim().to_string();
        info!(link = %self.name, message = %msg, "[CommandLink] Received");
        self.send_ack()?;
        Ok(Some(msg))
    }

    pub fn send_ack(&mut self) -> Result<(), LinkError> {
        self.send_line(ACK)
    }

    async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.pending.pop_front() {
            return Some(line);
        }
        let line = self.lines.recv().await;
        if line.is_none() {
            self.closed = true;
        }
        line
    }

    fn drain_channel(&mut self) {
        loop {
            match self.lines.try_recv() {
                Ok(line) => self.pending.push_back(line),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for CommandLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLink")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .field("reconnectable", &self.reopen.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    const WINDOW: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_receive_line_is_non_blocking() {
        let (mut bot, _controller) = pair();
        assert!(!bot.has_line());
        assert_eq!(bot.receive_line(), None);
    }

    #[tokio::test]
    async fn test_lines_arrive_in_order() {
        let (mut bot, mut controller) = pair();
        bot.send_line("START").unwrap();
        bot.send_line("GO").unwrap();

        assert!(controller.has_line());
        assert_eq!(controller.receive_line().as_deref(), Some("START"));
        assert_eq!(controller.receive_line().as_deref(), Some("GO"));
        assert_eq!(controller.receive_line(), None);
    }

    #[tokio::test]
    async fn test_wait_and_ack_replies_unconditionally() {
        let (mut bot, mut controller) = pair();
        assert_eq!(controller.wait_and_ack().unwrap(), None);

        bot.send_line("  anything at all \r").unwrap();
        assert!(controller.wait_for_line().await);
        assert_eq!(
            controller.wait_and_ack().unwrap().as_deref(),
            Some("anything at all")
        );
        assert_eq!(bot.receive_line().as_deref(), Some(ACK));
    }

    #[tokio::test]
    async fn test_send_with_ack_succeeds() {
        let (mut bot, mut controller) = pair();
        let responder = tokio::spawn(async move {
            controller.wait_for_line().await;
            controller.wait_and_ack().unwrap()
        });

        bot.send_with_ack("STOP", WINDOW).await.unwrap();
        assert_eq!(responder.await.unwrap().as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn test_send_with_ack_discards_other_lines() {
        let (mut bot, mut controller) = pair();
        let responder = tokio::spawn(async move {
            controller.wait_for_line().await;
            controller.receive_line();
            controller.send_line("BUSY").unwrap();
            controller.send_line("ack").unwrap();
            controller.send_line(" ACK \r").unwrap();
            controller
        });

        bot.send_with_ack("GO", WINDOW).await.unwrap();
        let _controller = responder.await.unwrap();
        assert!(!bot.has_line());
    }

    #[tokio::test]
    async fn test_send_with_ack_times_out() {
        let (mut bot, _controller) = pair();
        let err = bot.send_with_ack("TEST", WINDOW).await.unwrap_err();
        assert!(matches!(err, LinkError::AckTimeout(w) if w == WINDOW));
    }

    #[tokio::test]
    async fn test_send_with_ack_reports_closed_peer() {
        let (mut bot, controller) = pair();
        drop(controller);
        let err = bot.send_with_ack("TEST", WINDOW).await;
        assert!(matches!(err, Err(LinkError::Io(_) | LinkError::Closed)));
        assert!(bot.is_closed());
    }

    #[tokio::test]
    async fn test_reconnect_swaps_transport() {
        let (mut bot, controller) = pair();
        let (spare_bot, spare_controller) = pair();
        let spare = std::sync::Mutex::new(Some(spare_bot));

        bot = bot.with_reopen(Box::new(move || {
            let next = spare.lock().unwrap().take().ok_or(LinkError::Closed);
            async move { next }.boxed()
        }));
        drop(controller);
        assert!(bot.is_closed());

        let policy = ReconnectPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        bot.reconnect(&policy).await.unwrap();
        assert!(!bot.is_closed());

        let mut spare_controller = spare_controller;
        bot.send_line("GO").unwrap();
        assert_eq!(spare_controller.receive_line().as_deref(), Some("GO"));
    }

    #[tokio::test]
    async fn test_reconnect_without_reopen_is_closed() {
        let (mut bot, _controller) = pair();
        assert!(!bot.can_reconnect());
        let err = bot.reconnect(&ReconnectPolicy::default()).await.unwrap_err();
        assert!(matches!(err, LinkError::Closed));
    }

    #[test]
    fn test_command_wire_names() {
        assert_eq!(Command::Start.to_string(), "START");
        assert_eq!(Command::Go.as_str(), "GO");
        assert_eq!(Command::Stop.as_str(), "STOP");
        assert_eq!(Command::Test.as_str(), "TEST");
    }
}
