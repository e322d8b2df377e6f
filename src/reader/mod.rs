//! Tag Reader — RFID presentations as normalized tag events
//!
//! A [`CardSource`] reports raw card state (a UID is present, the card was
//! removed). [`TagReader`] turns that into [`TagEvent`]s: one per physical
//! presentation, with repeated reports of the card still on the antenna
//! suppressed until it is lifted.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::reconnect::ReconnectPolicy;

/// Raw card state from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// A card with this UID is on the antenna.
    Present(Vec<u8>),
    /// No card on the antenna.
    Removed,
    /// Source finished (EOF or permanent disconnect).
    Eof,
}

/// A new card presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagEvent {
    /// Lowercase hex, two digits per UID byte.
    pub tag_id: String,
    pub read_at: DateTime<Utc>,
}

/// Where card state comes from.
#[async_trait]
pub trait CardSource: Send + 'static {
    /// Next change of card state. `Err` is unrecoverable.
    async fn next_event(&mut self) -> Result<CardEvent>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

/// Render a UID the way card ids are configured and matched.
pub fn normalize_uid(uid: &[u8]) -> String {
    uid.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a UID written as hex, optionally separated by `:`, `-` or spaces.
pub fn parse_uid(text: &str) -> Option<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' ' | '\t'))
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}

// ============================================================================
// TagReader
// ============================================================================

pub struct TagReader {
    source: Box<dyn CardSource>,
    /// Card currently on the antenna, already reported.
    present: Option<String>,
}

impl TagReader {
    pub fn new(source: Box<dyn CardSource>) -> Self {
        Self {
            source,
            present: None,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.source_name()
    }

    /// Wait for the next new presentation. `Ok(None)` once the source ends.
    pub async fn next_tag(&mut self) -> Result<Option<TagEvent>> {
        loop {
            match self.source.next_event().await? {
                CardEvent::Present(uid) => {
                    let tag_id = normalize_uid(&uid);
                    if self.present.as_deref() == Some(tag_id.as_str()) {
                        continue;
                    }
                    debug!(tag = %tag_id, "[TagReader] Card presented");
                    self.present = Some(tag_id.clone());
                    return Ok(Some(TagEvent {
                        tag_id,
                        read_at: Utc::now(),
                    }));
                }
                CardEvent::Removed => {
                    if let Some(tag) = self.present.take() {
                        debug!(tag = %tag, "[TagReader] Card removed");
                    }
                }
                CardEvent::Eof => return Ok(None),
            }
        }
    }
}

// ============================================================================
// Line Source (stdin / TCP reader bridge)
// ============================================================================

/// One hex UID per line; each line is a full tap (present, then removed).
///
/// Blank lines are ignored. Lines that are not hex are logged and skipped.
pub struct LineCardSource<R> {
    reader: R,
    name: String,
    line_buffer: String,
    lift_pending: bool,
}

impl<R> LineCardSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line_buffer: String::with_capacity(64),
            lift_pending: false,
        }
    }
}

impl LineCardSource<tokio::io::BufReader<tokio::io::Stdin>> {
    /// Bench use: `echo c3a27b28 | delivery-bot --stdin`.
    pub fn stdin() -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()), "stdin")
    }
}

type TcpLines = LineCardSource<tokio::io::BufReader<tokio::net::TcpStream>>;

impl TcpLines {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        Ok(Self::new(tokio::io::BufReader::new(stream), address))
    }
}

#[async_trait]
impl<R> CardSource for LineCardSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_event(&mut self) -> Result<CardEvent> {
        if self.lift_pending {
            self.lift_pending = false;
            return Ok(CardEvent::Removed);
        }
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(CardEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match parse_uid(line) {
                Some(uid) => {
                    self.lift_pending = true;
                    return Ok(CardEvent::Present(uid));
                }
                None => {
                    warn!("[{}] Ignoring line that is not a hex UID: {:?}", self.name, line);
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// TCP Reader Bridge
// ============================================================================

/// Line source on a TCP reader bridge that reconnects when the bridge drops.
///
/// Only an exhausted reconnect ends the source, and it ends with an error so
/// the supervisor sees a failure rather than a finished task.
pub struct TcpCardSource {
    address: String,
    lines: TcpLines,
    policy: ReconnectPolicy,
}

impl TcpCardSource {
    pub async fn connect(address: &str, policy: ReconnectPolicy) -> Result<Self> {
        Ok(Self {
            address: address.to_string(),
            lines: TcpLines::connect(address).await?,
            policy,
        })
    }
}

#[async_trait]
impl CardSource for TcpCardSource {
    async fn next_event(&mut self) -> Result<CardEvent> {
        loop {
            match self.lines.next_event().await {
                Ok(CardEvent::Eof) => {
                    warn!("[{}] Reader bridge closed the connection", self.address);
                }
                Err(e) => {
                    warn!("[{}] Reader bridge read failed: {}", self.address, e);
                }
                Ok(event) => return Ok(event),
            }

            let address = self.address.clone();
            self.lines = self
                .policy
                .run(&address, || TcpLines::connect(&address))
                .await?;
        }
    }

    fn source_name(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// Replay Source
// ============================================================================

/// Replays a fixed sequence of card events, then reports EOF.
pub struct ReplayCardSource {
    events: std::vec::IntoIter<CardEvent>,
}

impl ReplayCardSource {
    pub fn new(events: Vec<CardEvent>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

#[async_trait]
impl CardSource for ReplayCardSource {
    async fn next_event(&mut self) -> Result<CardEvent> {
        Ok(self.events.next().unwrap_or(CardEvent::Eof))
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pads_and_lowercases() {
        assert_eq!(normalize_uid(&[0xC3, 0xA2, 0x7B, 0x28]), "c3a27b28");
        assert_eq!(normalize_uid(&[0x04, 0x0A]), "040a");
        assert_eq!(normalize_uid(&[]), "");
    }

    #[test]
    fn test_parse_uid_formats() {
        assert_eq!(parse_uid("C3A27B28"), Some(vec![0xc3, 0xa2, 0x7b, 0x28]));
        assert_eq!(parse_uid("c3:a2:7b:28"), Some(vec![0xc3, 0xa2, 0x7b, 0x28]));
        assert_eq!(parse_uid("04 0a"), Some(vec![0x04, 0x0a]));
        assert_eq!(parse_uid("abc"), None);
        assert_eq!(parse_uid("zz"), None);
        assert_eq!(parse_uid("ü1"), None);
        assert_eq!(parse_uid(""), None);
    }

    #[tokio::test]
    async fn test_repeats_suppressed_until_removed() {
        let uid = vec![0x34, 0xe0, 0xef, 0x03];
        let other = vec![0x01, 0x02];
        let mut reader = TagReader::new(Box::new(ReplayCardSource::new(vec![
            CardEvent::Present(uid.clone()),
            CardEvent::Present(uid.clone()),
            CardEvent::Present(uid.clone()),
            CardEvent::Removed,
            CardEvent::Present(uid.clone()),
            CardEvent::Present(other),
        ])));

        let mut seen = Vec::new();
        while let Some(event) = reader.next_tag().await.unwrap() {
            seen.push(event.tag_id);
        }
        assert_eq!(seen, vec!["34e0ef03", "34e0ef03", "0102"]);
    }

    fn fast_reconnect(attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts,
            initial_delay: std::time::Duration::from_millis(5),
            max_delay: std::time::Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_tcp_source_survives_bridge_drop() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // first bridge session sends one card and hangs up
            let (mut first, _) = listener.accept().await.unwrap();
            first.write_all(b"34e0ef03\n").await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            second.write_all(b"a1b2c3d4\n").await.unwrap();
            // keep the session open
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let source = TcpCardSource::connect(&address, fast_reconnect(5)).await.unwrap();
        let mut reader = TagReader::new(Box::new(source));

        let first = reader.next_tag().await.unwrap().unwrap();
        let second = reader.next_tag().await.unwrap().unwrap();
        assert_eq!(first.tag_id, "34e0ef03");
        assert_eq!(second.tag_id, "a1b2c3d4");
    }

    #[tokio::test]
    async fn test_tcp_source_fails_when_reconnect_exhausted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let source = TcpCardSource::connect(&address, fast_reconnect(2)).await;
        let mut source = source.unwrap();
        // bridge goes away for good
        let (session, _) = listener.accept().await.unwrap();
        drop(session);
        drop(listener);

        assert!(source.next_event().await.is_err());
    }

    #[tokio::test]
    async fn test_line_source_taps_each_line() {
        let input: &'static [u8] = b"34E0EF03\n\nnot-a-card\n34e0ef03\r\n";
        let source = LineCardSource::new(tokio::io::BufReader::new(input), "test");
        let mut reader = TagReader::new(Box::new(source));

        let first = reader.next_tag().await.unwrap().unwrap();
        let second = reader.next_tag().await.unwrap().unwrap();
        assert_eq!(first.tag_id, "34e0ef03");
        assert_eq!(second.tag_id, "34e0ef03");
        assert!(reader.next_tag().await.unwrap().is_none());
    }
}
