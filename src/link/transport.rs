//! Transports behind a [`CommandLink`].
//!
//! - `tcp`: the controller UART exposed through a serial-to-TCP bridge;
//!   reconnectable when the bridge drops
//! - `serial`: a local UART (needs the `serial` feature)
//! - [`pair`]: two links wired back to back in memory, for tests
//!
//! Blocking transports get a dedicated reader thread. It keeps a line buffer
//! across read timeouts, so a partial line is completed by the next read
//! instead of being dropped.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{CommandLink, LinkError, ReopenFn};
use crate::config::{defaults, LinkConfig, LinkTransport};

/// Open the link described by `config`.
///
/// Connecting blocks, so it runs on the blocking pool.
pub async fn open(config: &LinkConfig) -> Result<CommandLink, LinkError> {
    let config = config.clone();
    let target = match config.transport {
        LinkTransport::Tcp => config.address.clone(),
        LinkTransport::Serial => config.device.clone(),
    };

    let opened = tokio::task::spawn_blocking(move || match config.transport {
        LinkTransport::Tcp => connect_tcp(&config.address),
        LinkTransport::Serial => open_serial(&config.device, config.baud_rate),
    })
    .await
    .map_err(|e| LinkError::Open {
        target: target.clone(),
        message: e.to_string(),
    })??;

    info!(target = %target, "[CommandLink] Link open");
    Ok(opened)
}

/// Connect to a serial-to-TCP bridge at `address` (`host:port`).
///
/// The link can reconnect to the same address later.
pub fn connect_tcp(address: &str) -> Result<CommandLink, LinkError> {
    let stream = std::net::TcpStream::connect(address).map_err(|e| LinkError::Open {
        target: address.to_string(),
        message: e.to_string(),
    })?;
    Ok(from_tcp_stream(stream, address)?.with_reopen(tcp_reopen(address.to_string())))
}

fn tcp_reopen(address: String) -> ReopenFn {
    Box::new(move || {
        let address = address.clone();
        async move {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| LinkError::Open {
                    target: address.clone(),
                    message: e.to_string(),
                })?;
            from_tcp_stream(stream.into_std()?, &address)
        }
        .boxed()
    })
}

/// Wrap an already connected stream, e.g. one accepted by the responder.
pub fn from_tcp_stream(
    stream: std::net::TcpStream,
    name: &str,
) -> Result<CommandLink, LinkError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(defaults::LINK_READ_POLL_MS)))?;

    let reader = stream.try_clone()?;
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_line_reader(name.to_string(), reader, tx)?;

    Ok(CommandLink::new(name, Box::new(stream), rx))
}

/// Open a local UART, 8N1 at `baud_rate`.
#[cfg(feature = "serial")]
pub fn open_serial(device: &str, baud_rate: u32) -> Result<CommandLink, LinkError> {
    let open_err = |e: serialport::Error| LinkError::Open {
        target: device.to_string(),
        message: e.to_string(),
    };

    let port = serialport::new(device, baud_rate)
        .timeout(Duration::from_millis(defaults::LINK_READ_POLL_MS))
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .open()
        .map_err(open_err)?;

    let reader = port.try_clone().map_err(open_err)?;
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_line_reader(device.to_string(), reader, tx)?;

    Ok(CommandLink::new(device, Box::new(port), rx))
}

#[cfg(not(feature = "serial"))]
pub fn open_serial(device: &str, _baud_rate: u32) -> Result<CommandLink, LinkError> {
    Err(LinkError::Open {
        target: device.to_string(),
        message: "built without the `serial` feature; use transport = \"tcp\"".to_string(),
    })
}

/// Two links whose writes arrive as lines on the other side.
pub fn pair() -> (CommandLink, CommandLink) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = CommandLink::new("memory-a", Box::new(ChannelWriter::new(b_tx)), a_rx);
    let b = CommandLink::new("memory-b", Box::new(ChannelWriter::new(a_tx)), b_rx);
    (a, b)
}

// ============================================================================
// Reader thread
// ============================================================================

fn spawn_line_reader<R>(
    name: String,
    reader: R,
    tx: mpsc::UnboundedSender<String>,
) -> io::Result<std::thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("link-reader-{name}"))
        .spawn(move || read_lines(&name, reader, &tx))
}

fn read_lines<R: Read>(name: &str, reader: R, tx: &mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();

    loop {
        match reader.read_line(&mut buf) {
            Ok(0) => {
                debug!(link = name, "[CommandLink] Reader reached EOF");
                break;
            }
            Ok(_) => {
                if !buf.ends_with('\n') {
                    continue;
                }
                let line = buf.trim_end_matches(['\r', '\n']).to_string();
                buf.clear();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(link = name, "[CommandLink] Dropping line with invalid UTF-8");
                buf.clear();
            }
            Err(e) => {
                warn!(link = name, error = %e, "[CommandLink] Reader stopped");
                break;
            }
        }
    }
}

// ============================================================================
// In-memory writer
// ============================================================================

/// `io::Write` that splits written bytes into lines and forwards them.
struct ChannelWriter {
    tx: mpsc::UnboundedSender<String>,
    partial: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            partial: Vec::new(),
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            self.tx
                .send(line)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer link dropped"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
