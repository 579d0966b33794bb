//! One TCP connection to the eval server: lifecycle and the read loop.
//!
//! A [`Connection`] owns its socket exclusively. While connected, a spawned
//! read loop appends each chunk to a [`FrameBuffer`], decodes every complete
//! frame, and delivers the results over an unbounded event channel in frame
//! order. The channel's consumer processes events one at a time, so handler
//! code never races with itself.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::framing::{self, FrameBuffer};
use super::NetError;
use crate::protocol::Message;

/// Socket read granularity.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Idle,
    /// A connect is in flight.
    Connecting,
    /// Socket open, read loop running.
    Connected,
}

/// What the read loop delivers to the connection's consumer.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded inbound message, in frame arrival order.
    Message(Message),
    /// A recoverable or fatal error. A decode failure for one frame does
    /// not end the stream; transport failures are followed by `Closed`.
    Error(NetError),
    /// The read loop ended (EOF, read failure, or framing desync). The
    /// consumer should call [`Connection::disconnect`].
    Closed,
}

/// A persistent framed TCP link to the peer.
pub struct Connection {
    addr: String,
    state: ConnectionState,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    event_tx: UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Create an idle connection and the receiver for its events.
    pub fn new(addr: impl Into<String>) -> (Self, UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = Self {
            addr: addr.into(),
            state: ConnectionState::Idle,
            writer: None,
            reader: None,
            event_tx,
        };
        (connection, event_rx)
    }

    /// The peer address this connection targets.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the read loop is live.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Open the socket and start the read loop.
    ///
    /// A no-op returning `Ok` when already connected. No timeout is applied
    /// here; callers that need one wrap this in `tokio::time::timeout`.
    ///
    /// # Errors
    ///
    /// `NetError::AlreadyConnecting` if a connect is in flight,
    /// `NetError::Connect` if the socket cannot be opened (the connection
    /// stays idle).
    pub async fn connect(&mut self) -> Result<(), NetError> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => return Err(NetError::AlreadyConnecting),
            ConnectionState::Idle => {}
        }

        self.state = ConnectionState::Connecting;
        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Idle;
                return Err(NetError::Connect(e));
            }
        };

        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        self.reader = Some(tokio::spawn(read_loop(read_half, self.event_tx.clone())));
        self.state = ConnectionState::Connected;
        info!("connected to {}", self.addr);
        Ok(())
    }

    /// Close the socket and stop the read loop.
    ///
    /// Idempotent, safe to call from any event handler, and never panics on
    /// a socket already in an error state. Returns `true` only when the
    /// connection was previously connected, so the caller reports a
    /// disconnect at most once per connected period.
    pub fn disconnect(&mut self) -> bool {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;

        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Idle;
        if was_connected {
            info!("disconnected from {}", self.addr);
        }
        was_connected
    }

    /// Encode and write one message.
    ///
    /// # Errors
    ///
    /// `NetError::NotConnected` when idle (no bytes written). Encode
    /// failures surface as `NetError::Encode`. A write failure returns
    /// `NetError::Io` and transitions the connection to idle; the caller
    /// owns flushing any correlation state it keeps.
    pub async fn send(&mut self, message: &Message) -> Result<(), NetError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(NetError::NotConnected);
        };

        let frame = framing::encode(message)?;
        debug!(bytes = frame.len(), "sending frame");
        if let Err(e) = writer.write_all(&frame).await {
            warn!("write failed, dropping connection: {e}");
            self.disconnect();
            return Err(NetError::Io(e));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Continuous read loop for one connected socket.
///
/// Runs until EOF, a read error, or a framing desync. One undecodable frame
/// is reported and skipped by its declared length; the frames after it in
/// the same chunk still decode.
async fn read_loop(mut reader: OwnedReadHalf, events: UnboundedSender<ConnectionEvent>) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("peer closed the stream");
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
            Ok(n) => {
                let payloads = match frames.push(&chunk[..n]) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        warn!("framing desync: {e}");
                        let _ = events.send(ConnectionEvent::Error(e));
                        let _ = events.send(ConnectionEvent::Closed);
                        return;
                    }
                };
                for payload in payloads {
                    match framing::decode_payload(&payload) {
                        Ok(message) => {
                            if events.send(ConnectionEvent::Message(message)).is_err() {
                                // consumer is gone, nothing left to read for
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("dropping undecodable frame: {e}");
                            let _ = events.send(ConnectionEvent::Error(e));
                        }
                    }
                }
            }
            Err(e) => {
                let _ = events.send(ConnectionEvent::Error(NetError::Io(e)));
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
        }
    }
}
