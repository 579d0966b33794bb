//! Framed TCP transport to the eval server.
//!
//! This module owns the wire boundary of the bridge: one persistent TCP
//! connection per session, carrying length-prefixed JSON messages in both
//! directions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐            TCP             ┌─────────────────┐
//! │  front-end   │ ◄─────────────────────────►│   eval server   │
//! │ (Connection) │  u32 BE length + JSON body │     (peer)      │
//! └──────────────┘                            └─────────────────┘
//! ```
//!
//! # Protocol
//!
//! Each message is a 4-byte big-endian length prefix followed by that many
//! bytes of UTF-8 JSON:
//!
//! ```text
//! 00 00 00 2F {"status":"Success","request_id":1,"contents":"1+1"}
//! ```
//!
//! [`Connection`] drives the socket and delivers decoded messages, in the
//! order their frames arrived, over an event channel; the session layer
//! consumes them one at a time.

mod connection;
mod framing;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use framing::{decode_payload, encode, FrameBuffer, MAX_FRAME_SIZE};

use std::io;

use thiserror::Error;

/// Transport and codec failures for one connection.
///
/// Transport-level failures are never panicked across the async boundary:
/// they come back as values, either from the call that caused them or as a
/// [`ConnectionEvent::Error`] from the read loop.
#[derive(Debug, Error)]
pub enum NetError {
    /// Opening the socket failed.
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    /// A connect was requested while one is already in flight.
    #[error("connect already in progress")]
    AlreadyConnecting,

    /// A send was attempted while the connection is idle.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// An inbound frame body was not a valid message.
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A frame declared a length past the hard cap. The stream can no
    /// longer be trusted to resynchronize, so this tears the link down.
    #[error("declared frame length {0} exceeds maximum {max}", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    /// The peer violated the protocol in a way we can name.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read or write on an established socket failed.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}
