//! Server-side WebSocket ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455),
//! version 13) frame pipe over any tokio byte stream.
//!
//! This crate is the transport core of a WebSocket endpoint: the frame
//! codec and the connection state machine. It deliberately starts where the
//! HTTP Upgrade handshake ends: construct a [`Conn`] around an
//! already-upgraded stream and the crate takes it from there. TLS, listening
//! sockets, Origin checks and extension negotiation are out of its scope.
//!
//! # Layered interfaces
//!
//! Two interfaces share one connection state:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Messaging layer                               │
//! │  • receive / receive_stream, send / send_stream│
//! │  • deadlines, retries with backoff             │
//! │  • transparent Ping→Pong and Close handling    │
//! │  • UTF-8 validation for Text                   │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//! ┌──────────────────▼─────────────────────────────┐
//! │  Frame pipe (Conn)                             │
//! │  • read/write span one message / one frame     │
//! │  • fixed scratch buffers, streaming payloads   │
//! │  • masking, header codec, close latch          │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The low-level pipe never buffers a message: payload bytes stream through
//! caller buffers with only a 131-byte read scratch and a 127-byte write
//! scratch in between, so message size is unbounded by memory. The
//! messaging layer adds the conveniences around it without taking that
//! property away. Buffer-mode [`Conn::receive`] is bounded by the caller's
//! buffer, and [`Conn::receive_stream`]/[`Conn::send_stream`] keep
//! arbitrary-length messages flowing.
//!
//! Each direction is independently serialised, so one task can stream a
//! large upload while another reads, and control traffic weaves in between
//! messages without corrupting either.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wspipe::{Conn, OpCode, ACCEPT_V13};
//!
//! # async fn serve(stream: tokio::net::TcpStream) -> wspipe::Result<()> {
//! let mut conn = Conn::new(stream);
//! conn.set_accept(ACCEPT_V13);
//!
//! let wire = Duration::from_secs(10);
//! let idle = Duration::from_secs(60);
//!
//! let mut buf = vec![0; 64 * 1024];
//! loop {
//!     let (opcode, n) = conn.receive(&mut buf, wire, idle).await?;
//!     if opcode == OpCode::Text {
//!         conn.send(OpCode::Text, &buf[..n], wire).await?;
//!     }
//! }
//! # }
//! ```
//!
//! For a non-blocking parse loop without a connection, see
//! [`reader::Reader`].

pub mod close;
mod conn;
pub mod frame;
mod mask;
mod messaging;
pub mod reader;

use std::io;

use thiserror::Error;

pub use close::CloseCode;
pub use conn::Conn;
pub use frame::{OpCode, ACCEPT_V13};
pub use messaging::{MessageReader, MessageWriter};
pub use reader::Reader;

/// A result type for WebSocket operations, using `WebSocketError` as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// Protocol violations do not appear as their own variants: the connection
/// reacts to them by closing with the appropriate status code, so they
/// surface as [`WebSocketError::Closed`] carrying that status.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The connection closed, whether by the peer, by a protocol violation, by a
    /// deadline or by an explicit [`Conn::send_close`]. Carries the status
    /// code that won the close latch; every operation after the latch
    /// reports the same value. The underlying stream still needs to be
    /// dropped by the caller.
    #[error("{}", close::closed_message(*.0))]
    Closed(CloseCode),

    /// A write was resumed with a payload length that differs from the
    /// pending frame remainder. Retry with the original buffer minus the
    /// bytes already reported.
    #[error("websocket: retry with the pending payload size")]
    Retry,

    /// The message does not fit the receive buffer. The connection has
    /// been closed with status 1009 and the message is lost.
    #[error("websocket: message exceeds buffer capacity")]
    Overflow,

    /// The next frame needs more input than the parse buffer holds. Read
    /// more and retry.
    #[error("websocket: next frame needs more data")]
    Underflow,

    /// A Text payload is not valid UTF-8. The connection remains open;
    /// whether to close with status 1007 is the caller's call.
    #[error("websocket: text message with invalid UTF-8")]
    InvalidUtf8,

    /// The transport failed. Reads and writes surface these as they
    /// happen; the messaging layer retries the transient kinds with
    /// backoff first.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WebSocketError {
    /// Transient transport conditions worth retrying after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            )
        )
    }

    /// The latched status code, when the error is a closed connection.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Closed(code) => Some(*code),
            _ => None,
        }
    }
}
