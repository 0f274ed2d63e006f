//! # Frame
//!
//! Wire-level definitions for WebSocket frames as specified in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is never materialised as a struct here: the connection streams
//! headers and payloads through fixed cursors instead, so this module only
//! holds the byte layout, the [`OpCode`] space and the header encoder.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Incoming frames must be masked (this is the server side of the protocol);
//! outgoing frames never are.

// first frame byte layout
pub(crate) const OPCODE_BITS: u8 = 0x0f;
pub(crate) const CTRL_FLAG: u8 = 0x08;
pub(crate) const RESERVED_BITS: u8 = 0x70;
pub(crate) const FINAL_FLAG: u8 = 0x80;

// second frame byte layout
pub(crate) const SIZE_BITS: u8 = 0x7f;
pub(crate) const MASK_FLAG: u8 = 0x80;

/// Largest header this side ever emits: 2 bytes plus a 64-bit length.
pub(crate) const MAX_HEAD_SIZE: usize = 10;

/// Accept-mask covering all non-reserved opcodes of protocol version 13.
///
/// The accept mask is a bitset indexed by opcode, little-endian bit order as
/// in `1 << opcode`. When the connection's mask is non-zero, a frame whose
/// opcode bit is unset is rejected with a 1003 close
/// ([`CloseCode::CannotAccept`]). Zero disables filtering.
///
/// [`CloseCode::CannotAccept`]: crate::CloseCode::CannotAccept
pub const ACCEPT_V13: u16 = 1 << OpCode::Continuation as u16
    | 1 << OpCode::Text as u16
    | 1 << OpCode::Binary as u16
    | 1 << OpCode::Close as u16
    | 1 << OpCode::Ping as u16
    | 1 << OpCode::Pong as u16;

/// WebSocket operation code, the payload interpretation of a frame.
///
/// Data opcodes occupy the range 0-7 and control opcodes the range 8-15.
/// The reserved values are carried as distinct variants rather than rejected
/// at parse time: whether an endpoint accepts them is governed by the accept
/// mask (see [`ACCEPT_V13`]), not by the codec.
///
/// The numeric values follow [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation = 0,
    /// UTF-8 encoded data.
    Text = 1,
    /// Opaque binary data.
    Binary = 2,
    /// Reserved for further data frames.
    Reserved3 = 3,
    /// Reserved for further data frames.
    Reserved4 = 4,
    /// Reserved for further data frames.
    Reserved5 = 5,
    /// Reserved for further data frames.
    Reserved6 = 6,
    /// Reserved for further data frames.
    Reserved7 = 7,
    /// Disconnect notification.
    Close = 8,
    /// Liveness check; requests a Pong.
    Ping = 9,
    /// Answer to a Ping. May also be sent unsolicited.
    Pong = 10,
    /// Reserved for further control frames.
    Reserved11 = 11,
    /// Reserved for further control frames.
    Reserved12 = 12,
    /// Reserved for further control frames.
    Reserved13 = 13,
    /// Reserved for further control frames.
    Reserved14 = 14,
    /// Reserved for further control frames.
    Reserved15 = 15,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping`, `Pong` and the reserved control
    /// range 11-15.
    ///
    /// Control frames manage the connection and have special constraints:
    /// they cannot be fragmented and their payload is limited to 125 bytes.
    pub fn is_control(&self) -> bool {
        *self as u8 & CTRL_FLAG != 0
    }
}

impl From<u8> for OpCode {
    /// Interprets the low nibble of `value` as an opcode.
    fn from(value: u8) -> Self {
        match value & OPCODE_BITS {
            0 => Self::Continuation,
            1 => Self::Text,
            2 => Self::Binary,
            3 => Self::Reserved3,
            4 => Self::Reserved4,
            5 => Self::Reserved5,
            6 => Self::Reserved6,
            7 => Self::Reserved7,
            8 => Self::Close,
            9 => Self::Ping,
            10 => Self::Pong,
            11 => Self::Reserved11,
            12 => Self::Reserved12,
            13 => Self::Reserved13,
            14 => Self::Reserved14,
            _ => Self::Reserved15,
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        value as u8
    }
}

/// Encodes a frame header for `payload_len` bytes into `dst` and returns the
/// header size: 2 bytes below 126, 4 bytes below 65536 and 10 bytes beyond.
///
/// `head` becomes the first header byte as-is (FIN flag and opcode). The
/// mask flag is never set; server output goes out unmasked.
///
/// # Panics
/// Panics if `dst` is shorter than [`MAX_HEAD_SIZE`].
pub(crate) fn encode_head(head: u8, payload_len: usize, dst: &mut [u8]) -> usize {
    dst[0] = head;
    if payload_len < 126 {
        dst[1] = payload_len as u8;
        2
    } else if payload_len < 1 << 16 {
        dst[1] = 126;
        dst[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        dst[1] = 127;
        dst[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    }
}
