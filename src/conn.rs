//! Connection state and the low-level frame pipe.
//!
//! # Architecture Layer: Transport & Framing
//!
//! [`Conn`] wraps a full-duplex byte stream and exposes a byte-oriented
//! read/write interface that spans one message per direction:
//!
//! - [`Conn::read`] yields successive payload bytes of the current incoming
//!   message; the active opcode and the message boundary are queryable
//!   through [`Conn::read_mode`].
//! - [`Conn::write`] emits one frame per call, headed by the mode configured
//!   with [`Conn::write_mode`].
//!
//! Each direction is serialised by its own async mutex and owns a fixed
//! scratch buffer sized to hold any control frame in full, so arbitrarily
//! large messages stream through without ever being buffered whole.
//!
//! The close status is a separate atomic latch, set exactly once per
//! connection by whichever side closes first: an incoming Close frame, a
//! protocol violation, a transport disconnect, or a local
//! [`Conn::send_close`]. Once latched, every write reports the same
//! [`WebSocketError::Closed`] value; reads may still drain buffered input.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::close::CloseCode;
use crate::frame::{
    encode_head, OpCode, CTRL_FLAG, FINAL_FLAG, MASK_FLAG, MAX_HEAD_SIZE, OPCODE_BITS,
    RESERVED_BITS, SIZE_BITS,
};
use crate::{mask, Result, WebSocketError};

/// Read scratch fits a compact frame: 2B header + 4B mask + 125B payload.
pub(crate) const READ_BUF_SIZE: usize = 131;
/// Write scratch fits a compact frame: 2B header + 125B payload.
pub(crate) const WRITE_BUF_SIZE: usize = 127;

// any header this side emits must fit the write scratch
const _: () = assert!(WRITE_BUF_SIZE >= MAX_HEAD_SIZE);

/// Marks the close latch as set, so legal status codes (1005 included)
/// remain distinguishable from the open state.
const STATUS_SET: u32 = 1 << 16;

/// A low-level WebSocket connection over any full-duplex byte stream.
///
/// `Conn` is the server side of the protocol: incoming frames must be
/// masked, outgoing frames never are. It is constructed around an
/// already-upgraded stream (the HTTP handshake is a collaborator's job) and
/// lives until dropped or taken apart with [`Conn::into_inner`], even after
/// a close status has been latched.
///
/// All operations take `&self`; reads and writes are internally serialised
/// per direction, so a `Conn` can be shared between tasks (for example
/// behind an `Arc`) with independent readers and writers.
pub struct Conn<S> {
    pub(crate) reader: Mutex<ReadState<S>>,
    pub(crate) writer: Mutex<WriteState<S>>,

    /// First byte of the last frame decoded: final flag, reserved bits and
    /// opcode. Continuation frames are stored under the opcode of the
    /// message they continue.
    pub(crate) read_head: AtomicU32,
    /// First byte of the frame the next write emits.
    pub(crate) write_head: AtomicU32,

    /// Payload bytes of the current incoming frame not yet delivered.
    pub(crate) read_remaining: AtomicU64,

    /// Close latch. Zero is open; any other value is `status | STATUS_SET`.
    status: AtomicU32,

    /// When not zero, opcodes without their bit set are rejected with a
    /// 1003 close. See [`ACCEPT_V13`](crate::ACCEPT_V13).
    pub(crate) accept: u16,
}

pub(crate) struct ReadState<S> {
    pub(crate) io: ReadHalf<S>,

    /// Keystream word for the current frame: the 4-byte key duplicated into
    /// both halves.
    pub(crate) mask: u64,
    /// Keystream byte position for the next masked byte.
    pub(crate) mask_pos: u32,

    /// Opcode of the fragmented message in flight, while one is open.
    pub(crate) frag: Option<u8>,

    pub(crate) buf: [u8; READ_BUF_SIZE],
    /// High-water mark of `buf`.
    pub(crate) filled: usize,
    /// Low-water mark of `buf`; bytes before it have been delivered.
    pub(crate) consumed: usize,
}

pub(crate) struct WriteState<S> {
    pub(crate) io: WriteHalf<S>,

    pub(crate) buf: [u8; WRITE_BUF_SIZE],
    /// Bytes staged in `buf` and not yet flushed to the transport.
    pub(crate) buf_pending: usize,
    /// Payload bytes of a mid-flight frame not yet written out.
    pub(crate) payload_remaining: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Wraps an already-connected byte stream. The accept mask starts at
    /// zero (no opcode filtering).
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadState {
                io: read,
                mask: 0,
                mask_pos: 0,
                frag: None,
                buf: [0; READ_BUF_SIZE],
                filled: 0,
                consumed: 0,
            }),
            writer: Mutex::new(WriteState {
                io: write,
                buf: [0; WRITE_BUF_SIZE],
                buf_pending: 0,
                payload_remaining: 0,
            }),
            read_head: AtomicU32::new(0),
            write_head: AtomicU32::new(0),
            read_remaining: AtomicU64::new(0),
            status: AtomicU32::new(0),
            accept: 0,
        }
    }

    /// Restricts which opcodes the read path accepts. Flags follow
    /// little-endian bit order as in `1 << opcode`; frames whose bit is
    /// unset close the connection with status 1003. Zero disables
    /// filtering.
    ///
    /// Must be called before the connection is shared.
    pub fn set_accept(&mut self, mask: u16) {
        self.accept = mask;
    }

    /// Takes the connection apart, returning the underlying stream.
    pub fn into_inner(self) -> S {
        let read = self.reader.into_inner();
        let write = self.writer.into_inner();
        read.io.unsplit(write.io)
    }

    /// Sets the mode for subsequent [`write`](Conn::write) calls.
    ///
    /// With `fin`, each write sends a whole message of the given type.
    /// Without it, each write sends the next fragment: the head switches to
    /// Continuation by itself after the first fragment, and a later
    /// `write_mode(opcode, true)` concludes the message on the following
    /// write. Control opcodes cannot be fragmented, so the control bit is
    /// cleared for non-final modes.
    ///
    /// The mode is stored atomically; any task may change it between
    /// writes.
    pub fn write_mode(&self, opcode: OpCode, fin: bool) {
        let head = if fin {
            u8::from(opcode) & OPCODE_BITS | FINAL_FLAG
        } else {
            u8::from(opcode) & (OPCODE_BITS & !CTRL_FLAG)
        };
        self.write_head.store(head as u32, Ordering::Release);
    }

    /// Reports the opcode of the message being read and whether the last
    /// [`read`](Conn::read) concluded it.
    ///
    /// The opcode does not change until a final read passed: Continuation
    /// frames are hidden, a fragmented message reports the opcode of its
    /// first frame throughout. Mid-frame reads never report final.
    pub fn read_mode(&self) -> (OpCode, bool) {
        let head = self.read_head.load(Ordering::Acquire) as u8;
        let fin = head & FINAL_FLAG != 0 && self.read_remaining.load(Ordering::Acquire) == 0;
        (OpCode::from(head), fin)
    }

    /// Returns the latched close error, if the connection closed.
    pub fn close_error(&self) -> Option<WebSocketError> {
        let status = self.status.load(Ordering::Acquire);
        (status != 0).then(|| WebSocketError::Closed(CloseCode::from(status as u16)))
    }

    /// Closes the connection with a status code, and returns the typed
    /// closed error that every subsequent operation will report.
    ///
    /// The first close wins: when the latch is already set, the original
    /// error is returned and nothing is sent. Otherwise a Close frame goes
    /// out best-effort. It is skipped entirely when another frame is
    /// mid-transmission (a Close in the middle of someone else's payload
    /// would corrupt the stream), transport errors are ignored, and the
    /// write side is shut down afterwards.
    ///
    /// `reason` is dropped when longer than 123 bytes. Status 1005 and 1006
    /// are reserved for local use and produce an empty-body Close frame.
    pub async fn send_close(&self, code: CloseCode, reason: &str) -> WebSocketError {
        let status = u16::from(code);
        if self
            .status
            .compare_exchange(
                0,
                status as u32 | STATUS_SET,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.close_error().expect("close latch set");
        }
        log::debug!("websocket: close latched, status {status}, reason {reason:?}");

        // control frame payloads cap the reason at 125 - 2 bytes
        let reason = if reason.len() > 123 { "" } else { reason };

        if let Ok(mut writer) = self.writer.try_lock() {
            if writer.buf_pending == 0 && writer.payload_remaining == 0 {
                let frame_len = if code.is_reserved() {
                    writer.buf[0] = FINAL_FLAG | OpCode::Close as u8;
                    writer.buf[1] = 0;
                    2
                } else {
                    writer.buf[0] = FINAL_FLAG | OpCode::Close as u8;
                    writer.buf[1] = (reason.len() + 2) as u8;
                    writer.buf[2..4].copy_from_slice(&status.to_be_bytes());
                    writer.buf[4..4 + reason.len()].copy_from_slice(reason.as_bytes());
                    4 + reason.len()
                };

                // a single poll keeps the latching operation from blocking
                // on a congested transport; the notification is best-effort
                let WriteState { io, buf, .. } = &mut *writer;
                poll_fn(|cx| {
                    let _ = Pin::new(&mut *io).poll_write(cx, &buf[..frame_len]);
                    Poll::Ready(())
                })
                .await;
            }

            // nothing more to say on this side
            let io = &mut writer.io;
            poll_fn(|cx| {
                let _ = Pin::new(&mut *io).poll_shutdown(cx);
                Poll::Ready(())
            })
            .await;
        }

        WebSocketError::Closed(CloseCode::from(status))
    }

    /// Receives payload bytes conform the reader convention: the returned
    /// count may be short, and zero means the current frame carries no
    /// more data (query [`read_mode`](Conn::read_mode) for the boundary).
    ///
    /// A call with no frame in flight parses the next header first, which
    /// may observe a Close frame or a protocol violation and return the
    /// latched close error. A call never crosses a frame boundary; an empty
    /// `buf` just advances to the next header.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        self.read_locked(&mut reader, buf).await
    }

    pub(crate) async fn read_locked(
        &self,
        st: &mut ReadState<S>,
        buf: &mut [u8],
    ) -> Result<usize> {
        if self.read_remaining.load(Ordering::Acquire) == 0 {
            self.next_frame(st).await?;
        }
        self.read_payload(st, buf).await
    }

    /// Copies payload bytes of the frame in flight into `buf`, first from
    /// the scratch, then from the transport, and unmasks them in place.
    /// The returned count may be short; callers loop on
    /// [`read_mode`](Conn::read_mode).
    pub(crate) async fn read_payload(
        &self,
        st: &mut ReadState<S>,
        buf: &mut [u8],
    ) -> Result<usize> {
        let remaining = self.read_remaining.load(Ordering::Acquire);
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..want];

        // scratch remainder settles before the transport is touched, so a
        // deadline cutting the call short never strands consumed bytes
        let buffered = (st.filled - st.consumed).min(want);
        if buffered > 0 {
            buf[..buffered].copy_from_slice(&st.buf[st.consumed..st.consumed + buffered]);
            st.consumed += buffered;
            self.read_remaining
                .store(remaining - buffered as u64, Ordering::Release);
            mask::apply_keystream(&mut buf[..buffered], st.mask, &mut st.mask_pos);
            return Ok(buffered);
        }

        match st.io.read(buf).await {
            Ok(0) => {
                let _ = self.send_close(CloseCode::Abnormal, "unexpected EOF").await;
                Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
            }
            Ok(n) => {
                self.read_remaining
                    .store(remaining - n as u64, Ordering::Release);
                mask::apply_keystream(&mut buf[..n], st.mask, &mut st.mask_pos);
                Ok(n)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Parses the next frame header off the transport.
    ///
    /// Data frames leave the cursor at the payload start with the keystream
    /// armed. Control frames are staged whole: the payload sits unmasked in
    /// the scratch with the keystream zeroed, so copy-out reads pass it
    /// through untouched. Close frames are consumed here and latch the
    /// connection.
    pub(crate) async fn next_frame(&self, st: &mut ReadState<S>) -> Result<()> {
        self.ensure(st, 6).await?;

        let head = st.buf[0];
        let head2 = st.buf[1];
        let opcode = head & OPCODE_BITS;

        if head & RESERVED_BITS != 0 {
            return Err(self.send_close(CloseCode::Protocol, "reserved bit set").await);
        }
        if head2 & MASK_FLAG == 0 {
            return Err(self.send_close(CloseCode::Protocol, "no mask").await);
        }
        if self.accept != 0 && self.accept >> opcode & 1 == 0 {
            let reason = format!("opcode {opcode}");
            return Err(self.send_close(CloseCode::CannotAccept, &reason).await);
        }

        let size7 = head2 & SIZE_BITS;

        if head & CTRL_FLAG != 0 {
            if head & FINAL_FLAG == 0 {
                return Err(self
                    .send_close(CloseCode::Protocol, "control frame not final")
                    .await);
            }
            if size7 > 125 {
                return Err(self.send_close(CloseCode::Protocol, "control frame size").await);
            }

            let len = size7 as usize;
            self.ensure(st, 6 + len).await?;

            // unmask the staged payload in place; zero the keystream so
            // copy-out reads leave the plaintext as-is
            let key: [u8; 4] = st.buf[2..6].try_into().expect("mask key");
            let mut pos = 0;
            mask::apply_keystream(&mut st.buf[6..6 + len], mask::key_word(key), &mut pos);
            st.mask = 0;
            st.mask_pos = 0;
            st.consumed = 6;
            self.read_head.store(head as u32, Ordering::Release);

            if OpCode::from(head) == OpCode::Close {
                st.consumed += len;
                if len < 2 {
                    return Err(self.send_close(CloseCode::NoStatus, "").await);
                }
                let code = u16::from_be_bytes([st.buf[6], st.buf[7]]);
                let reason = std::str::from_utf8(&st.buf[8..6 + len]).unwrap_or_default();
                return Err(self.send_close(CloseCode::from(code), reason).await);
            }

            self.read_remaining.store(len as u64, Ordering::Release);
            return Ok(());
        }

        // data frame; fragmentation hides Continuation behind the opcode of
        // the message it continues
        let fin = head & FINAL_FLAG != 0;
        let effective = if opcode == OpCode::Continuation as u8 {
            match st.frag {
                Some(first) => first,
                None => {
                    return Err(self
                        .send_close(CloseCode::Protocol, "continuation of final message")
                        .await)
                }
            }
        } else {
            if st.frag.is_some() {
                return Err(self
                    .send_close(CloseCode::Protocol, "fragmented message interrupted")
                    .await);
            }
            opcode
        };
        st.frag = (!fin).then_some(effective);

        let (len, header_len) = match size7 {
            126 => {
                self.ensure(st, 8).await?;
                (u16::from_be_bytes([st.buf[2], st.buf[3]]) as u64, 8)
            }
            127 => {
                self.ensure(st, 14).await?;
                let len = u64::from_be_bytes(st.buf[2..10].try_into().expect("64-bit length"));
                if len > i64::MAX as u64 {
                    return Err(self.send_close(CloseCode::TooBig, "word size exceeded").await);
                }
                (len, 14)
            }
            _ => (size7 as u64, 6),
        };

        let key: [u8; 4] = st.buf[header_len - 4..header_len]
            .try_into()
            .expect("mask key");
        st.mask = mask::key_word(key);
        st.mask_pos = 0;
        st.consumed = header_len;
        self.read_head
            .store((effective | head & FINAL_FLAG) as u32, Ordering::Release);
        self.read_remaining.store(len, Ordering::Release);
        Ok(())
    }

    /// Fills the read scratch until `need` bytes sit at its start,
    /// compacting any consumed prefix first.
    async fn ensure(&self, st: &mut ReadState<S>, need: usize) -> Result<()> {
        if st.consumed != 0 {
            st.buf.copy_within(st.consumed..st.filled, 0);
            st.filled -= st.consumed;
            st.consumed = 0;
        }
        while st.filled < need {
            let n = st.io.read(&mut st.buf[st.filled..]).await?;
            if n == 0 {
                let closed = self.send_close(CloseCode::Abnormal, "EOF").await;
                if st.filled == 0 {
                    // disconnect between frames
                    return Err(closed);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            st.filled += n;
        }
        Ok(())
    }

    /// Sends `buf` in one frame conform the writer convention, headed by
    /// the current [`write_mode`](Conn::write_mode). Control frames must
    /// not exceed 125 bytes; an empty `buf` emits an empty frame or
    /// fragment.
    ///
    /// A short count means the transport accepted only part of the payload
    /// and the frame is mid-flight; the error behind it surfaces on the
    /// next call if it persists. **Retries must continue with the same
    /// payload minus the bytes already reported**: a follow-up `write`
    /// whose length differs from the pending remainder is rejected with
    /// [`WebSocketError::Retry`], because switching buffers mid-frame would
    /// break the announced frame length.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, buf).await
    }

    pub(crate) async fn write_locked(&self, st: &mut WriteState<S>, p: &[u8]) -> Result<usize> {
        if let Some(err) = self.close_error() {
            return Err(err);
        }

        // a frame interrupted by a transport error resumes here
        if st.buf_pending > 0 || st.payload_remaining > 0 {
            if st.payload_remaining != p.len() {
                return Err(WebSocketError::Retry);
            }
            flush_header(st).await?;
            return write_payload(st, p).await;
        }

        let head = self.write_head.load(Ordering::Acquire) as u8;
        if head & FINAL_FLAG == 0 && head & OPCODE_BITS != OpCode::Continuation as u8 {
            // stream mode: follow-up fragments continue the message
            self.write_head
                .store((head & !OPCODE_BITS) as u32, Ordering::Release);
        }

        if p.len() < 126 {
            // frame fits the scratch; send one packet
            st.buf[0] = head;
            st.buf[1] = p.len() as u8;
            st.buf[2..2 + p.len()].copy_from_slice(p);
            st.buf_pending = 2 + p.len();
            st.payload_remaining = 0;
            flush_compact(st, p.len()).await
        } else {
            st.buf_pending = encode_head(head, p.len(), &mut st.buf);
            st.payload_remaining = p.len();
            flush_header(st).await?;
            write_payload(st, p).await
        }
    }
}

/// Flushes staged header bytes, shifting the unwritten remainder to the
/// scratch start on every step so an error leaves a resumable cursor.
async fn flush_header<S: AsyncRead + AsyncWrite + Unpin>(st: &mut WriteState<S>) -> Result<()> {
    while st.buf_pending > 0 {
        let n = match st.io.write(&st.buf[..st.buf_pending]).await {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => n,
            Err(err) => return Err(err.into()),
        };
        st.buf.copy_within(n..st.buf_pending, 0);
        st.buf_pending -= n;
    }
    Ok(())
}

/// Writes the payload remainder directly from `p`, which must span exactly
/// the pending bytes. Partial progress is reported as a short count; the
/// error behind it resurfaces on the next attempt.
async fn write_payload<S: AsyncRead + AsyncWrite + Unpin>(
    st: &mut WriteState<S>,
    p: &[u8],
) -> Result<usize> {
    let total = p.len();
    while st.payload_remaining > 0 {
        let at = total - st.payload_remaining;
        match st.io.write(&p[at..]).await {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => st.payload_remaining -= n,
            Err(err) => {
                let done = total - st.payload_remaining;
                if done > 0 {
                    return Ok(done);
                }
                return Err(err.into());
            }
        }
    }
    Ok(total)
}

/// Flushes a compact frame staged whole in the scratch. On failure only the
/// unwritten header bytes stay buffered; unsent payload moves to the payload
/// cursor so the resume path can take it from the caller again.
async fn flush_compact<S: AsyncRead + AsyncWrite + Unpin>(
    st: &mut WriteState<S>,
    payload_len: usize,
) -> Result<usize> {
    let header_len = st.buf_pending - payload_len;
    while st.buf_pending > 0 {
        let result = match st.io.write(&st.buf[..st.buf_pending]).await {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            other => other,
        };
        match result {
            Ok(n) => {
                st.buf.copy_within(n..st.buf_pending, 0);
                st.buf_pending -= n;
            }
            Err(err) => {
                let sent = header_len + payload_len - st.buf_pending;
                if sent >= header_len {
                    let payload_sent = sent - header_len;
                    st.buf_pending = 0;
                    st.payload_remaining = payload_len - payload_sent;
                    if payload_sent > 0 {
                        return Ok(payload_sent);
                    }
                } else {
                    st.buf_pending = header_len - sent;
                    st.payload_remaining = payload_len;
                }
                return Err(err.into());
            }
        }
    }
    st.payload_remaining = 0;
    Ok(payload_len)
}
