//! Message-oriented transceiving on top of the frame pipe.
//!
//! # Architecture Layer: Messaging
//!
//! This module adds the conveniences the low-level pipe deliberately leaves
//! out:
//!
//! - **Deadlines**: every operation takes a wire timeout bounding a single
//!   transport read or write; the receive operations additionally take an
//!   idle timeout bounding the wait for a message to start. A deadline hit
//!   closes the connection with status 1008 (policy violation).
//! - **Transparent control frames**: Pings are answered with a Pong built
//!   from the payload already staged in the read scratch; Pongs are
//!   discarded; Close frames latch the connection and surface as the typed
//!   closed error.
//! - **Retries**: transient transport errors back off exponentially from
//!   one microsecond to one second and continue on the remainder of the
//!   buffer.
//! - **UTF-8 validation**: Text messages are validated whole in buffer mode
//!   and incrementally in streaming mode, where up to three trailing bytes
//!   of a rune split across reads are withheld and prepended to the next
//!   read.
//!
//! Receive operations serialise on the read mutex for their whole duration,
//! and a [`MessageWriter`] holds the write mutex across its fragment
//! sequence, so messages from concurrent tasks never interleave.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::MutexGuard;
use tokio::time::timeout;

use crate::close::CloseCode;
use crate::conn::{Conn, ReadState, WriteState};
use crate::frame::{OpCode, FINAL_FLAG};
use crate::{Result, WebSocketError};

/// Retry pacing for transient transport errors.
const RETRY_FLOOR: Duration = Duration::from_micros(1);
const RETRY_CEIL: Duration = Duration::from_secs(1);

struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { delay: RETRY_FLOOR }
    }

    /// Sleeps the current delay, then doubles it up to the ceiling.
    async fn wait(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(RETRY_CEIL);
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Receives one complete message into `buf` and returns its opcode and
    /// size.
    ///
    /// Blocks up to `idle` for a message to start, then up to `wire` per
    /// transport read. Pings arriving before or inside the message are
    /// answered transparently; an incoming Close frame (or a deadline hit,
    /// which closes with status 1008) surfaces as the typed closed error.
    ///
    /// When the message outgrows `buf`, the connection is closed with
    /// status 1009 and [`WebSocketError::Overflow`] is returned; the
    /// message is lost. A Text message that is not valid UTF-8 returns
    /// [`WebSocketError::InvalidUtf8`] with the raw bytes left in `buf`;
    /// the connection stays open for the caller to decide.
    pub async fn receive(
        &self,
        buf: &mut [u8],
        wire: Duration,
        idle: Duration,
    ) -> Result<(OpCode, usize)> {
        let mut reader = self.reader.lock().await;
        let opcode = self.await_message(&mut reader, wire, idle).await?;

        let mut n = 0;
        loop {
            n += self
                .message_bytes(&mut reader, &mut buf[n..], wire)
                .await?;
            if self.read_mode().1 {
                break;
            }
            if n == buf.len() {
                let _ = self.send_close(CloseCode::TooBig, "message too big").await;
                return Err(WebSocketError::Overflow);
            }
        }

        if opcode == OpCode::Text && std::str::from_utf8(&buf[..n]).is_err() {
            return Err(WebSocketError::InvalidUtf8);
        }
        Ok((opcode, n))
    }

    /// Receives one message lazily: returns its opcode and a reader that
    /// yields the payload bytes as they arrive, ending with a zero count at
    /// the final frame.
    ///
    /// Control frames are handled exactly as in [`receive`](Conn::receive).
    /// Text payloads are validated incrementally across frame boundaries.
    /// The reader holds the connection's read half for its lifetime; drop
    /// it (or call [`MessageReader::discard`]) to move on, with the caveat
    /// that an unread remainder stays in the message cursor.
    pub async fn receive_stream(
        &self,
        wire: Duration,
        idle: Duration,
    ) -> Result<(OpCode, MessageReader<'_, S>)> {
        let mut reader = self.reader.lock().await;
        let opcode = self.await_message(&mut reader, wire, idle).await?;
        Ok((
            opcode,
            MessageReader {
                conn: self,
                st: reader,
                wire,
                text: opcode == OpCode::Text,
                carry: [0; 3],
                carry_len: 0,
                done: false,
            },
        ))
    }

    /// Sends `message` as one frame of the given type, retrying transient
    /// transport errors with backoff. `wire` bounds each transport write; a
    /// deadline hit closes the connection with status 1008.
    pub async fn send(&self, opcode: OpCode, message: &[u8], wire: Duration) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.write_mode(opcode, true);
        self.write_retry(&mut writer, message, wire).await
    }

    /// Starts a streamed message of the given type. Every
    /// [`MessageWriter::write`] emits one fragment; [`MessageWriter::finish`]
    /// concludes the message.
    ///
    /// The returned writer owns the connection's write half until dropped,
    /// so no other sender can interleave the fragment sequence. Control
    /// frames from other tasks (a `send` with a control opcode) queue up on
    /// the write mutex and go out after the stream.
    pub async fn send_stream(&self, opcode: OpCode, wire: Duration) -> MessageWriter<'_, S> {
        let writer = self.writer.lock().await;
        self.write_mode(opcode, false);
        MessageWriter {
            conn: self,
            st: writer,
            wire,
            wrote: false,
        }
    }

    /// Parses frames until a data message starts, answering control frames
    /// along the way. `idle` bounds each wait for a frame to arrive.
    async fn await_message(
        &self,
        st: &mut ReadState<S>,
        wire: Duration,
        idle: Duration,
    ) -> Result<OpCode> {
        let mut backoff = Backoff::new();
        loop {
            if self.read_remaining.load(Ordering::Acquire) == 0 {
                match timeout(idle, self.next_frame(st)).await {
                    Err(_) => {
                        return Err(self.send_close(CloseCode::Policy, "idle timeout").await)
                    }
                    Ok(Err(err)) if err.is_transient() => {
                        backoff.wait().await;
                        continue;
                    }
                    Ok(Err(err)) => return Err(err),
                    Ok(Ok(())) => {}
                }
            }

            let (opcode, _) = self.read_mode();
            if opcode.is_control() {
                self.got_ctrl(st, wire).await?;
                continue;
            }
            return Ok(opcode);
        }
    }

    /// Reads payload bytes of the current message into `buf`, crossing
    /// fragment boundaries and answering interleaved control frames. Zero
    /// means the message concluded (`buf` must not be empty).
    async fn message_bytes(
        &self,
        st: &mut ReadState<S>,
        buf: &mut [u8],
        wire: Duration,
    ) -> Result<usize> {
        let mut backoff = Backoff::new();
        loop {
            if self.read_remaining.load(Ordering::Acquire) == 0 {
                if self.read_mode().1 {
                    return Ok(0);
                }

                // next fragment, or an interleaved control frame
                let head_before = self.read_head.load(Ordering::Acquire);
                match timeout(wire, self.next_frame(st)).await {
                    Err(_) => {
                        return Err(self.send_close(CloseCode::Policy, "read timeout").await)
                    }
                    Ok(Err(err)) if err.is_transient() => {
                        backoff.wait().await;
                        continue;
                    }
                    Ok(Err(err)) => return Err(err),
                    Ok(Ok(())) => {}
                }

                let (opcode, _) = self.read_mode();
                if opcode.is_control() {
                    self.got_ctrl(st, wire).await?;
                    // the data message stays current for the caller
                    self.read_head.store(head_before, Ordering::Release);
                    continue;
                }
            }

            match timeout(wire, self.read_payload(st, buf)).await {
                Err(_) => return Err(self.send_close(CloseCode::Policy, "read timeout").await),
                Ok(Err(err)) if err.is_transient() => backoff.wait().await,
                Ok(Err(err)) => return Err(err),
                Ok(Ok(n)) => return Ok(n),
            }
        }
    }

    /// Reacts to a staged control frame: Pings are answered with a Pong
    /// reusing the unmasked payload in the read scratch, everything else is
    /// discarded. (Close frames never get here; the header parser consumes
    /// them.)
    async fn got_ctrl(&self, st: &mut ReadState<S>, wire: Duration) -> Result<()> {
        let len = self.read_remaining.load(Ordering::Acquire) as usize;
        let (opcode, _) = self.read_mode();
        let start = st.consumed;
        st.consumed += len;
        self.read_remaining.store(0, Ordering::Release);

        if opcode == OpCode::Ping {
            log::trace!("websocket: answering ping, {len} byte payload");

            // the two header bytes overwrite scratch just before the
            // staged payload, completing the Pong frame in place
            st.buf[start - 2] = FINAL_FLAG | OpCode::Pong as u8;
            st.buf[start - 1] = len as u8;

            let mut writer = self.writer.lock().await;
            if self.close_error().is_none()
                && writer.buf_pending == 0
                && writer.payload_remaining == 0
            {
                let frame = &st.buf[start - 2..start + len];
                let io = &mut writer.io;
                match timeout(wire, io.write_all(frame)).await {
                    Err(_) => {
                        return Err(self.send_close(CloseCode::Policy, "write timeout").await)
                    }
                    Ok(Err(err)) => return Err(err.into()),
                    Ok(Ok(())) => {}
                }
            }
        }
        Ok(())
    }

    /// Writes `p` as one frame, looping over short counts and backing off
    /// on transient errors. `wire` bounds each transport write.
    pub(crate) async fn write_retry(
        &self,
        st: &mut WriteState<S>,
        p: &[u8],
        wire: Duration,
    ) -> Result<()> {
        let mut backoff = Backoff::new();
        let mut at = 0;
        loop {
            match timeout(wire, self.write_locked(st, &p[at..])).await {
                Err(_) => return Err(self.send_close(CloseCode::Policy, "write timeout").await),
                Ok(Ok(n)) => {
                    at += n;
                    if at == p.len() {
                        return Ok(());
                    }
                }
                Ok(Err(err)) if err.is_transient() => backoff.wait().await,
                Ok(Err(err)) => return Err(err),
            }
        }
    }
}

/// Streaming access to one incoming message, returned by
/// [`Conn::receive_stream`].
///
/// Payload bytes arrive through [`read`](MessageReader::read) until a zero
/// count marks the end of the message. For Text messages the bytes are
/// UTF-8 validated as they pass: a rune split across reads is withheld
/// until completed, so every delivered prefix is valid on its own.
pub struct MessageReader<'a, S> {
    conn: &'a Conn<S>,
    st: MutexGuard<'a, ReadState<S>>,
    wire: Duration,
    text: bool,
    /// Trailing bytes of a rune cut off mid-read, prepended to the next one.
    carry: [u8; 3],
    carry_len: usize,
    done: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageReader<'_, S> {
    /// Reads the next payload bytes into `buf`. Zero means the message
    /// concluded.
    ///
    /// For Text messages, `buf` should be at least four bytes; smaller
    /// buffers can fail to fit a withheld rune and report a zero count
    /// without ending the message. A validation error wins over an I/O
    /// error occurring on the same read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done {
            return Ok(0);
        }
        loop {
            let carried = self.carry_len;
            if buf.len() <= carried {
                // no room for progress past the withheld rune bytes
                return Ok(0);
            }
            buf[..carried].copy_from_slice(&self.carry[..carried]);

            let n = self
                .conn
                .message_bytes(&mut self.st, &mut buf[carried..], self.wire)
                .await?;
            if n == 0 {
                self.done = true;
                if carried > 0 {
                    // the message ended inside a rune
                    return Err(WebSocketError::InvalidUtf8);
                }
                return Ok(0);
            }

            let total = carried + n;
            if !self.text {
                return Ok(total);
            }

            match std::str::from_utf8(&buf[..total]) {
                Ok(_) => {
                    self.carry_len = 0;
                    return Ok(total);
                }
                Err(err) if err.error_len().is_some() => return Err(WebSocketError::InvalidUtf8),
                Err(err) => {
                    // incomplete trailing rune; withhold its bytes
                    let valid = err.valid_up_to();
                    let tail = total - valid;
                    self.carry[..tail].copy_from_slice(&buf[valid..total]);
                    self.carry_len = tail;
                    if valid > 0 {
                        return Ok(valid);
                    }
                    // nothing deliverable yet; read on to decide
                }
            }
        }
    }

    /// Drains the rest of the message, releasing the read half.
    pub async fn discard(mut self) -> Result<()> {
        let mut sink = [0u8; 512];
        while !self.done {
            let n = self
                .conn
                .message_bytes(&mut self.st, &mut sink, self.wire)
                .await?;
            if n == 0 {
                self.done = true;
            }
        }
        Ok(())
    }
}

/// Streamed transmission of one outgoing message, returned by
/// [`Conn::send_stream`].
///
/// Each [`write`](MessageWriter::write) emits one fragment (a Continuation
/// after the first). The writer keeps the connection's write half to
/// itself until dropped; call [`finish`](MessageWriter::finish) to conclude
/// the message; dropping without it leaves the message unterminated on the
/// wire.
pub struct MessageWriter<'a, S> {
    conn: &'a Conn<S>,
    st: MutexGuard<'a, WriteState<S>>,
    wire: Duration,
    wrote: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageWriter<'_, S> {
    /// Sends `p` as the next fragment. An empty `p` emits an empty
    /// fragment.
    pub async fn write(&mut self, p: &[u8]) -> Result<usize> {
        let MessageWriter { conn, st, wire, .. } = self;
        conn.write_retry(st, p, *wire).await?;
        self.wrote = true;
        Ok(p.len())
    }

    /// Concludes the message: an empty final Continuation goes out when at
    /// least one fragment was written, otherwise this is a no-op.
    pub async fn finish(mut self) -> Result<()> {
        if !self.wrote {
            return Ok(());
        }
        let head = self.conn.write_head.load(Ordering::Acquire) as u8;
        self.conn
            .write_head
            .store((head | FINAL_FLAG) as u32, Ordering::Release);

        let MessageWriter { conn, st, wire, .. } = &mut self;
        conn.write_retry(st, &[], *wire).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};

    const WIRE: Duration = Duration::from_secs(2);
    const IDLE: Duration = Duration::from_secs(2);
    const TEST_KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn conn_pair() -> (Conn<DuplexStream>, DuplexStream) {
        let (inner, test_end) = tokio::io::duplex(256 * 1024);
        (Conn::new(inner), test_end)
    }

    /// Builds a masked client-side frame for the connection to parse.
    fn masked_frame(head: u8, key: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![head];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() < 1 << 16 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&key);
        let start = frame.len();
        frame.extend_from_slice(payload);
        let mut pos = 0;
        mask::apply_keystream(&mut frame[start..], mask::key_word(key), &mut pos);
        frame
    }

    #[tokio::test]
    async fn test_receive_empty_text() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(b"\x81\x80\x12\x34\x56\x78")
            .await
            .expect("test end write");

        let mut buf = [0u8; 16];
        let (opcode, n) = conn.receive(&mut buf, WIRE, IDLE).await.expect("receive");
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_receive_small_binary() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(b"\x82\x81\x12\x34\x56\x78\x15")
            .await
            .expect("test end write");

        let mut buf = [0u8; 16];
        let (opcode, n) = conn.receive(&mut buf, WIRE, IDLE).await.expect("receive");
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(&buf[..n], b"\x07");
    }

    #[tokio::test]
    async fn test_receive_extended_length_text() {
        let (conn, mut test_end) = conn_pair();
        let message = vec![b'!'; 126];
        let frame = masked_frame(0x81, TEST_KEY, &message);
        assert_eq!(&frame[..8], b"\x81\xfe\x00\x7e\x12\x34\x56\x78");
        test_end.write_all(&frame).await.expect("test end write");

        let mut buf = [0u8; 256];
        let (opcode, n) = conn.receive(&mut buf, WIRE, IDLE).await.expect("receive");
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&buf[..n], &message[..]);
    }

    #[tokio::test]
    async fn test_receive_fragmented_with_ping_interruption() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(
                b"\x01\x85\x00\x00\x00\x00Hello\
                  \x89\x81\x00\x00\x00\x00.\
                  \x80\x86\x00\x00\x00\x00 World",
            )
            .await
            .expect("test end write");

        let mut buf = [0u8; 100];
        let (opcode, n) = conn.receive(&mut buf, WIRE, IDLE).await.expect("receive");
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&buf[..n], b"Hello World");

        // the Ping got its unsolicited answer
        let mut pong = [0u8; 3];
        test_end.read_exact(&mut pong).await.expect("test end read");
        assert_eq!(&pong, b"\x8a\x01.");
    }

    #[tokio::test]
    async fn test_receive_overflow_closes_too_big() {
        let (conn, mut test_end) = conn_pair();
        let message = vec![0x42u8; 200];
        test_end
            .write_all(&masked_frame(0x82, TEST_KEY, &message))
            .await
            .expect("test end write");

        let mut buf = [0u8; 100];
        let err = conn
            .receive(&mut buf, WIRE, IDLE)
            .await
            .expect_err("overflow");
        assert!(matches!(err, WebSocketError::Overflow));

        // the wire carries a 1009 close
        let mut close = [0u8; 4];
        test_end.read_exact(&mut close).await.expect("test end read");
        assert_eq!(&close[..2], &[0x88, 2 + 15]);
        assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1009);

        // and the latch holds for later operations
        let err = conn
            .send(OpCode::Text, b"late", WIRE)
            .await
            .expect_err("send after close");
        assert!(matches!(err, WebSocketError::Closed(CloseCode::TooBig)));
    }

    #[tokio::test]
    async fn test_receive_invalid_utf8_keeps_connection_open() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(b"\x81\x83\x00\x00\x00\x00\xff\xfe\xfd")
            .await
            .expect("test end write");

        let mut buf = [0u8; 16];
        let err = conn
            .receive(&mut buf, WIRE, IDLE)
            .await
            .expect_err("invalid utf8");
        assert!(matches!(err, WebSocketError::InvalidUtf8));
        assert!(conn.close_error().is_none(), "connection must stay open");

        // the connection still works both ways
        conn.send(OpCode::Text, b"ok", WIRE).await.expect("send");
        let mut frame = [0u8; 4];
        test_end.read_exact(&mut frame).await.expect("test end read");
        assert_eq!(&frame, b"\x81\x02ok");
    }

    #[tokio::test]
    async fn test_receive_close_frame_surfaces_latched_error() {
        let (conn, mut test_end) = conn_pair();
        let mut body = 1001u16.to_be_bytes().to_vec();
        body.extend_from_slice(b"moving on");
        test_end
            .write_all(&masked_frame(0x88, TEST_KEY, &body))
            .await
            .expect("test end write");

        let mut buf = [0u8; 16];
        let err = conn.receive(&mut buf, WIRE, IDLE).await.expect_err("close");
        assert!(matches!(err, WebSocketError::Closed(CloseCode::GoingAway)));
        assert_eq!(
            err.to_string(),
            "websocket: connection closed, status code 1001"
        );
    }

    #[tokio::test]
    async fn test_receive_stream_fragments() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(
                b"\x01\x85\x00\x00\x00\x00Hello\
                  \x89\x81\x00\x00\x00\x00.\
                  \x80\x86\x00\x00\x00\x00 World",
            )
            .await
            .expect("test end write");

        let (opcode, mut reader) = conn.receive_stream(WIRE, IDLE).await.expect("stream");
        assert_eq!(opcode, OpCode::Text);

        let mut message = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = reader.read(&mut buf).await.expect("stream read");
            if n == 0 {
                break;
            }
            message.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&message, b"Hello World");

        let mut pong = [0u8; 3];
        test_end.read_exact(&mut pong).await.expect("test end read");
        assert_eq!(&pong, b"\x8a\x01.");
    }

    #[tokio::test]
    async fn test_receive_stream_splits_rune_across_fragments() {
        let (conn, mut test_end) = conn_pair();
        // "世界" cut mid-rune: 世 = e4 b8 96, 界 = e7 95 8c
        let mut wire = Vec::new();
        wire.extend_from_slice(&masked_frame(0x01, TEST_KEY, &[0xe4, 0xb8]));
        wire.extend_from_slice(&masked_frame(0x80, TEST_KEY, &[0x96, 0xe7, 0x95, 0x8c]));
        test_end.write_all(&wire).await.expect("test end write");

        let (opcode, mut reader) = conn.receive_stream(WIRE, IDLE).await.expect("stream");
        assert_eq!(opcode, OpCode::Text);

        let mut message = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = reader.read(&mut buf).await.expect("stream read");
            if n == 0 {
                break;
            }
            // every delivered prefix stands on its own
            std::str::from_utf8(&buf[..n]).expect("valid chunk");
            message.extend_from_slice(&buf[..n]);
        }
        assert_eq!(String::from_utf8(message).expect("valid utf8"), "世界");
    }

    #[tokio::test]
    async fn test_receive_stream_rejects_invalid_utf8() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(&masked_frame(0x81, TEST_KEY, &[b'h', b'i', 0xff]))
            .await
            .expect("test end write");

        let (_, mut reader) = conn.receive_stream(WIRE, IDLE).await.expect("stream");
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.expect_err("invalid utf8");
        assert!(matches!(err, WebSocketError::InvalidUtf8));
    }

    #[tokio::test]
    async fn test_receive_stream_rejects_rune_cut_at_message_end() {
        let (conn, mut test_end) = conn_pair();
        test_end
            .write_all(&masked_frame(0x81, TEST_KEY, &[0xe4, 0xb8]))
            .await
            .expect("test end write");

        let (_, mut reader) = conn.receive_stream(WIRE, IDLE).await.expect("stream");
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.expect_err("cut rune");
        assert!(matches!(err, WebSocketError::InvalidUtf8));
    }

    #[tokio::test]
    async fn test_receive_stream_discard_moves_on() {
        let (conn, mut test_end) = conn_pair();
        let mut wire = Vec::new();
        wire.extend_from_slice(&masked_frame(0x82, TEST_KEY, &vec![0u8; 1000]));
        wire.extend_from_slice(&masked_frame(0x81, TEST_KEY, b"next"));
        test_end.write_all(&wire).await.expect("test end write");

        let (opcode, reader) = conn.receive_stream(WIRE, IDLE).await.expect("stream");
        assert_eq!(opcode, OpCode::Binary);
        reader.discard().await.expect("discard");

        let mut buf = [0u8; 16];
        let (opcode, n) = conn.receive(&mut buf, WIRE, IDLE).await.expect("receive");
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn test_send_whole_messages() {
        let (conn, mut test_end) = conn_pair();

        conn.send(OpCode::Text, b"hello", WIRE).await.expect("send");
        conn.send(OpCode::Ping, b"?", WIRE).await.expect("send ping");

        let mut got = [0u8; 7 + 3];
        test_end.read_exact(&mut got).await.expect("test end read");
        assert_eq!(&got, b"\x81\x05hello\x89\x01?");
    }

    #[tokio::test]
    async fn test_send_stream_fragments_and_finish() {
        let (conn, mut test_end) = conn_pair();

        let mut writer = conn.send_stream(OpCode::Text, WIRE).await;
        writer.write(b"Hel").await.expect("first fragment");
        writer.write(b"lo").await.expect("second fragment");
        writer.finish().await.expect("finish");

        let mut got = [0u8; 5 + 4 + 2];
        test_end.read_exact(&mut got).await.expect("test end read");
        assert_eq!(&got, b"\x01\x03Hel\x00\x02lo\x80\x00");
    }

    #[tokio::test]
    async fn test_send_stream_finish_without_fragments() {
        let (conn, mut test_end) = conn_pair();

        let writer = conn.send_stream(OpCode::Binary, WIRE).await;
        writer.finish().await.expect("finish");

        // nothing went out; a regular send follows cleanly
        conn.send(OpCode::Binary, b"\x07", WIRE).await.expect("send");
        let mut got = [0u8; 3];
        test_end.read_exact(&mut got).await.expect("test end read");
        assert_eq!(&got, b"\x82\x01\x07");
    }

    #[tokio::test]
    async fn test_send_waits_for_stream_to_finish() {
        let (conn, mut test_end) = conn_pair();
        let conn = Arc::new(conn);

        let mut writer = conn.send_stream(OpCode::Text, WIRE).await;
        writer.write(b"one").await.expect("fragment");

        // a competing sender queues on the write mutex
        let competing = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send(OpCode::Binary, b"\x07", WIRE).await })
        };
        tokio::task::yield_now().await;

        writer.write(b"two").await.expect("fragment");
        writer.finish().await.expect("finish");
        competing.await.expect("task").expect("competing send");

        let mut got = [0u8; 5 + 5 + 2 + 3];
        test_end.read_exact(&mut got).await.expect("test end read");
        assert_eq!(&got, b"\x01\x03one\x00\x03two\x80\x00\x82\x01\x07");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_with_policy() {
        let (conn, mut test_end) = conn_pair();

        let mut buf = [0u8; 16];
        let err = conn
            .receive(&mut buf, WIRE, Duration::from_secs(1))
            .await
            .expect_err("idle timeout");
        assert!(matches!(err, WebSocketError::Closed(CloseCode::Policy)));
        assert_eq!(
            err.to_string(),
            "websocket: connection closed, status code 1008"
        );

        // the peer is told before the write side shuts down
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.expect("test end read");
        let mut want = vec![0x88, 2 + 12, 0x03, 0xf0];
        want.extend_from_slice(b"idle timeout");
        assert_eq!(got, want);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wire_timeout_mid_message_closes_with_policy() {
        let (conn, mut test_end) = conn_pair();
        // announced five bytes, delivered three
        let frame = masked_frame(0x81, TEST_KEY, b"abcde");
        test_end
            .write_all(&frame[..frame.len() - 2])
            .await
            .expect("test end write");

        let mut buf = [0u8; 16];
        let err = conn
            .receive(&mut buf, Duration::from_secs(1), IDLE)
            .await
            .expect_err("wire timeout");
        assert!(matches!(err, WebSocketError::Closed(CloseCode::Policy)));
    }

    /// Transport that swallows writes without ever completing them.
    struct StuckStream;

    impl AsyncRead for StuckStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for StuckStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_closes_with_policy() {
        let conn = Conn::new(StuckStream);

        let err = conn
            .send(OpCode::Text, b"hello", Duration::from_secs(1))
            .await
            .expect_err("write timeout");
        assert!(matches!(err, WebSocketError::Closed(CloseCode::Policy)));
    }

    /// Transport erroring with `Interrupted` a fixed number of times before
    /// delegating to an inner duplex pipe.
    struct InterruptedStream {
        inner: DuplexStream,
        write_interrupts: usize,
    }

    impl AsyncRead for InterruptedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for InterruptedStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.write_interrupts > 0 {
                self.write_interrupts -= 1;
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::Interrupted)));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_send_retries_transient_errors() {
        let (inner, mut test_end) = tokio::io::duplex(4096);
        let conn = Conn::new(InterruptedStream {
            inner,
            write_interrupts: 3,
        });

        conn.send(OpCode::Text, b"persistent", WIRE)
            .await
            .expect("send despite interrupts");

        let mut got = [0u8; 12];
        test_end.read_exact(&mut got).await.expect("test end read");
        assert_eq!(&got, b"\x81\x0apersistent");
    }
}
