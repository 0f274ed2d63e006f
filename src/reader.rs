//! Non-blocking frame parsing out of a bounded buffer.
//!
//! [`Reader`] is the pull-oriented alternative to the connection's cursor
//! interface: the caller owns the pacing, feeding input with
//! [`read_some`](Reader::read_some) and slicing complete frames out with
//! [`next_frame`](Reader::next_frame). Nothing ever blocks on frame
//! boundaries: when the buffer holds half a frame, `next_frame` reports
//! [`Underflow`](crate::WebSocketError::Underflow) and the caller decides
//! when to read more.
//!
//! Unlike the connection, the parser accepts masked and unmasked frames
//! alike and leaves protocol judgement (reserved bits, control-frame rules)
//! to the caller via the header accessors. Frames larger than the buffer
//! capacity can never complete and surface as
//! [`Overflow`](crate::WebSocketError::Overflow).

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::frame::{FINAL_FLAG, MASK_FLAG, OpCode, SIZE_BITS};
use crate::{mask, Result, WebSocketError};

/// Incremental WebSocket frame parser over a fixed-capacity buffer.
///
/// ```no_run
/// # async fn demo(conn: &mut tokio::net::TcpStream) -> wspipe::Result<()> {
/// use wspipe::{Reader, WebSocketError};
///
/// let mut reader = Reader::new(4096);
/// loop {
///     match reader.next_frame() {
///         Ok(payload) => {
///             let size = payload.len();
///             println!("{:?} frame, {size} bytes", reader.opcode());
///         }
///         Err(WebSocketError::Underflow) => reader.read_some(conn).await?,
///         Err(err) => return Err(err),
///     }
/// }
/// # }
/// ```
pub struct Reader {
    buf: BytesMut,
    capacity: usize,
    /// Index of the current frame.
    at: usize,
    /// First index after the current frame; zero means no frame was parsed
    /// yet.
    next: usize,
}

impl Reader {
    /// Creates a parser that can hold frames up to `capacity` bytes,
    /// header included.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            at: 0,
            next: 0,
        }
    }

    /// Size of the input remaining after the current frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.next
    }

    /// Whether the current frame is the last one of its message.
    /// Fragmented messages span their payload over zero or more non-final
    /// frames combined with the final one.
    ///
    /// Valid once [`next_frame`](Reader::next_frame) returned a payload.
    pub fn is_final(&self) -> bool {
        self.buf[self.at] & FINAL_FLAG != 0
    }

    /// First reserved bit of the current frame.
    pub fn reserved1(&self) -> bool {
        self.buf[self.at] & 0x40 != 0
    }

    /// Second reserved bit of the current frame.
    pub fn reserved2(&self) -> bool {
        self.buf[self.at] & 0x20 != 0
    }

    /// Third reserved bit of the current frame.
    pub fn reserved3(&self) -> bool {
        self.buf[self.at] & 0x10 != 0
    }

    /// Payload interpretation of the current frame. Fragmented messages
    /// carry their opcode only in the first frame of their sequence, with
    /// Continuation on all of the following ones.
    pub fn opcode(&self) -> OpCode {
        OpCode::from(self.buf[self.at])
    }

    /// Performs one read from `conn` into the buffer, compacting spent
    /// frames when space runs low. A transport end-of-file surfaces as an
    /// `UnexpectedEof` I/O error.
    pub async fn read_some<R: AsyncRead + Unpin>(&mut self, conn: &mut R) -> Result<()> {
        if self.at > 0 && self.capacity - self.buf.len() < 1024 {
            // move the pending input to the buffer start
            self.buf.advance(self.at);
            self.next -= self.at;
            self.at = 0;
        }

        let free = self.capacity - self.buf.len();
        if free > 0 {
            let n = conn.read_buf(&mut (&mut self.buf).limit(free)).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
        Ok(())
    }

    /// Moves past the current frame.
    fn pass_frame(&mut self) {
        if self.next < self.buf.len() {
            self.at = self.next;
        } else {
            self.buf.clear();
            self.at = 0;
            self.next = 0;
        }
    }

    /// Slices the payload of the following frame out of the buffer,
    /// unmasking it in place when the frame is masked. The bytes stop
    /// being valid at the next invocation; use [`opcode`](Reader::opcode)
    /// and [`is_final`](Reader::is_final) to decide how to act on each
    /// payload, and the reserved-bit accessors to judge extension use.
    ///
    /// # Errors
    /// - [`Underflow`](crate::WebSocketError::Underflow): the frame is
    ///   incomplete; feed more input with [`read_some`](Reader::read_some)
    ///   and retry.
    /// - [`Overflow`](crate::WebSocketError::Overflow): the frame can never
    ///   fit the buffer. The appropriate reaction is a close with status
    ///   1009.
    pub fn next_frame(&mut self) -> Result<&[u8]> {
        if self.next > 0 {
            self.pass_frame();
        }

        let i = self.at;
        let filled = self.buf.len();
        if i + 1 >= filled {
            return Err(WebSocketError::Underflow);
        }

        let size_head = self.buf[i + 1];
        let masked = size_head & MASK_FLAG != 0;
        let (extra, len) = match size_head & SIZE_BITS {
            126 => {
                if i + 4 > filled {
                    return Err(WebSocketError::Underflow);
                }
                (2, u16::from_be_bytes([self.buf[i + 2], self.buf[i + 3]]) as usize)
            }
            127 => {
                if i + 10 > filled {
                    return Err(WebSocketError::Underflow);
                }
                let len = u64::from_be_bytes(self.buf[i + 2..i + 10].try_into().expect("length"));
                // the announced size allows up to 8 PiB; anything beyond
                // the buffer can never complete
                if len > self.capacity as u64 {
                    return Err(WebSocketError::Overflow);
                }
                (8, len as usize)
            }
            size7 => (0, size7 as usize),
        };

        let mask_len = if masked { 4 } else { 0 };
        let offset = i + 2 + extra + mask_len;
        if 2 + extra + mask_len + len > self.capacity {
            return Err(WebSocketError::Overflow);
        }
        if offset > filled {
            return Err(WebSocketError::Underflow);
        }

        let end = offset + len;
        if end > filled {
            return Err(WebSocketError::Underflow);
        }
        // frame accepted; the cursor moves on the next call
        self.next = end;

        if masked {
            let key: [u8; 4] = self.buf[offset - 4..offset].try_into().expect("mask key");
            let mut pos = 0;
            mask::apply_keystream(&mut self.buf[offset..end], mask::key_word(key), &mut pos);
        }

        Ok(&self.buf[offset..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a frame, masked when a key is given.
    fn frame(head: u8, key: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
        let mask_flag = if key.is_some() { MASK_FLAG } else { 0 };
        let mut frame = vec![head];
        if payload.len() < 126 {
            frame.push(mask_flag | payload.len() as u8);
        } else if payload.len() < 1 << 16 {
            frame.push(mask_flag | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(mask_flag | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        match key {
            Some(key) => {
                frame.extend_from_slice(&key);
                let start = frame.len();
                frame.extend_from_slice(payload);
                let mut pos = 0;
                mask::apply_keystream(&mut frame[start..], mask::key_word(key), &mut pos);
            }
            None => frame.extend_from_slice(payload),
        }
        frame
    }

    #[tokio::test]
    async fn test_underflow_until_complete() {
        let wire = frame(0x81, Some([0x12, 0x34, 0x56, 0x78]), b"hello");
        let mut reader = Reader::new(256);

        // every prefix of the frame leaves the parser wanting
        for split in 1..wire.len() {
            let mut reader = Reader::new(256);
            let mut input = &wire[..split];
            reader.read_some(&mut input).await.expect("read some");
            assert!(
                matches!(reader.next_frame(), Err(WebSocketError::Underflow)),
                "split at {split}"
            );
        }

        let mut input = &wire[..];
        reader.read_some(&mut input).await.expect("read some");
        let payload = reader.next_frame().expect("complete frame");
        assert_eq!(payload, b"hello");
        assert_eq!(reader.opcode(), OpCode::Text);
        assert!(reader.is_final());
    }

    #[tokio::test]
    async fn test_unmasked_frames_pass_through() {
        let wire = frame(0x82, None, &[0xde, 0xad, 0xbe, 0xef]);
        let mut reader = Reader::new(64);

        let mut input = &wire[..];
        reader.read_some(&mut input).await.expect("read some");
        let payload = reader.next_frame().expect("frame");
        assert_eq!(payload, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(reader.opcode(), OpCode::Binary);
    }

    #[tokio::test]
    async fn test_several_frames_in_one_read() {
        let mut wire = frame(0x01, Some([1, 2, 3, 4]), b"Hel");
        wire.extend_from_slice(&frame(0x80, Some([5, 6, 7, 8]), b"lo"));
        let mut reader = Reader::new(256);

        let mut input = &wire[..];
        reader.read_some(&mut input).await.expect("read some");

        let payload = reader.next_frame().expect("first frame");
        assert_eq!(payload, b"Hel");
        assert_eq!(reader.opcode(), OpCode::Text);
        assert!(!reader.is_final());
        assert_eq!(reader.buffered(), 2 + 4 + 2);

        let payload = reader.next_frame().expect("second frame");
        assert_eq!(payload, b"lo");
        assert_eq!(reader.opcode(), OpCode::Continuation);
        assert!(reader.is_final());
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_overflows() {
        let wire = frame(0x82, None, &vec![0u8; 300]);
        let mut reader = Reader::new(64);

        let mut input = &wire[..];
        // fills to capacity; the frame can never complete
        reader.read_some(&mut input).await.expect("read some");
        assert!(matches!(
            reader.next_frame(),
            Err(WebSocketError::Overflow)
        ));
    }

    #[tokio::test]
    async fn test_reserved_bits_are_exposed() {
        let wire = frame(0xc1, None, b"deflated?");
        let mut reader = Reader::new(64);

        let mut input = &wire[..];
        reader.read_some(&mut input).await.expect("read some");
        let payload = reader.next_frame().expect("frame");
        assert_eq!(payload, b"deflated?");
        assert!(reader.reserved1());
        assert!(!reader.reserved2());
        assert!(!reader.reserved3());
    }

    #[tokio::test]
    async fn test_compaction_keeps_parsing() {
        // the buffer holds less than two frames, so pending input gets
        // shifted to the front over and over
        let mut reader = Reader::new(48);
        let key = [0xaa, 0xbb, 0xcc, 0xdd];

        let mut wire = Vec::new();
        for round in 0..32u8 {
            wire.extend_from_slice(&frame(0x82, Some(key), &vec![round; 20]));
        }

        let mut input = &wire[..];
        for round in 0..32u8 {
            loop {
                match reader.next_frame() {
                    Ok(payload) => {
                        assert_eq!(payload, &vec![round; 20][..], "round {round}");
                        break;
                    }
                    Err(WebSocketError::Underflow) => {
                        reader.read_some(&mut input).await.expect("read some");
                    }
                    Err(err) => panic!("round {round}: {err}"),
                }
            }
        }
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_error() {
        let mut reader = Reader::new(64);
        let mut input: &[u8] = &[];
        let err = reader.read_some(&mut input).await.expect_err("EOF");
        assert!(matches!(err, WebSocketError::Io(_)));
    }
}
