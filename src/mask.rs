//! Payload masking with a carried key offset.
//!
//! Incoming payloads arrive XOR-ed with a 4-byte key. Because a read may
//! stop anywhere inside a frame, the keystream position must survive between
//! calls: the connection stores the key duplicated into both halves of a
//! 64-bit word plus the byte offset reached so far, and this module applies
//! the stream eight bytes at a time from that offset.

/// Duplicates the little-endian key into both halves of a 64-bit word so the
/// hot loop can XOR eight payload bytes per step.
pub(crate) fn key_word(key: [u8; 4]) -> u64 {
    let word = u32::from_le_bytes(key) as u64;
    word << 32 | word
}

/// XORs the keystream over `buf`, starting `*offset` bytes into the key, and
/// advances the offset.
///
/// Only `*offset & 3` matters for the key position. Word steps cover eight
/// bytes at once, which is a multiple of the key period, so they leave the
/// offset untouched; the invariant callers rely on is that a run whose
/// length is a multiple of 8 does not move `*offset`.
pub(crate) fn apply_keystream(buf: &mut [u8], word: u64, offset: &mut u32) {
    if buf.len() < 8 {
        for byte in buf {
            *byte ^= (word >> ((*offset & 3) * 8)) as u8;
            *offset += 1;
        }
        return;
    }

    let rotated = word.rotate_right(8 * (*offset & 3));
    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let loaded: [u8; 8] = (&*chunk).try_into().expect("8-byte chunk");
        let flipped = u64::from_le_bytes(loaded) ^ rotated;
        chunk.copy_from_slice(&flipped.to_le_bytes());
    }
    for byte in chunks.into_remainder() {
        *byte ^= (word >> ((*offset & 3) * 8)) as u8;
        *offset += 1;
    }
}
