//! Generator payload: a fixed ASCII pattern tiled into one shared buffer.
//!
//! The buffer is built once per process, before any connection exists, and
//! handed to every generator session as a cheap [`Bytes`] clone.

use bytes::Bytes;

/// Base pattern. Alphanumerics without the visually ambiguous glyphs.
pub const PATTERN: &[u8] = b"23456789abcdefghijklmnopqrstuvwxyzABCEFGHJKLMNPQRSTUVWXYZ";

/// The chunk is doubled until the buffer is at least this long.
pub const MIN_PAYLOAD_LEN: usize = 1024 * 1024;

/// Final buffer length for a write chunk of `chunk` bytes: `chunk * 2^k` for
/// the smallest `k` reaching [`MIN_PAYLOAD_LEN`].
pub fn payload_len(chunk: usize) -> usize {
    let mut len = chunk.max(1);
    while len < MIN_PAYLOAD_LEN {
        len *= 2;
    }
    len
}

/// Build the payload for a write chunk of `chunk` bytes.
///
/// Equivalent to repeating [`PATTERN`] and truncating it to `chunk` bytes,
/// then doubling that block until it reaches [`MIN_PAYLOAD_LEN`], but
/// allocated exactly once.
pub fn build(chunk: usize) -> Bytes {
    let chunk = chunk.max(1);
    let len = payload_len(chunk);
    let buf: Vec<u8> = (0..len)
        .map(|i| PATTERN[(i % chunk) % PATTERN.len()])
        .collect();
    Bytes::from(buf)
}
