//! Byte-stream framers that extract message boundaries (C1).
//!
//! Both implementations accumulate chunks as a list of zero-copy slices
//! rather than concatenating on every `decode` call; a contiguous buffer is
//! only materialized when a frame actually spans more than one chunk.

mod length_prefixed;
mod newline;

pub use length_prefixed::LengthPrefixedFramer;
pub use newline::NewlineFramer;

use bytes::Bytes;

use crate::error::FramingError;

/// A stateful byte-stream framer.
///
/// Invariant (P1): for any partition of a stream into chunks, feeding the
/// chunks to `decode` in order yields exactly the same sequence of frames as
/// feeding the concatenation of those chunks at once.
pub trait Framer: Send {
    /// Wrap one payload into a framed byte sequence ready to write.
    fn encode(&self, payload: &[u8]) -> Bytes;

    /// Feed one chunk of newly arrived bytes, returning zero or more
    /// complete frame payloads extracted from the accumulated buffer.
    fn decode(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, FramingError>;

    /// Discard any buffered partial frame and return to the initial state.
    /// Called when a channel reconnects.
    fn reset(&mut self);

    /// Whether a partial frame is currently buffered.
    fn has_buffered_data(&self) -> bool;

    /// Total bytes currently buffered awaiting a complete frame.
    fn buffer_size(&self) -> usize;
}

/// Accumulates chunks as a list of slices with a running total, giving O(1)
/// `push` and a single linear pass to materialize a contiguous span only
/// when a frame actually needs one.
#[derive(Default)]
pub(crate) struct ChunkList {
    chunks: Vec<Bytes>,
    total_len: usize,
}

impl ChunkList {
    pub(crate) fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_len += chunk.len();
        self.chunks.push(chunk);
    }

    pub(crate) fn len(&self) -> usize {
        self.total_len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.total_len = 0;
    }

    /// Byte at absolute offset `index` within the accumulated stream.
    fn byte_at(&self, index: usize) -> u8 {
        let mut remaining = index;
        for chunk in &self.chunks {
            if remaining < chunk.len() {
                return chunk[remaining];
            }
            remaining -= chunk.len();
        }
        panic!("byte_at index out of range");
    }

    /// Find the first occurrence of `needle` at or after `from`, scanning
    /// across chunk boundaries without concatenating first.
    pub(crate) fn find_from(&self, from: usize, needle: u8) -> Option<usize> {
        if from >= self.total_len {
            return None;
        }
        let mut offset = 0usize;
        for chunk in &self.chunks {
            let chunk_end = offset + chunk.len();
            if chunk_end > from {
                let start_in_chunk = from.saturating_sub(offset);
                if let Some(pos) = memchr(needle, &chunk[start_in_chunk..]) {
                    return Some(offset + start_in_chunk + pos);
                }
            }
            offset = chunk_end;
        }
        None
    }

    /// Copy out `len` bytes starting at absolute offset `start` into one
    /// contiguous buffer. Only called when a frame spans multiple chunks;
    /// the common case (frame fully inside one chunk) is handled by the
    /// caller via `contiguous_slice`.
    pub(crate) fn copy_range(&self, start: usize, len: usize) -> Bytes {
        if let Some(slice) = self.contiguous_slice(start, len) {
            return slice;
        }
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(self.byte_at(start + i));
        }
        Bytes::from(out)
    }

    /// Fast path: if `[start, start+len)` lies entirely within one
    /// underlying chunk, return a zero-copy slice of it.
    fn contiguous_slice(&self, start: usize, len: usize) -> Option<Bytes> {
        let mut offset = 0usize;
        for chunk in &self.chunks {
            let chunk_end = offset + chunk.len();
            if start >= offset && start + len <= chunk_end {
                let local_start = start - offset;
                return Some(chunk.slice(local_start..local_start + len));
            }
            if chunk_end > start {
                return None;
            }
            offset = chunk_end;
        }
        None
    }

    /// Drop the first `count` bytes of the accumulated stream, keeping
    /// later chunks (and trimming the chunk that straddles the boundary)
    /// so partial frames never retain more of a chunk than needed.
    pub(crate) fn advance(&mut self, count: usize) {
        let mut remaining = count;
        while remaining > 0 {
            let Some(front) = self.chunks.first_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.total_len -= front.len();
                self.chunks.remove(0);
            } else {
                *front = front.slice(remaining..);
                self.total_len -= remaining;
                remaining = 0;
            }
        }
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod chunk_list_tests {
    use super::*;

    #[test]
    fn find_across_chunk_boundary() {
        let mut list = ChunkList::default();
        list.push(Bytes::from_static(b"hel"));
        list.push(Bytes::from_static(b"lo\n"));
        assert_eq!(list.find_from(0, b'\n'), Some(5));
    }

    #[test]
    fn advance_trims_straddling_chunk() {
        let mut list = ChunkList::default();
        list.push(Bytes::from_static(b"abc"));
        list.push(Bytes::from_static(b"def"));
        list.advance(4);
        assert_eq!(list.len(), 2);
        assert_eq!(list.copy_range(0, 2), Bytes::from_static(b"ef"));
    }
}
