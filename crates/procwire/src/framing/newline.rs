use bytes::{Bytes, BytesMut};

use crate::error::FramingError;

use super::{ChunkList, Framer};

/// Frames end at a single configured delimiter byte (default `\n`).
pub struct NewlineFramer {
    delimiter: u8,
    max_buffer_size: usize,
    strip_delimiter: bool,
    buffer: ChunkList,
    /// Absolute offset up to which we've already scanned for a delimiter,
    /// so repeated `decode` calls don't re-scan bytes we know don't match.
    scanned_up_to: usize,
}

impl Default for NewlineFramer {
    fn default() -> Self {
        Self::new(b'\n', 8 * 1024 * 1024, true)
    }
}

impl NewlineFramer {
    pub fn new(delimiter: u8, max_buffer_size: usize, strip_delimiter: bool) -> Self {
        Self {
            delimiter,
            max_buffer_size,
            strip_delimiter,
            buffer: ChunkList::default(),
            scanned_up_to: 0,
        }
    }
}

impl Framer for NewlineFramer {
    fn encode(&self, payload: &[u8]) -> Bytes {
        if payload.last() == Some(&self.delimiter) {
            return Bytes::copy_from_slice(payload);
        }
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&[self.delimiter]);
        buf.freeze()
    }

    fn decode(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, FramingError> {
        self.buffer.push(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(delim_pos) = self.buffer.find_from(self.scanned_up_to, self.delimiter)
            else {
                self.scanned_up_to = self.buffer.len();
                break;
            };

            let frame_len = if self.strip_delimiter {
                delim_pos
            } else {
                delim_pos + 1
            };
            let frame = if frame_len == 0 {
                Bytes::new()
            } else {
                self.buffer.copy_range(0, frame_len)
            };
            frames.push(frame);

            self.buffer.advance(delim_pos + 1);
            self.scanned_up_to = 0;
        }

        if self.buffer.len() > self.max_buffer_size {
            let buffered = self.buffer.len();
            self.reset();
            return Err(FramingError::BufferOverflow {
                buffered,
                max: self.max_buffer_size,
            });
        }

        Ok(frames)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned_up_to = 0;
    }

    fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame_in_one_chunk() {
        let mut framer = NewlineFramer::default();
        let frames = framer.decode(Bytes::from_static(b"hello\n")).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert!(!framer.has_buffered_data());
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut framer = NewlineFramer::default();
        assert!(framer.decode(Bytes::from_static(b"hel")).unwrap().is_empty());
        let frames = framer.decode(Bytes::from_static(b"lo\n")).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn chunk_invariance_for_arbitrary_partition() {
        let payload = b"alpha\nbeta\ngamma\n".to_vec();
        let whole = {
            let mut framer = NewlineFramer::default();
            framer.decode(Bytes::from(payload.clone())).unwrap()
        };

        let splits: Vec<Vec<usize>> = vec![
            vec![3, 7, payload.len()],
            vec![1, 2, 3, 4, 5, 6, payload.len()],
            vec![payload.len()],
        ];

        for split in splits {
            let mut framer = NewlineFramer::default();
            let mut start = 0;
            let mut collected = Vec::new();
            for end in split {
                let chunk = Bytes::copy_from_slice(&payload[start..end]);
                collected.extend(framer.decode(chunk).unwrap());
                start = end;
            }
            assert_eq!(collected, whole);
        }
    }

    #[test]
    fn empty_frames_between_delimiters_are_valid() {
        let mut framer = NewlineFramer::default();
        let frames = framer.decode(Bytes::from_static(b"\n\n")).unwrap();
        assert_eq!(frames, vec![Bytes::new(), Bytes::new()]);
    }

    #[test]
    fn retains_delimiter_when_configured() {
        let mut framer = NewlineFramer::new(b'\n', 1024, false);
        let frames = framer.decode(Bytes::from_static(b"hi\n")).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hi\n")]);
    }

    #[test]
    fn overflow_raises_error_and_resets() {
        let mut framer = NewlineFramer::new(b'\n', 4, true);
        let err = framer.decode(Bytes::from_static(b"abcdefgh")).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow { .. }));
        assert!(!framer.has_buffered_data());
    }

    #[test]
    fn encode_does_not_double_delimiter() {
        let framer = NewlineFramer::default();
        assert_eq!(framer.encode(b"hi\n"), Bytes::from_static(b"hi\n"));
        assert_eq!(framer.encode(b"hi"), Bytes::from_static(b"hi\n"));
    }
}
