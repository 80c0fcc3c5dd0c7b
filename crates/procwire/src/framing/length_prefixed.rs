use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FramingError;

use super::{ChunkList, Framer};

const HEADER_LEN: usize = 4;

#[derive(Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { len: usize },
}

/// Each frame is a 4-byte big-endian unsigned length followed by that many
/// bytes of payload.
pub struct LengthPrefixedFramer {
    max_message_size: usize,
    buffer: ChunkList,
    state: State,
}

impl Default for LengthPrefixedFramer {
    fn default() -> Self {
        Self::new(32 * 1024 * 1024)
    }
}

impl LengthPrefixedFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            buffer: ChunkList::default(),
            state: State::WaitingForHeader,
        }
    }
}

impl Framer for LengthPrefixedFramer {
    fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    fn decode(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, FramingError> {
        self.buffer.push(chunk);

        let mut frames = Vec::new();
        loop {
            match self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let header = self.buffer.copy_range(0, HEADER_LEN);
                    let len = u32::from_be_bytes(header.as_ref().try_into().unwrap()) as usize;
                    if len > self.max_message_size {
                        self.reset();
                        return Err(FramingError::LengthExceedsMax {
                            declared: len as u32,
                            max: self.max_message_size as u32,
                        });
                    }
                    self.buffer.advance(HEADER_LEN);
                    self.state = State::WaitingForPayload { len };
                }
                State::WaitingForPayload { len } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let payload = self.buffer.copy_range(0, len);
                    self.buffer.advance(len);
                    frames.push(payload);
                    self.state = State::WaitingForHeader;
                }
            }
        }

        Ok(frames)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}
