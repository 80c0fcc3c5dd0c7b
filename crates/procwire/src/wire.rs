//! Binary data-plane wire format (C2): an 11-byte fixed header followed by a
//! variable-length payload, used for high-throughput traffic on the data
//! channel. Two parser objects share the same byte-consumer contract: the
//! batch parser produces `Frame` records, the streaming parser drives a
//! handler without ever buffering a whole payload (Design Notes §9).

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::framing::ChunkList;

pub const HEADER_LEN: usize = 11;
pub const RESERVED_METHOD_ID: u16 = 0;
pub const ABORT_METHOD_ID: u16 = 0xFFFF;
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 1024 * 1024 * 1024; // 1 GiB
pub const ABSOLUTE_MAX_PAYLOAD_LEN: u32 = 2 * 1024 * 1024 * 1024 - 1; // ~2 GiB ceiling

bitflags! {
    /// Flags byte. Bits 6-7 are reserved and must be zero.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Flags: u8 {
        const DIRECTION_TO_PARENT = 0b0000_0001;
        const IS_RESPONSE         = 0b0000_0010;
        const IS_ERROR            = 0b0000_0100;
        const IS_STREAM           = 0b0000_1000;
        const STREAM_END          = 0b0001_0000;
        const IS_ACK              = 0b0010_0000;
    }
}

const RESERVED_FLAG_MASK: u8 = 0b1100_0000;

/// Decoded header. `decode_header` never fails on semantically invalid
/// values (methodId 0, reserved bits set, oversized length) — only on
/// truncated input. Semantic validity is `validate_header`'s job, matching
/// the decode-vs-validate split required by seed scenario 4.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameHeader {
    pub method_id: u16,
    pub flags: Flags,
    pub request_id: u32,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u16(self.method_id);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.request_id);
        buf.put_u32(self.payload_length);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::HeaderTruncated {
                needed: HEADER_LEN,
                have: bytes.len(),
            });
        }
        let method_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let flags = Flags::from_bits_truncate(bytes[2]);
        let request_id = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        let payload_length = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        Ok(Self {
            method_id,
            flags,
            request_id,
            payload_length,
        })
    }

    /// Raw flags byte, including any reserved bits the peer actually sent
    /// (used by `validate_header` since `Flags::from_bits_truncate` above
    /// already discarded them for the decoded representation).
    fn raw_flags_byte(bytes: &[u8]) -> u8 {
        bytes[2]
    }
}

/// methodId != 0, reserved flag bits zero, payloadLength <= max (P7).
pub fn validate_header(header: &FrameHeader, max_payload_len: u32) -> Result<(), WireError> {
    if header.method_id == RESERVED_METHOD_ID {
        return Err(WireError::ReservedMethodId);
    }
    if header.payload_length > max_payload_len {
        return Err(WireError::PayloadTooLarge {
            declared: header.payload_length,
            max: max_payload_len,
        });
    }
    Ok(())
}

/// Validates directly off the raw bytes, catching reserved-bit violations
/// that `FrameHeader::decode` silently truncates away.
pub fn validate_header_bytes(bytes: &[u8], max_payload_len: u32) -> Result<FrameHeader, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::HeaderTruncated {
            needed: HEADER_LEN,
            have: bytes.len(),
        });
    }
    let raw_flags = FrameHeader::raw_flags_byte(bytes);
    if raw_flags & RESERVED_FLAG_MASK != 0 {
        return Err(WireError::ReservedFlagBitsSet(raw_flags));
    }
    let header = FrameHeader::decode(bytes)?;
    validate_header(&header, max_payload_len)?;
    Ok(header)
}

/// A payload exposed both as a zero-copy list of chunk slices and, on
/// demand, as one concatenated view.
#[derive(Clone, Debug)]
pub struct Payload {
    chunks: Vec<Bytes>,
}

impl Payload {
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn concat(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let total: usize = self.chunks.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Payload,
}

/// Builds a single contiguous byte sequence (header + payload). Prefer
/// `encode_scatter` for large payloads to avoid the copy.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// A `{header, payload}` pair suitable for writev-style scatter writes, so a
/// large payload is never copied just to prepend a header.
pub fn encode_scatter(header: &FrameHeader, payload: Bytes) -> (Bytes, Bytes) {
    (Bytes::copy_from_slice(&header.encode()), payload)
}

#[derive(Clone, Copy)]
enum BatchState {
    WaitingForHeader,
    WaitingForPayload { header: FrameHeader },
}

/// Batch-mode parser (default): accumulates whole frames and returns them
/// from `push`.
pub struct BatchFrameParser {
    max_payload_len: u32,
    buffer: ChunkList,
    state: BatchState,
    poisoned: bool,
}

impl BatchFrameParser {
    pub fn new(max_payload_len: u32) -> Self {
        Self {
            max_payload_len,
            buffer: ChunkList::default(),
            state: BatchState::WaitingForHeader,
            poisoned: false,
        }
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<Vec<Frame>, WireError> {
        if self.poisoned {
            return Err(WireError::Poisoned);
        }
        self.buffer.push(chunk);

        let mut frames = Vec::new();
        loop {
            match self.state {
                BatchState::WaitingForHeader => {
                    if self.buffer.len() < HEADER_LEN {
                        break;
                    }
                    let header_bytes = self.buffer.copy_range(0, HEADER_LEN);
                    let header = match validate_header_bytes(&header_bytes, self.max_payload_len) {
                        Ok(h) => h,
                        Err(e) => {
                            self.poisoned = true;
                            return Err(e);
                        }
                    };
                    self.buffer.advance(HEADER_LEN);
                    self.state = BatchState::WaitingForPayload { header };
                }
                BatchState::WaitingForPayload { header } => {
                    let needed = header.payload_length as usize;
                    if self.buffer.len() < needed {
                        break;
                    }
                    let payload = Payload {
                        chunks: if needed == 0 {
                            vec![]
                        } else {
                            vec![self.buffer.copy_range(0, needed)]
                        },
                    };
                    self.buffer.advance(needed);
                    frames.push(Frame { header, payload });
                    self.state = BatchState::WaitingForHeader;
                }
            }
        }

        Ok(frames)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Handler driven by the streaming parser. Payload bytes are delivered as
/// they arrive; no full-payload buffering ever happens.
pub trait StreamingHandler {
    fn on_frame_start(&mut self, header: &FrameHeader);
    fn on_payload_chunk(&mut self, slice: &[u8], offset: usize, is_last: bool);
    fn on_frame_end(&mut self, header: &FrameHeader);
    fn on_error(&mut self, error: &WireError, partial_header: Option<&FrameHeader>);
}

/// Streaming-mode parser: drives a `StreamingHandler` without buffering an
/// entire payload. Mode switching between batch and streaming is only
/// allowed when no bytes are buffered (enforced by `FrameBuffer`, not here).
pub struct StreamingFrameParser {
    max_payload_len: u32,
    header_buffer: ChunkList,
    state: StreamState,
    poisoned: bool,
}

enum StreamState {
    WaitingForHeader,
    InPayload { header: FrameHeader, consumed: usize },
}

impl StreamingFrameParser {
    pub fn new(max_payload_len: u32) -> Self {
        Self {
            max_payload_len,
            header_buffer: ChunkList::default(),
            state: StreamState::WaitingForHeader,
            poisoned: false,
        }
    }

    pub fn push(&mut self, mut chunk: &[u8], handler: &mut dyn StreamingHandler) {
        if self.poisoned {
            return;
        }
        while !chunk.is_empty() {
            match &mut self.state {
                StreamState::WaitingForHeader => {
                    let still_need = HEADER_LEN - self.header_buffer.len();
                    let take = still_need.min(chunk.len());
                    self.header_buffer
                        .push(Bytes::copy_from_slice(&chunk[..take]));
                    chunk = &chunk[take..];

                    if self.header_buffer.len() < HEADER_LEN {
                        continue;
                    }

                    let header_bytes = self.header_buffer.copy_range(0, HEADER_LEN);
                    self.header_buffer.clear();
                    match validate_header_bytes(&header_bytes, self.max_payload_len) {
                        Ok(header) => {
                            handler.on_frame_start(&header);
                            if header.payload_length == 0 {
                                handler.on_frame_end(&header);
                                self.state = StreamState::WaitingForHeader;
                            } else {
                                self.state = StreamState::InPayload {
                                    header,
                                    consumed: 0,
                                };
                            }
                        }
                        Err(e) => {
                            self.poisoned = true;
                            handler.on_error(&e, None);
                            return;
                        }
                    }
                }
                StreamState::InPayload { header, consumed } => {
                    let remaining = header.payload_length as usize - *consumed;
                    let take = remaining.min(chunk.len());
                    let is_last = take == remaining;
                    if take > 0 || header.payload_length == 0 {
                        handler.on_payload_chunk(&chunk[..take], *consumed, is_last);
                    }
                    *consumed += take;
                    chunk = &chunk[take..];

                    if is_last {
                        let finished_header = *header;
                        handler.on_frame_end(&finished_header);
                        self.state = StreamState::WaitingForHeader;
                    }
                }
            }
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.header_buffer.is_empty() || matches!(self.state, StreamState::InPayload { .. })
    }
}

/// Dual-mode entry point: owns exactly one of the two parser objects at a
/// time and only permits switching while empty, per Design Notes §9.
pub enum FrameBuffer {
    Batch(BatchFrameParser),
    Streaming(StreamingFrameParser),
}

impl FrameBuffer {
    pub fn new_batch(max_payload_len: u32) -> Self {
        FrameBuffer::Batch(BatchFrameParser::new(max_payload_len))
    }

    pub fn new_streaming(max_payload_len: u32) -> Self {
        FrameBuffer::Streaming(StreamingFrameParser::new(max_payload_len))
    }

    pub fn has_buffered_data(&self) -> bool {
        match self {
            FrameBuffer::Batch(p) => p.has_buffered_data(),
            FrameBuffer::Streaming(p) => p.has_buffered_data(),
        }
    }

    pub fn switch_to_batch(&mut self, max_payload_len: u32) -> Result<(), WireError> {
        if self.has_buffered_data() {
            return Err(WireError::Poisoned);
        }
        *self = FrameBuffer::new_batch(max_payload_len);
        Ok(())
    }

    pub fn switch_to_streaming(&mut self, max_payload_len: u32) -> Result<(), WireError> {
        if self.has_buffered_data() {
            return Err(WireError::Poisoned);
        }
        *self = FrameBuffer::new_streaming(max_payload_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_for_valid_headers() {
        let header = FrameHeader {
            method_id: 7,
            flags: Flags::DIRECTION_TO_PARENT | Flags::IS_RESPONSE,
            request_id: 42,
            payload_length: 1024,
        };
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        validate_header(&decoded, DEFAULT_MAX_PAYLOAD_LEN).unwrap();
    }

    #[test]
    fn decode_succeeds_but_validate_rejects_method_zero() {
        let header = FrameHeader {
            method_id: 0,
            flags: Flags::empty(),
            request_id: 0,
            payload_length: 0,
        };
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.method_id, 0);
        assert!(matches!(
            validate_header(&decoded, DEFAULT_MAX_PAYLOAD_LEN),
            Err(WireError::ReservedMethodId)
        ));
    }

    #[test]
    fn reserved_flag_bits_rejected() {
        let mut bytes = FrameHeader {
            method_id: 1,
            flags: Flags::empty(),
            request_id: 0,
            payload_length: 0,
        }
        .encode();
        bytes[2] = 0b1000_0000;
        let err = validate_header_bytes(&bytes, DEFAULT_MAX_PAYLOAD_LEN).unwrap_err();
        assert!(matches!(err, WireError::ReservedFlagBitsSet(_)));
    }

    #[test]
    fn payload_over_max_is_rejected() {
        let header = FrameHeader {
            method_id: 1,
            flags: Flags::empty(),
            request_id: 0,
            payload_length: DEFAULT_MAX_PAYLOAD_LEN + 1,
        };
        assert!(matches!(
            validate_header(&header, DEFAULT_MAX_PAYLOAD_LEN),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn batch_parser_assembles_frame_split_across_pushes() {
        let mut parser = BatchFrameParser::new(DEFAULT_MAX_PAYLOAD_LEN);
        let header = FrameHeader {
            method_id: 3,
            flags: Flags::empty(),
            request_id: 99,
            payload_length: 5,
        };
        let full = encode_frame(&header, b"hello");

        assert!(parser.push(full.slice(0..8)).unwrap().is_empty());
        let frames = parser.push(full.slice(8..full.len())).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, header);
        assert_eq!(frames[0].payload.concat(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn batch_parser_poisons_on_malformed_header() {
        let mut parser = BatchFrameParser::new(DEFAULT_MAX_PAYLOAD_LEN);
        let bad_header = FrameHeader {
            method_id: 0,
            flags: Flags::empty(),
            request_id: 0,
            payload_length: 0,
        };
        let bytes = Bytes::copy_from_slice(&bad_header.encode());
        assert!(parser.push(bytes).is_err());
        assert!(parser.is_poisoned());
        assert!(parser.push(Bytes::new()).is_err());
    }

    struct RecordingHandler {
        starts: Vec<FrameHeader>,
        chunks: Vec<(Vec<u8>, usize, bool)>,
        ends: Vec<FrameHeader>,
        errors: usize,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                starts: vec![],
                chunks: vec![],
                ends: vec![],
                errors: 0,
            }
        }
    }

    impl StreamingHandler for RecordingHandler {
        fn on_frame_start(&mut self, header: &FrameHeader) {
            self.starts.push(*header);
        }
        fn on_payload_chunk(&mut self, slice: &[u8], offset: usize, is_last: bool) {
            self.chunks.push((slice.to_vec(), offset, is_last));
        }
        fn on_frame_end(&mut self, header: &FrameHeader) {
            self.ends.push(*header);
        }
        fn on_error(&mut self, _error: &WireError, _partial_header: Option<&FrameHeader>) {
            self.errors += 1;
        }
    }

    #[test]
    fn streaming_parser_delivers_chunks_without_buffering_whole_payload() {
        let header = FrameHeader {
            method_id: 9,
            flags: Flags::IS_STREAM,
            request_id: 1,
            payload_length: 6,
        };
        let full = encode_frame(&header, b"abcdef");

        let mut parser = StreamingFrameParser::new(DEFAULT_MAX_PAYLOAD_LEN);
        let mut handler = RecordingHandler::new();

        // Feed byte by byte to exercise the partial-header and
        // partial-payload paths.
        for byte in full.iter() {
            parser.push(std::slice::from_ref(byte), &mut handler);
        }

        assert_eq!(handler.starts, vec![header]);
        assert_eq!(handler.ends, vec![header]);
        let reassembled: Vec<u8> = handler.chunks.iter().flat_map(|(c, _, _)| c.clone()).collect();
        assert_eq!(reassembled, b"abcdef");
        assert!(handler.chunks.last().unwrap().2, "last chunk must be marked is_last");
    }

    #[test]
    fn streaming_parser_reports_error_on_malformed_header() {
        let bad_header = FrameHeader {
            method_id: 0xFFFF,
            flags: Flags::from_bits_truncate(0b1000_0000),
            request_id: 0,
            payload_length: 0,
        };
        let mut raw = bad_header.encode();
        raw[2] = 0b1000_0000;

        let mut parser = StreamingFrameParser::new(DEFAULT_MAX_PAYLOAD_LEN);
        let mut handler = RecordingHandler::new();
        parser.push(&raw, &mut handler);

        assert_eq!(handler.errors, 1);
        assert!(parser.is_poisoned());
    }

    #[test]
    fn frame_buffer_mode_switch_requires_empty_buffer() {
        let mut buffer = FrameBuffer::new_batch(DEFAULT_MAX_PAYLOAD_LEN);
        if let FrameBuffer::Batch(parser) = &mut buffer {
            let header = FrameHeader {
                method_id: 1,
                flags: Flags::empty(),
                request_id: 0,
                payload_length: 5,
            };
            parser.push(Bytes::copy_from_slice(&header.encode())).unwrap();
        }
        assert!(buffer.has_buffered_data());
        assert!(buffer.switch_to_streaming(DEFAULT_MAX_PAYLOAD_LEN).is_err());
    }
}
