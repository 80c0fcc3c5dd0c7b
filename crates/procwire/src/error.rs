use std::time::Duration;

use thiserror::Error;

/// Malformed or over-limit byte-stream framing (C1, C2).
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("buffered {buffered} bytes without a delimiter, exceeding max {max}")]
    BufferOverflow { buffered: usize, max: usize },
    #[error("declared length {declared} exceeds max message size {max}")]
    LengthExceedsMax { declared: u32, max: u32 },
    #[error("frame buffer is not empty; cannot switch parsing mode")]
    ModeSwitchWhileBuffered,
}

/// Binary data-plane header/frame errors (C2).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("methodId 0 is reserved and invalid")]
    ReservedMethodId,
    #[error("reserved flag bits are set: {0:#04x}")]
    ReservedFlagBitsSet(u8),
    #[error("payload length {declared} exceeds configured max {max}")]
    PayloadTooLarge { declared: u32, max: u32 },
    #[error("header truncated: need {needed} bytes, have {have}")]
    HeaderTruncated { needed: usize, have: usize },
    #[error("parser is in an unrecoverable state after a malformed header")]
    Poisoned,
}

/// Connection-level transport failures (C3).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("child stdin unavailable")]
    StdinUnavailable,
    #[error("child stdout unavailable")]
    StdoutUnavailable,
    #[error("write attempted after transport close")]
    WriteAfterClose,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("local endpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("endpoint path {path} exceeds the {limit}-byte platform limit")]
    PathTooLong { path: String, limit: usize },
    #[error("transport is not connected")]
    NotConnected,
}

/// Codec registry mutation failures (C10).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a codec named `{name}` is already registered")]
    DuplicateName { name: String },
    #[error("a codec for content type `{content_type}` is already registered (as `{existing}`)")]
    DuplicateContentType {
        content_type: String,
        existing: String,
    },
}

/// Envelope classification failures (C4).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message does not conform to the protocol envelope")]
    MalformedEnvelope,
    #[error("response carries neither result nor error")]
    MissingResultAndError,
    #[error("response carries both result and error")]
    AmbiguousResultAndError,
    #[error("request method must be a non-empty string")]
    InvalidMethod,
    #[error("failed to encode/decode envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Remote peer returned a well-formed error response.
#[derive(Debug, Error, Clone)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<crate::value::Value>,
}

/// Errors surfaced by the channel engine (C5).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel was closed")]
    Closed,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Reconnect loop and queued-request failures (C7).
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("reconnect queue is full (max {max})")]
    QueueFull { max: usize },
    #[error("queued request timed out waiting for reconnect to succeed")]
    QueuedRequestTimeout,
    #[error("reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectFailed { attempts: u32, last_error: String },
    #[error("reconnect was cancelled")]
    Cancelled,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Process lifecycle failures (C9).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process id `{0}` is already registered")]
    DuplicateId(String),
    #[error("no process registered under id `{0}`")]
    UnknownId(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("restart budget exhausted after {0} attempts")]
    RestartBudgetExhausted(u32),
}

/// Top-level aggregate error, mirroring the taxonomy of spec §7.
#[derive(Debug, Error)]
pub enum ProcwireError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}
