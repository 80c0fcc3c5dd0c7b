//! procwire is a modular inter-process communication runtime. It spawns and
//! supervises worker processes and drives them over a layered pipeline:
//!
//! - [`transport`] — raw, possibly-chunked byte conduits over a child
//!   process's standard streams or a local domain socket / named pipe.
//! - [`framing`] — extracts whole-message boundaries from a byte stream.
//! - [`wire`] — the binary frame header shared by the length-prefixed
//!   framer and data-channel streaming use cases.
//! - [`codec`] — serializes and deserializes a framed payload to/from
//!   [`value::Value`].
//! - [`protocol`] — classifies and constructs wire envelopes (JSON-RPC or
//!   a simpler request/response/notification scheme) on top of a codec's
//!   decoded values.
//! - [`channel`] — composes a transport, framer, codec, and protocol into
//!   one correlated request/response/notification interface.
//!
//! Three independent resilience layers sit on top of a channel:
//! [`heartbeat`] (liveness probing), [`reconnect`] (backoff plus a bounded
//! outage queue), and [`shutdown`] (two-phase graceful shutdown). Each
//! exposes a `handle_notification` "consumed or not" hook so a single
//! [`channel::Channel::on_notification`] dispatcher can fan out to all
//! three plus application notifications.
//!
//! [`process`] ties it all together: [`process::ProcessManager`] spawns
//! worker processes, wires up their control (and optional data) channel,
//! and restarts them on crash per a configurable backoff policy.

pub mod channel;
pub mod codec;
pub mod error;
pub mod framing;
pub mod heartbeat;
pub mod process;
pub mod protocol;
pub mod reconnect;
pub mod shutdown;
pub mod transport;
pub mod value;
pub mod wire;

pub use channel::{Channel, ChannelBuilder};
pub use error::ProcwireError;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager};
pub use process::{ProcessEvent, ProcessManager, ProcessStatus, SpawnOptions};
pub use reconnect::{ReconnectConfig, ReconnectEvent, ReconnectManager};
pub use shutdown::{ShutdownConfig, ShutdownEvent, ShutdownManager, ShutdownTarget};
pub use value::Value;
