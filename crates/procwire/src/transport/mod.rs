//! Raw byte conduits (C3): a bidirectional transport with an observable
//! lifecycle state machine, realized over a child process's standard
//! streams or a local domain socket / named pipe.

mod local;
pub mod pipe_path;
mod stdio;

pub use local::{LocalListener, LocalTransport};
pub use stdio::{StdioConfig, StdioTransport};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

/// `disconnected -> connecting -> connected -> closing -> closed`, or
/// `-> error` from any state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
    Error = 5,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransportState::Disconnected,
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Closing,
            4 => TransportState::Closed,
            _ => TransportState::Error,
        }
    }
}

/// Shared, lock-free state cell used by every concrete transport so the
/// lifecycle machine lives in one place.
#[derive(Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(initial: TransportState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub(crate) fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// `(exit_code, signal)` reported when a child-backed transport's peer
/// terminates.
pub type ExitInfo = (Option<i32>, Option<String>);

/// One-shot takeable receivers for the transport's three observable
/// streams. A fresh transport always has all three; the channel engine
/// takes them exactly once when it starts driving the transport.
#[derive(Default)]
pub(crate) struct Observables {
    pub(crate) data_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    pub(crate) error_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportError>>>,
    pub(crate) close_rx: Mutex<Option<oneshot::Receiver<ExitInfo>>>,
}

impl Observables {
    pub(crate) fn new(
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        error_rx: mpsc::UnboundedReceiver<TransportError>,
        close_rx: oneshot::Receiver<ExitInfo>,
    ) -> Self {
        Self {
            data_rx: Mutex::new(Some(data_rx)),
            error_rx: Mutex::new(Some(error_rx)),
            close_rx: Mutex::new(Some(close_rx)),
        }
    }
}

/// A bidirectional byte conduit. Created by the process manager or a
/// channel builder; lives for one connection; never shared across channels.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> TransportState;

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn write(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Take the data-arrival stream. Returns `None` if already taken.
    fn take_data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    /// Take the error stream. Returns `None` if already taken.
    fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportError>>;

    /// Take the one-shot close/exit notification. Returns `None` if already
    /// taken.
    fn take_close_receiver(&self) -> Option<oneshot::Receiver<ExitInfo>>;
}

pub(crate) fn take_from<T>(cell: &Mutex<Option<T>>) -> Option<T> {
    cell.lock().expect("observable mutex poisoned").take()
}
