//! Exponential-backoff reconnect loop plus a bounded outage queue (C7).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::channel::BoxFuture;
use crate::error::{ChannelError, ReconnectError};
use crate::transport::Transport;
use crate::value::Value;

#[derive(Clone, Copy, Debug)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Jitter fraction in `[0, 1]`; the actual delay is drawn uniformly from
    /// `[delay * (1 - jitter), delay * (1 + jitter)]`.
    pub jitter: f64,
    pub queue_requests: bool,
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.2,
            queue_requests: true,
            max_queue_size: 100,
            queue_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ReconnectEvent {
    Attempting { attempt: u32 },
    Success { attempt: u32, total_time: Duration },
    Failed { attempts: u32, last_error: String },
    RequestTimeout { method: String },
}

/// A unit of work captured while the channel is down. Returns the same
/// result shape a live `Channel::request` would.
pub type QueuedExecutor = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, ChannelError>> + Send + Sync>;

struct QueuedEntry {
    id: u64,
    method: String,
    executor: QueuedExecutor,
    responder: Mutex<Option<oneshot::Sender<Result<Value, ReconnectError>>>>,
}

struct State {
    is_reconnecting: AtomicBool,
    cancelled: AtomicBool,
    queue: Mutex<VecDeque<Arc<QueuedEntry>>>,
    next_entry_id: AtomicU64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ReconnectConfig,
    state: State,
    events: broadcast::Sender<ReconnectEvent>,
    cancel_notify: Notify,
}

/// Cheap to clone; every clone shares the same in-flight reconnect attempt
/// and queue.
#[derive(Clone)]
pub struct ReconnectManager(Arc<Inner>);

impl ReconnectManager {
    pub fn new(transport: Arc<dyn Transport>, config: ReconnectConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self(Arc::new(Inner {
            transport,
            config,
            state: State {
                is_reconnecting: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                next_entry_id: AtomicU64::new(0),
            },
            events,
            cancel_notify: Notify::new(),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.0.events.subscribe()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.0.state.is_reconnecting.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.0.state.queue.lock().expect("queue mutex poisoned").len()
    }

    /// Returns `false` without doing anything if disabled or already
    /// reconnecting, matching the host-driven `handleDisconnect` contract.
    pub async fn handle_disconnect(&self, cause: impl Into<String>) -> bool {
        if !self.0.config.enabled {
            return false;
        }
        if self.0.state.is_reconnecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.0.state.cancelled.store(false, Ordering::SeqCst);

        let started_at = Instant::now();
        let mut last_error = cause.into();
        let mut succeeded = false;
        let mut attempts_made = 0u32;

        for attempt in 1..=self.0.config.max_attempts {
            attempts_made = attempt;
            if self.0.state.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let delay = self.compute_delay(attempt);
            if !self.sleep_cancellable(delay).await {
                break;
            }

            let _ = self.0.events.send(ReconnectEvent::Attempting { attempt });
            match self.0.transport.connect().await {
                Ok(()) => {
                    let _ = self.0.events.send(ReconnectEvent::Success {
                        attempt,
                        total_time: started_at.elapsed(),
                    });
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    debug!("reconnect attempt {attempt} failed: {e}");
                    last_error = e.to_string();
                }
            }
        }

        if succeeded {
            self.drain_queue().await;
        } else {
            let cancelled = self.0.state.cancelled.load(Ordering::SeqCst);
            if !cancelled {
                let _ = self.0.events.send(ReconnectEvent::Failed {
                    attempts: attempts_made,
                    last_error: last_error.clone(),
                });
            }
            self.reject_queue(cancelled, &last_error, attempts_made);
        }

        self.0.state.is_reconnecting.store(false, Ordering::SeqCst);
        succeeded
    }

    /// Sets the interrupt flag checked at the start of every loop iteration
    /// and pre-empts a currently-awaiting delay.
    pub fn cancel(&self) {
        self.0.state.cancelled.store(true, Ordering::SeqCst);
        self.0.cancel_notify.notify_waiters();
    }

    /// Only meaningful while reconnecting; returns `None` otherwise. The
    /// returned receiver resolves once on success (with the executor's own
    /// result), on queue-full, on per-entry timeout, or on outage failure.
    pub fn queue_request(
        &self,
        method: impl Into<String>,
        executor: QueuedExecutor,
    ) -> Option<oneshot::Receiver<Result<Value, ReconnectError>>> {
        if !self.0.state.is_reconnecting.load(Ordering::SeqCst) || !self.0.config.queue_requests {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let method = method.into();
        let mut queue = self.0.state.queue.lock().expect("queue mutex poisoned");
        if queue.len() >= self.0.config.max_queue_size {
            let _ = tx.send(Err(ReconnectError::QueueFull {
                max: self.0.config.max_queue_size,
            }));
            return Some(rx);
        }

        let id = self.0.state.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(QueuedEntry {
            id,
            method: method.clone(),
            executor,
            responder: Mutex::new(Some(tx)),
        });
        queue.push_back(entry);
        drop(queue);

        let inner = self.0.clone();
        let timeout = self.0.config.queue_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut queue = inner.state.queue.lock().expect("queue mutex poisoned");
            if let Some(pos) = queue.iter().position(|e| e.id == id) {
                let entry = queue.remove(pos).expect("position just located");
                drop(queue);
                if let Some(tx) = entry.responder.lock().expect("responder mutex poisoned").take()
                {
                    let _ = tx.send(Err(ReconnectError::QueuedRequestTimeout));
                    let _ = inner.events.send(ReconnectEvent::RequestTimeout { method });
                }
            }
        });

        Some(rx)
    }

    fn compute_delay(&self, attempt: u32) -> Duration {
        let base =
            self.0.config.initial_delay.as_secs_f64() * self.0.config.multiplier.powi(attempt as i32 - 1);
        let clamped = base.clamp(0.0, self.0.config.max_delay.as_secs_f64());
        let jitter = self.0.config.jitter.clamp(0.0, 1.0);
        let low = clamped * (1.0 - jitter);
        let high = clamped * (1.0 + jitter);
        let secs = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            clamped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    async fn sleep_cancellable(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.0.cancel_notify.notified() => false,
        }
    }

    async fn drain_queue(&self) {
        let entries: Vec<Arc<QueuedEntry>> = {
            let mut queue = self.0.state.queue.lock().expect("queue mutex poisoned");
            queue.drain(..).collect()
        };
        for entry in entries {
            let responder = entry.responder.lock().expect("responder mutex poisoned").take();
            let Some(responder) = responder else {
                continue;
            };
            let result = (entry.executor)().await;
            let _ = responder.send(result.map_err(ReconnectError::from));
        }
    }

    fn reject_queue(&self, cancelled: bool, last_error: &str, attempts: u32) {
        let entries: Vec<Arc<QueuedEntry>> = {
            let mut queue = self.0.state.queue.lock().expect("queue mutex poisoned");
            queue.drain(..).collect()
        };
        for entry in entries {
            if let Some(tx) = entry.responder.lock().expect("responder mutex poisoned").take() {
                let err = if cancelled {
                    ReconnectError::Cancelled
                } else {
                    ReconnectError::ReconnectFailed {
                        attempts,
                        last_error: last_error.to_string(),
                    }
                };
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{ExitInfo, TransportState};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct FlakyTransport {
        attempts: AtomicU64,
        succeed_at: u64,
    }

    impl FlakyTransport {
        fn new(succeed_at: u64) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU64::new(0),
                succeed_at,
            })
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn state(&self) -> TransportState {
            TransportState::Connected
        }
        async fn connect(&self) -> Result<(), TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_at {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        }
        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn write(&self, _bytes: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        fn take_data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
            None
        }
        fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
            None
        }
        fn take_close_receiver(&self) -> Option<oneshot::Receiver<ExitInfo>> {
            None
        }
    }

    fn fast_config(max_attempts: u32, max_queue_size: usize) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            max_attempts,
            jitter: 0.0,
            queue_requests: true,
            max_queue_size,
            queue_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn succeeds_and_drains_queue_in_insertion_order() {
        let transport = FlakyTransport::new(3);
        let manager = ReconnectManager::new(transport, fast_config(10, 10));

        let order = Arc::new(Mutex::new(Vec::new()));
        let reconnect = tokio::spawn({
            let manager = manager.clone();
            async move { manager.handle_disconnect("disconnected").await }
        });

        // Give the loop a moment to flip into the reconnecting state before
        // queueing, mirroring a host that queues requests as they arrive
        // during an outage.
        tokio::time::sleep(Duration::from_millis(2)).await;

        let mut receivers = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let executor: QueuedExecutor = Arc::new(move || {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                    Ok(Value::from(i as i64))
                })
            });
            if let Some(rx) = manager.queue_request(format!("m{i}"), executor) {
                receivers.push(rx);
            }
        }

        assert!(reconnect.await.unwrap());
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn queue_full_rejects_immediately() {
        let transport = FlakyTransport::new(1000);
        let manager = ReconnectManager::new(transport, fast_config(1000, 1));

        let reconnect = tokio::spawn({
            let manager = manager.clone();
            async move { manager.handle_disconnect("disconnected").await }
        });
        tokio::time::sleep(Duration::from_millis(2)).await;

        let noop: QueuedExecutor = Arc::new(|| Box::pin(async { Ok(Value::Null) }));
        let first = manager.queue_request("a", noop.clone()).unwrap();
        let second = manager.queue_request("b", noop).unwrap();

        assert!(matches!(
            second.await.unwrap(),
            Err(ReconnectError::QueueFull { .. })
        ));

        manager.cancel();
        let _ = reconnect.await;
        let _ = first.await;
    }

    #[tokio::test]
    async fn cancel_rejects_pending_requests() {
        let transport = FlakyTransport::new(1000);
        let manager = ReconnectManager::new(transport, fast_config(1000, 10));

        let reconnect = tokio::spawn({
            let manager = manager.clone();
            async move { manager.handle_disconnect("disconnected").await }
        });
        tokio::time::sleep(Duration::from_millis(2)).await;

        let noop: QueuedExecutor = Arc::new(|| Box::pin(async { Ok(Value::Null) }));
        let rx = manager.queue_request("a", noop).unwrap();

        manager.cancel();
        assert!(!reconnect.await.unwrap());
        assert!(matches!(rx.await.unwrap(), Err(ReconnectError::Cancelled)));
    }

    #[tokio::test]
    async fn disabled_manager_never_starts_reconnecting() {
        let transport = FlakyTransport::new(1);
        let manager = ReconnectManager::new(
            transport,
            ReconnectConfig {
                enabled: false,
                ..fast_config(10, 10)
            },
        );
        assert!(!manager.handle_disconnect("disconnected").await);
        assert!(!manager.is_reconnecting());
    }
}
