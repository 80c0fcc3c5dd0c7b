//! Ping/pong liveness probing (C6), layered over a [`Channel`](crate::channel::Channel)
//! as reserved `__heartbeat_ping__`/`__heartbeat_pong__` notifications.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::channel::Channel;
use crate::protocol::{NOTIFICATION_HEARTBEAT_PING, NOTIFICATION_HEARTBEAT_PONG};
use crate::value::Value;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_missed: u32,
    pub implicit_heartbeat: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_missed: 3,
            implicit_heartbeat: true,
        }
    }
}

#[derive(Clone, Debug)]
pub enum HeartbeatEvent {
    Pong {
        seq: u64,
        rtt: Duration,
        load: Option<Value>,
    },
    Missed {
        seq: u64,
        missed_count: u32,
    },
    Dead {
        missed_count: u32,
        last_pong_at: Option<Instant>,
    },
}

/// A snapshot of the manager's internal state, for `getState()`-style
/// introspection without racing the running loop.
#[derive(Clone, Debug)]
pub struct HeartbeatState {
    pub last_seq: u64,
    pub consecutive_missed: u32,
    pub last_pong_at: Option<Instant>,
    pub pending_ping_seq: Option<u64>,
}

struct PendingPing {
    seq: u64,
    sent_at: Instant,
    deadline: Instant,
}

struct State {
    seq: AtomicU64,
    pending: Mutex<Option<PendingPing>>,
    consecutive_missed: AtomicU64,
    last_pong_at: Mutex<Option<Instant>>,
    dead_fired: AtomicBool,
}

struct Inner {
    channel: Channel,
    config: HeartbeatConfig,
    state: State,
    events: broadcast::Sender<HeartbeatEvent>,
    task: Mutex<Option<(JoinHandle<()>, oneshot::Sender<()>)>>,
}

/// Cheap to clone; every clone shares the same running task and state.
#[derive(Clone)]
pub struct HeartbeatManager(Arc<Inner>);

impl HeartbeatManager {
    pub fn new(channel: Channel, config: HeartbeatConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self(Arc::new(Inner {
            channel,
            config,
            state: State {
                seq: AtomicU64::new(0),
                pending: Mutex::new(None),
                consecutive_missed: AtomicU64::new(0),
                last_pong_at: Mutex::new(None),
                dead_fired: AtomicBool::new(false),
            },
            events,
            task: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.0.events.subscribe()
    }

    pub fn state(&self) -> HeartbeatState {
        let pending = self.0.state.pending.lock().expect("pending mutex poisoned");
        HeartbeatState {
            last_seq: self.0.state.seq.load(Ordering::SeqCst),
            consecutive_missed: self.0.state.consecutive_missed.load(Ordering::SeqCst) as u32,
            last_pong_at: *self.0.state.last_pong_at.lock().expect("poisoned"),
            pending_ping_seq: pending.as_ref().map(|p| p.seq),
        }
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    pub async fn start(&self) {
        if !self.0.config.enabled {
            return;
        }
        if self.0.task.lock().expect("task mutex poisoned").is_some() {
            return;
        }

        self.0.state.seq.store(0, Ordering::SeqCst);
        self.0.state.consecutive_missed.store(0, Ordering::SeqCst);
        self.0.state.dead_fired.store(false, Ordering::SeqCst);
        *self.0.state.pending.lock().expect("poisoned") = None;

        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = self.0.clone();
        let handle = tokio::spawn(run(inner, stop_rx));
        *self.0.task.lock().expect("task mutex poisoned") = Some((handle, stop_tx));
    }

    /// Idempotent: a second `stop()` after `stop()` is a no-op. State is
    /// preserved so `state()` still reflects the last observed view.
    pub async fn stop(&self) {
        if let Some((handle, stop_tx)) = self.0.task.lock().expect("task mutex poisoned").take() {
            let _ = stop_tx.send(());
            handle.abort();
        }
    }

    /// Any observed inbound application traffic. When `implicit_heartbeat`
    /// is enabled this resets `consecutive_missed` the same way a real pong
    /// would.
    pub fn on_activity(&self) {
        if self.0.config.implicit_heartbeat {
            self.0.state.consecutive_missed.store(0, Ordering::SeqCst);
        }
    }

    /// Feeds one inbound notification to the manager. Returns `true` if it
    /// was a heartbeat pong and has been consumed; `false` means the caller
    /// should treat it as ordinary application traffic (and may still want
    /// to call [`on_activity`](Self::on_activity) for it).
    pub fn handle_notification(&self, method: &str, params: &Value) -> bool {
        if method != NOTIFICATION_HEARTBEAT_PONG {
            return false;
        }
        let seq = params
            .as_map()
            .and_then(|m| m.get("seq"))
            .and_then(Value::as_i64)
            .map(|n| n as u64);
        let load = params.as_map().and_then(|m| m.get("load")).cloned();
        self.on_pong(seq, load);
        true
    }

    fn on_pong(&self, seq: Option<u64>, load: Option<Value>) {
        let mut pending = self.0.state.pending.lock().expect("pending mutex poisoned");
        let Some(ping) = pending.as_ref() else {
            return;
        };
        if Some(ping.seq) != seq {
            // Mismatched or stale seq, or no pending ping: silently ignored.
            return;
        }
        let rtt = ping.sent_at.elapsed();
        let resolved_seq = ping.seq;
        *pending = None;
        drop(pending);

        *self.0.state.last_pong_at.lock().expect("poisoned") = Some(Instant::now());
        self.0.state.consecutive_missed.store(0, Ordering::SeqCst);
        self.0.state.dead_fired.store(false, Ordering::SeqCst);

        let _ = self.0.events.send(HeartbeatEvent::Pong {
            seq: resolved_seq,
            rtt,
            load,
        });
    }
}

/// With no ping pending there is nothing to time out; parking the timer far
/// in the future is simpler than making the `select!` branch conditional and
/// behaves identically (it will be reset long before it could ever fire).
const NO_DEADLINE_PARK: Duration = Duration::from_secs(60 * 60 * 24 * 365);

async fn run(inner: Arc<Inner>, mut stop_rx: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    send_ping(&inner).await;

    // A single persistent `Sleep`, re-armed via `reset()` on every deadline
    // change, so the timer driver keeps a live registration across polls
    // instead of losing its waker to a throwaway future each time (the same
    // pattern `tokio::time::Interval` itself uses internally).
    let timeout_sleep = tokio::time::sleep_until(current_deadline(&inner).unwrap_or_else(far_future));
    tokio::pin!(timeout_sleep);

    loop {
        let deadline = current_deadline(&inner).unwrap_or_else(far_future);
        timeout_sleep.as_mut().reset(deadline);

        tokio::select! {
            _ = ticker.tick() => {
                let has_pending = inner.state.pending.lock().expect("poisoned").is_some();
                if !has_pending {
                    send_ping(&inner).await;
                }
            }
            _ = &mut timeout_sleep => {
                handle_timeout(&inner).await;
            }
            _ = &mut stop_rx => break,
        }
    }
}

fn current_deadline(inner: &Arc<Inner>) -> Option<Instant> {
    inner
        .state
        .pending
        .lock()
        .expect("pending mutex poisoned")
        .as_ref()
        .map(|p| p.deadline)
}

fn far_future() -> Instant {
    Instant::now() + NO_DEADLINE_PARK
}

async fn send_ping(inner: &Arc<Inner>) {
    let seq = inner.state.seq.fetch_add(1, Ordering::SeqCst) + 1;
    let now = Instant::now();
    {
        *inner.state.pending.lock().expect("pending mutex poisoned") = Some(PendingPing {
            seq,
            sent_at: now,
            deadline: now + inner.config.timeout,
        });
    }

    let params = ping_params(seq);
    if let Err(e) = inner.channel.notify(NOTIFICATION_HEARTBEAT_PING, params).await {
        warn!("heartbeat ping send failed, treating as a missed beat: {e}");
        handle_timeout(inner).await;
    }
}

async fn handle_timeout(inner: &Arc<Inner>) {
    let ping = inner.state.pending.lock().expect("pending mutex poisoned").take();
    let Some(ping) = ping else {
        return;
    };

    let missed_count = inner.state.consecutive_missed.fetch_add(1, Ordering::SeqCst) as u32 + 1;
    let _ = inner.events.send(HeartbeatEvent::Missed {
        seq: ping.seq,
        missed_count,
    });

    if missed_count >= inner.config.max_missed
        && !inner.state.dead_fired.swap(true, Ordering::SeqCst)
    {
        let last_pong_at = *inner.state.last_pong_at.lock().expect("poisoned");
        let _ = inner.events.send(HeartbeatEvent::Dead {
            missed_count,
            last_pong_at,
        });
    }
}

fn ping_params(seq: u64) -> Value {
    let mut map = BTreeMap::new();
    map.insert("timestamp".to_string(), Value::from(now_millis()));
    map.insert("seq".to_string(), Value::from(seq as i64));
    Value::Map(map)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBuilder;
    use crate::codec::JsonCodec;
    use crate::error::TransportError;
    use crate::framing::NewlineFramer;
    use crate::protocol::JsonRpcProtocol;
    use crate::transport::{ExitInfo, Transport, TransportState};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct NullTransport {
        data_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
        error_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportError>>>,
        close_rx: Mutex<Option<oneshot::Receiver<ExitInfo>>>,
    }

    impl NullTransport {
        fn new() -> Arc<Self> {
            let (_data_tx, data_rx) = mpsc::unbounded_channel();
            let (_error_tx, error_rx) = mpsc::unbounded_channel();
            let (_close_tx, close_rx) = oneshot::channel();
            Arc::new(Self {
                data_rx: Mutex::new(Some(data_rx)),
                error_rx: Mutex::new(Some(error_rx)),
                close_rx: Mutex::new(Some(close_rx)),
            })
        }
    }

    #[async_trait]
    impl Transport for NullTransport {
        fn state(&self) -> TransportState {
            TransportState::Connected
        }
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn write(&self, _bytes: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        fn take_data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
            self.data_rx.lock().unwrap().take()
        }
        fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
            self.error_rx.lock().unwrap().take()
        }
        fn take_close_receiver(&self) -> Option<oneshot::Receiver<ExitInfo>> {
            self.close_rx.lock().unwrap().take()
        }
    }

    fn build_manager(config: HeartbeatConfig) -> HeartbeatManager {
        let channel = ChannelBuilder::new(
            NullTransport::new(),
            Box::new(NewlineFramer::default()),
            Arc::new(JsonCodec),
            Arc::new(JsonRpcProtocol::default()),
        )
        .build();
        HeartbeatManager::new(channel, config)
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pings_escalate_to_dead_after_max_missed() {
        let config = HeartbeatConfig {
            enabled: true,
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            max_missed: 3,
            implicit_heartbeat: true,
        };
        let manager = build_manager(config);
        let mut events = manager.subscribe();
        manager.start().await;

        let mut missed = 0;
        let mut saw_dead = false;
        for _ in 0..16 {
            tokio::time::advance(Duration::from_millis(25)).await;
            while let Ok(event) = events.try_recv() {
                match event {
                    HeartbeatEvent::Missed { .. } => missed += 1,
                    HeartbeatEvent::Dead { missed_count, .. } => {
                        assert_eq!(missed_count, 3);
                        saw_dead = true;
                    }
                    HeartbeatEvent::Pong { .. } => panic!("no pong was ever sent"),
                }
            }
            if saw_dead {
                break;
            }
        }
        assert!(missed >= 3);
        assert!(saw_dead);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn matching_pong_resets_missed_count() {
        let config = HeartbeatConfig {
            enabled: true,
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            max_missed: 5,
            implicit_heartbeat: true,
        };
        let manager = build_manager(config);
        let mut events = manager.subscribe();
        manager.start().await;

        // The first ping is sent synchronously inside `start()`'s spawn
        // before the loop's select; give the task a chance to run.
        tokio::task::yield_now().await;
        let seq = manager.state().pending_ping_seq.expect("a ping should be pending");

        let mut params = BTreeMap::new();
        params.insert("seq".to_string(), Value::from(seq as i64));
        assert!(manager.handle_notification(NOTIFICATION_HEARTBEAT_PONG, &Value::Map(params)));

        let event = events.recv().await.unwrap();
        assert!(matches!(event, HeartbeatEvent::Pong { .. }));
        assert_eq!(manager.state().consecutive_missed, 0);
        manager.stop().await;
    }

    #[test]
    fn on_activity_resets_missed_count_when_implicit_enabled() {
        let manager = build_manager(HeartbeatConfig {
            implicit_heartbeat: true,
            ..HeartbeatConfig::default()
        });
        manager
            .0
            .state
            .consecutive_missed
            .store(2, Ordering::SeqCst);
        manager.on_activity();
        assert_eq!(manager.state().consecutive_missed, 0);
    }
}
