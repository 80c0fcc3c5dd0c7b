//! Process supervision (C9): spawns worker processes, wires up their
//! control (and optional data) channels, and restarts them on crash.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, warn};
#[cfg(unix)]
use tracing::info;

use crate::channel::{Channel, ChannelBuilder};
use crate::codec::JsonCodec;
use crate::error::ProcessError;
use crate::framing::{LengthPrefixedFramer, NewlineFramer};
use crate::protocol::JsonRpcProtocol;
use crate::transport::{pipe_path, LocalTransport, StdioConfig, StdioTransport};

const DEFAULT_NAMESPACE: &str = "procwire";

#[derive(Clone, Debug)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub backoff: Duration,
    /// `None` means the backoff grows unbounded (per spec: "maxBackoffMs or
    /// infinity").
    pub max_backoff: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            backoff: Duration::from_millis(500),
            max_backoff: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DataChannelOptions {
    pub enabled: bool,
    /// Caller-provided endpoint path; computed via the pipe-path utility
    /// from the manager's namespace and process id when absent.
    pub path: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SpawnOptions {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub startup_timeout: Duration,
    pub data_channel: DataChannelOptions,
    pub restart_policy: RestartPolicy,
    pub graceful_shutdown: Duration,
    pub default_timeout: Duration,
}

impl SpawnOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            startup_timeout: Duration::from_secs(10),
            data_channel: DataChannelOptions::default(),
            restart_policy: RestartPolicy::default(),
            graceful_shutdown: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_data_channel(mut self) -> Self {
        self.data_channel.enabled = true;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessStatus {
    Spawning,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Error,
}

#[derive(Clone, Debug)]
pub enum ProcessEvent {
    Spawn { id: String, pid: Option<u32> },
    Ready { id: String },
    Exit { id: String, code: Option<i32>, signal: Option<String> },
    Restart { id: String, attempt: u32, delay: Duration },
    Crash { id: String },
    Error { id: String, message: String },
}

struct ManagedEntry {
    id: String,
    control: Channel,
    data: Option<Channel>,
    pid: Mutex<Option<u32>>,
    options: SpawnOptions,
    restart_attempt: AtomicU32,
    manual_stop: AtomicBool,
    status: Mutex<ProcessStatus>,
}

struct Inner {
    namespace: String,
    entries: Mutex<HashMap<String, Arc<ManagedEntry>>>,
    /// Ids reserved by an in-flight `spawn()` that haven't landed in
    /// `entries` yet, so a concurrent `spawn()` with the same id can be
    /// rejected without holding the entries lock across an `.await`.
    reserved: Mutex<HashSet<String>>,
    events: broadcast::Sender<ProcessEvent>,
}

/// Cheap to clone; every clone shares the same process table.
#[derive(Clone)]
pub struct ProcessManager(Arc<Inner>);

/// Marks every still-registered entry as manually stopped and drops the
/// table, releasing this manager's references to each entry's control/data
/// `Channel`s (whose own `Drop` aborts their reader tasks). A watcher task
/// spawned by [`ProcessManager::watch_for_exit`] holds its own entry clone
/// and outlives this, per-process, until the child actually exits or is
/// terminated; this only releases what the manager itself still owns.
impl Drop for Inner {
    fn drop(&mut self) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        for entry in entries.values() {
            entry.manual_stop.store(true, Ordering::SeqCst);
        }
        entries.clear();
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self(Arc::new(Inner {
            namespace: namespace.into(),
            entries: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            events,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.0.events.subscribe()
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.entries.lock().expect("entries mutex poisoned").keys().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<ProcessStatus> {
        let entries = self.0.entries.lock().expect("entries mutex poisoned");
        entries.get(id).map(|e| *e.status.lock().expect("status mutex poisoned"))
    }

    pub fn control_channel(&self, id: &str) -> Option<Channel> {
        let entries = self.0.entries.lock().expect("entries mutex poisoned");
        entries.get(id).map(|e| e.control.clone())
    }

    pub fn data_channel(&self, id: &str) -> Option<Channel> {
        let entries = self.0.entries.lock().expect("entries mutex poisoned");
        entries.get(id).and_then(|e| e.data.clone())
    }

    /// Rejects if `id` is already registered. On any failure past that
    /// point, rolls back everything it built (channels, transport) and
    /// leaves no trace of `id` in the table.
    pub async fn spawn(&self, id: impl Into<String>, options: SpawnOptions) -> Result<(), ProcessError> {
        let id = id.into();
        {
            let entries = self.0.entries.lock().expect("entries mutex poisoned");
            let mut reserved = self.0.reserved.lock().expect("reserved mutex poisoned");
            if entries.contains_key(&id) || !reserved.insert(id.clone()) {
                return Err(ProcessError::DuplicateId(id));
            }
        }

        let result = self.build_entry(&id, options).await;
        self.0.reserved.lock().expect("reserved mutex poisoned").remove(&id);

        match result {
            Ok(entry) => {
                self.0.entries.lock().expect("entries mutex poisoned").insert(id.clone(), entry.clone());
                let _ = self.0.events.send(ProcessEvent::Spawn {
                    id: id.clone(),
                    pid: *entry.pid.lock().expect("pid mutex poisoned"),
                });
                *entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Running;
                let _ = self.0.events.send(ProcessEvent::Ready { id: id.clone() });
                self.watch_for_exit(entry);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn build_entry(&self, id: &str, options: SpawnOptions) -> Result<Arc<ManagedEntry>, ProcessError> {
        let data_path = if options.data_channel.enabled {
            Some(match &options.data_channel.path {
                Some(path) => path.clone(),
                None => pipe_path::for_module(&self.0.namespace, id, None)
                    .map_err(ProcessError::Transport)?,
            })
        } else {
            None
        };

        let mut env = options.env.clone();
        if let Some(path) = &data_path {
            // Handed to the child so it can dial the data channel back; not
            // part of the wire protocol itself, just how this manager tells
            // a worker where to find it.
            env.push((OsString::from("PROCWIRE_DATA_PATH"), OsString::from(path.clone())));
        }

        let control_transport = Arc::new(StdioTransport::new(StdioConfig {
            program: options.program.clone(),
            args: options.args.clone(),
            current_dir: options.current_dir.clone(),
            env,
            startup_timeout: options.startup_timeout,
        }));

        let control = ChannelBuilder::new(
            control_transport.clone(),
            Box::new(NewlineFramer::default()),
            Arc::new(JsonCodec),
            Arc::new(JsonRpcProtocol::default()),
        )
        .default_timeout(options.default_timeout)
        .build();

        if let Err(e) = control.start().await {
            return Err(ProcessError::Channel(e));
        }

        let data = match self.build_data_channel(data_path, &options).await {
            Ok(data) => data,
            Err(e) => {
                let _ = control.close().await;
                return Err(e);
            }
        };

        let pid = control_transport.pid();
        Ok(Arc::new(ManagedEntry {
            id: id.to_string(),
            control,
            data,
            pid: Mutex::new(pid),
            options,
            restart_attempt: AtomicU32::new(0),
            manual_stop: AtomicBool::new(false),
            status: Mutex::new(ProcessStatus::Spawning),
        }))
    }

    async fn build_data_channel(
        &self,
        data_path: Option<String>,
        options: &SpawnOptions,
    ) -> Result<Option<Channel>, ProcessError> {
        let Some(path) = data_path else {
            return Ok(None);
        };

        let transport = Arc::new(LocalTransport::new(path));
        let channel = ChannelBuilder::new(
            transport,
            Box::new(LengthPrefixedFramer::default()),
            Arc::new(JsonCodec),
            Arc::new(JsonRpcProtocol::default()),
        )
        .default_timeout(options.default_timeout)
        .build();

        channel.start().await.map_err(ProcessError::Channel)?;
        Ok(Some(channel))
    }

    /// Sets `manualStop`, disconnects both channels, and transitions to
    /// `stopped`. Falls back to a forced transport close if graceful
    /// disconnect fails (the transports themselves escalate to a kill; see
    /// `shutdown.rs` for the richer two-phase protocol used when a
    /// `ShutdownManager` is layered on top of this manager).
    pub async fn terminate(&self, id: &str) -> Result<(), ProcessError> {
        let entry = self
            .0
            .entries
            .lock()
            .expect("entries mutex poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownId(id.to_string()))?;

        entry.manual_stop.store(true, Ordering::SeqCst);
        *entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Stopping;

        if let Some(data) = &entry.data {
            if let Err(e) = data.close().await {
                warn!("data channel close failed for {id}: {e}");
            }
        }
        if let Err(e) = entry.control.close().await {
            warn!("control channel close failed for {id}, already disconnected: {e}");
        }

        *entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Stopped;
        self.0.entries.lock().expect("entries mutex poisoned").remove(id);
        Ok(())
    }

    /// All-settled: every entry is given a chance to terminate even if an
    /// earlier one fails.
    pub async fn terminate_all(&self) -> Vec<(String, Result<(), ProcessError>)> {
        let ids = self.ids();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.terminate(&id).await;
            results.push((id, result));
        }
        results
    }

    /// Spawns a task that watches the control channel's transport for
    /// closure and drives `handle_process_exit` once it happens.
    fn watch_for_exit(&self, entry: Arc<ManagedEntry>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while !entry.control.is_closed() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            let (code, signal) = entry.control.exit_info().unwrap_or((None, None));
            manager.handle_process_exit(entry, code, signal).await;
        });
    }

    async fn handle_process_exit(
        &self,
        entry: Arc<ManagedEntry>,
        code: Option<i32>,
        signal: Option<String>,
    ) {
        let id = entry.id.clone();
        let _ = self.0.events.send(ProcessEvent::Exit {
            id: id.clone(),
            code,
            signal: signal.clone(),
        });

        let manual_stop = entry.manual_stop.load(Ordering::SeqCst);
        let unclean = code != Some(0) || signal.is_some();
        let policy = &entry.options.restart_policy;
        let attempt = entry.restart_attempt.load(Ordering::SeqCst);
        let should_restart = !manual_stop && policy.enabled && attempt < policy.max_restarts && unclean;

        if should_restart {
            let next_attempt = attempt + 1;
            entry.restart_attempt.store(next_attempt, Ordering::SeqCst);
            let delay = backoff_delay(policy, attempt);
            *entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Crashed;
            let _ = self.0.events.send(ProcessEvent::Restart {
                id: id.clone(),
                attempt: next_attempt,
                delay,
            });

            tokio::time::sleep(delay).await;

            let options = entry.options.clone();
            match self.build_entry(&id, options).await {
                Ok(mut new_entry) => {
                    Arc::get_mut(&mut new_entry)
                        .expect("freshly built entry has no other owners yet")
                        .restart_attempt = AtomicU32::new(next_attempt);
                    self.0
                        .entries
                        .lock()
                        .expect("entries mutex poisoned")
                        .insert(id.clone(), new_entry.clone());
                    let _ = self.0.events.send(ProcessEvent::Spawn {
                        id: id.clone(),
                        pid: *new_entry.pid.lock().expect("pid mutex poisoned"),
                    });
                    *new_entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Running;
                    let _ = self.0.events.send(ProcessEvent::Ready { id: id.clone() });
                    self.watch_for_exit(new_entry);
                }
                Err(e) => {
                    error!("restart of {id} failed: {e}");
                    *entry.status.lock().expect("status mutex poisoned") = ProcessStatus::Error;
                    let _ = self.0.events.send(ProcessEvent::Error {
                        id: id.clone(),
                        message: e.to_string(),
                    });
                    let _ = self.0.events.send(ProcessEvent::Crash { id: id.clone() });
                    self.0.entries.lock().expect("entries mutex poisoned").remove(&id);
                }
            }
        } else {
            let final_status = if manual_stop || !unclean {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Crashed
            };
            *entry.status.lock().expect("status mutex poisoned") = final_status;
            self.0.entries.lock().expect("entries mutex poisoned").remove(&id);
            if final_status == ProcessStatus::Crashed {
                let _ = self.0.events.send(ProcessEvent::Crash { id });
            }
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    let scaled = policy.backoff.saturating_mul(multiplier);
    match policy.max_backoff {
        Some(max) => scaled.min(max),
        None => scaled,
    }
}

/// Installs `SIGINT`/`SIGTERM` handlers that call `terminate_all()` and
/// exit the host process. Returns a guard; dropping it (or calling
/// [`ShutdownSignalGuard::disarm`]) detaches the handlers.
#[cfg(unix)]
pub struct ShutdownSignalGuard {
    task: tokio::task::JoinHandle<()>,
}

#[cfg(unix)]
impl ShutdownSignalGuard {
    pub fn install(manager: ProcessManager) -> Result<Self, std::io::Error> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
            info!("termination signal received, shutting down all managed processes");
            let _ = manager.terminate_all().await;
            std::process::exit(0);
        });

        Ok(Self { task })
    }

    pub fn disarm(self) {
        self.task.abort();
    }
}

#[cfg(unix)]
impl Drop for ShutdownSignalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
