use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;

use super::{take_from, ExitInfo, Observables, StateCell, Transport, TransportState};

#[derive(Clone, Debug)]
pub struct StdioConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub startup_timeout: Duration,
}

impl StdioConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            startup_timeout: Duration::from_secs(10),
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Spawns a child process and drives its standard streams. Reads raw bytes
/// from stdout (framing is the caller's job), writes raw bytes to stdin,
/// mirrors stderr into `tracing`.
pub struct StdioTransport {
    config: StdioConfig,
    state: Arc<StateCell>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    data_tx: mpsc::UnboundedSender<Bytes>,
    error_tx: mpsc::UnboundedSender<TransportError>,
    close_tx: Mutex<Option<oneshot::Sender<ExitInfo>>>,
    observables: Observables,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pid: Mutex<Option<u32>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        Self {
            config,
            state: Arc::new(StateCell::new(TransportState::Disconnected)),
            write_tx: Mutex::new(None),
            kill_tx: Mutex::new(None),
            data_tx,
            error_tx,
            close_tx: Mutex::new(Some(close_tx)),
            observables: Observables::new(data_rx, error_rx, close_rx),
            tasks: Mutex::new(Vec::new()),
            pid: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().expect("pid mutex poisoned")
    }

    async fn spawn_with_retry(&self) -> Result<Child, TransportError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut backoff = Duration::from_millis(2);
        for attempt in 0..5 {
            match command.spawn() {
                Ok(child) => return Ok(child),
                Err(source) => {
                    let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                        || source.raw_os_error() == Some(26);
                    if is_busy && attempt < 4 {
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                        continue;
                    }
                    return Err(TransportError::Spawn(source));
                }
            }
        }
        unreachable!("spawn loop always returns on the last attempt")
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.state.set(TransportState::Connecting);

        let mut child = match self.spawn_with_retry().await {
            Ok(child) => child,
            Err(e) => {
                self.state.set(TransportState::Error);
                return Err(e);
            }
        };

        *self.pid.lock().expect("pid mutex poisoned") = child.id();

        let stdout = child.stdout.take().ok_or(TransportError::StdoutUnavailable)?;
        let stdin = child.stdin.take().ok_or(TransportError::StdinUnavailable)?;
        let stderr = child.stderr.take();

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        *self.write_tx.lock().expect("write_tx mutex poisoned") = Some(write_tx);

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock().expect("kill_tx mutex poisoned") = Some(kill_tx);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_task(stdin, write_rx)));
        tasks.push(tokio::spawn(reader_task(
            stdout,
            self.data_tx.clone(),
            self.error_tx.clone(),
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        let close_tx = self.close_tx.lock().expect("close_tx mutex poisoned").take();
        tasks.push(tokio::spawn(exit_task(
            child,
            kill_rx,
            close_tx,
            self.state.clone(),
            self.error_tx.clone(),
        )));

        *self.tasks.lock().expect("tasks mutex poisoned") = tasks;
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.state.get() == TransportState::Closed {
            return Ok(());
        }
        self.state.set(TransportState::Closing);
        self.write_tx.lock().expect("write_tx mutex poisoned").take();
        if let Some(kill_tx) = self.kill_tx.lock().expect("kill_tx mutex poisoned").take() {
            let _ = kill_tx.send(());
        }
        self.state.set(TransportState::Closed);
        Ok(())
    }

    async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.state.get() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let sender = self
            .write_tx
            .lock()
            .expect("write_tx mutex poisoned")
            .clone();
        match sender {
            Some(tx) => tx.send(bytes).map_err(|_| TransportError::WriteAfterClose),
            None => Err(TransportError::NotConnected),
        }
    }

    fn take_data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        take_from(&self.observables.data_rx)
    }

    fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
        take_from(&self.observables.error_rx)
    }

    fn take_close_receiver(&self) -> Option<oneshot::Receiver<ExitInfo>> {
        take_from(&self.observables.close_rx)
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if stdin.write_all(&bytes).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn reader_task(
    mut stdout: ChildStdout,
    data_tx: mpsc::UnboundedSender<Bytes>,
    error_tx: mpsc::UnboundedSender<TransportError>,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        buf.resize(64 * 1024, 0);
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if data_tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = error_tx.send(TransportError::Io(e));
                break;
            }
        }
    }
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("child stderr: {line}");
    }
}

async fn exit_task(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    close_tx: Option<oneshot::Sender<ExitInfo>>,
    state: Arc<StateCell>,
    error_tx: mpsc::UnboundedSender<TransportError>,
) {
    tokio::select! {
        status = child.wait() => {
            finish(status, close_tx, &state, &error_tx);
        }
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill child during disconnect: {e}");
            }
            let status = child.wait().await;
            finish(status, close_tx, &state, &error_tx);
        }
    }
}

fn finish(
    status: std::io::Result<std::process::ExitStatus>,
    close_tx: Option<oneshot::Sender<ExitInfo>>,
    state: &StateCell,
    error_tx: &mpsc::UnboundedSender<TransportError>,
) {
    match status {
        Ok(status) => {
            state.set(TransportState::Closed);
            if let Some(tx) = close_tx {
                let code = status.code();
                let signal = exit_signal(status);
                let _ = tx.send((code, signal));
            }
        }
        Err(e) => {
            state.set(TransportState::Error);
            let _ = error_tx.send(TransportError::Io(e));
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| sig.to_string())
}

#[cfg(not(unix))]
fn exit_signal(_status: std::process::ExitStatus) -> Option<String> {
    None
}
