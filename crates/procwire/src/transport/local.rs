use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;

use super::{pipe_path, take_from, ExitInfo, Observables, StateCell, Transport, TransportState};

/// Connects to a named pipe (Windows) or local domain socket (elsewhere).
/// Used for the optional high-throughput data channel.
pub struct LocalTransport {
    path: String,
    state: Arc<StateCell>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    data_tx: mpsc::UnboundedSender<Bytes>,
    error_tx: mpsc::UnboundedSender<TransportError>,
    close_tx: Mutex<Option<oneshot::Sender<ExitInfo>>>,
    observables: Observables,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTransport {
    pub fn new(path: impl Into<String>) -> Self {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        Self {
            path: path.into(),
            state: Arc::new(StateCell::new(TransportState::Disconnected)),
            write_tx: Mutex::new(None),
            data_tx,
            error_tx,
            close_tx: Mutex::new(Some(close_tx)),
            observables: Observables::new(data_rx, error_rx, close_rx),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wraps an already-accepted connection (server side) in the same
    /// transport machinery used by the client side.
    fn from_parts(
        path: String,
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let transport = Self::new(path);
        transport.spawn_io(reader, writer);
        transport.state.set(TransportState::Connected);
        transport
    }

    fn spawn_io(
        &self,
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        *self.write_tx.lock().expect("write_tx mutex poisoned") = Some(write_tx);

        let close_tx = self.close_tx.lock().expect("close_tx mutex poisoned").take();
        let state = self.state.clone();
        let data_tx = self.data_tx.clone();
        let error_tx = self.error_tx.clone();
        let error_tx_writer = self.error_tx.clone();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(writer_task(writer, write_rx, error_tx_writer)));
        tasks.push(tokio::spawn(reader_task(
            reader, data_tx, error_tx, close_tx, state,
        )));
        *self.tasks.lock().expect("tasks mutex poisoned") = tasks;
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.state.set(TransportState::Connecting);
        match connect_endpoint(&self.path).await {
            Ok((reader, writer)) => {
                self.spawn_io(reader, writer);
                self.state.set(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state.set(TransportState::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.state.get() == TransportState::Closed {
            return Ok(());
        }
        self.state.set(TransportState::Closing);
        self.write_tx.lock().expect("write_tx mutex poisoned").take();
        for task in self.tasks.lock().expect("tasks mutex poisoned").drain(..) {
            task.abort();
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

async fn writer_task(
    mut writer: impl tokio::io::AsyncWrite + Unpin,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    error_tx: mpsc::UnboundedSender<TransportError>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            let _ = error_tx.send(TransportError::Io(e));
            break;
        }
        if let Err(e) = writer.flush().await {
            let _ = error_tx.send(TransportError::Io(e));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_task(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    data_tx: mpsc::UnboundedSender<Bytes>,
    error_tx: mpsc::UnboundedSender<TransportError>,
    close_tx: Option<oneshot::Sender<ExitInfo>>,
    state: Arc<StateCell>,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        buf.resize(64 * 1024, 0);
        match reader.read(&mut buf).await {
            Ok(0) => {
                state.set(TransportState::Closed);
                if let Some(tx) = close_tx {
                    let _ = tx.send((None, None));
                }
                break;
            }
            Ok(n) => {
                if data_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) => {
                state.set(TransportState::Error);
                let _ = error_tx.send(TransportError::Io(e));
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn connect_endpoint(
    path: &str,
) -> Result<
    (
        tokio::net::unix::OwnedReadHalf,
        tokio::net::unix::OwnedWriteHalf,
    ),
    TransportError,
> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(stream.into_split())
}

#[cfg(windows)]
async fn connect_endpoint(
    path: &str,
) -> Result<
    (
        tokio::io::ReadHalf<tokio::net::windows::named_pipe::NamedPipeClient>,
        tokio::io::WriteHalf<tokio::net::windows::named_pipe::NamedPipeClient>,
    ),
    TransportError,
> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(tokio::io::split(client))
}

/// Server side: accepts connections on a local endpoint and yields a
/// `LocalTransport` per connection.
pub struct LocalListener {
    path: String,
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(windows)]
    inner: Mutex<Option<tokio::net::windows::named_pipe::NamedPipeServer>>,
}

impl LocalListener {
    #[cfg(unix)]
    pub async fn bind(path: impl Into<String>) -> Result<Self, TransportError> {
        let path = path.into();
        let _ = pipe_path::cleanup(&path);
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { path, inner })
    }

    #[cfg(windows)]
    pub async fn bind(path: impl Into<String>) -> Result<Self, TransportError> {
        let path = path.into();
        let server = tokio::net::windows::named_pipe::ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Some(server)),
        })
    }

    #[cfg(unix)]
    pub async fn accept(&self) -> Result<LocalTransport, TransportError> {
        let (stream, _addr) = self.inner.accept().await?;
        let (reader, writer) = stream.into_split();
        Ok(LocalTransport::from_parts(self.path.clone(), reader, writer))
    }

    #[cfg(windows)]
    pub async fn accept(&self) -> Result<LocalTransport, TransportError> {
        let server = self
            .inner
            .lock()
            .expect("listener mutex poisoned")
            .take()
            .ok_or(TransportError::NotConnected)?;
        server.connect().await?;
        let (reader, writer) = tokio::io::split(server);
        Ok(LocalTransport::from_parts(self.path.clone(), reader, writer))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn client_server_roundtrip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procwire-test.sock");
        let path_str = path.to_string_lossy().into_owned();

        let listener = LocalListener::bind(path_str.clone()).await.unwrap();
        let accept_fut = tokio::spawn(async move { listener.accept().await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = LocalTransport::new(path_str);
        client.connect().await.unwrap();

        let server = accept_fut.await.unwrap();

        client.write(Bytes::from_static(b"hello")).await.unwrap();

        let mut data_rx = server.take_data_receiver().unwrap();
        let received = data_rx.recv().await.unwrap();
        assert_eq!(received, Bytes::from_static(b"hello"));
    }
}
