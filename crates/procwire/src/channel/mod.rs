//! The composed message channel (C5): transport + frame codec +
//! serialization codec + protocol, plus the pending-request table that
//! correlates outbound requests with inbound responses.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::{ChannelError, RemoteError, TransportError};
use crate::framing::Framer;
use crate::protocol::{
    error_codes, ParsedMessage, Protocol, RemoteErrorPayload, RequestId, ResponseOutcome,
};
use crate::transport::{ExitInfo, Transport};
use crate::value::Value;

/// Boxed, `'static` future, the shape every pluggable handler returns.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type RequestHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, RemoteErrorPayload>> + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct ChannelInner {
    transport: Arc<dyn Transport>,
    framer: Mutex<Box<dyn Framer>>,
    codec: Arc<dyn Codec>,
    protocol: Arc<dyn Protocol>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, ChannelError>>>>,
    default_timeout: Duration,
    request_handler: Mutex<Option<RequestHandler>>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    exit_info: Mutex<Option<ExitInfo>>,
}

/// A bidirectional message channel. Cheap to clone (an `Arc` handle); every
/// clone shares the same pending-request table and reader task.
#[derive(Clone)]
pub struct Channel(Arc<ChannelInner>);

/// Aborts the reader task once the last `Channel` handle referencing it goes
/// away, mirroring the teacher's `impl Drop for JsonRpcTransport` so a
/// dropped channel can never leak a background task or a pending-request
/// table full of oneshot senders nobody will ever resolve.
impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Ok(mut reader_task) = self.reader_task.lock() {
            if let Some(handle) = reader_task.take() {
                handle.abort();
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(ChannelError::Closed));
            }
        }
    }
}

/// Builds a [`Channel`] from its four independent role objects (spec §2's
/// "compose the channel from four independent role objects").
pub struct ChannelBuilder {
    transport: Arc<dyn Transport>,
    framer: Box<dyn Framer>,
    codec: Arc<dyn Codec>,
    protocol: Arc<dyn Protocol>,
    default_timeout: Duration,
}

impl ChannelBuilder {
    pub fn new(
        transport: Arc<dyn Transport>,
        framer: Box<dyn Framer>,
        codec: Arc<dyn Codec>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        Self {
            transport,
            framer,
            codec,
            protocol,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> Channel {
        Channel(Arc::new(ChannelInner {
            transport: self.transport,
            framer: Mutex::new(self.framer),
            codec: self.codec,
            protocol: self.protocol,
            pending: Mutex::new(HashMap::new()),
            default_timeout: self.default_timeout,
            request_handler: Mutex::new(None),
            notification_handler: Mutex::new(None),
            reader_task: Mutex::new(None),
            closed: AtomicBool::new(true),
            exit_info: Mutex::new(None),
        }))
    }
}

impl Channel {
    /// Connects the transport, resets the framer, and spawns the dispatch
    /// loop. Idempotent: a second call on an already-started channel is a
    /// no-op.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.0.reader_task.lock().expect("reader mutex poisoned").is_some() {
            return Ok(());
        }

        self.0.transport.connect().await?;
        self.0
            .framer
            .lock()
            .expect("framer mutex poisoned")
            .reset();

        let data_rx = self
            .0
            .transport
            .take_data_receiver()
            .ok_or(ChannelError::Closed)?;
        let error_rx = self
            .0
            .transport
            .take_error_receiver()
            .ok_or(ChannelError::Closed)?;
        let close_rx = self
            .0
            .transport
            .take_close_receiver()
            .ok_or(ChannelError::Closed)?;

        self.0.closed.store(false, Ordering::SeqCst);
        let inner = self.0.clone();
        let handle = tokio::spawn(dispatch_loop(inner, data_rx, error_rx, close_rx));
        *self.0.reader_task.lock().expect("reader mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Disconnects the transport, rejects every pending request with
    /// [`ChannelError::Closed`], and clears the pending table. Idempotent.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.0.transport.disconnect().await?;
        if let Some(handle) = self.0.reader_task.lock().expect("reader mutex poisoned").take() {
            handle.abort();
        }
        reject_all_pending(&self.0);
        Ok(())
    }

    /// Sends a request and awaits its correlated response, or a timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value, ChannelError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let id = self.0.protocol.next_id();
        let envelope = self.0.protocol.create_request(&id, method, &params);

        let (tx, rx) = oneshot::channel();
        self.0
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id.clone(), tx);

        if let Err(e) = send_envelope(&self.0, envelope).await {
            self.0.pending.lock().expect("pending mutex poisoned").remove(&id);
            return Err(e);
        }

        let timeout = timeout_override.unwrap_or(self.0.default_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.0.pending.lock().expect("pending mutex poisoned").remove(&id);
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Like [`request`](Self::request), but decodes the result through the
    /// JSON bridge into a caller-chosen type instead of handing back the raw
    /// [`Value`].
    pub async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout_override: Option<Duration>,
    ) -> Result<T, ChannelError> {
        let value = self.request(method, params, timeout_override).await?;
        Ok(value.decode()?)
    }

    /// Fire-and-forget: resolves once the write completes, without waiting
    /// for any peer acknowledgement.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ChannelError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let envelope = self.0.protocol.create_notification(method, &params);
        send_envelope(&self.0, envelope).await
    }

    /// Registers the single dispatcher for inbound requests. A later call
    /// replaces the previous handler; there is exactly one at a time
    /// (invariant I4).
    pub fn on_request<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteErrorPayload>> + Send + 'static,
    {
        let wrapped: RequestHandler = Arc::new(move |method, params| Box::pin(handler(method, params)));
        *self.0.request_handler.lock().expect("handler mutex poisoned") = Some(wrapped);
    }

    /// Registers the single dispatcher for inbound notifications.
    pub fn on_notification<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: NotificationHandler =
            Arc::new(move |method, params| Box::pin(handler(method, params)));
        *self.0.notification_handler.lock().expect("handler mutex poisoned") = Some(wrapped);
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// `(exit_code, signal)` reported by the underlying transport the last
    /// time it closed, if any. `None` if the transport never reported one
    /// (e.g. an explicit [`close`](Self::close) rather than the peer
    /// exiting), or if the channel has never been started.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.0.exit_info.lock().expect("exit_info mutex poisoned").clone()
    }
}

async fn send_envelope(inner: &Arc<ChannelInner>, envelope: JsonValue) -> Result<(), ChannelError> {
    let bytes = inner.codec.serialize(&envelope)?;
    let framed = {
        let framer = inner.framer.lock().expect("framer mutex poisoned");
        framer.encode(&bytes)
    };
    inner.transport.write(framed).await.map_err(ChannelError::from)
}

fn reject_all_pending(inner: &Arc<ChannelInner>) {
    let mut pending = inner.pending.lock().expect("pending mutex poisoned");
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(ChannelError::Closed));
    }
}

async fn dispatch_loop(
    inner: Arc<ChannelInner>,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
    mut error_rx: mpsc::UnboundedReceiver<TransportError>,
    mut close_rx: oneshot::Receiver<ExitInfo>,
) {
    loop {
        tokio::select! {
            chunk = data_rx.recv() => {
                match chunk {
                    Some(chunk) => handle_chunk(&inner, chunk).await,
                    None => break,
                }
            }
            err = error_rx.recv() => {
                match err {
                    Some(err) => warn!("transport error on channel: {err}"),
                    None => continue,
                }
            }
            exit = &mut close_rx => {
                debug!("transport closed, tearing down channel");
                if let Ok(exit_info) = exit {
                    *inner.exit_info.lock().expect("exit_info mutex poisoned") = Some(exit_info);
                }
                break;
            }
        }
    }
    reject_all_pending(&inner);
    inner.closed.store(true, Ordering::SeqCst);
}

async fn handle_chunk(inner: &Arc<ChannelInner>, chunk: Bytes) {
    let decoded = {
        let mut framer = inner.framer.lock().expect("framer mutex poisoned");
        framer.decode(chunk)
    };
    match decoded {
        Ok(payloads) => {
            for payload in payloads {
                dispatch_payload(inner, payload).await;
            }
        }
        Err(e) => warn!("framing error, dropping buffered bytes: {e}"),
    }
}

async fn dispatch_payload(inner: &Arc<ChannelInner>, payload: Bytes) {
    let value = match inner.codec.deserialize(&payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("dropped unparseable inbound payload: {e}");
            // No envelope could be parsed at all, so there is no correlation
            // id to recover; JSON-RPC's convention for this case is to reply
            // with a null id (§4.5/§7).
            send_invalid_reply(inner, RequestId::Null, error_codes::PARSE_ERROR, &e.to_string())
                .await;
            return;
        }
    };

    match inner.protocol.parse_message(&value) {
        ParsedMessage::Request { id, method, params } => {
            dispatch_request(inner, id, method, params).await;
        }
        ParsedMessage::Response { id, outcome } => dispatch_response(inner, id, outcome),
        ParsedMessage::Notification { method, params } => {
            dispatch_notification(inner, method, params).await;
        }
        ParsedMessage::Invalid { id: Some(id) } => {
            send_invalid_reply(inner, id, error_codes::INVALID_REQUEST, "invalid request envelope")
                .await;
        }
        ParsedMessage::Invalid { id: None } => debug!("dropped invalid inbound message"),
    }
}

/// Replies to a malformed inbound envelope that still carried (or, for a
/// totally unparseable payload, is given a null) correlation id. The channel
/// never surfaces this as a completed request to application code; it is
/// purely an on-the-wire courtesy to the peer (§4.5/§7).
async fn send_invalid_reply(inner: &Arc<ChannelInner>, id: RequestId, code: i64, message: &str) {
    let envelope = inner.protocol.create_error_response(&id, code, message, None);
    if let Err(e) = send_envelope(inner, envelope).await {
        warn!("failed to write invalid-request reply for `{id:?}`: {e}");
    }
}

async fn dispatch_request(inner: &Arc<ChannelInner>, id: RequestId, method: String, params: Value) {
    let handler = inner
        .request_handler
        .lock()
        .expect("handler mutex poisoned")
        .clone();

    let outcome = match handler {
        Some(handler) => handler(method, params).await,
        None => Err(RemoteErrorPayload {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("no request handler registered for `{method}`"),
            data: None,
        }),
    };

    let envelope = match outcome {
        Ok(result) => inner.protocol.create_response(&id, &result),
        Err(payload) => inner.protocol.create_error_response(
            &id,
            payload.code,
            &payload.message,
            payload.data.as_ref(),
        ),
    };

    if let Err(e) = send_envelope(inner, envelope).await {
        warn!("failed to write response for `{id:?}`: {e}");
    }
}

fn dispatch_response(inner: &Arc<ChannelInner>, id: RequestId, outcome: ResponseOutcome) {
    let sender = inner.pending.lock().expect("pending mutex poisoned").remove(&id);
    let Some(tx) = sender else {
        debug!("dropped response for unmatched or already-resolved id");
        return;
    };
    let result = match outcome {
        ResponseOutcome::Ok(value) => Ok(value),
        ResponseOutcome::Err(payload) => Err(ChannelError::Remote(RemoteError {
            code: payload.code,
            message: payload.message,
            data: payload.data,
        })),
    };
    let _ = tx.send(result);
}

async fn dispatch_notification(inner: &Arc<ChannelInner>, method: String, params: Value) {
    let handler = inner
        .notification_handler
        .lock()
        .expect("handler mutex poisoned")
        .clone();
    match handler {
        Some(handler) => handler(method, params).await,
        None => debug!("dropped notification `{method}`: no handler registered"),
    }
}
