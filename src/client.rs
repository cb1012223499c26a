//! Reconnecting WebSocket client.
//!
//! Requests get a fresh id and wait on a one-shot slot keyed by it. While the
//! socket is down, requests queue up and are flushed in order on the next
//! connect. Any disconnect rejects every waiting request and drops the queue;
//! callers decide whether to retry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::API_KEY_HEADER;
use crate::backoff::ReconnectPolicy;
use crate::cancellation::{Controller, Token};
use crate::frame::{FrameCodec, FrameError, RunBuffers};
use crate::messages::{
    ChatChunk, EnvResponse, ModelConfigurationRequest, ModelConfigurationResponse, Request,
    ResponseEnvelope, ResponseStatus, RunAbortRequest, RunAck, RunEnd, RunListResponse, RunRecord,
    RunStartRequest, ServerEvent, ServerMessage, VersionResponse,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("client stopped")]
    Stopped,
    #[error("{kind} failed: {message}")]
    Remote { kind: String, message: String },
    #[error("failed to decode {kind} response: {message}")]
    Decode { kind: String, message: String },
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("http request failed: {0}")]
    Http(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub reconnect: ReconnectPolicy,
    pub api_key: Option<String>,
    pub event_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { reconnect: ReconnectPolicy::default(), api_key: None, event_capacity: 256 }
    }
}

type Pending = oneshot::Sender<Result<ResponseEnvelope, ClientError>>;

#[derive(Default)]
struct ClientState {
    writer: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, Pending>,
    queue: VecDeque<String>,
    attempts: u32,
    runs: HashMap<String, RunBuffers>,
}

struct Shared {
    url: String,
    options: ClientOptions,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
    events: broadcast::Sender<ServerMessage>,
    status: watch::Sender<ConnectionStatus>,
    stop: Controller,
    codec: FrameCodec,
    http: reqwest::Client,
}

#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Starts the connection loop and returns immediately.
    pub fn connect(url: impl Into<String>, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            url: url.into(),
            options,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ClientState::default()),
            events,
            status,
            stop: Controller::new(),
            codec: FrameCodec::default(),
            http: reqwest::Client::new(),
        });
        tokio::spawn(connection_loop(Arc::clone(&shared)));
        Self { shared }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.shared.status.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionStatus::Open | ConnectionStatus::Stopped)),
        )
        .await;
        match waited {
            Ok(Ok(status)) if *status == ConnectionStatus::Open => Ok(()),
            Ok(_) => Err(ClientError::Stopped),
            Err(_) => Err(ClientError::Disconnected("timed out waiting for connection".to_string())),
        }
    }

    /// Every message the server pushes or answers, in arrival order.
    pub fn events(&self) -> BroadcastStream<ServerMessage> {
        BroadcastStream::new(self.shared.events.subscribe())
    }

    /// Reassembled streams of a run seen on this client. Reset on disconnect;
    /// the server replays active runs in full on the next attach.
    pub fn run_buffers(&self, run_id: &str) -> Option<RunBuffers> {
        self.shared.state.lock().runs.get(run_id).cloned()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state.lock().attempts
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Send `request` now, or once connected, and wait for its response.
    pub async fn queue(&self, request: &Request) -> Result<ResponseEnvelope, ClientError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = request
            .to_frame_value(&id)
            .map_err(|e| ClientError::Encode(e.to_string()))?
            .to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if self.shared.stop.is_aborted() {
                return Err(ClientError::Stopped);
            }
            state.pending.insert(id.clone(), tx);
            let sent = state.writer.as_ref().is_some_and(|w| w.send(frame.clone()).is_ok());
            if !sent {
                debug!(id = %id, kind = request.kind(), "queued until connected");
                state.queue.push_back(frame);
            }
        }
        rx.await
            .unwrap_or_else(|_| Err(ClientError::Disconnected("request dropped".to_string())))
    }

    /// Close for good. Waiting requests fail with [`ClientError::Stopped`].
    pub fn stop(&self) {
        if !self.shared.stop.abort("stopped") {
            return;
        }
        let pending = {
            let mut state = self.shared.state.lock();
            state.writer = None;
            state.queue.clear();
            std::mem::take(&mut state.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::Stopped));
        }
        self.shared.status.send_replace(ConnectionStatus::Stopped);
        info!(url = %self.shared.url, "client stopped");
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ClientError> {
        let envelope = self.queue(&request).await?;
        let status = envelope.status();
        if !status.ok {
            return Err(ClientError::Remote {
                kind: envelope.kind,
                message: status.error.map(|e| e.message).unwrap_or_else(|| "request failed".to_string()),
            });
        }
        serde_json::from_value(envelope.response)
            .map_err(|e| ClientError::Decode { kind: envelope.kind, message: e.to_string() })
    }

    pub async fn version(&self) -> Result<VersionResponse, ClientError> {
        self.call(Request::ServerVersion).await
    }

    pub async fn env(&self) -> Result<EnvResponse, ClientError> {
        self.call(Request::ServerEnv).await
    }

    pub async fn model_configuration(
        &self,
        model: &str,
        token: bool,
    ) -> Result<ModelConfigurationResponse, ClientError> {
        self.call(Request::ModelConfiguration(ModelConfigurationRequest { model: model.to_string(), token }))
            .await
    }

    pub async fn list_runs(&self) -> Result<RunListResponse, ClientError> {
        self.call(Request::RunList).await
    }

    /// Starts a run; any buffers this client held for the same id are reset.
    pub async fn start_run(&self, request: RunStartRequest) -> Result<RunAck, ClientError> {
        self.shared.state.lock().runs.remove(&request.run_id);
        self.call(Request::RunStart(request)).await
    }

    /// An empty id is acknowledged without a round trip.
    pub async fn abort_run(&self, run_id: &str, reason: Option<&str>) -> Result<RunAck, ClientError> {
        if run_id.is_empty() {
            return Ok(RunAck::ok(""));
        }
        self.call(Request::RunAbort(RunAbortRequest {
            run_id: run_id.to_string(),
            reason: reason.map(str::to_string),
        }))
        .await
    }

    pub async fn send_chat_chunk(&self, chunk: ChatChunk) -> Result<ResponseStatus, ClientError> {
        self.call(Request::ChatChunk(chunk)).await
    }

    pub async fn kill(&self) -> Result<ResponseStatus, ClientError> {
        self.call(Request::ServerKill).await
    }

    /// `GET /api/runs/{id}` on the same host.
    pub async fn fetch_run(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let url = format!("{}/api/runs/{}", http_base(&self.shared.url), run_id);
        let mut req = self.shared.http.get(&url);
        if let Some(key) = &self.shared.options.api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        let resp = req.send().await.map_err(|e| ClientError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::Http(format!("{url} returned {}", resp.status())));
        }
        resp.json::<RunRecord>().await.map_err(|e| ClientError::Http(e.to_string()))
    }

    /// A compacted `run.end` carries no trace; fill it in over HTTP.
    pub async fn complete_end(&self, end: RunEnd) -> Result<RunEnd, ClientError> {
        if end.trace.is_some() {
            return Ok(end);
        }
        let record = self.fetch_run(&end.run_id).await?;
        Ok(RunEnd {
            run_id: record.run_id,
            exit_code: record.exit_code.unwrap_or(end.exit_code),
            result: record.result.or(end.result),
            trace: Some(record.trace),
        })
    }
}

/// `ws://host:port/path?q` -> `http://host:port`
fn http_base(ws_url: &str) -> String {
    let (scheme, rest) = match ws_url.split_once("://") {
        Some(("wss", rest)) => ("https", rest),
        Some((_, rest)) => ("http", rest),
        None => ("http", ws_url),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    format!("{scheme}://{authority}")
}

async fn connection_loop(shared: Arc<Shared>) {
    let stop = shared.stop.token();
    loop {
        shared.status.send_replace(ConnectionStatus::Connecting);
        let connected = tokio::select! {
            _ = stop.cancelled() => break,
            connected = open_socket(&shared) => connected,
        };
        let reason = match connected {
            Ok(socket) => shared.session(socket, &stop).await,
            Err(reason) => reason,
        };
        if stop.is_cancelled() {
            break;
        }
        let attempt = shared.on_disconnect(&reason);
        let delay = shared.options.reconnect.delay(attempt);
        debug!(url = %shared.url, attempt, ?delay, "reconnecting");
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.status.send_replace(ConnectionStatus::Stopped);
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn open_socket(shared: &Shared) -> Result<Socket, String> {
    let mut request = shared.url.as_str().into_client_request().map_err(|e| e.to_string())?;
    if let Some(key) = &shared.options.api_key {
        let value = HeaderValue::from_str(key).map_err(|e| format!("invalid api key: {e}"))?;
        request.headers_mut().insert(API_KEY_HEADER, value);
    }
    let (socket, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| e.to_string())?;
    Ok(socket)
}

impl Shared {
    /// Runs one connected session; returns why it ended.
    async fn session(&self, socket: Socket, stop: &Token) -> String {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let flushed = {
            let mut state = self.state.lock();
            let flushed = state.queue.len();
            for frame in state.queue.drain(..) {
                let _ = tx.send(frame);
            }
            state.writer = Some(tx);
            state.attempts = 0;
            flushed
        };
        self.status.send_replace(ConnectionStatus::Open);
        info!(url = %self.url, flushed, "connected");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "stopped".to_string();
                }
                outgoing = rx.recv() => match outgoing {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            return e.to_string();
                        }
                    }
                    // Only `stop` takes the writer away.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return "stopped".to_string();
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_incoming(&text),
                    Some(Ok(Message::Close(_))) | None => return "connection closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                },
            }
        }
    }

    fn handle_incoming(&self, text: &str) {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(FrameError::Unrecognized(kind)) => {
                debug!(kind = %kind, "ignoring unrecognized frame");
                return;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        match &message {
            ServerMessage::Response(envelope) => {
                let waiting = self.state.lock().pending.remove(&envelope.id);
                match waiting {
                    Some(tx) => {
                        let _ = tx.send(Ok(envelope.clone()));
                    }
                    None => debug!(id = %envelope.id, kind = %envelope.kind, "response for unknown request"),
                }
            }
            ServerMessage::Event(ServerEvent::RunProgress(progress)) => {
                self.state.lock().runs.entry(progress.run_id.clone()).or_default().apply(progress);
            }
            ServerMessage::Event(ServerEvent::RunEnd(end)) => {
                let mut state = self.state.lock();
                let buffers = state.runs.entry(end.run_id.clone()).or_default();
                // The final trace is authoritative; compacted ends carry none.
                if let Some(trace) = &end.trace {
                    buffers.trace.clone_from(trace);
                }
            }
            ServerMessage::Event(ServerEvent::Log(log)) => log.emit(),
            ServerMessage::Event(_) => {}
        }
        let _ = self.events.send(message);
    }

    /// Returns the attempt count used to pick the next delay.
    fn on_disconnect(&self, reason: &str) -> u32 {
        let (attempt, pending) = {
            let mut state = self.state.lock();
            state.writer = None;
            state.attempts += 1;
            state.queue.clear();
            // The server replays whole buffers on attach.
            state.runs.clear();
            (state.attempts, std::mem::take(&mut state.pending))
        };
        self.status.send_replace(ConnectionStatus::Closed);
        warn!(url = %self.url, reason, attempt, rejected = pending.len(), "disconnected");
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::Disconnected(reason.to_string())));
        }
        attempt
    }
}
