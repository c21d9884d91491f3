//! Realtime session websocket client.
//!
//! The client opens one websocket per session, authenticates with an AUTH
//! envelope, and routes inbound envelopes to registered handlers. A background
//! worker owns the socket; after an unexpected close it reconnects with the
//! last connection parameters until the caller disconnects.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::realtime::proto::{error_detail, message_type, AuthPayload, Envelope};
use crate::realtime::registry::{HandlerRegistry, Subscription};
use crate::reconnect::{with_optional_timeout, with_timeout, ReconnectPolicy};

/// Local development websocket endpoint for the meeting service.
pub const LOCAL_SESSION_ENDPOINT: &str = "ws://localhost:8080/ws";

const NORMAL_CLOSE_CODE: u16 = 1000;
const DISCONNECT_REASON: &str = "Client disconnect";
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default values used by [`SessionClientOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    /// Fixed delay before each reconnect attempt.
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
    /// Credential sent when the caller has no token.
    pub const GUEST_TOKEN: &'static str = "guest-token";
}

/// How outbound payloads are embedded in the envelope.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadEncoding {
    /// Payload is written as a JSON value.
    #[default]
    Inline,
    /// Non-string payloads are serialized to a JSON string first.
    Stringified,
}

impl PayloadEncoding {
    /// Applies this encoding to an outbound payload.
    pub fn encode(self, payload: Value) -> Value {
        match (self, payload) {
            (Self::Stringified, Value::String(text)) => Value::String(text),
            (Self::Stringified, other) => Value::String(other.to_string()),
            (Self::Inline, payload) => payload,
        }
    }
}

/// Client behavior shared by every connection it opens.
#[derive(Clone, Debug)]
pub struct SessionClientOptions {
    /// Applied after an unexpected close.
    pub reconnect: ReconnectPolicy,
    /// Bounds transport open plus handshake for one attempt.
    pub connect_timeout: Option<Duration>,
    /// Credential sent when the params carry no token.
    pub guest_token: String,
    pub payload_encoding: PayloadEncoding,
    /// Appends `meetingId` and `guestName` query parameters to the endpoint.
    pub session_query: bool,
}

impl Default for SessionClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::fixed(SessionDefaults::RECONNECT_DELAY),
            connect_timeout: None,
            guest_token: SessionDefaults::GUEST_TOKEN.to_string(),
            payload_encoding: PayloadEncoding::Inline,
            session_query: true,
        }
    }
}

/// Name the attendee is shown under.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisplayIdentity {
    Split { first: String, last: String },
    Display(String),
}

impl DisplayIdentity {
    /// Name shown to other attendees, trimmed.
    pub fn display_name(&self) -> String {
        match self {
            Self::Split { first, last } => format!("{} {}", first.trim(), last.trim())
                .trim()
                .to_string(),
            Self::Display(name) => name.trim().to_string(),
        }
    }
}

/// Parameters for one session connection, replayed verbatim on reconnect.
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub endpoint: String,
    pub session_id: String,
    /// Absent or empty tokens authenticate as a guest.
    pub token: Option<SecretString>,
    pub identity: DisplayIdentity,
}

impl ConnectionParams {
    pub fn new(
        endpoint: impl Into<String>,
        session_id: impl Into<String>,
        identity: DisplayIdentity,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: session_id.into(),
            token: None,
            identity,
        }
    }

    /// Guest identity shown under a single display name.
    pub fn guest(
        endpoint: impl Into<String>,
        session_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self::new(
            endpoint,
            session_id,
            DisplayIdentity::Display(display_name.into()),
        )
    }

    /// Identity shown as `"{first} {last}"`.
    pub fn named(
        endpoint: impl Into<String>,
        session_id: impl Into<String>,
        first: impl Into<String>,
        last: impl Into<String>,
    ) -> Self {
        Self::new(
            endpoint,
            session_id,
            DisplayIdentity::Split {
                first: first.into(),
                last: last.into(),
            },
        )
    }

    /// Authenticates with `token` instead of the guest placeholder.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    fn validate(&self) -> Result<Url, SessionClientError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(SessionClientError::InvalidParams(
                "endpoint must not be empty".to_string(),
            ));
        }
        if self.session_id.trim().is_empty() {
            return Err(SessionClientError::InvalidParams(
                "session_id must not be empty".to_string(),
            ));
        }

        let url = Url::parse(endpoint).map_err(|err| {
            SessionClientError::InvalidParams(format!("endpoint is not a valid url: {err}"))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(SessionClientError::InvalidParams(format!(
                "endpoint scheme must be ws or wss, got {other}"
            ))),
        }
    }

    fn request_url(&self, mut url: Url, session_query: bool) -> String {
        if session_query {
            url.query_pairs_mut()
                .append_pair("meetingId", self.session_id.trim())
                .append_pair("guestName", &self.identity.display_name());
        }
        url.into()
    }

    fn auth_payload(&self, guest_token: &str) -> AuthPayload {
        let token = self
            .token
            .as_ref()
            .map(|token| token.expose_secret().as_str())
            .filter(|token| !token.trim().is_empty())
            .unwrap_or(guest_token)
            .to_string();
        let (first_name, last_name) = match &self.identity {
            DisplayIdentity::Split { first, last } => (Some(first.clone()), Some(last.clone())),
            DisplayIdentity::Display(_) => (None, None),
        };
        let display_name = Some(self.identity.display_name()).filter(|name| !name.is_empty());

        AuthPayload {
            token,
            meeting_id: self.session_id.trim().to_string(),
            first_name,
            last_name,
            display_name,
        }
    }
}

/// Connection lifecycle published by the client.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    AwaitingAuth,
    Ready,
    Closed,
}

/// Errors surfaced to callers of [`SessionClient::connect`].
#[derive(Debug, Error)]
pub enum SessionClientError {
    /// Connection parameters are incomplete or unusable.
    #[error("invalid connection params: {0}")]
    InvalidParams(String),

    /// Server answered the AUTH envelope with ERROR.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport closed before the handshake completed.
    #[error("connection closed during handshake (code {code:?})")]
    ClosedDuringHandshake { code: Option<u16> },

    /// `disconnect` was called while the connect was pending.
    #[error("disconnected before the session was ready")]
    Disconnected,

    /// Transport open plus handshake exceeded the configured timeout.
    #[error("timed out waiting for the session handshake")]
    ConnectTimeout,

    /// Reconnect policy gave up after consecutive failed attempts.
    #[error("gave up after {attempts} failed reconnect attempts")]
    ReconnectExhausted { attempts: usize },

    /// Session worker contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionClientError {
    /// Copy handed to each caller waiting on the same attempt.
    fn replicate(&self) -> Self {
        match self {
            Self::InvalidParams(detail) => Self::InvalidParams(detail.clone()),
            Self::HandshakeRejected(detail) => Self::HandshakeRejected(detail.clone()),
            Self::WebSocket(err) => Self::Protocol(format!("websocket error: {err}")),
            Self::Json(err) => Self::Protocol(format!("json error: {err}")),
            Self::ClosedDuringHandshake { code } => Self::ClosedDuringHandshake { code: *code },
            Self::Disconnected => Self::Disconnected,
            Self::ConnectTimeout => Self::ConnectTimeout,
            Self::ReconnectExhausted { attempts } => Self::ReconnectExhausted {
                attempts: *attempts,
            },
            Self::Protocol(detail) => Self::Protocol(detail.clone()),
        }
    }
}

struct Control {
    epoch: u64,
    current_session: Option<String>,
}

/// State shared between client handles and the worker.
///
/// Every state write is tagged with the writer's epoch; `connect` and
/// `disconnect` bump it so a superseded worker cannot publish.
struct Shared {
    state: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
    handlers: HandlerRegistry,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            state,
            control: Mutex::new(Control {
                epoch: 0,
                current_session: None,
            }),
            handlers: HandlerRegistry::new(),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, epoch: u64, next: ConnectionState, session_id: &str) -> bool {
        let mut control = self.control();
        if control.epoch != epoch {
            return false;
        }
        control.current_session =
            (next == ConnectionState::Ready).then(|| session_id.to_string());
        self.publish(next);
        true
    }

    /// Must be called with the control lock held.
    fn publish(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(event = "state_changed", from = ?previous, to = ?next);
        }
    }
}

type ReadyResult = Result<(), SessionClientError>;
type ReadySender = oneshot::Sender<ReadyResult>;

/// Callers waiting for one worker's session to become ready.
///
/// The worker settles waiters under the gate lock together with the state
/// write, so a caller that joined while the state was pending is always woken.
#[derive(Default)]
struct ReadyGate {
    inner: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    waiters: Vec<ReadySender>,
    finished: bool,
}

enum Join {
    Ready,
    Wait(oneshot::Receiver<ReadyResult>),
    Restart,
}

impl ReadyGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) -> oneshot::Receiver<ReadyResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().waiters.push(tx);
        rx
    }

    fn join(&self, state: &watch::Sender<ConnectionState>) -> Join {
        let mut gate = self.lock();
        if gate.finished {
            return Join::Restart;
        }
        let current = *state.borrow();
        match current {
            ConnectionState::Ready => Join::Ready,
            ConnectionState::Connecting | ConnectionState::AwaitingAuth => {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push(tx);
                Join::Wait(rx)
            }
            ConnectionState::Idle | ConnectionState::Closed => Join::Restart,
        }
    }

    /// Publishes `next` and wakes every waiter with `result`.
    fn settle(
        &self,
        shared: &Shared,
        epoch: u64,
        session_id: &str,
        next: ConnectionState,
        result: ReadyResult,
    ) {
        let mut gate = self.lock();
        shared.transition(epoch, next, session_id);
        wake(&mut gate.waiters, &result);
    }

    /// Wakes every waiter with `err`. Later connects start a new worker.
    fn finish(&self, err: SessionClientError) {
        let mut gate = self.lock();
        gate.finished = true;
        wake(&mut gate.waiters, &Err(err));
    }
}

fn wake(waiters: &mut Vec<ReadySender>, result: &ReadyResult) {
    for waiter in waiters.drain(..) {
        let reply = match result {
            Ok(()) => Ok(()),
            Err(err) => Err(err.replicate()),
        };
        let _ = waiter.send(reply);
    }
}

struct WorkerLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    shutdown: watch::Sender<bool>,
    ready: Arc<ReadyGate>,
    /// Reports a change error once the worker task has returned.
    done: watch::Receiver<()>,
    task: JoinHandle<()>,
}

impl WorkerLink {
    fn stop(self) {
        let _ = self.shutdown.send(true);
    }
}

struct ClientInner {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerLink>>,
}

impl ClientInner {
    fn worker(&self) -> MutexGuard<'_, Option<WorkerLink>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

/// Handle to one realtime session connection.
///
/// Clones share the connection, the handler registry, and the published
/// state. The socket is released when `disconnect` is called or the last
/// handle is dropped.
#[derive(Clone)]
pub struct SessionClient {
    options: SessionClientOptions,
    inner: Arc<ClientInner>,
}

impl SessionClient {
    /// Client with default options.
    pub fn new() -> Self {
        Self::with_options(SessionClientOptions::default())
    }

    /// Client with explicit options.
    pub fn with_options(options: SessionClientOptions) -> Self {
        Self {
            options,
            inner: Arc::new(ClientInner {
                shared: Arc::new(Shared::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = Some(timeout);
        self
    }

    pub fn with_payload_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.options.payload_encoding = encoding;
        self
    }

    /// Options this client was built with.
    pub fn options(&self) -> &SessionClientOptions {
        &self.options
    }

    /// Opens the session and resolves once the server answers CONNECTED.
    ///
    /// Resolves immediately when the session is already ready. A call made
    /// while an attempt is in flight waits for that attempt instead of
    /// opening a second transport. Fails when the server answers ERROR, the
    /// transport fails before the handshake completes, or `disconnect` is
    /// called first.
    pub async fn connect(&self, params: ConnectionParams) -> Result<(), SessionClientError> {
        let endpoint = params.validate()?;

        let ready_rx = {
            let mut worker = self.inner.worker();
            let joined = worker
                .as_ref()
                .filter(|link| !link.task.is_finished())
                .map_or(Join::Restart, |link| link.ready.join(&self.inner.shared.state));
            match joined {
                Join::Ready => {
                    debug!(event = "connect_skipped", session_id = %params.session_id);
                    return Ok(());
                }
                Join::Wait(ready_rx) => {
                    debug!(event = "connect_joined_pending", session_id = %params.session_id);
                    ready_rx
                }
                Join::Restart => self.spawn_worker(&mut worker, params, endpoint),
            }
        };

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionClientError::Protocol(
                "session worker stopped before the session was ready".to_string(),
            )),
        }
    }

    fn spawn_worker(
        &self,
        worker: &mut Option<WorkerLink>,
        params: ConnectionParams,
        endpoint: Url,
    ) -> oneshot::Receiver<ReadyResult> {
        if let Some(previous) = worker.take() {
            previous.stop();
        }

        let shared = &self.inner.shared;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(());
        let ready = Arc::new(ReadyGate::default());
        let ready_rx = ready.wait();

        let epoch = {
            let mut control = shared.control();
            control.epoch += 1;
            control.current_session = None;
            shared.publish(ConnectionState::Connecting);
            control.epoch
        };

        let url = params.request_url(endpoint, self.options.session_query);
        debug!(event = "connect_requested", url = %url, session_id = %params.session_id);
        let session = SessionWorker {
            epoch,
            url,
            params,
            options: self.options.clone(),
            shared: Arc::clone(shared),
            ready: Arc::clone(&ready),
            established: false,
            outbound_rx,
            shutdown: shutdown_rx,
            _done: done_tx,
        };
        let task = tokio::spawn(session.run());
        *worker = Some(WorkerLink {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            ready,
            done: done_rx,
            task,
        });
        ready_rx
    }

    /// Closes the session without scheduling a reconnect.
    ///
    /// Rejects a pending `connect` and cancels a pending reconnect timer.
    /// Calling it again is harmless.
    pub fn disconnect(&self) {
        let mut worker = self.inner.worker();
        let shared = &self.inner.shared;
        {
            let mut control = shared.control();
            control.epoch += 1;
            control.current_session = None;
            shared.publish(ConnectionState::Closed);
        }
        if let Some(link) = worker.take() {
            debug!(event = "disconnect_requested");
            link.stop();
        }
    }

    /// Sends a typed envelope. Returns `false` unless the session is ready.
    pub fn send(&self, kind: &str, payload: Value) -> bool {
        let state = self.state();
        if state != ConnectionState::Ready {
            debug!(event = "send_refused", kind, state = ?state);
            return false;
        }

        let envelope = Envelope::new(kind, self.options.payload_encoding.encode(payload));
        let worker = self.inner.worker();
        match worker.as_ref() {
            Some(link) => link.outbound.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Sends a chat `MESSAGE` with `{text}`.
    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.send(message_type::MESSAGE, json!({ "text": text.into() }))
    }

    /// Sends a `PING` with an empty payload.
    pub fn ping(&self) -> bool {
        self.send(message_type::PING, json!({}))
    }

    /// Asks the chair for the floor.
    pub fn request_recognition(&self) -> bool {
        self.send(message_type::REQUEST_RECOGNITION, json!({}))
    }

    /// Registers a handler for envelopes of type `kind`.
    ///
    /// See [`HandlerRegistry::on`].
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.shared.handlers.on(kind, handler)
    }

    /// Registers a wildcard handler that receives every decoded envelope.
    pub fn on_envelope<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.shared.handlers.on_envelope(handler)
    }

    /// Registry shared by every clone of this client.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.shared.handlers
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Returns `true` while the session is ready for sends.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Resolves once the current connection has stopped for good.
    ///
    /// That covers `disconnect`, a normal close from the server, a failed
    /// initial connect, and exhausted reconnects. Resolves at once when no
    /// connection was started.
    pub async fn closed(&self) {
        let done = self.inner.worker().as_ref().map(|link| link.done.clone());
        if let Some(mut done) = done {
            while done.changed().await.is_ok() {}
        }
    }

    /// Session id of the ready connection, if any.
    pub fn current_session(&self) -> Option<String> {
        self.inner.shared.control().current_session.clone()
    }
}

impl Default for SessionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.state())
            .field("options", &self.options)
            .field("handlers", &self.inner.shared.handlers)
            .finish()
    }
}

enum Handshake {
    Accepted,
    Rejected(String),
}

enum AttemptOutcome {
    /// Caller disconnected; the socket has been released.
    Shutdown,
    /// Server closed with code 1000.
    ClosedNormally,
    /// Transport dropped after the handshake settled.
    Dropped { after_ready: bool },
    /// Attempt failed before the handshake settled.
    Failed(SessionClientError),
}

struct SessionWorker {
    epoch: u64,
    url: String,
    params: ConnectionParams,
    options: SessionClientOptions,
    shared: Arc<Shared>,
    ready: Arc<ReadyGate>,
    /// Set once any handshake has settled; initial failures before that are terminal.
    established: bool,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    shutdown: watch::Receiver<bool>,
    _done: watch::Sender<()>,
}

impl SessionWorker {
    async fn run(mut self) {
        let mut failed_attempts = 0usize;

        loop {
            self.discard_stale_outbound();
            match self.run_attempt().await {
                AttemptOutcome::Shutdown => {
                    self.ready.finish(SessionClientError::Disconnected);
                    debug!(event = "session_worker_stopped", session_id = %self.params.session_id);
                    return;
                }
                AttemptOutcome::ClosedNormally => {
                    self.transition(ConnectionState::Closed);
                    self.ready.finish(SessionClientError::ClosedDuringHandshake {
                        code: Some(NORMAL_CLOSE_CODE),
                    });
                    info!(event = "session_closed_by_server", session_id = %self.params.session_id);
                    return;
                }
                AttemptOutcome::Dropped { after_ready } => {
                    self.transition(ConnectionState::Closed);
                    if after_ready {
                        failed_attempts = 0;
                    } else {
                        failed_attempts += 1;
                    }
                    warn!(event = "unexpected_close", session_id = %self.params.session_id);
                }
                AttemptOutcome::Failed(err) => {
                    self.transition(ConnectionState::Closed);
                    if !self.established {
                        warn!(
                            event = "connect_failed",
                            session_id = %self.params.session_id,
                            error = %err
                        );
                        self.ready.finish(err);
                        return;
                    }
                    failed_attempts += 1;
                    warn!(
                        event = "reconnect_attempt_failed",
                        attempt = failed_attempts,
                        error = %err
                    );
                }
            }

            if !self.options.reconnect.allows(failed_attempts) {
                warn!(
                    event = "reconnect_exhausted",
                    failed_attempts,
                    session_id = %self.params.session_id
                );
                self.ready.finish(SessionClientError::ReconnectExhausted {
                    attempts: failed_attempts,
                });
                return;
            }
            if !self.wait_before_reconnect().await {
                self.ready.finish(SessionClientError::Disconnected);
                return;
            }
            info!(event = "reconnect_attempt", session_id = %self.params.session_id);
        }
    }

    async fn run_attempt(&mut self) -> AttemptOutcome {
        if *self.shutdown.borrow() {
            return AttemptOutcome::Shutdown;
        }
        self.transition(ConnectionState::Connecting);

        let mut shutdown = self.shutdown.clone();
        let mut transport = None;
        let attempt = async {
            with_optional_timeout(self.options.connect_timeout, self.handshake(&mut transport))
                .await
                .unwrap_or(Err(SessionClientError::ConnectTimeout))
        };
        let settled = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => None,
            result = attempt => Some(result),
        };
        let Some(settled) = settled else {
            if let Some(mut socket) = transport.take() {
                close_gracefully(&mut socket).await;
            }
            return AttemptOutcome::Shutdown;
        };
        let handshake = match settled {
            Ok(handshake) => handshake,
            Err(err) => return AttemptOutcome::Failed(err),
        };
        let Some(socket) = transport.take() else {
            return AttemptOutcome::Failed(SessionClientError::Protocol(
                "handshake settled without a transport".to_string(),
            ));
        };

        self.established = true;
        let ready = match handshake {
            Handshake::Accepted => {
                info!(event = "session_ready", session_id = %self.params.session_id);
                true
            }
            Handshake::Rejected(error) => {
                warn!(
                    event = "handshake_rejected",
                    session_id = %self.params.session_id,
                    error = %error
                );
                false
            }
        };
        self.pump(socket, ready).await
    }

    /// Opens the transport, sends AUTH, and waits for CONNECTED or ERROR.
    ///
    /// Envelopes received before the reply are still dispatched.
    async fn handshake(
        &self,
        transport: &mut Option<Socket>,
    ) -> Result<Handshake, SessionClientError> {
        let (stream, _) = connect_async(self.url.as_str()).await?;
        let socket = transport.insert(stream);
        self.transition(ConnectionState::AwaitingAuth);

        let auth = self.params.auth_payload(&self.options.guest_token);
        let auth = Envelope::new(message_type::AUTH, serde_json::to_value(auth)?);
        send_envelope(socket, &auth).await?;
        debug!(event = "auth_sent", session_id = %self.params.session_id);

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Some(envelope) = parse_inbound(text.as_str()) else {
                        continue;
                    };
                    let session_id = self.params.session_id.trim();
                    let settled = match envelope.kind.as_str() {
                        message_type::CONNECTED => {
                            self.ready.settle(
                                &self.shared,
                                self.epoch,
                                session_id,
                                ConnectionState::Ready,
                                Ok(()),
                            );
                            Some(Handshake::Accepted)
                        }
                        message_type::ERROR => {
                            let detail = error_detail(&envelope.payload);
                            self.ready.settle(
                                &self.shared,
                                self.epoch,
                                session_id,
                                ConnectionState::Closed,
                                Err(SessionClientError::HandshakeRejected(detail.clone())),
                            );
                            Some(Handshake::Rejected(detail))
                        }
                        _ => None,
                    };
                    self.shared.handlers.dispatch(&envelope);
                    if let Some(settled) = settled {
                        return Ok(settled);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    socket.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(SessionClientError::ClosedDuringHandshake {
                        code: frame.map(|frame| u16::from(frame.code)),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(SessionClientError::WebSocket(err)),
                None => return Err(SessionClientError::ClosedDuringHandshake { code: None }),
            }
        }
    }

    /// Steady state: writes queued envelopes (only once ready) and
    /// dispatches inbound ones until the transport or the caller ends it.
    async fn pump(&mut self, mut socket: Socket, ready: bool) -> AttemptOutcome {
        let mut shutdown = self.shutdown.clone();
        let outbound_rx = &mut self.outbound_rx;
        let handlers = &self.shared.handlers;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    close_gracefully(&mut socket).await;
                    return AttemptOutcome::Shutdown;
                }
                maybe_outbound = outbound_rx.recv(), if ready => {
                    let Some(envelope) = maybe_outbound else {
                        close_gracefully(&mut socket).await;
                        return AttemptOutcome::Shutdown;
                    };
                    if let Err(err) = send_envelope(&mut socket, &envelope).await {
                        warn!(event = "send_failed", kind = %envelope.kind, error = %err);
                        return AttemptOutcome::Dropped { after_ready: ready };
                    }
                    debug!(event = "envelope_sent", kind = %envelope.kind);
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(envelope) = parse_inbound(text.as_str()) {
                                handlers.dispatch(&envelope);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return AttemptOutcome::Dropped { after_ready: ready };
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|frame| u16::from(frame.code));
                            if code == Some(NORMAL_CLOSE_CODE) {
                                return AttemptOutcome::ClosedNormally;
                            }
                            debug!(event = "transport_closed", code = ?code);
                            return AttemptOutcome::Dropped { after_ready: ready };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "transport_error", error = %err);
                            return AttemptOutcome::Dropped { after_ready: ready };
                        }
                        None => return AttemptOutcome::Dropped { after_ready: ready },
                    }
                }
            }
        }
    }

    /// Returns `false` when the caller disconnected during the delay.
    async fn wait_before_reconnect(&self) -> bool {
        let delay = self.options.reconnect.delay;
        debug!(
            event = "reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            session_id = %self.params.session_id
        );
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(&mut shutdown) => false,
        }
    }

    /// Messages queued for a dropped transport are never replayed on a new
    /// authenticated session.
    fn discard_stale_outbound(&mut self) {
        while let Ok(envelope) = self.outbound_rx.try_recv() {
            warn!(event = "outbound_discarded", kind = %envelope.kind);
        }
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.shared
            .transition(self.epoch, next, self.params.session_id.trim())
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means the owning client is gone.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn parse_inbound(text: &str) -> Option<Envelope> {
    match Envelope::from_text(text) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(event = "malformed_message", error = %err, len = text.len());
            None
        }
    }
}

async fn send_envelope(socket: &mut Socket, envelope: &Envelope) -> Result<(), SessionClientError> {
    let text = envelope.to_text()?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn close_gracefully(socket: &mut Socket) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: DISCONNECT_REASON.into(),
    };
    match with_timeout(CLOSE_FLUSH_TIMEOUT, socket.close(Some(frame))).await {
        Ok(Ok(())) => debug!(event = "transport_released"),
        Ok(Err(err)) => debug!(event = "transport_release_failed", error = %err),
        Err(_) => debug!(event = "transport_release_timed_out"),
    }
}
