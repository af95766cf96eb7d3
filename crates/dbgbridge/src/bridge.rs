//! Bridge coordinator - routes messages between the client channel and the target.
//!
//! Flow:
//! 1. Client frames are parsed into requests and classified
//!    (disconnect / launch / attach / queue / forward)
//! 2. Launch or attach creates the single target connection. The handshake
//!    request goes first, then the pending queue is flushed in order
//! 3. Every message written to the client gets the next sequence number
//! 4. Disconnect, target close or debuggee exit ends the run with an exit code
//!
//! All bridge state is owned by the run loop. Helper tasks only feed
//! [`TargetEvent`]s into it.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::ops::ControlFlow;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::client::ClientChannel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, CodecError, ConnectError, Result};
use crate::target::attach::{self, AttachOptions};
use crate::target::launch::{self, LaunchOptions};
use crate::target::{EVENT_CHANNEL_CAPACITY, TargetConnection, TargetEvent};
use crate::wire::protocol::{Event, Request, Response, set_sequence};

/// `Break` carries the exit code of the bridge process.
type Flow = ControlFlow<i32>;

const NO_DEBUG_SESSION: &str = "no debug session (launched with noDebug)";

/// Outbound sequence numbers. Starts at 0, every call to `next` returns a fresh value.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: u64,
}

impl SequenceCounter {
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn current(&self) -> u64 {
        self.last
    }
}

/// Requests accepted before the target is writable.
#[derive(Debug, Default)]
pub struct PendingQueue {
    requests: VecDeque<Request>,
    drained: bool,
}

impl PendingQueue {
    pub fn push(&mut self, request: Request) {
        debug_assert!(!self.drained, "pending queue used after draining");
        self.requests.push_back(request);
    }

    /// Take every queued request in arrival order. Only the first call yields anything.
    pub fn drain(&mut self) -> Vec<Request> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        self.requests.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}

/// Rewrites the legacy command prefix to the new one.
#[derive(Debug, Clone)]
pub struct CommandTranslator {
    legacy: String,
    new: String,
}

impl CommandTranslator {
    pub fn new(legacy: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            legacy: legacy.into(),
            new: new.into(),
        }
    }

    pub fn translate<'a>(&self, command: &'a str) -> Cow<'a, str> {
        if self.legacy.is_empty() {
            return Cow::Borrowed(command);
        }
        match command.strip_prefix(self.legacy.as_str()) {
            Some(rest) => Cow::Owned(format!("{}{}", self.new, rest)),
            None => Cow::Borrowed(command),
        }
    }

    pub fn apply(&self, request: &mut Request) {
        let translated = match self.translate(&request.command) {
            Cow::Owned(translated) => translated,
            Cow::Borrowed(_) => return,
        };
        tracing::debug!(from = %request.command, to = %translated, "Translated command");
        request.command = translated;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Disconnect,
    Launch,
    Attach,
    Target,
}

fn classify(command: &str) -> Route {
    match command {
        "disconnect" => Route::Disconnect,
        "launch" => Route::Launch,
        "attach" => Route::Attach,
        _ => Route::Target,
    }
}

#[derive(Debug, Default)]
enum TargetPhase {
    #[default]
    Idle,
    /// Waiting for the attach task; holds the attach request.
    Attaching(Request),
    Running,
    /// Launched with `noDebug`: no protocol stream will ever exist.
    NoDebug,
}

/// Mutable state of one bridge instance.
#[derive(Debug, Default)]
pub struct BridgeState {
    pub sequence: SequenceCounter,
    pub pending: PendingQueue,
    phase: TargetPhase,
    /// Set once the target is writable.
    target: Option<TargetConnection>,
}

impl BridgeState {
    pub fn is_connected(&self) -> bool {
        self.target.is_some()
    }
}

pub struct Bridge<R, W> {
    config: BridgeConfig,
    translator: CommandTranslator,
    state: BridgeState,
    client: ClientChannel<R, W>,
    events_tx: mpsc::Sender<TargetEvent>,
    events_rx: mpsc::Receiver<TargetEvent>,
    cancel: CancellationToken,
}

impl<R, W> Bridge<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(config: BridgeConfig, client: ClientChannel<R, W>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let translator = CommandTranslator::new(&config.legacy_prefix, &config.new_prefix);
        Self {
            config,
            translator,
            state: BridgeState::default(),
            client,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Serve until the session ends. Returns the exit code for the process.
    ///
    /// Helper tasks are cancelled on return, which also kills a launched debuggee.
    pub async fn run(mut self) -> Result<i32> {
        let result = self.run_loop().await;
        self.cancel.cancel();
        result
    }

    async fn run_loop(&mut self) -> Result<i32> {
        loop {
            let flow = tokio::select! {
                frame = self.client.next_frame() => self.on_client_frame(frame).await?,
                Some(event) = self.events_rx.recv() => self.on_target_event(event).await?,
            };
            if let ControlFlow::Break(code) = flow {
                tracing::debug!(code, sequence = self.state.sequence.current(), "Bridge exiting");
                return Ok(code);
            }
        }
    }

    async fn on_client_frame(
        &mut self,
        frame: Option<std::result::Result<Bytes, CodecError>>,
    ) -> Result<Flow> {
        let payload = match frame {
            Some(frame) => frame?,
            None => {
                tracing::info!("Client closed the input stream");
                return Ok(ControlFlow::Break(0));
            }
        };

        // Every consumed header advances the outbound counter.
        self.state.sequence.next();

        let request = match Request::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(&payload),
                    "Dropping unroutable client message"
                );
                return Ok(ControlFlow::Continue(()));
            }
        };
        tracing::debug!(seq = request.seq, command = %request.command, "Received request");
        self.on_request(request).await
    }

    async fn on_request(&mut self, request: Request) -> Result<Flow> {
        let route = classify(&request.command);
        let started = !matches!(self.state.phase, TargetPhase::Idle);

        match route {
            Route::Disconnect => {
                self.respond(Response::success(&request)).await?;
                tracing::info!(seq = request.seq, "Disconnect requested, shutting down");
                Ok(ControlFlow::Break(0))
            }
            Route::Launch | Route::Attach if started => {
                tracing::warn!(command = %request.command, "Target already started, rejecting");
                self.respond(Response::failure(&request, "target already started"))
                    .await?;
                Ok(ControlFlow::Continue(()))
            }
            Route::Launch => self.launch(request).await,
            Route::Attach => self.attach(request).await,
            Route::Target if matches!(self.state.phase, TargetPhase::NoDebug) => {
                self.reject_without_session(&request).await?;
                Ok(ControlFlow::Continue(()))
            }
            Route::Target => {
                match self.state.target.as_mut() {
                    Some(target) => send_request(target, &self.translator, request).await,
                    None => {
                        tracing::trace!(seq = request.seq, command = %request.command, "Queueing request until target connects");
                        self.state.pending.push(request);
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    async fn launch(&mut self, request: Request) -> Result<Flow> {
        let options = match LaunchOptions::from_request(&request, &self.config) {
            Ok(options) => options,
            Err(e) => return self.abort(&request, e).await,
        };

        let launched = match launch::spawn(
            &options,
            self.events_tx.clone(),
            self.cancel.child_token(),
        ) {
            Ok(launched) => launched,
            Err(e) => return self.abort(&request, e.into()).await,
        };

        match launched.protocol {
            Some(writer) => {
                self.state.phase = TargetPhase::Running;
                let target = TargetConnection::Process {
                    pid: launched.pid,
                    writer,
                };
                self.establish(target, &request).await;
            }
            None => {
                // Nothing on the other side answers in noDebug mode.
                self.state.phase = TargetPhase::NoDebug;
                self.respond(Response::success(&request)).await?;
                for pending in self.state.pending.drain() {
                    self.reject_without_session(&pending).await?;
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn reject_without_session(&mut self, request: &Request) -> Result<()> {
        tracing::debug!(seq = request.seq, command = %request.command, "No debug session, rejecting request");
        self.respond(Response::failure(request, NO_DEBUG_SESSION))
            .await
    }

    async fn attach(&mut self, request: Request) -> Result<Flow> {
        let options = match AttachOptions::from_request(&request, &self.config) {
            Ok(options) => options,
            Err(e) => return self.abort(&request, e).await,
        };

        tracing::info!(addr = %options.addr(), "Attaching to target");
        attach::spawn_connect(
            options,
            self.config.retry,
            self.events_tx.clone(),
            self.cancel.child_token(),
        );
        self.state.phase = TargetPhase::Attaching(request);
        Ok(ControlFlow::Continue(()))
    }

    /// Report a failed launch/attach to the client and end the session.
    async fn abort(&mut self, request: &Request, error: BridgeError) -> Result<Flow> {
        tracing::error!(command = %request.command, error = %error, "Cannot start target");
        self.respond(Response::failure(request, error.to_string()))
            .await?;
        Ok(ControlFlow::Break(1))
    }

    /// Handshake first, then the pending queue, then mark the target writable.
    async fn establish(&mut self, mut target: TargetConnection, handshake: &Request) {
        tracing::info!(kind = target.kind(), ?target, "Target connected");
        if let Err(e) = target.send(handshake).await {
            tracing::warn!(command = %handshake.command, error = %e, "Failed to send handshake to target");
        }

        let pending = self.state.pending.drain();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing pending requests");
        }
        for request in pending {
            send_request(&mut target, &self.translator, request).await;
        }

        self.state.target = Some(target);
    }

    async fn on_target_event(&mut self, event: TargetEvent) -> Result<Flow> {
        match event {
            TargetEvent::Message(message) => self.on_target_message(&message).await?,
            TargetEvent::Output { category, text } => {
                self.emit(Event::output(category, text)).await?
            }
            TargetEvent::Connected(result) => return self.on_connected(result).await,
            TargetEvent::Closed { error } => {
                match &error {
                    Some(e) => tracing::warn!(error = %e, "Target stream failed"),
                    None => tracing::debug!("Target stream closed"),
                }
                let socket = self
                    .state
                    .target
                    .as_ref()
                    .is_some_and(TargetConnection::is_socket);
                if socket {
                    tracing::warn!("Target closed the connection, shutting down");
                    return Ok(ControlFlow::Break(0));
                }
                // A launched debuggee ends the session through its exit status.
            }
            TargetEvent::Exited { code } => {
                tracing::info!(code, "Debuggee exited");
                return Ok(ControlFlow::Break(code));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_connected(
        &mut self,
        result: std::result::Result<TcpStream, ConnectError>,
    ) -> Result<Flow> {
        let request = match std::mem::replace(&mut self.state.phase, TargetPhase::Running) {
            TargetPhase::Attaching(request) => request,
            other => {
                tracing::warn!(phase = ?other, "Connection result without a pending attach");
                self.state.phase = other;
                return Ok(ControlFlow::Continue(()));
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Unable to attach to target");
                let code = e.exit_code();
                self.respond(Response::failure(&request, e.to_string()))
                    .await?;
                return Ok(ControlFlow::Break(code));
            }
        };

        let target = match TargetConnection::socket(
            stream,
            self.events_tx.clone(),
            self.cancel.child_token(),
        ) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(error = %e, "Connected socket is unusable");
                let code = e.raw_os_error().unwrap_or(1);
                self.respond(Response::failure(&request, e.to_string()))
                    .await?;
                return Ok(ControlFlow::Break(code));
            }
        };

        self.establish(target, &request).await;
        self.respond(Response::success(&request)).await?;
        Ok(ControlFlow::Continue(()))
    }

    async fn on_target_message(&mut self, message: &[u8]) -> Result<()> {
        let message = match serde_json::from_slice::<Value>(message) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                tracing::warn!(
                    message = %String::from_utf8_lossy(message),
                    "Dropping target message that is not a JSON object"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    message = %String::from_utf8_lossy(message),
                    "Dropping malformed target message"
                );
                return Ok(());
            }
        };
        self.emit_value(message).await
    }

    async fn respond(&mut self, response: Response) -> Result<()> {
        self.emit(response).await
    }

    async fn emit<T: Serialize>(&mut self, message: T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.emit_value(value).await
    }

    /// Stamp the next sequence number and write to the client.
    async fn emit_value(&mut self, mut message: Value) -> Result<()> {
        let seq = self.state.sequence.next();
        set_sequence(&mut message, seq)?;
        tracing::trace!(seq, "Writing message to client");
        self.client.write(&message).await?;
        Ok(())
    }
}

/// Translate and send one client request. Write failures are only logged: a dead
/// target surfaces as a close or exit event.
async fn send_request(
    target: &mut TargetConnection,
    translator: &CommandTranslator,
    mut request: Request,
) {
    translator.apply(&mut request);
    if let Err(e) = target.send(&request).await {
        tracing::warn!(
            seq = request.seq,
            command = %request.command,
            error = %e,
            "Failed to send request to target"
        );
    }
}
