//! The protocol engine: owns the connection lifecycle, the inbound pipeline
//! (extract, slurp, defer, dispatch) and the recovery policies.

pub mod handshake;
pub mod recovery;

pub use handshake::LoadOptions;
pub use recovery::{CloseReason, FatalError, RecoveryPolicy};

use anyhow::Result;
use std::collections::VecDeque;
use std::future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::protocol::{
    json_trailer, DataUrlDecoder, FrameExtractor, ImageDecoder, InboundEvent, ServerCommand,
    ServerInfo, PROTOCOL_VERSION,
};
use crate::sync::{DeferralBuffer, SlurpQueue, DEFERRAL_RETRY_INTERVAL, SLURP_FLUSH_DELAY};
use crate::transport::{OutboundMessage, SocketEvent, TransportFactory, TransportSocket};

/// Delay between a socket close and the reconnect decision, so any `close:`
/// line still sitting in the slurp queue is processed first.
const RECONNECT_DECISION_DELAY: Duration = Duration::from_millis(1);

/// Delay before retrying after a failed connection attempt.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Delay before reloading after a forced-reload close (version restore,
/// rename, conflict overwrite).
const FORCE_RELOAD_DELAY: Duration = Duration::from_secs(3);

/// Warn this long before the access token expires.
const TOKEN_EXPIRY_WARNING: Duration = Duration::from_secs(900);

/// Re-warn interval once the first expiry warning has fired.
const TOKEN_REWARN_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, no pending attempt.
    Closed,
    Connecting,
    Connected,
    /// Closed, with a reconnect attempt scheduled.
    Reconnecting,
}

/// Which password the server is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    ToView,
    ToModify,
}

impl PasswordKind {
    fn from_error_kind(kind: &str) -> Self {
        match kind.split(':').nth(1) {
            Some("to-modify") => PasswordKind::ToModify,
            _ => PasswordKind::ToView,
        }
    }
}

/// Resolution of a storage conflict, chosen by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Drop local changes and close.
    Discard,
    /// Overwrite the storage copy with the local state.
    Overwrite,
    /// Save the local state under a new name.
    SaveAs(String),
    Cancel,
}

/// Collaborator surface. The engine calls these from its own task; decisions
/// (passwords, conflicts) are returned synchronously.
pub trait EngineHandler: Send + 'static {
    /// One fully extracted, parsed inbound message. An error here is logged
    /// and never aborts the batch.
    fn on_decoded(&mut self, event: &InboundEvent, command: &ServerCommand) -> Result<()>;

    fn on_connection_state(&mut self, state: ConnectionState);

    fn on_fatal_error(&mut self, error: &FatalError);

    /// Gating predicate for the deferrable message classes: false until the
    /// document layer exists.
    fn ready_for_dispatch(&self) -> bool;

    /// Current document part, when a document was already open. Sent back on
    /// reconnect so the server restores the same view.
    fn current_part(&self) -> Option<i64> {
        None
    }

    fn on_server_info(&mut self, _info: &ServerInfo) {}

    /// `progress:` status updates (`start`, `setvalue`, `finish`, ...).
    fn on_progress(&mut self, _status: &str, _value: Option<serde_json::Value>) {}

    /// The document needs a password (or the last one was wrong). Return the
    /// password to retry with, or `None` to give up; giving up on a
    /// modify-password still reopens read-only.
    fn on_password_required(&mut self, _kind: PasswordKind, _retry: bool) -> Option<String> {
        None
    }

    /// The storage copy changed under us; pick what happens to the local
    /// unsaved changes.
    fn on_document_conflict(&mut self) -> ConflictChoice {
        ConflictChoice::Cancel
    }

    /// Non-fatal, user-visible warning lines.
    fn on_warning(&mut self, _msg: &str) {}

    /// Access token expiry countdown; `expired` once past the deadline.
    fn on_session_expiry(&mut self, _expired: bool) {}

    /// A batch dispatch pass is starting; a renderer can pause reflow.
    fn on_batch_start(&mut self) {}

    /// A slurped batch has been fully dispatched.
    fn on_batch_settled(&mut self) {}
}

/// Requests from the application into the engine task.
enum EngineCommand {
    Send(OutboundMessage),
    SetActive(bool),
    Reload,
    Close,
}

/// Cloneable application-side handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn send(&self, msg: impl Into<String>) {
        let _ = self.tx.send(EngineCommand::Send(OutboundMessage::Text(msg.into())));
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(EngineCommand::Send(OutboundMessage::Binary(bytes)));
    }

    /// Toggle user activity. Going inactive gates all outbound traffic except
    /// the activity toggles themselves; going active reconnects if needed.
    pub fn set_active(&self, active: bool) {
        let _ = self.tx.send(EngineCommand::SetActive(active));
    }

    /// Tear down and reconnect immediately.
    pub fn reload(&self) {
        let _ = self.tx.send(EngineCommand::Reload);
    }

    pub fn close(&self) {
        let _ = self.tx.send(EngineCommand::Close);
    }
}

struct Connection {
    id: u64,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    task: JoinHandle<()>,
}

pub struct ProtocolEngine<H: EngineHandler> {
    config: EngineConfig,
    factory: Arc<dyn TransportFactory>,
    handler: H,

    extractor: FrameExtractor,
    wake_rx: mpsc::UnboundedReceiver<()>,
    slurp: SlurpQueue,
    deferral: DeferralBuffer,

    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    event_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
    event_rx: mpsc::UnboundedReceiver<(u64, SocketEvent)>,

    conn: Option<Connection>,
    conn_seq: u64,
    state: ConnectionState,
    fatal: Option<FatalError>,
    active: bool,
    document_idle: bool,
    server_recycling: bool,
    doc_loaded_once: bool,
    server_version: Option<String>,
    reconnect_count: u32,
    password: Option<String>,
    pending_sends: VecDeque<OutboundMessage>,

    slurp_deadline: Option<Instant>,
    deferral_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    token_deadline: Option<Instant>,
    shutting_down: bool,
}

impl<H: EngineHandler> ProtocolEngine<H> {
    /// Start the engine task. The handle is the application's only way in;
    /// everything outbound flows through the handler.
    pub fn spawn(
        config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
        handler: H,
    ) -> (EngineHandle, JoinHandle<()>) {
        Self::spawn_with_decoder(config, factory, Arc::new(DataUrlDecoder), handler)
    }

    /// [`Self::spawn`] with the dialog-bitmap decoder injected.
    pub fn spawn_with_decoder(
        config: EngineConfig,
        factory: Arc<dyn TransportFactory>,
        decoder: Arc<dyn ImageDecoder>,
        handler: H,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            factory,
            handler,
            extractor: FrameExtractor::new(decoder, wake_tx),
            wake_rx,
            slurp: SlurpQueue::new(),
            deferral: DeferralBuffer::new(),
            cmd_rx,
            event_tx,
            event_rx,
            conn: None,
            conn_seq: 0,
            state: ConnectionState::Closed,
            fatal: None,
            active: true,
            document_idle: false,
            server_recycling: false,
            doc_loaded_once: false,
            server_version: None,
            reconnect_count: 0,
            password: None,
            pending_sends: VecDeque::new(),
            slurp_deadline: None,
            deferral_deadline: None,
            reconnect_deadline: None,
            token_deadline: None,
            shutting_down: false,
        };
        let task = tokio::spawn(engine.run());
        (EngineHandle { tx: cmd_tx }, task)
    }

    async fn run(mut self) {
        self.connect().await;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                    if self.shutting_down {
                        break;
                    }
                }
                event = self.event_rx.recv() => {
                    // The engine holds an event_tx clone, so this never ends.
                    if let Some((conn_id, event)) = event {
                        self.handle_socket_event(conn_id, event).await;
                    }
                }
                _ = self.wake_rx.recv() => {
                    // An async image finished decoding; resume the batch.
                    self.flush_slurp();
                }
                _ = sleep_until_opt(self.slurp_deadline) => {
                    self.slurp_deadline = None;
                    self.flush_slurp();
                }
                _ = sleep_until_opt(self.deferral_deadline) => {
                    self.deferral_deadline = None;
                    self.drain_deferral();
                }
                _ = sleep_until_opt(self.reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    if self.state != ConnectionState::Connected {
                        // A fired retry timer reactivates the session.
                        self.active = true;
                        self.connect().await;
                    }
                }
                _ = sleep_until_opt(self.token_deadline) => {
                    self.fire_token_warning();
                }
            }
        }
        self.teardown();
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Send(msg) => self.send_message(msg).await,
            EngineCommand::SetActive(active) => {
                self.active = active;
                if active {
                    self.document_idle = false;
                    if self.state == ConnectionState::Closed && self.fatal.is_none() {
                        self.connect().await;
                    }
                }
            }
            EngineCommand::Reload => {
                self.teardown();
                self.fatal = None;
                self.connect().await;
            }
            EngineCommand::Close => {
                self.teardown();
                self.shutting_down = true;
            }
        }
    }

    /// Outbound gate: nothing leaves in the fatal state, and only the
    /// activity toggles leave while inactive. A message sent while the
    /// socket is down is queued and triggers a reconnect.
    async fn send_message(&mut self, msg: OutboundMessage) {
        if self.fatal.is_some() {
            return;
        }
        if !self.active {
            let allowed = msg
                .as_text()
                .is_some_and(|t| t.starts_with("useractive") || t.starts_with("userinactive"));
            if !allowed {
                if let Some(text) = msg.as_text() {
                    tracing::debug!(
                        target = "driftwood::session",
                        msg = %text,
                        "dropping outgoing message while inactive"
                    );
                }
                return;
            }
        }
        match self.state {
            ConnectionState::Connected => self.transmit(msg),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.pending_sends.push_back(msg);
            }
            ConnectionState::Closed => {
                self.pending_sends.push_back(msg);
                if self.fatal.is_none() {
                    self.connect().await;
                }
            }
        }
    }

    fn transmit(&mut self, msg: OutboundMessage) {
        if let Some(text) = msg.as_text() {
            tracing::debug!(target = "driftwood::session", direction = "outgoing", msg = %text);
        }
        if let Some(conn) = &self.conn {
            if conn.out_tx.send(msg).is_err() {
                tracing::warn!(target = "driftwood::session", "send on a closing connection");
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.handler.on_connection_state(state);
        }
    }

    /// Open a fresh socket and start its pump task. Previous connections are
    /// torn down first so stale events cannot reach the pipeline.
    async fn connect(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Connecting);
        let socket = match self.factory.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(target = "driftwood::session", error = %e, "connection attempt failed");
                self.set_state(ConnectionState::Reconnecting);
                self.reconnect_deadline = Some(Instant::now() + CONNECT_RETRY_DELAY);
                return;
            }
        };
        self.conn_seq += 1;
        let id = self.conn_seq;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(id, socket, out_rx, self.event_tx.clone()));
        self.conn = Some(Connection { id, out_tx, task });
    }

    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.task.abort();
        }
        self.slurp_deadline = None;
        self.token_deadline = None;
        // Deferred state must not leak into the next connection.
        self.deferral.clear();
        self.deferral_deadline = None;
    }

    async fn handle_socket_event(&mut self, conn_id: u64, event: SocketEvent) {
        // A torn-down connection's pump may still have events in flight.
        if self.conn.as_ref().map(|c| c.id) != Some(conn_id) {
            return;
        }
        match event {
            SocketEvent::Opened => self.on_open(),
            SocketEvent::Message(payload) => {
                if let crate::transport::SocketPayload::Binary(bytes) = &payload {
                    crate::telemetry::record_bytes("inbound_binary", bytes.len());
                }
                let event = self.extractor.extract(payload);
                if self.slurp.push(event) {
                    self.slurp_deadline = Some(Instant::now() + SLURP_FLUSH_DELAY);
                }
            }
            SocketEvent::Error(e) => {
                tracing::warn!(target = "driftwood::session", error = %e, "socket error");
            }
            SocketEvent::Closed { reason } => self.on_close(reason).await,
        }
    }

    /// Handshake, then drain the queued sends in order.
    fn on_open(&mut self) {
        self.server_recycling = false;
        self.document_idle = false;
        self.set_state(ConnectionState::Connected);

        self.transmit(OutboundMessage::Text(handshake::coolclient_line()));
        let part = if self.doc_loaded_once {
            self.handler.current_part()
        } else {
            None
        };
        let load = handshake::load_command(&self.config.load, part, self.password.as_deref());
        self.transmit(OutboundMessage::Text(load));

        while let Some(msg) = self.pending_sends.pop_front() {
            self.transmit(msg);
        }
        self.arm_token_warning();
    }

    async fn on_close(&mut self, reason: Option<String>) {
        self.teardown();

        // Process anything still slurped first; a `close: idle` in there
        // decides whether we reconnect at all.
        self.flush_slurp();

        if let Some(reason) = reason.as_deref().filter(|r| r.starts_with("error:")) {
            if !self.doc_loaded_once {
                let command = ServerCommand::parse(reason);
                let error = match (command.error_cmd.as_deref(), command.error_kind.as_deref()) {
                    (Some("internal"), Some("unauthorized")) => {
                        FatalError::Unauthorized(reason.to_string())
                    }
                    _ => FatalError::FailedDocLoading,
                };
                self.enter_fatal(error);
                return;
            }
        }

        if self.fatal.is_some() || self.shutting_down {
            self.set_state(ConnectionState::Closed);
            return;
        }
        if self.document_idle {
            // Idle suspension: wait for a user gesture instead of retrying.
            self.active = false;
            self.set_state(ConnectionState::Closed);
            return;
        }
        if self.reconnect_deadline.is_some() {
            // A recovery policy already scheduled the retry.
            self.set_state(ConnectionState::Reconnecting);
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_deadline = Some(Instant::now() + RECONNECT_DECISION_DELAY);
    }

    fn enter_fatal(&mut self, error: FatalError) {
        tracing::error!(target = "driftwood::session", error = %error, "fatal protocol error");
        self.teardown();
        self.fatal = Some(error.clone());
        self.pending_sends.clear();
        self.set_state(ConnectionState::Closed);
        self.handler.on_fatal_error(&error);
    }

    /// Dispatch the slurped batch in arrival order, stopping at the first
    /// still-loading image.
    fn flush_slurp(&mut self) {
        if self.slurp.is_empty() {
            return;
        }
        let _perf = crate::telemetry::PerfGuard::new("slurp_flush");
        self.handler.on_batch_start();
        // Dispatch is fully synchronous on this task, so nothing can land in
        // the queue behind our back while it is swapped out.
        let mut queue = std::mem::take(&mut self.slurp);
        let outcome = queue.flush(|event| {
            self.process_inbound(event);
            Ok(())
        });
        self.slurp = queue;
        if let crate::sync::FlushOutcome::Stalled { remaining, .. } = outcome {
            tracing::debug!(
                target = "driftwood::session",
                remaining,
                "batch stalled on a loading image"
            );
        }
        // Drawing resumes after every pass, stalled or not; a renderer must
        // never stay paused across an image decode.
        self.handler.on_batch_settled();
        if !self.deferral.is_empty() && self.deferral_deadline.is_none() {
            self.deferral_deadline = Some(Instant::now() + DEFERRAL_RETRY_INTERVAL);
        }
    }

    fn drain_deferral(&mut self) {
        let ready = self.handler.ready_for_dispatch();
        let zoom = self.config.zoom;
        let handler = &mut self.handler;
        self.deferral.drain(ready, |msg| {
            let event = InboundEvent::text(msg);
            let command = ServerCommand::parse_with(&event.text_msg, Some(zoom));
            handler.on_decoded(&event, &command)
        });
        if !self.deferral.is_empty() {
            self.deferral_deadline = Some(Instant::now() + DEFERRAL_RETRY_INTERVAL);
        }
    }

    /// One extracted message: engine-level interception first, then the
    /// deferral gate, then the collaborator.
    fn process_inbound(&mut self, event: &InboundEvent) {
        let text = event.text_msg.clone();
        tracing::debug!(target = "driftwood::session", direction = "incoming", msg = %text);

        if let Some(rest) = text.strip_prefix("coolserver ") {
            self.on_server_line(rest);
            return;
        }
        if let Some(reason) = text.strip_prefix("close: ") {
            self.on_close_line(reason);
            return;
        }
        if text.starts_with("error:") {
            let command = ServerCommand::parse(&text);
            if self.on_error_line(&text, &command) {
                return;
            }
        }
        if text.starts_with("progress:") {
            self.on_progress_line(&text);
            return;
        }
        if text.starts_with("pong ") {
            let command = ServerCommand::parse(&text);
            tracing::debug!(
                target = "driftwood::session",
                rendercount = command.rendercount.unwrap_or(0),
                "pong"
            );
            return;
        }

        if self.deferral.should_defer(&text, self.handler.ready_for_dispatch()) {
            self.deferral.defer(text);
            if self.deferral_deadline.is_none() {
                self.deferral_deadline = Some(Instant::now() + DEFERRAL_RETRY_INTERVAL);
            }
            return;
        }

        let command = ServerCommand::parse_with(&text, Some(self.config.zoom));
        if let Err(e) = self.handler.on_decoded(event, &command) {
            tracing::error!(
                target = "driftwood::session",
                error = %e,
                msg = %text,
                "handler error on inbound message"
            );
        }
    }

    fn on_server_line(&mut self, rest: &str) {
        let Some(info) = ServerInfo::from_line(rest) else {
            tracing::warn!(target = "driftwood::session", line = %rest, "malformed coolserver line");
            return;
        };
        if !info.protocol.is_empty() && info.protocol != PROTOCOL_VERSION {
            self.enter_fatal(FatalError::UnsupportedServerVersion);
            return;
        }
        tracing::info!(
            target = "driftwood::session",
            id = %info.id,
            version = %info.version,
            "connected to server"
        );
        // A different server version on reconnect means we were upgraded
        // under a live document.
        if let Some(previous) = self.server_version.replace(info.version.clone()) {
            if previous != info.version {
                self.handler
                    .on_warning("server has been updated, please reload the document");
            }
        }
        self.handler.on_server_info(&info);
    }

    fn on_close_line(&mut self, reason: &str) {
        let reason = CloseReason::classify(reason);
        tracing::info!(target = "driftwood::session", reason = ?reason, "server close notice");
        match reason.policy() {
            RecoveryPolicy::CloseSession => {
                self.enter_fatal(FatalError::OwnerTermination);
            }
            RecoveryPolicy::DocumentIdle => {
                self.document_idle = true;
                self.active = false;
            }
            RecoveryPolicy::PassiveWait => {
                self.active = false;
                self.server_recycling = true;
                self.handler
                    .on_warning("server is shutting down for maintenance, saving the document");
            }
            RecoveryPolicy::Reconnect => {
                // The transport close that follows schedules the retry.
            }
            RecoveryPolicy::RecyclingPoll => {
                self.active = false;
                self.server_recycling = true;
                let delay = recovery::recycling_backoff(&mut rand::thread_rng());
                self.reconnect_deadline = Some(Instant::now() + delay);
            }
            RecoveryPolicy::ConflictPrompt => self.resolve_conflict(),
            RecoveryPolicy::ForceReload => {
                self.handler
                    .on_warning("the document changed on the server, reloading");
                self.teardown();
                self.set_state(ConnectionState::Reconnecting);
                self.reconnect_deadline = Some(Instant::now() + FORCE_RELOAD_DELAY);
            }
        }
    }

    /// Returns true when the message was consumed here.
    fn on_error_line(&mut self, text: &str, command: &ServerCommand) -> bool {
        let error_cmd = command.error_cmd.as_deref().unwrap_or("");
        let error_kind = command.error_kind.as_deref().unwrap_or("");
        match error_cmd {
            "storage" | "saveas" | "downloadas" | "exportas" => {
                if error_kind == "documentconflict" {
                    self.resolve_conflict();
                    return true;
                }
                if error_kind == "loadfailed" {
                    self.handler.on_warning(text);
                    self.teardown();
                    return true;
                }
                // Storage warnings are the collaborator's to present.
                false
            }
            "internal" => {
                let error = match error_kind {
                    "diskfull" => FatalError::DiskFull,
                    "unauthorized" => FatalError::Unauthorized(text.to_string()),
                    _ => FatalError::FailedDocLoading,
                };
                self.enter_fatal(error);
                true
            }
            "load" => self.on_load_error(error_kind),
            _ => {
                if error_kind == "hardlimitreached" {
                    self.enter_fatal(FatalError::HardLimitReached);
                    return true;
                }
                if error_kind == "serviceunavailable" {
                    self.enter_fatal(FatalError::ServiceUnavailable);
                    return true;
                }
                false
            }
        }
    }

    /// Returns true when the load-error kind was handled here; unrecognized
    /// kinds flow through to the collaborator.
    fn on_load_error(&mut self, error_kind: &str) -> bool {
        if error_kind.starts_with("passwordrequired") || error_kind.starts_with("wrongpassword") {
            let retry = error_kind.starts_with("wrongpassword");
            let kind = if retry {
                PasswordKind::ToView
            } else {
                PasswordKind::from_error_kind(error_kind)
            };
            self.teardown();
            match self.handler.on_password_required(kind, retry) {
                Some(password) => {
                    self.password = Some(password);
                    self.set_state(ConnectionState::Reconnecting);
                    self.reconnect_deadline = Some(Instant::now());
                }
                None if kind == PasswordKind::ToModify => {
                    // Declined: reopen in view-only mode.
                    self.password = Some(String::new());
                    self.set_state(ConnectionState::Reconnecting);
                    self.reconnect_deadline = Some(Instant::now());
                }
                None => {
                    self.set_state(ConnectionState::Closed);
                }
            }
            true
        } else if error_kind.starts_with("faileddocloading") {
            self.enter_fatal(FatalError::FailedDocLoading);
            true
        } else if error_kind.starts_with("docloadtimeout") {
            self.enter_fatal(FatalError::DocLoadTimeout);
            true
        } else if error_kind.starts_with("docunloading") {
            // The document is still unloading on the server; back off.
            self.active = false;
            self.reconnect_count += 1;
            match recovery::doc_unloading_backoff(self.reconnect_count) {
                Some(delay) => {
                    self.teardown();
                    self.set_state(ConnectionState::Reconnecting);
                    self.reconnect_deadline = Some(Instant::now() + delay);
                    if self.reconnect_count > 1 {
                        self.handler.on_warning("still unloading, retrying");
                    }
                }
                None => self.enter_fatal(FatalError::DocUnloadingGiveUp),
            }
            true
        } else {
            false
        }
    }

    fn resolve_conflict(&mut self) {
        match self.handler.on_document_conflict() {
            ConflictChoice::Discard => self.transmit(OutboundMessage::Text("closedocument".into())),
            ConflictChoice::Overwrite => {
                self.transmit(OutboundMessage::Text("savetostorage force=1".into()))
            }
            ConflictChoice::SaveAs(name) => {
                self.transmit(OutboundMessage::Text(format!("saveas url={name}")))
            }
            ConflictChoice::Cancel => {}
        }
    }

    fn on_progress_line(&mut self, text: &str) {
        let Some(info) = json_trailer(text) else {
            tracing::warn!(target = "driftwood::session", line = %text, "malformed progress line");
            return;
        };
        let status = info.get("id").and_then(|v| v.as_str()).unwrap_or("");
        match status {
            "find" | "connect" | "ready" => {
                if status == "ready" {
                    // Fully loaded: retry counting starts over.
                    self.doc_loaded_once = true;
                    self.reconnect_count = 0;
                    self.reconnect_deadline = None;
                }
                self.handler.on_progress(status, info.get("value").cloned());
            }
            "start" | "setvalue" | "finish" => {
                self.handler.on_progress(status, info.get("value").cloned());
                if status == "finish" && self.server_recycling {
                    self.handler.on_warning("server is shutting down");
                }
            }
            other => {
                tracing::warn!(target = "driftwood::session", status = %other, "unknown progress status");
            }
        }
    }

    fn arm_token_warning(&mut self) {
        let Some(ttl_ms) = self.config.access_token_ttl_ms else {
            return;
        };
        let now_ms = unix_millis();
        let warn_at_ms = ttl_ms.saturating_sub(TOKEN_EXPIRY_WARNING.as_millis() as u64);
        let delay = Duration::from_millis(warn_at_ms.saturating_sub(now_ms));
        self.token_deadline = Some(Instant::now() + delay);
    }

    fn fire_token_warning(&mut self) {
        let Some(ttl_ms) = self.config.access_token_ttl_ms else {
            self.token_deadline = None;
            return;
        };
        let expired = ttl_ms <= unix_millis();
        self.handler.on_session_expiry(expired);
        self.token_deadline = Some(Instant::now() + TOKEN_REWARN_INTERVAL);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

enum PumpStep {
    Outbound(Option<OutboundMessage>),
    Inbound(Option<SocketEvent>),
}

/// Per-connection task: owns the socket, forwards outbound messages and tags
/// inbound events with the connection id so the engine can discard events
/// from a connection it already replaced.
async fn pump(
    id: u64,
    mut socket: Box<dyn TransportSocket>,
    mut out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    event_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
) {
    loop {
        let step = tokio::select! {
            msg = out_rx.recv() => PumpStep::Outbound(msg),
            event = socket.recv() => PumpStep::Inbound(event),
        };
        match step {
            PumpStep::Outbound(Some(msg)) => {
                if let Err(e) = socket.send(msg).await {
                    tracing::warn!(target = "driftwood::session", error = %e, "socket send failed");
                }
            }
            PumpStep::Outbound(None) => {
                socket.shutdown().await;
                break;
            }
            PumpStep::Inbound(Some(event)) => {
                let closed = matches!(event, SocketEvent::Closed { .. });
                if event_tx.send((id, event)).is_err() || closed {
                    break;
                }
            }
            PumpStep::Inbound(None) => {
                let _ = event_tx.send((id, SocketEvent::Closed { reason: None }));
                break;
            }
        }
    }
}
