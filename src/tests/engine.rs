//! Engine behaviour over a loopback transport: handshake, ordering, the
//! recovery table, and the outbound gates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::protocol::{ImageDecoder, InboundEvent, ServerCommand, ServerInfo};
use crate::session::{
    ConflictChoice, ConnectionState, EngineHandle, EngineHandler, FatalError, PasswordKind,
    ProtocolEngine,
};
use crate::transport::loopback::{LoopbackFactory, LoopbackRemote};
use crate::transport::OutboundMessage;

#[derive(Default)]
struct Recorded {
    decoded: Vec<String>,
    states: Vec<ConnectionState>,
    fatals: Vec<FatalError>,
    warnings: Vec<String>,
    expiries: Vec<bool>,
    password_asks: Vec<(PasswordKind, bool)>,
    batch_starts: usize,
    batch_settles: usize,
}

#[derive(Clone)]
struct RecordingHandler {
    recorded: Arc<Mutex<Recorded>>,
    ready: Arc<AtomicBool>,
    part: Option<i64>,
    password: Arc<Mutex<Option<String>>>,
    conflict: Arc<Mutex<ConflictChoice>>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            ready: Arc::new(AtomicBool::new(true)),
            part: None,
            password: Arc::new(Mutex::new(None)),
            conflict: Arc::new(Mutex::new(ConflictChoice::Cancel)),
        }
    }

    fn decoded(&self) -> Vec<String> {
        self.recorded.lock().unwrap().decoded.clone()
    }

    fn fatals(&self) -> Vec<FatalError> {
        self.recorded.lock().unwrap().fatals.clone()
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn warnings(&self) -> Vec<String> {
        self.recorded.lock().unwrap().warnings.clone()
    }

    fn batch_counts(&self) -> (usize, usize) {
        let recorded = self.recorded.lock().unwrap();
        (recorded.batch_starts, recorded.batch_settles)
    }
}

impl EngineHandler for RecordingHandler {
    fn on_decoded(&mut self, event: &InboundEvent, _command: &ServerCommand) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .decoded
            .push(event.text_msg.clone());
        Ok(())
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        self.recorded.lock().unwrap().states.push(state);
    }

    fn on_fatal_error(&mut self, error: &FatalError) {
        self.recorded.lock().unwrap().fatals.push(error.clone());
    }

    fn ready_for_dispatch(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn current_part(&self) -> Option<i64> {
        self.part
    }

    fn on_server_info(&mut self, _info: &ServerInfo) {}

    fn on_password_required(&mut self, kind: PasswordKind, retry: bool) -> Option<String> {
        self.recorded
            .lock()
            .unwrap()
            .password_asks
            .push((kind, retry));
        self.password.lock().unwrap().take()
    }

    fn on_document_conflict(&mut self) -> ConflictChoice {
        self.conflict.lock().unwrap().clone()
    }

    fn on_warning(&mut self, msg: &str) {
        self.recorded.lock().unwrap().warnings.push(msg.to_string());
    }

    fn on_session_expiry(&mut self, expired: bool) {
        self.recorded.lock().unwrap().expiries.push(expired);
    }

    fn on_batch_start(&mut self) {
        self.recorded.lock().unwrap().batch_starts += 1;
    }

    fn on_batch_settled(&mut self) {
        self.recorded.lock().unwrap().batch_settles += 1;
    }
}

struct Harness {
    handle: EngineHandle,
    task: JoinHandle<()>,
    remotes: mpsc::UnboundedReceiver<LoopbackRemote>,
    handler: RecordingHandler,
}

impl Harness {
    async fn next_remote(&mut self) -> LoopbackRemote {
        self.remotes.recv().await.expect("connection attempt")
    }

    async fn finish(self) {
        self.handle.close();
        let _ = self.task.await;
    }
}

fn start(config: EngineConfig, handler: RecordingHandler) -> Harness {
    let (factory, remotes) = LoopbackFactory::new(true);
    let (handle, task) = ProtocolEngine::spawn(config, Arc::new(factory), handler.clone());
    Harness {
        handle,
        task,
        remotes,
        handler,
    }
}

fn doc_config() -> EngineConfig {
    EngineConfig::for_document("https://example.com/doc.odt")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

async fn recv_text(remote: &mut LoopbackRemote) -> String {
    match remote.next_outbound().await {
        Some(OutboundMessage::Text(text)) => text,
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Decoder that holds dialog bitmaps until released, so a batch can be
/// observed mid-stall.
struct GatedDecoder {
    release: Arc<Notify>,
}

#[async_trait]
impl ImageDecoder for GatedDecoder {
    async fn decode(&self, _src: &str) -> Result<()> {
        self.release.notified().await;
        Ok(())
    }
}

/// Consume and sanity-check the two handshake frames.
async fn skip_handshake(remote: &mut LoopbackRemote) -> String {
    let hello = recv_text(remote).await;
    assert!(hello.starts_with("coolclient 0.1 "), "got {hello}");
    let load = recv_text(remote).await;
    assert!(load.starts_with("load url="), "got {load}");
    load
}

#[tokio::test(start_paused = true)]
async fn handshake_precedes_queued_sends() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    harness.handle.send("first");
    harness.handle.send("second");

    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    assert!(load.contains("url=https%3A%2F%2Fexample.com%2Fdoc.odt"));
    assert_eq!(recv_text(&mut remote).await, "first");
    assert_eq!(recv_text(&mut remote).await, "second");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn dispatches_in_arrival_order() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    for i in 0..6 {
        remote.send_text(format!("invalidatetiles: part=0 seq={i}"));
    }
    remote.send_binary(&b"delta: part=0 x=0 y=0\n\x01\x02\x03"[..]);
    settle().await;

    let decoded = harness.handler.decoded();
    assert_eq!(decoded.len(), 7);
    for (i, line) in decoded.iter().take(6).enumerate() {
        assert_eq!(line, &format!("invalidatetiles: part=0 seq={i}"));
    }
    assert_eq!(decoded[6], "delta: part=0 x=0 y=0");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn defers_view_state_until_ready() {
    let handler = RecordingHandler::new();
    handler.set_ready(false);
    let mut harness = start(doc_config(), handler);
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("viewinfo: [1]");
    remote.send_text("invalidatetiles: part=0");
    remote.send_text("statechanged: .uno:Bold=true");
    settle().await;

    // Only the non-deferrable class passes while not ready.
    assert_eq!(harness.handler.decoded(), vec!["invalidatetiles: part=0"]);

    harness.handler.set_ready(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        harness.handler.decoded(),
        vec![
            "invalidatetiles: part=0",
            "viewinfo: [1]",
            "statechanged: .uno:Bold=true"
        ]
    );

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn inactivity_gates_outbound_except_activity_toggles() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    harness.handle.set_active(false);
    settle().await;
    harness.handle.send("ping");
    harness.handle.send("useractive");
    settle().await;

    assert_eq!(recv_text(&mut remote).await, "useractive");
    assert!(remote.try_next_outbound().is_none());

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn close_idle_suspends_until_reactivated() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("close: idle");
    remote.close(None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // No automatic reconnect while idle-suspended.
    assert!(harness.remotes.try_recv().is_err());

    harness.handle.set_active(true);
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn transport_close_reconnects_with_current_part() {
    let mut handler = RecordingHandler::new();
    handler.part = Some(2);
    let mut harness = start(doc_config(), handler);
    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    assert!(!load.contains("part="), "fresh load carries no part: {load}");

    remote.send_text(r#"progress: {"id":"ready"}"#);
    settle().await;
    remote.close(None);

    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    assert!(load.contains(" part=2"), "reconnect restores part: {load}");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn owner_termination_is_fatal_and_gates_sends() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("close: ownertermination");
    settle().await;
    assert_eq!(harness.handler.fatals(), vec![FatalError::OwnerTermination]);

    harness.handle.send("anything");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.remotes.try_recv().is_err(), "no reconnect after fatal");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn password_required_retries_load_with_password() {
    let handler = RecordingHandler::new();
    *handler.password.lock().unwrap() = Some("s3cret".to_string());
    let mut harness = start(doc_config(), handler);
    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    assert!(!load.contains("password="));

    remote.send_text("error: cmd=load kind=passwordrequired:to-view");
    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    assert!(load.contains(" password=s3cret"), "got {load}");
    assert_eq!(
        harness.handler.recorded.lock().unwrap().password_asks,
        vec![(PasswordKind::ToView, false)]
    );

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn declined_modify_password_reloads_view_only() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("error: cmd=load kind=passwordrequired:to-modify");
    let mut remote = harness.next_remote().await;
    let load = skip_handshake(&mut remote).await;
    // Empty password reopens read-only.
    assert!(load.contains(" password="), "got {load}");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn doc_unloading_backs_off_then_gives_up() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;
    remote.send_text("error: cmd=load kind=docunloading");

    for _ in 0..10 {
        let mut retry = harness.next_remote().await;
        skip_handshake(&mut retry).await;
        retry.send_text("error: cmd=load kind=docunloading");
    }

    settle().await;
    assert_eq!(
        harness.handler.fatals(),
        vec![FatalError::DocUnloadingGiveUp]
    );
    assert!(harness.remotes.try_recv().is_err());

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn progress_ready_resets_unloading_attempts() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;
    remote.send_text("error: cmd=load kind=docunloading");

    let mut retry = harness.next_remote().await;
    skip_handshake(&mut retry).await;
    retry.send_text(r#"progress: {"id":"ready"}"#);
    settle().await;

    // Counter restarted: another unload error retries instead of counting on.
    retry.send_text("error: cmd=load kind=docunloading");
    let mut retry = harness.next_remote().await;
    skip_handshake(&mut retry).await;

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn protocol_mismatch_is_fatal() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text(r#"coolserver {"Id":"x","Version":"24.04","Protocol":"9.9"}"#);
    settle().await;
    assert_eq!(
        harness.handler.fatals(),
        vec![FatalError::UnsupportedServerVersion]
    );

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn storage_conflict_resolution_sends_chosen_command() {
    let handler = RecordingHandler::new();
    *handler.conflict.lock().unwrap() = ConflictChoice::Overwrite;
    let mut harness = start(doc_config(), handler);
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("error: cmd=storage kind=documentconflict");
    settle().await;
    assert_eq!(recv_text(&mut remote).await, "savetostorage force=1");

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connects_are_retried() {
    let (factory, mut remotes) = LoopbackFactory::new(true);
    factory.fail_next_connects(2).await;
    let handler = RecordingHandler::new();
    let (handle, task) = ProtocolEngine::spawn(doc_config(), Arc::new(factory), handler.clone());

    let mut remote = remotes.recv().await.expect("third attempt connects");
    skip_handshake(&mut remote).await;
    let states = handler.recorded.lock().unwrap().states.clone();
    assert!(states.contains(&ConnectionState::Reconnecting));

    handle.close();
    let _ = task.await;
}

#[tokio::test(start_paused = true)]
async fn stale_connection_events_never_reach_the_pipeline() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut old_remote = harness.next_remote().await;
    skip_handshake(&mut old_remote).await;

    harness.handle.reload();
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    // The replaced connection's traffic is discarded, not dispatched.
    old_remote.send_text("invalidatetiles: stale");
    remote.send_text("invalidatetiles: live");
    settle().await;
    assert_eq!(harness.handler.decoded(), vec!["invalidatetiles: live"]);

    // Closing twice is harmless.
    harness.handle.close();
    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_batch_still_resumes_drawing() {
    let release = Arc::new(Notify::new());
    let (factory, mut remotes) = LoopbackFactory::new(true);
    let handler = RecordingHandler::new();
    let decoder = Arc::new(GatedDecoder {
        release: release.clone(),
    });
    let (handle, task) =
        ProtocolEngine::spawn_with_decoder(doc_config(), Arc::new(factory), decoder, handler.clone());
    let mut remote = remotes.recv().await.expect("connection attempt");
    skip_handshake(&mut remote).await;

    remote.send_text("invalidatetiles: part=0");
    let mut frame = Vec::from(&b"windowpaint: id=1 width=10 height=10\n"[..]);
    frame.extend_from_slice(b"PNG...");
    remote.send_binary(frame);
    settle().await;

    // The text dispatched, the bitmap stalled the tail, and drawing resumed
    // anyway: every pause is paired with a resume even mid-stall.
    assert_eq!(handler.decoded(), vec!["invalidatetiles: part=0"]);
    assert_eq!(handler.batch_counts(), (1, 1));

    release.notify_one();
    settle().await;
    assert_eq!(
        handler.decoded(),
        vec![
            "invalidatetiles: part=0",
            "windowpaint: id=1 width=10 height=10"
        ]
    );
    assert_eq!(handler.batch_counts(), (2, 2));

    handle.close();
    let _ = task.await;
}

#[tokio::test(start_paused = true)]
async fn unrecognized_load_errors_reach_the_collaborator() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("error: cmd=load kind=documentalreadyopen");
    settle().await;
    assert_eq!(
        harness.handler.decoded(),
        vec!["error: cmd=load kind=documentalreadyopen"]
    );
    assert!(harness.handler.fatals().is_empty());

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_close_surfaces_a_notice() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("close: shuttingdown");
    settle().await;
    let warnings = harness.handler.warnings();
    assert!(
        warnings.iter().any(|w| w.contains("shutting down")),
        "got {warnings:?}"
    );

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn version_restore_close_notifies_and_reloads() {
    let mut harness = start(doc_config(), RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    remote.send_text("close: versionrestore: prerestore_ack");
    settle().await;
    let warnings = harness.handler.warnings();
    assert!(
        warnings.iter().any(|w| w.contains("reload")),
        "got {warnings:?}"
    );

    // The forced reload reconnects after its delay.
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn token_expiry_warning_fires_before_deadline() {
    let mut config = doc_config();
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    config.access_token_ttl_ms = Some(now_ms + 3_600_000);
    let mut harness = start(config, RecordingHandler::new());
    let mut remote = harness.next_remote().await;
    skip_handshake(&mut remote).await;

    // 45 minutes until the warning point; the paused clock jumps there.
    tokio::time::sleep(Duration::from_secs(46 * 60)).await;
    let expiries = harness.handler.recorded.lock().unwrap().expiries.clone();
    assert!(!expiries.is_empty());
    assert!(!expiries[0], "token not yet expired at warning time");

    harness.finish().await;
}
