//! Same-process transport pair: the drop-in substitute used on embedded
//! platforms and throughout the tests. The remote half plays the server.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{OutboundMessage, SocketEvent, SocketPayload, TransportFactory, TransportSocket};

/// Create a connected client/server pair.
pub fn pair() -> (LoopbackTransport, LoopbackRemote) {
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    (
        LoopbackTransport {
            ev_rx,
            out_tx,
            connected: connected.clone(),
        },
        LoopbackRemote {
            ev_tx,
            out_rx,
            connected,
        },
    )
}

pub struct LoopbackTransport {
    ev_rx: mpsc::UnboundedReceiver<SocketEvent>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSocket for LoopbackTransport {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("loopback not connected");
        }
        self.out_tx
            .send(msg)
            .map_err(|e| anyhow::anyhow!("loopback peer gone: {e}"))
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        let event = self.ev_rx.recv().await;
        if matches!(event, Some(SocketEvent::Closed { .. }) | None) {
            self.connected.store(false, Ordering::SeqCst);
        }
        event
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ev_rx.close();
    }
}

/// The server end of a loopback pair.
pub struct LoopbackRemote {
    ev_tx: mpsc::UnboundedSender<SocketEvent>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

impl LoopbackRemote {
    /// Signal the open handshake point.
    pub fn open(&self) {
        let _ = self.ev_tx.send(SocketEvent::Opened);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .ev_tx
            .send(SocketEvent::Message(SocketPayload::Text(text.into())));
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) {
        let _ = self
            .ev_tx
            .send(SocketEvent::Message(SocketPayload::Binary(data.into())));
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.ev_tx.send(SocketEvent::Error(message.into()));
    }

    pub fn close(&self, reason: Option<&str>) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.ev_tx.send(SocketEvent::Closed {
            reason: reason.map(str::to_string),
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Next message the client transmitted, if any.
    pub async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        self.out_rx.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<OutboundMessage> {
        self.out_rx.try_recv().ok()
    }
}

/// Hands a fresh loopback pair to the engine per connection attempt and
/// parks the remote ends where the driving side can pick them up.
pub struct LoopbackFactory {
    remotes: mpsc::UnboundedSender<LoopbackRemote>,
    auto_open: bool,
    fail_connects: Arc<Mutex<u32>>,
}

impl LoopbackFactory {
    /// Returns the factory and the stream of remote ends, one per connect.
    pub fn new(auto_open: bool) -> (Self, mpsc::UnboundedReceiver<LoopbackRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes: tx,
                auto_open,
                fail_connects: Arc::new(Mutex::new(0)),
            },
            rx,
        )
    }

    /// Make the next `n` connection attempts fail, to exercise retry paths.
    pub async fn fail_next_connects(&self, n: u32) {
        *self.fail_connects.lock().await = n;
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn connect(&self) -> Result<Box<dyn TransportSocket>> {
        {
            let mut failures = self.fail_connects.lock().await;
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("loopback connect refused");
            }
        }
        let (socket, remote) = pair();
        if self.auto_open {
            remote.open();
        }
        self.remotes
            .send(remote)
            .map_err(|_| anyhow::anyhow!("remote receiver dropped"))?;
        Ok(Box::new(socket))
    }
}
