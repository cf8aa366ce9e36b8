use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{OutboundMessage, SocketEvent, SocketPayload, TransportFactory, TransportSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod config;
pub use config::WebSocketConfig;

/// WebSocket implementation of the `TransportSocket` trait.
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    connected: Arc<AtomicBool>,
    ws_task: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Connect and start the bridging task.
    pub async fn connect(config: &WebSocketConfig) -> Result<Self> {
        let url = config.build_url();
        let (ws_stream, _) = connect_async(&url).await?;
        tracing::debug!(target = "driftwood::transport", %url, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<OutboundMessage>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<SocketEvent>();

        let connected = Arc::new(AtomicBool::new(true));
        let connected_clone = connected.clone();

        // The caller observes the open through the event stream, like every
        // other lifecycle transition.
        let _ = tx_in.send(SocketEvent::Opened);

        let ws_task = tokio::spawn(async move {
            handle_websocket(ws_stream, rx_out, tx_in, connected_clone).await;
        });

        Ok(Self {
            tx: tx_out,
            rx: rx_in,
            connected,
            ws_task: Some(ws_task),
        })
    }
}

#[async_trait]
impl TransportSocket for WebSocketTransport {
    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("websocket not connected");
        }
        self.tx
            .send(msg)
            .map_err(|e| anyhow::anyhow!("failed to queue outbound message: {e}"))
    }

    async fn recv(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.rx.close();
        if let Some(task) = self.ws_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.ws_task.take() {
            task.abort();
        }
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<OutboundMessage>,
    tx_in: mpsc::UnboundedSender<SocketEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx_out.recv().await {
            let frame = match msg {
                OutboundMessage::Text(text) => Message::Text(text),
                OutboundMessage::Binary(data) => Message::Binary(data),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let event = match msg {
            Ok(Message::Text(text)) => SocketEvent::Message(SocketPayload::Text(text)),
            Ok(Message::Binary(data)) => {
                SocketEvent::Message(SocketPayload::Binary(Bytes::from(data)))
            }
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                let _ = tx_in.send(SocketEvent::Closed { reason });
                break;
            }
            Ok(_) => continue, // Ping/Pong/Frame
            Err(e) => {
                let _ = tx_in.send(SocketEvent::Error(e.to_string()));
                let _ = tx_in.send(SocketEvent::Closed { reason: None });
                break;
            }
        };
        if tx_in.send(event).is_err() {
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
    send_task.abort();
    let _ = send_task.await;
}

/// Builds a fresh websocket per connection attempt.
pub struct WebSocketFactory {
    config: WebSocketConfig,
}

impl WebSocketFactory {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn connect(&self) -> Result<Box<dyn TransportSocket>> {
        let socket = WebSocketTransport::connect(&self.config).await?;
        Ok(Box::new(socket))
    }
}
