use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub mod loopback;
pub mod websocket;

/// One inbound transport payload: a text frame, or a binary frame that may
/// carry a command line followed by image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketPayload {
    Text(String),
    Binary(Bytes),
}

/// Lifecycle and message events surfaced by a transport socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(SocketPayload),
    Error(String),
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundMessage::Text(text) => Some(text),
            OutboundMessage::Binary(_) => None,
        }
    }
}

/// Uniform duplex-byte-stream abstraction satisfied by a native WebSocket,
/// an HTTP long-poll proxy, or a same-process loopback pair.
///
/// Implementations deliver `SocketEvent::Opened` once, then zero or more
/// `Message`/`Error` events, then at most one `Closed`; after that (or after
/// `shutdown`) `recv` returns `None`.
#[async_trait]
pub trait TransportSocket: Send {
    async fn send(&self, msg: OutboundMessage) -> Result<()>;

    async fn recv(&mut self) -> Option<SocketEvent>;

    fn is_connected(&self) -> bool;

    /// Tear the socket down. Any message still in flight is dropped rather
    /// than delivered into a now-stale pipeline.
    async fn shutdown(&mut self);
}

/// Creates a fresh socket per connection attempt, so the engine can replace a
/// dead connection and tests can inject loopback ends.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TransportSocket>>;
}
