//! Transport abstraction for the sync protocol.
//!
//! A transport carries opaque binary frames between one client and the
//! relay. Framing and encoding live in [`codec`](crate::codec); the
//! transport only delivers bytes.

use std::time::Duration;

use async_trait::async_trait;
use tessera_core::OwnerId;

use crate::error::Result;

/// Client side of a connection to the relay.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Receive the next frame.
    ///
    /// Returns `None` if the timeout expires before a frame arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Close the connection. Later sends fail.
    async fn close(&self) -> Result<()>;
}

/// Server side: turns one request frame into one reply.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle a frame arriving on a connection opened for `owner`.
    ///
    /// `None` means the frame was malformed and the connection is dropped.
    async fn handle_frame(&self, owner: &OwnerId, frame: &[u8]) -> Option<Vec<u8>>;
}

/// An in-memory transport for testing.
///
/// Frames are handed straight to a [`FrameHandler`]; replies are queued on a
/// channel and picked up by `recv_timeout`.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    use crate::error::SyncError;

    pub struct MemoryTransport {
        owner: OwnerId,
        handler: Arc<dyn FrameHandler>,
        replies: mpsc::UnboundedSender<Vec<u8>>,
        receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closed: AtomicBool,
        offline: AtomicBool,
    }

    impl MemoryTransport {
        /// Open a connection for `owner` to `handler`.
        pub fn connect(owner: OwnerId, handler: Arc<dyn FrameHandler>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                owner,
                handler,
                replies: tx,
                receiver: Mutex::new(rx),
                closed: AtomicBool::new(false),
                offline: AtomicBool::new(false),
            }
        }

        /// Simulate a network partition: sends fail while offline.
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, frame: Vec<u8>) -> Result<()> {
            if self.is_closed() {
                return Err(SyncError::Transport("connection closed".into()));
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("network unreachable".into()));
            }

            match self.handler.handle_frame(&self.owner, &frame).await {
                Some(reply) => self
                    .replies
                    .send(reply)
                    .map_err(|_| SyncError::Transport("channel closed".into())),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
            let mut rx = self.receiver.lock().await;
            if let Ok(frame) = rx.try_recv() {
                return Ok(Some(frame));
            }
            if self.is_closed() {
                return Err(SyncError::Transport("connection closed".into()));
            }
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(frame)) => Ok(Some(frame)),
                Ok(None) => Err(SyncError::Transport("channel closed".into())),
                Err(_) => Ok(None), // Timeout
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}

/// WebSocket client transport: binary frames at `ws://host:port/<ownerId>`.
pub mod websocket {
    use super::*;
    use futures_util::stream::{SplitSink, SplitStream};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::sync::Mutex;
    use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tracing::debug;

    use crate::error::SyncError;
    use crate::messages::limits;

    type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    pub struct WebSocketTransport {
        sink: Mutex<SplitSink<WsStream, Message>>,
        stream: Mutex<SplitStream<WsStream>>,
    }

    fn transport_err(err: impl std::fmt::Display) -> SyncError {
        SyncError::Transport(err.to_string())
    }

    /// Message and frame limits shared by clients and the relay server.
    pub(crate) fn config() -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(limits::MAX_FRAME_BYTES);
        config.max_frame_size = Some(limits::MAX_FRAME_BYTES);
        config
    }

    impl WebSocketTransport {
        /// Connect to a relay URL such as `ws://127.0.0.1:4000/<ownerId>`.
        pub async fn connect(url: &str) -> Result<Self> {
            let (ws, _response) =
                tokio_tungstenite::connect_async_with_config(url, Some(config()), false)
                    .await
                    .map_err(transport_err)?;
            debug!(url, "connected to relay");
            let (sink, stream) = ws.split();
            Ok(Self {
                sink: Mutex::new(sink),
                stream: Mutex::new(stream),
            })
        }

        /// URL of the relay endpoint for `owner`.
        pub fn owner_url(base: &str, owner: &OwnerId) -> String {
            format!("{}/{}", base.trim_end_matches('/'), owner)
        }
    }

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn send(&self, frame: Vec<u8>) -> Result<()> {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(frame)).await.map_err(transport_err)
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
            let mut stream = self.stream.lock().await;
            let next_binary = async {
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Binary(frame))) => return Ok(frame),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SyncError::Transport("connection closed".into()))
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(transport_err(e)),
                    }
                }
            };
            match tokio::time::timeout(timeout, next_binary).await {
                Ok(frame) => frame.map(Some),
                Err(_) => Ok(None),
            }
        }

        async fn close(&self) -> Result<()> {
            let mut sink = self.sink.lock().await;
            sink.close().await.map_err(transport_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTransport;
    use super::*;
    use std::sync::Arc;
    use tessera_core::Id;

    use crate::error::SyncError;

    /// Echoes frames back; drops the connection on an empty frame.
    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle_frame(&self, _owner: &OwnerId, frame: &[u8]) -> Option<Vec<u8>> {
            (!frame.is_empty()).then(|| frame.to_vec())
        }
    }

    fn connect() -> MemoryTransport {
        MemoryTransport::connect(OwnerId(Id::from_hash([1; 16])), Arc::new(Echo))
    }

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let transport = connect();
        transport.send(vec![1, 2, 3]).await.unwrap();
        let reply = transport
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(reply, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_memory_transport_timeout() {
        let transport = connect();
        let reply = transport
            .recv_timeout(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_dropped_connection() {
        let transport = connect();
        transport.send(vec![]).await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.recv_timeout(Duration::from_millis(10)).await,
            Err(SyncError::Transport(_))
        ));
        assert!(transport.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_offline() {
        let transport = connect();
        transport.set_offline(true);
        assert!(matches!(
            transport.send(vec![1]).await,
            Err(SyncError::Transport(_))
        ));
        transport.set_offline(false);
        transport.send(vec![1]).await.unwrap();
    }

    #[test]
    fn test_owner_url() {
        let owner = OwnerId(Id::from_hash([1; 16]));
        let url = websocket::WebSocketTransport::owner_url("ws://localhost:4000/", &owner);
        assert_eq!(url, format!("ws://localhost:4000/{}", owner));
    }
}
