//! WebSocket relay server.
//!
//! Clients connect to `ws://host:port/<ownerId>`; every binary frame on the
//! connection is handed to a [`FrameHandler`] and the reply is sent back.
//! One task per connection; shutdown stops accepting and aborts the rest.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tessera_core::OwnerId;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{Result, SyncError};
use crate::transport::{websocket, FrameHandler};

fn transport_err(err: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(err.to_string())
}

pub struct RelayServer {
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
}

impl RelayServer {
    pub async fn bind(addr: impl ToSocketAddrs, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(transport_err)?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(transport_err)
    }

    /// Serve connections until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!("relay: serving on ws://{addr}");

        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!(%peer, "relay: connection opened");
                        let handler = Arc::clone(&self.handler);
                        connections.spawn(
                            async move {
                                if let Err(e) = serve_connection(stream, handler).await {
                                    debug!(error = %e, "relay: connection ended with error");
                                }
                            }
                            .instrument(tracing::info_span!("conn", %peer)),
                        );
                    }
                    Err(e) => error!("relay: failed to accept connection: {e}"),
                },
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        info!("relay: shut down");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn FrameHandler>) -> Result<()> {
    let mut path = String::new();
    let capture_path = |request: &Request,
                        response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        capture_path,
        Some(websocket::config()),
    )
    .await
        .map_err(transport_err)?;
    let (mut sink, mut frames) = ws.split();

    let owner: OwnerId = match path.trim_start_matches('/').parse() {
        Ok(owner) => owner,
        Err(e) => {
            warn!(%path, error = %e, "relay: rejecting connection with invalid owner");
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        }
    };

    while let Some(message) = frames.next().await {
        match message.map_err(transport_err)? {
            Message::Binary(frame) => match handler.handle_frame(&owner, &frame).await {
                Some(reply) => sink
                    .send(Message::Binary(reply))
                    .await
                    .map_err(transport_err)?,
                None => break,
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(%owner, "relay: connection closed");
    let _ = sink.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_core::{Id, MerkleTree, NodeId};
    use tessera_store::MemoryRelayStore;
    use tokio::sync::oneshot;

    use crate::codec;
    use crate::messages::{Envelope, SyncRequest};
    use crate::relay::Relay;
    use crate::transport::websocket::WebSocketTransport;
    use crate::transport::Transport;

    async fn spawn_server() -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let relay = Relay::new(Arc::new(MemoryRelayStore::new()));
        let server = RelayServer::bind("127.0.0.1:0", Arc::new(relay))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        (addr, tx, task)
    }

    #[tokio::test]
    async fn test_request_over_websocket() {
        let (addr, shutdown, task) = spawn_server().await;
        let owner = OwnerId(Id::from_hash([6; 16]));

        let url = WebSocketTransport::owner_url(&format!("ws://{addr}"), &owner);
        let transport = WebSocketTransport::connect(&url).await.unwrap();
        let frame = codec::encode(&Envelope::Request(SyncRequest {
            owner,
            write_key: None,
            after: None,
            node: NodeId([1; 8]),
            messages: vec![],
            tree: MerkleTree::new(),
        }));
        transport.send(frame).await.unwrap();

        let reply = transport
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("reply");
        assert!(matches!(codec::decode(&reply).unwrap(), Envelope::Response(_)));

        transport.close().await.unwrap();
        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_owner_path_closed() {
        let (addr, shutdown, task) = spawn_server().await;

        let transport = WebSocketTransport::connect(&format!("ws://{addr}/not-an-owner"))
            .await
            .unwrap();
        assert!(transport
            .recv_timeout(Duration::from_secs(5))
            .await
            .is_err());

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
