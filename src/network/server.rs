//! Network Server
//!
//! TCP server for accepting connections from nodes and clients.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::error::Result;
use crate::protocol::{Message, MessageCodec};

/// Handles one validated inbound message. `None` means no reply is sent and
/// the connection is closed.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Option<Message>;
}

/// Network server for cluster communication
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
}

impl NetworkServer {
    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, handler: Arc<dyn MessageHandler>) -> Self {
        Self { listener, handler }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown flag flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Network server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, addr, handler, shutdown).await {
                                    tracing::debug!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }
}

/// Serve one connection: frames are handled in arrival order
async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, MessageCodec);

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.changed() => break,
        };

        match frame {
            Some(Ok(Ok(message))) => {
                tracing::trace!("Received {} from node {} ({})", message.kind(), message.origin(), peer_addr);

                match handler.handle(message).await {
                    Some(reply) => framed.send(&reply).await?,
                    None => break,
                }
            }
            Some(Ok(Err(e))) => {
                // Corrupt or tampered message: drop it, keep the connection
                tracing::warn!("Dropping message from {}: {}", peer_addr, e);
            }
            Some(Err(e)) => {
                tracing::warn!("Closing connection from {}: {}", peer_addr, e);
                break;
            }
            None => break,
        }
    }

    Ok(())
}
