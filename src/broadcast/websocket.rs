//! WebSocket bridge for the invalidation hub.
//!
//! Every accepted connection becomes a hub subscriber; hub messages are
//! forwarded as text frames. Frames sent by clients are ignored apart from
//! close.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::InvalidationHub;
use crate::error::{Error, Result};

/// Default listen port for invalidation subscribers
pub const DEFAULT_WS_PORT: u16 = 8080;

/// Accept WebSocket subscribers on `listener` until `shutdown` fires
pub async fn serve_websocket(
    listener: TcpListener,
    hub: Arc<InvalidationHub>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Invalidation WebSocket server listening");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Invalidation WebSocket server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let hub = Arc::clone(&hub);
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_subscriber(stream, peer, hub, shutdown).await {
                        debug!(peer = %peer, error = %e, "subscriber connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<InvalidationHub>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::Broadcast(format!("handshake with {peer} failed: {e}")))?;
    let (mut sink, mut source) = ws.split();

    let mut subscription = hub.subscribe();
    let id = subscription.id();
    info!(peer = %peer, subscriber = id, "Invalidation subscriber connected");

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            outgoing = subscription.recv() => {
                let Some(text) = outgoing else {
                    break Ok(());
                };
                if let Err(e) = sink.send(Message::Text(text.to_string())).await {
                    break Err(Error::Broadcast(format!("send to {peer} failed: {e}")));
                }
            }
            incoming = source.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    break Err(Error::Broadcast(format!("read from {peer} failed: {e}")));
                }
            },
        }
    };

    hub.unsubscribe(id);
    info!(peer = %peer, subscriber = id, "Invalidation subscriber disconnected");
    result
}
