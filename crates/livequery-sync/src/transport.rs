//! # WebSocket Transport
//!
//! Moves text frames between the worker and the deployment.
//!
//! ## Link Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Transport Link                                │
//! │                                                                         │
//! │   worker                     pump task                    deployment    │
//! │   ──────                     ─────────                    ──────────    │
//! │   outgoing.send(json) ─────► WsMessage::Text ───────────► socket        │
//! │   incoming.recv()     ◄───── TransportEvent::Frame ◄───── socket        │
//! │                                                                         │
//! │   drop(outgoing)      ─────► Close frame, task exits                    │
//! │                              ping every ping_interval                   │
//! │                              Pong for every Ping                        │
//! │   incoming.recv()     ◄───── TransportEvent::Closed(reason)             │
//! │                              on close frame, error or EOF               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A link never reconnects by itself. Reconnecting (and the backoff between
//! attempts) is owned by [`crate::connection::ProtocolConnection`].

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Something the link reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Frame(String),

    /// The link is gone. No further events follow.
    Closed(String),
}

/// Both directions of one open link.
///
/// Dropping `outgoing` closes the link.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens links to a sync endpoint.
pub trait Transport: Send + Sync {
    fn open(&self, url: &Url) -> BoxFuture<'static, SyncResult<TransportLink>>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// [`Transport`] over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration, ping_interval: Duration) -> Self {
        Self {
            connect_timeout,
            ping_interval,
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(15))
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> BoxFuture<'static, SyncResult<TransportLink>> {
        let url = url.to_string();
        let connect_timeout = self.connect_timeout;
        let ping_interval = self.ping_interval;

        async move {
            let ws_stream = connect_with_timeout(&url, connect_timeout).await?;
            info!(url = %url, "WebSocket connected");

            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(ws_stream, outgoing_rx, incoming_tx, ping_interval));

            Ok(TransportLink {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            })
        }
        .boxed()
    }
}

/// Connects with timeout.
async fn connect_with_timeout(
    url: &str,
    connect_timeout: Duration,
) -> SyncResult<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((ws_stream, response))) => {
            debug!(status = ?response.status(), "WebSocket handshake complete");
            Ok(ws_stream)
        }
        Ok(Err(e)) => Err(SyncError::from(e)),
        Err(_) => Err(SyncError::Timeout(connect_timeout.as_secs())),
    }
}

/// Forwards frames both ways until either side goes away.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    incoming_tx: mpsc::UnboundedSender<TransportEvent>,
    ping_interval: Duration,
) {
    let (mut write, mut read) = ws_stream.split();

    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        break SyncError::from(e).to_string();
                    }
                }
                None => {
                    debug!("Link dropped by owner, closing socket");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return;
                }
            },

            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if incoming_tx.send(TransportEvent::Frame(text.to_string())).is_err() {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = write.send(WsMessage::Pong(data)).await {
                        break SyncError::from(e).to_string();
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Received close frame");
                    break match frame {
                        Some(frame) if !frame.reason.is_empty() => frame.reason.to_string(),
                        Some(frame) => format!("Closed with code {}", frame.code),
                        None => "Closed by server".to_string(),
                    };
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("Received unexpected binary message");
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(?e, "WebSocket error");
                    break SyncError::from(e).to_string();
                }
                None => break "Socket stream ended".to_string(),
            },

            _ = ping.tick() => {
                if let Err(e) = write.send(WsMessage::Ping(vec![].into())).await {
                    break SyncError::from(e).to_string();
                }
                debug!("Sent ping");
            }

            _ = incoming_tx.closed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return;
            }
        }
    };

    debug!(reason = %reason, "Link closed");
    let _ = incoming_tx.send(TransportEvent::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    async fn echo(mut socket: WebSocket) {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) if text.as_str() == "bye" => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                Message::Text(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Message::Close(_) => return,
                _ => {}
            }
        }
    }

    async fn upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
        ws.on_upgrade(echo)
    }

    async fn spawn_server() -> SocketAddr {
        let app = Router::new().route("/api/sync", get(upgrade));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn sync_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("ws://{}/api/sync", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_frames_round_trip() {
        let addr = spawn_server().await;
        let transport = WebSocketTransport::default();
        let mut link = transport.open(&sync_url(addr)).await.unwrap();

        link.outgoing.send(r#"{"type":"Ping"}"#.to_string()).unwrap();
        let event = link.incoming.recv().await.unwrap();
        assert_eq!(event, TransportEvent::Frame(r#"{"type":"Ping"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_server_close_reported() {
        let addr = spawn_server().await;
        let transport = WebSocketTransport::default();
        let mut link = transport.open(&sync_url(addr)).await.unwrap();

        link.outgoing.send("bye".to_string()).unwrap();
        match link.incoming.recv().await.unwrap() {
            TransportEvent::Closed(_) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::default();
        let err = transport.open(&sync_url(addr)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
