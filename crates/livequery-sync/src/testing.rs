//! # Test Transport
//!
//! An in-memory [`Transport`] for driving a [`crate::SyncClient`] from tests
//! without a deployment. Every link the client opens shows up as a
//! [`ServerSide`] that can read what the client sent and answer it.
//!
//! ```rust,ignore
//! let transport = Arc::new(TestTransport::new());
//! let client = SyncClient::with_transport(config, transport.clone())?;
//!
//! let mut server = transport.next_link().await;
//! assert_eq!(server.recv().await.unwrap().type_name(), "Connect");
//! server.send(ServerMessage::Ping);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use livequery_core::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, TransportEvent, TransportLink};

/// How long [`TestTransport::next_link`] and [`ServerSide::recv`] wait.
pub const TEST_WAIT: Duration = Duration::from_secs(120);

/// In-memory transport. Links are handed out in the order they were opened.
pub struct TestTransport {
    accepted_tx: mpsc::UnboundedSender<ServerSide>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<ServerSide>>,
    refuse: AtomicUsize,
    opened: AtomicUsize,
}

impl TestTransport {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            accepted_tx,
            accepted_rx: Mutex::new(accepted_rx),
            refuse: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` open attempts fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Successful opens so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Waits for the client to open its next link.
    ///
    /// Returns `None` if no link is opened within [`TEST_WAIT`].
    pub async fn next_link(&self) -> Option<ServerSide> {
        let mut accepted = self.accepted_rx.lock().await;
        tokio::time::timeout(TEST_WAIT, accepted.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Default for TestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TestTransport {
    fn open(&self, url: &Url) -> BoxFuture<'static, SyncResult<TransportLink>> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(url = %url, "Refusing test link");
            return future::ready(Err(SyncError::ConnectionFailed("refused".into()))).boxed();
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let server = ServerSide {
            from_client: outgoing_rx,
            to_client: Some(incoming_tx),
        };
        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.accepted_tx.send(server);

        future::ready(Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        }))
        .boxed()
    }
}

/// The deployment's end of one test link.
pub struct ServerSide {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl ServerSide {
    /// Next message the client sent, or `None` once the client dropped the
    /// link (or nothing arrives within [`TEST_WAIT`]).
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        let text = tokio::time::timeout(TEST_WAIT, self.from_client.recv())
            .await
            .ok()
            .flatten()?;
        ClientMessage::from_json(&text).ok()
    }

    /// A message the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        let text = self.from_client.try_recv().ok()?;
        ClientMessage::from_json(&text).ok()
    }

    /// Delivers a message to the client.
    pub fn send(&self, message: ServerMessage) {
        if let Ok(text) = message.to_json() {
            self.send_raw(text);
        }
    }

    /// Delivers a raw frame, decodable or not.
    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(to_client) = &self.to_client {
            let _ = to_client.send(TransportEvent::Frame(text.into()));
        }
    }

    /// Drops the link from the server side.
    pub fn close(&mut self, reason: &str) {
        if let Some(to_client) = self.to_client.take() {
            let _ = to_client.send(TransportEvent::Closed(reason.to_string()));
        }
    }
}
