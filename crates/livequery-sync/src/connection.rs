//! # Protocol Connection
//!
//! Owns the link to the deployment: opening it, the `Connect` handshake,
//! and reconnecting with backoff after it drops.
//!
//! ## Connection States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Connection States                                 │
//! │                                                                         │
//! │  ┌────────────┐   connect()    ┌────────────┐                          │
//! │  │Disconnected│ ─────────────► │ Connecting │ ◄─────────────┐          │
//! │  └────────────┘                └─────┬──────┘               │          │
//! │        ▲                   opened    │    open failed        │          │
//! │        │                       ┌─────┴─────┐                 │          │
//! │        │ stop()                ▼           ▼                 │ timer    │
//! │        │               ┌────────────┐  ┌──────────────┐      │          │
//! │        └────────────── │ Connected  │─►│ Reconnecting │──────┘          │
//! │                        └────────────┘  └──────────────┘                 │
//! │                          closed / protocol fault                        │
//! │                                                                         │
//! │  close() from any state ──► Closed (terminal)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every link is tagged with an epoch. Events from a link that has since
//! been replaced are dropped, so a late frame from a dead socket can never
//! touch the new session.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use livequery_core::{ClientMessage, Timestamp};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::transport::{Transport, TransportEvent, TransportLink};

/// Close reason reported on the very first connection.
pub const INITIAL_CONNECT: &str = "InitialConnect";

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    #[default]
    Disconnected,
    /// A link is being opened.
    Connecting,
    /// Link open, `Connect` sent.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// Closed for good.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Link activity, delivered to the worker loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    LinkOpened {
        epoch: u64,
        result: SyncResult<TransportLink>,
    },
    Frame {
        epoch: u64,
        text: String,
    },
    LinkClosed {
        epoch: u64,
        reason: String,
    },
}

// =============================================================================
// Protocol Connection
// =============================================================================

pub struct ProtocolConnection {
    transport: Arc<dyn Transport>,
    url: Url,
    state: ConnectionState,
    epoch: u64,
    link: Option<mpsc::UnboundedSender<String>>,
    session_id: Uuid,
    connection_count: u32,
    last_close_reason: String,
    backoff: ExponentialBackoff,
    reconnect_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    verbose: bool,
}

impl ProtocolConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: Url,
        backoff: ExponentialBackoff,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        verbose: bool,
    ) -> Self {
        Self {
            transport,
            url,
            state: ConnectionState::Disconnected,
            epoch: 0,
            link: None,
            session_id: Uuid::new_v4(),
            connection_count: 0,
            last_close_reason: INITIAL_CONNECT.to_string(),
            backoff,
            reconnect_at: None,
            events_tx,
            verbose,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// When the pending reconnect attempt is due.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    // =========================================================================
    // Opening
    // =========================================================================

    /// Starts opening a new link.
    pub fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;

        let epoch = self.epoch;
        let opening = self.transport.open(&self.url);
        let events_tx = self.events_tx.clone();
        debug!(epoch, url = %self.url, "Opening link");

        tokio::spawn(async move {
            let result = opening.await;
            let _ = events_tx.send(ConnectionEvent::LinkOpened { epoch, result });
        });
    }

    /// Handles a finished open attempt. Returns true when a fresh session
    /// has started and `Connect` has been sent.
    pub fn on_link_opened(
        &mut self,
        epoch: u64,
        result: SyncResult<TransportLink>,
        max_observed_timestamp: Option<Timestamp>,
    ) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(epoch, current = self.epoch, "Dropping stale link");
            return false;
        }

        let link = match result {
            Ok(link) => link,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Failed to open link");
                self.last_close_reason = e.to_string();
                self.schedule_reconnect();
                return false;
            }
            Err(e) => {
                error!(error = %e, "Link cannot be opened, retrying at the slowest rate");
                self.last_close_reason = e.to_string();
                self.schedule_reconnect_after(self.backoff.max_interval);
                return false;
            }
        };

        let TransportLink {
            outgoing,
            mut incoming,
        } = link;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                let event = match event {
                    TransportEvent::Frame(text) => ConnectionEvent::Frame { epoch, text },
                    TransportEvent::Closed(reason) => {
                        let _ = events_tx.send(ConnectionEvent::LinkClosed { epoch, reason });
                        return;
                    }
                };
                if events_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = events_tx.send(ConnectionEvent::LinkClosed {
                epoch,
                reason: "Transport dropped".to_string(),
            });
        });

        self.link = Some(outgoing);
        self.state = ConnectionState::Connected;

        let connect = ClientMessage::Connect {
            session_id: self.session_id.to_string(),
            connection_count: self.connection_count,
            last_close_reason: self.last_close_reason.clone(),
            max_observed_timestamp,
        };
        self.connection_count += 1;
        info!(
            session_id = %self.session_id,
            connection_count = self.connection_count,
            "Connected"
        );
        self.send(&connect)
    }

    // =========================================================================
    // Traffic
    // =========================================================================

    /// Sends one message on the current link.
    pub fn send(&mut self, message: &ClientMessage) -> bool {
        let Some(link) = &self.link else {
            return false;
        };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, msg_type = message.type_name(), "Failed to encode message");
                return false;
            }
        };

        if self.verbose {
            debug!(msg_type = message.type_name(), body = %json, "Sending message");
        }
        link.send(json).is_ok()
    }

    /// Accepts a frame if it belongs to the current link.
    pub fn on_frame(&mut self, epoch: u64, text: String) -> Option<String> {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return None;
        }
        self.backoff.reset();
        Some(text)
    }

    // =========================================================================
    // Losing the link
    // =========================================================================

    /// The current link went away on its own.
    pub fn on_link_closed(&mut self, epoch: u64, reason: String) {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        info!(reason = %reason, "Link closed");
        self.link = None;
        self.last_close_reason = reason;
        self.schedule_reconnect();
    }

    /// The server's stream could not be followed; start a new session.
    pub fn fail(&mut self, reason: &str) {
        if self.state != ConnectionState::Connected {
            return;
        }
        warn!(reason, "Protocol fault, reconnecting");
        self.drop_link(reason);
        self.schedule_reconnect();
    }

    /// Drops the link and stays disconnected until [`Self::connect`].
    pub fn stop(&mut self, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!(reason, "Stopping connection");
        self.drop_link(reason);
        self.reconnect_at = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Drops the link and opens a new one right away.
    pub fn restart_now(&mut self, reason: &str) {
        self.stop(reason);
        self.connect();
    }

    /// Backoff expired.
    pub fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.state == ConnectionState::Reconnecting {
            self.connect();
        }
    }

    pub fn close(&mut self) {
        self.drop_link("Client closed");
        self.reconnect_at = None;
        self.state = ConnectionState::Closed;
        info!(session_id = %self.session_id, "Connection closed");
    }

    fn drop_link(&mut self, reason: &str) {
        self.link = None;
        self.epoch += 1;
        self.last_close_reason = reason.to_string();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        self.schedule_reconnect_after(delay);
    }

    fn schedule_reconnect_after(&mut self, delay: Duration) {
        debug!(?delay, "Waiting before reconnect");
        self.state = ConnectionState::Reconnecting;
        self.reconnect_at = Some(Instant::now() + delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::TestTransport;

    fn connection(
        transport: Arc<TestTransport>,
    ) -> (ProtocolConnection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let url = Url::parse("wss://test.example/api/sync").unwrap();
        (
            ProtocolConnection::new(transport, url, backoff, events_tx, false),
            events_rx,
        )
    }

    async fn open(
        connection: &mut ProtocolConnection,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> bool {
        match events.recv().await.unwrap() {
            ConnectionEvent::LinkOpened { epoch, result } => {
                connection.on_link_opened(epoch, result, Some(7))
            }
            other => panic!("Expected LinkOpened, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_handshake() {
        let transport = Arc::new(TestTransport::new());
        let (mut connection, mut events) = connection(transport.clone());

        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(open(&mut connection, &mut events).await);
        assert!(connection.is_connected());

        let mut server = transport.next_link().await.unwrap();
        match server.recv().await.unwrap() {
            ClientMessage::Connect {
                connection_count,
                last_close_reason,
                max_observed_timestamp,
                ..
            } => {
                assert_eq!(connection_count, 0);
                assert_eq!(last_close_reason, INITIAL_CONNECT);
                assert_eq!(max_observed_timestamp, Some(7));
            }
            other => panic!("Expected Connect, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_reconnect_with_reason() {
        let transport = Arc::new(TestTransport::new());
        let (mut connection, mut events) = connection(transport.clone());
        connection.connect();
        open(&mut connection, &mut events).await;
        let mut server = transport.next_link().await.unwrap();
        server.recv().await.unwrap();

        server.close("going away");
        match events.recv().await.unwrap() {
            ConnectionEvent::LinkClosed { epoch, reason } => connection.on_link_closed(epoch, reason),
            other => panic!("Expected LinkClosed, got {:?}", other),
        }
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        assert!(connection.reconnect_at().is_some());

        tokio::time::sleep_until(connection.reconnect_at().unwrap()).await;
        connection.on_reconnect_timer();
        assert!(open(&mut connection, &mut events).await);

        let mut server = transport.next_link().await.unwrap();
        match server.recv().await.unwrap() {
            ClientMessage::Connect {
                connection_count,
                last_close_reason,
                ..
            } => {
                assert_eq!(connection_count, 1);
                assert_eq!(last_close_reason, "going away");
            }
            other => panic!("Expected Connect, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_frames_are_dropped() {
        let transport = Arc::new(TestTransport::new());
        let (mut connection, mut events) = connection(transport.clone());
        connection.connect();
        open(&mut connection, &mut events).await;
        let server = transport.next_link().await.unwrap();

        server.send_raw("first");
        let (epoch, text) = match events.recv().await.unwrap() {
            ConnectionEvent::Frame { epoch, text } => (epoch, text),
            other => panic!("Expected Frame, got {:?}", other),
        };
        assert_eq!(connection.on_frame(epoch, text), Some("first".to_string()));

        connection.fail("bad frame");
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        assert_eq!(connection.on_frame(epoch, "late".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_backs_off() {
        let transport = Arc::new(TestTransport::new());
        transport.fail_next_opens(1);
        let (mut connection, mut events) = connection(transport.clone());

        connection.connect();
        assert!(!open(&mut connection, &mut events).await);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        assert_eq!(transport.opened(), 0);

        tokio::time::sleep_until(connection.reconnect_at().unwrap()).await;
        connection.on_reconnect_timer();
        assert!(open(&mut connection, &mut events).await);
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unretryable_open_error_waits_longest_backoff() {
        let transport = Arc::new(TestTransport::new());
        let (mut connection, mut events) = connection(transport);

        connection.connect();
        let epoch = match events.recv().await.unwrap() {
            ConnectionEvent::LinkOpened { epoch, .. } => epoch,
            other => panic!("Expected LinkOpened, got {:?}", other),
        };
        let rejected = Err(SyncError::InvalidUrl("no host".into()));
        assert!(!connection.on_link_opened(epoch, rejected, None));

        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        let wait = connection.reconnect_at().unwrap() - Instant::now();
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_is_terminal() {
        let transport = Arc::new(TestTransport::new());
        let (mut connection, _events) = connection(transport);
        connection.close();
        connection.connect();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
