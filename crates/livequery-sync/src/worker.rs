//! # Sync Worker
//!
//! The single task that owns all mutable protocol state of a client.
//!
//! ## Event Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Worker Loop                                   │
//! │                                                                         │
//! │   ClientRequest ──┐                                                     │
//! │   (handles)       │                                                     │
//! │                   │     ┌──────────────────────────────────────┐        │
//! │   ConnectionEvent ┼───► │ tokio::select!                       │        │
//! │   (link tasks)    │     │   BaseClient        (livequery-core) │        │
//! │                   │     │   ProtocolConnection                 │        │
//! │   AuthEvent ──────┤     │   AuthenticationManager              │        │
//! │   (token fetches) │     └───────────────┬──────────────────────┘        │
//! │                   │                     │ after every event             │
//! │   reconnect timer ┤                     ▼                               │
//! │   refresh timer ──┘     flush outbox ─► link                            │
//! │                         publish results ─► SharedStore ─► listeners     │
//! │                         publish status  ─► watch::Sender<ClientStatus>  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Async work (opening links, fetching tokens) is spawned and reports back
//! through a channel tagged with an epoch, so it never races the loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use livequery_core::{
    Args, BaseClient, CompletedRequest, FunctionError, FunctionPath, FunctionResult, Journal,
    Listener, OptimisticUpdate, QueryToken, RequestId, ServerMessage, Timestamp, TokenType, Value,
    WatchOptions,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthAction, AuthChangeCallback, AuthEvent, AuthenticationManager, TokenFetcher};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionState, ProtocolConnection};
use crate::error::SyncError;

// =============================================================================
// Requests
// =============================================================================

/// Operations sent from client handles to the worker.
pub(crate) enum ClientRequest {
    Subscribe {
        path: FunctionPath,
        args: Args,
        options: WatchOptions,
    },
    Unsubscribe {
        token: QueryToken,
    },
    Mutation {
        ticket: u64,
        path: FunctionPath,
        args: Args,
        update: Option<OptimisticUpdate>,
        reply: oneshot::Sender<FunctionResult>,
    },
    Action {
        ticket: u64,
        path: FunctionPath,
        args: Args,
        reply: oneshot::Sender<FunctionResult>,
    },
    Cancel {
        ticket: u64,
    },
    SetAuth {
        fetcher: TokenFetcher,
        token_type: TokenType,
        on_change: AuthChangeCallback,
    },
    ClearAuth,
    Close {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Status
// =============================================================================

/// Snapshot of the client's connection and request state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientStatus {
    pub connection_state: ConnectionState,

    /// Last value reported to the auth `on_change` callback.
    pub is_authenticated: bool,

    /// Mutations or actions sent and not yet answered.
    pub has_inflight_requests: bool,
    pub inflight_mutations: usize,
    pub inflight_actions: usize,

    /// Any request not yet confirmed, sent or not.
    pub has_unsaved_changes: bool,

    /// Links opened so far.
    pub connection_count: u32,

    pub max_observed_timestamp: Option<Timestamp>,
}

// =============================================================================
// Shared Store
// =============================================================================

/// Local result of one subscribed query.
pub type LocalResult = Result<Option<Value>, FunctionError>;

#[derive(Debug, Clone)]
struct StoredQuery {
    result: LocalResult,
    journal: Option<Journal>,
}

/// Settled results of every subscribed query at one point in time.
///
/// Queries still loading are left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySetSnapshot {
    results: BTreeMap<QueryToken, FunctionResult>,
}

impl QuerySetSnapshot {
    pub fn get(&self, token: &QueryToken) -> Option<&FunctionResult> {
        self.results.get(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QueryToken, &FunctionResult)> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Results and listeners shared between the worker and client handles.
///
/// Written only by the worker. Listeners are called without any lock held.
pub(crate) struct SharedStore {
    results: RwLock<BTreeMap<QueryToken, StoredQuery>>,
    listeners: Mutex<BTreeMap<QueryToken, BTreeMap<u64, Listener>>>,
    next_listener_id: AtomicU64,
    snapshots: watch::Sender<QuerySetSnapshot>,
}

impl Default for SharedStore {
    fn default() -> Self {
        let (snapshots, _) = watch::channel(QuerySetSnapshot::default());
        Self {
            results: RwLock::default(),
            listeners: Mutex::default(),
            next_listener_id: AtomicU64::new(0),
            snapshots,
        }
    }
}

impl SharedStore {
    pub(crate) fn result(&self, token: &QueryToken) -> LocalResult {
        let results = match self.results.read() {
            Ok(results) => results,
            Err(poisoned) => poisoned.into_inner(),
        };
        results
            .get(token)
            .map_or(Ok(None), |stored| stored.result.clone())
    }

    pub(crate) fn journal(&self, token: &QueryToken) -> Option<Journal> {
        let results = match self.results.read() {
            Ok(results) => results,
            Err(poisoned) => poisoned.into_inner(),
        };
        results.get(token).and_then(|stored| stored.journal.clone())
    }

    pub(crate) fn watch_snapshots(&self) -> watch::Receiver<QuerySetSnapshot> {
        self.snapshots.subscribe()
    }

    pub(crate) fn add_listener(&self, token: &QueryToken, listener: Listener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners()
            .entry(token.clone())
            .or_default()
            .insert(id, listener);
        id
    }

    pub(crate) fn remove_listener(&self, token: &QueryToken, id: u64) {
        let mut listeners = self.listeners();
        if let Some(for_token) = listeners.get_mut(token) {
            for_token.remove(&id);
            if for_token.is_empty() {
                listeners.remove(token);
            }
        }
    }

    fn store(&self, token: &QueryToken, stored: Option<StoredQuery>) {
        let mut results = match self.results.write() {
            Ok(results) => results,
            Err(poisoned) => poisoned.into_inner(),
        };
        match stored {
            Some(stored) => {
                results.insert(token.clone(), stored);
            }
            None => {
                results.remove(token);
            }
        }
    }

    /// Sends the current settled results to [`Self::watch_snapshots`]
    /// receivers if they differ from the last snapshot.
    fn publish_snapshot(&self) {
        let snapshot = {
            let results = match self.results.read() {
                Ok(results) => results,
                Err(poisoned) => poisoned.into_inner(),
            };
            let results = results
                .iter()
                .filter_map(|(token, stored)| {
                    let settled = match &stored.result {
                        Ok(Some(value)) => Ok(value.clone()),
                        Ok(None) => return None,
                        Err(error) => Err(error.clone()),
                    };
                    Some((token.clone(), settled))
                })
                .collect();
            QuerySetSnapshot { results }
        };
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn listeners_for(&self, tokens: &[QueryToken]) -> Vec<Listener> {
        let listeners = self.listeners();
        tokens
            .iter()
            .filter_map(|token| listeners.get(token))
            .flat_map(|for_token| for_token.values().cloned())
            .collect()
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<QueryToken, BTreeMap<u64, Listener>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

pub(crate) struct Worker {
    base: BaseClient,
    connection: ProtocolConnection,
    auth: AuthenticationManager,
    config: ClientConfig,
    store: Arc<SharedStore>,
    status_tx: watch::Sender<ClientStatus>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    auth_events: mpsc::UnboundedReceiver<AuthEvent>,
    pending: BTreeMap<RequestId, (u64, oneshot::Sender<FunctionResult>)>,
    tickets: BTreeMap<u64, RequestId>,
    restart_pending: bool,
}

impl Worker {
    pub(crate) fn new(
        connection: ProtocolConnection,
        connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        auth: AuthenticationManager,
        auth_events: mpsc::UnboundedReceiver<AuthEvent>,
        config: ClientConfig,
        store: Arc<SharedStore>,
        status_tx: watch::Sender<ClientStatus>,
    ) -> Self {
        Self {
            base: BaseClient::new(),
            connection,
            auth,
            config,
            store,
            status_tx,
            connection_events,
            auth_events,
            pending: BTreeMap::new(),
            tickets: BTreeMap::new(),
            restart_pending: false,
        }
    }

    /// Runs until `Close` arrives or every client handle is gone.
    pub(crate) async fn run(mut self, mut requests: mpsc::UnboundedReceiver<ClientRequest>) {
        info!(client_id = %self.config.deployment.client_id, "Sync worker starting");
        self.connection.connect();
        self.publish_status();

        loop {
            let reconnect_at = self.connection.reconnect_at();
            let refresh_at = self.auth.refresh_at();

            tokio::select! {
                biased;

                request = requests.recv() => match request {
                    Some(ClientRequest::Close { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                Some(event) = self.connection_events.recv() => self.handle_connection_event(event),

                Some(event) = self.auth_events.recv() => {
                    let action = self.auth.on_token_fetched(event);
                    self.apply_auth_action(action);
                }

                _ = sleep_until_opt(reconnect_at) => self.connection.on_reconnect_timer(),

                _ = sleep_until_opt(refresh_at) => self.auth.on_refresh_timer(),
            }

            self.flush();
            self.publish_status();
        }

        info!("Sync worker stopped");
    }

    // =========================================================================
    // Caller Requests
    // =========================================================================

    fn handle_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Subscribe {
                path,
                args,
                options,
            } => {
                let token = self.base.subscribe(&path, &args, &options);
                self.store_result(&token);
            }
            ClientRequest::Unsubscribe { token } => {
                let changed = self.base.unsubscribe(&token);
                self.store_result(&token);
                self.store.publish_snapshot();
                self.publish(&changed);
            }
            ClientRequest::Mutation {
                ticket,
                path,
                args,
                update,
                reply,
            } => {
                let (request_id, changed) = self.base.mutation(path, args, update);
                self.track(ticket, request_id, reply);
                self.publish(&changed);
            }
            ClientRequest::Action {
                ticket,
                path,
                args,
                reply,
            } => {
                let request_id = self.base.action(path, args);
                self.track(ticket, request_id, reply);
            }
            ClientRequest::Cancel { ticket } => {
                if let Some(request_id) = self.tickets.remove(&ticket) {
                    self.pending.remove(&request_id);
                    let changed = self.base.cancel_request(request_id);
                    self.publish(&changed);
                }
            }
            ClientRequest::SetAuth {
                fetcher,
                token_type,
                on_change,
            } => self.auth.set_auth(fetcher, token_type, on_change),
            ClientRequest::ClearAuth => {
                self.auth.clear_auth();
                self.base.clear_auth();
            }
            ClientRequest::Close { .. } => {}
        }
    }

    fn track(&mut self, ticket: u64, request_id: RequestId, reply: oneshot::Sender<FunctionResult>) {
        self.tickets.insert(ticket, request_id);
        self.pending.insert(request_id, (ticket, reply));
    }

    // =========================================================================
    // Connection Events
    // =========================================================================

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LinkOpened { epoch, result } => {
                let max_observed_timestamp = self.base.max_observed_timestamp();
                if self
                    .connection
                    .on_link_opened(epoch, result, max_observed_timestamp)
                {
                    if self.auth.is_paused() {
                        debug!("Holding session start until the token arrives");
                        self.restart_pending = true;
                    } else {
                        self.restart_session();
                    }
                }
            }
            ConnectionEvent::Frame { epoch, text } => {
                if let Some(text) = self.connection.on_frame(epoch, text) {
                    self.handle_frame(&text);
                }
            }
            ConnectionEvent::LinkClosed { epoch, reason } => {
                self.connection.on_link_closed(epoch, reason);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match ServerMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                self.protocol_fault(&SyncError::from(e).to_string());
                return;
            }
        };

        if self.config.client.verbose {
            debug!(msg_type = message.type_name(), body = %text, "Received message");
        }

        match message {
            ServerMessage::AuthError {
                error,
                base_version,
                auth_update_attempted,
            } => {
                let action = self.auth.on_auth_error(
                    &error,
                    base_version,
                    auth_update_attempted,
                    self.base.identity_version(),
                );
                self.apply_auth_action(action);
            }
            ServerMessage::FatalError { error } => {
                error!(error = %error, "Server reported a fatal error");
                self.protocol_fault(&SyncError::Fatal(error).to_string());
            }
            ServerMessage::Ping => debug!("Received ping"),
            message => {
                let is_transition = matches!(message, ServerMessage::Transition { .. });
                match self.base.receive_message(message) {
                    Ok(outcome) => {
                        self.publish(&outcome.changed_queries);
                        self.resolve(outcome.completed);
                        if is_transition {
                            self.auth.on_transition(outcome.identity_advanced);
                        }
                    }
                    Err(e) if e.is_protocol_fault() => {
                        self.protocol_fault(&SyncError::from(e).to_string());
                    }
                    Err(e) => warn!(error = %e, "Ignoring server message"),
                }
            }
        }
    }

    fn protocol_fault(&mut self, reason: &str) {
        self.restart_pending = false;
        self.connection.fail(reason);
    }

    /// Rebuilds the session for the link that just opened.
    fn restart_session(&mut self) {
        self.restart_pending = false;
        let failed = self.base.restart();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Failing actions lost with the connection");
        }
        self.resolve(failed);
    }

    // =========================================================================
    // Auth
    // =========================================================================

    fn apply_auth_action(&mut self, action: AuthAction) {
        match action {
            AuthAction::None => {}
            AuthAction::Install(token) => {
                if self.connection.is_connected() && !self.restart_pending {
                    self.base.set_auth(token);
                } else {
                    self.base.set_auth_for_restart(token);
                }
            }
            AuthAction::Disconnect => {
                self.restart_pending = false;
                self.connection.stop("AuthError");
            }
            AuthAction::ReconnectWith(token) => {
                self.base.set_auth_for_restart(token);
                self.connection.connect();
            }
            AuthAction::ClearAndReconnect => {
                self.base.clear_auth();
                self.restart_pending = false;
                self.connection.restart_now("AuthError");
            }
            AuthAction::Clear => self.base.clear_auth(),
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn flush(&mut self) {
        if self.auth.is_paused() {
            return;
        }
        if self.connection.state() == ConnectionState::Disconnected {
            self.connection.connect();
            return;
        }
        if !self.connection.is_connected() {
            return;
        }
        if self.restart_pending {
            self.restart_session();
        }
        for message in self.base.take_outbox() {
            if !self.connection.send(&message) {
                warn!(msg_type = message.type_name(), "Link gone, message dropped");
                break;
            }
        }
    }

    fn store_result(&self, token: &QueryToken) {
        let stored = self.base.is_subscribed(token).then(|| StoredQuery {
            result: self.base.local_query_result(token),
            journal: self.base.query_journal(token),
        });
        self.store.store(token, stored);
    }

    /// Stores new results, then notifies their listeners.
    fn publish(&self, changed: &[QueryToken]) {
        if changed.is_empty() {
            return;
        }
        for token in changed {
            self.store_result(token);
        }
        self.store.publish_snapshot();
        for listener in self.store.listeners_for(changed) {
            listener();
        }
    }

    fn resolve(&mut self, completed: Vec<CompletedRequest>) {
        for CompletedRequest { request_id, result } in completed {
            if let Some((ticket, reply)) = self.pending.remove(&request_id) {
                self.tickets.remove(&ticket);
                let _ = reply.send(result);
            }
        }
    }

    fn publish_status(&self) {
        let status = ClientStatus {
            connection_state: self.connection.state(),
            is_authenticated: self.auth.is_authenticated(),
            has_inflight_requests: self.base.has_inflight_requests(),
            inflight_mutations: self.base.inflight_mutations(),
            inflight_actions: self.base.inflight_actions(),
            has_unsaved_changes: self.base.has_unsaved_changes(),
            connection_count: self.connection.connection_count(),
            max_observed_timestamp: self.base.max_observed_timestamp(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn shutdown(&mut self) {
        if self.config.client.unsaved_changes_warning && self.base.has_unsaved_changes() {
            warn!(
                inflight_mutations = self.base.inflight_mutations(),
                "Closing with unconfirmed changes"
            );
        }
        self.connection.close();
        self.pending.clear();
        self.tickets.clear();
        self.publish_status();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
