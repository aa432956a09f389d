//! # Base Client
//!
//! The complete protocol state of one client, without any I/O.
//!
//! ## Composition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            BaseClient                                   │
//! │                                                                         │
//! │  caller ops ──► LocalSyncState ──────────┐                              │
//! │  (subscribe,    (desired queries, auth)  │                              │
//! │   mutation,                              ▼                              │
//! │   set_auth)     RequestManager ───────► outbox ──► take_outbox()        │
//! │                 (mutations, actions)                   (I/O shell)      │
//! │                                                                         │
//! │  server msgs ─► RemoteQuerySet ──► OptimisticQueryResults ──► visible   │
//! │  (receive_      (confirmed)        (+ pending updates)        results   │
//! │   message)                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation reports the query tokens whose visible result changed,
//! so the I/O shell knows exactly which listeners to notify.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::local_state::LocalSyncState;
use crate::optimistic::{OptimisticQueryResults, OptimisticUpdate, QueryResultEntry};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::remote_query_set::RemoteQuerySet;
use crate::request_manager::{CompletedRequest, RequestManager};
use crate::types::{
    Args, AuthToken, FunctionError, FunctionPath, Journal, QueryToken, RequestId, StateVersion,
    Timestamp, Value, WatchOptions,
};

/// Effects of one server message.
#[derive(Debug, Default, PartialEq)]
pub struct ReceiveOutcome {
    /// Queries whose visible result changed.
    pub changed_queries: Vec<QueryToken>,

    /// Requests to resolve, in resolution order.
    pub completed: Vec<CompletedRequest>,

    /// A Transition advanced the identity version.
    pub identity_advanced: bool,
}

/// Pure protocol state for one client.
#[derive(Debug, Default)]
pub struct BaseClient {
    state: LocalSyncState,
    remote_query_set: RemoteQuerySet,
    optimistic_query_results: OptimisticQueryResults,
    request_manager: RequestManager,
    outbox: VecDeque<ClientMessage>,
}

impl BaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Subscribes to a query and returns its token.
    pub fn subscribe(
        &mut self,
        path: &FunctionPath,
        args: &Args,
        options: &WatchOptions,
    ) -> QueryToken {
        let outcome = self.state.subscribe(path, args, options);
        if let Some(modification) = outcome.modification {
            self.outbox.push_back(modification);
        }
        outcome.query_token
    }

    /// Drops one subscriber of a query.
    pub fn unsubscribe(&mut self, query_token: &QueryToken) -> Vec<QueryToken> {
        match self.state.unsubscribe(query_token) {
            Some((query_id, modification)) => {
                self.outbox.push_back(modification);
                self.remote_query_set.forget(query_id);
                self.refresh_visible(&BTreeSet::new())
            }
            None => Vec::new(),
        }
    }

    /// Visible result of a subscribed query: `Ok(None)` while loading.
    pub fn local_query_result(
        &self,
        query_token: &QueryToken,
    ) -> Result<Option<Value>, FunctionError> {
        match self.optimistic_query_results.query_result(query_token) {
            Some(result) => result.to_local(),
            None => Ok(None),
        }
    }

    /// True while at least one subscriber holds the query.
    pub fn is_subscribed(&self, query_token: &QueryToken) -> bool {
        self.state.query_id(query_token).is_some()
    }

    /// Journal the server last sent for a query.
    pub fn query_journal(&self, query_token: &QueryToken) -> Option<Journal> {
        let query_id = self.state.query_id(query_token)?;
        self.remote_query_set.journal(query_id)
    }

    // =========================================================================
    // Mutations & Actions
    // =========================================================================

    /// Queues a mutation, applying its optimistic update first.
    ///
    /// Returns the request id and the queries the update changed.
    pub fn mutation(
        &mut self,
        path: FunctionPath,
        args: Args,
        optimistic_update: Option<OptimisticUpdate>,
    ) -> (RequestId, Vec<QueryToken>) {
        let request_id = self.request_manager.next_request_id();
        let changed = match optimistic_update {
            Some(update) => self
                .optimistic_query_results
                .apply_optimistic_update(update, request_id),
            None => Vec::new(),
        };
        let message = ClientMessage::Mutation {
            request_id,
            udf_path: path,
            args,
        };
        self.request_manager.request(request_id, message.clone());
        self.outbox.push_back(message);
        (request_id, changed)
    }

    /// Queues an action.
    pub fn action(&mut self, path: FunctionPath, args: Args) -> RequestId {
        let request_id = self.request_manager.next_request_id();
        let message = ClientMessage::Action {
            request_id,
            udf_path: path,
            args,
        };
        self.request_manager.request(request_id, message.clone());
        self.outbox.push_back(message);
        request_id
    }

    /// Abandons a request; its optimistic update is rolled back.
    pub fn cancel_request(&mut self, request_id: RequestId) -> Vec<QueryToken> {
        if !self.request_manager.cancel(request_id) {
            return Vec::new();
        }
        self.outbox.retain(|message| {
            !matches!(message,
                ClientMessage::Mutation { request_id: id, .. }
                | ClientMessage::Action { request_id: id, .. } if *id == request_id)
        });
        debug!(request_id, "Request cancelled");
        self.optimistic_query_results
            .remove_updates(&BTreeSet::from([request_id]))
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.request_manager.has_incomplete_requests()
    }

    pub fn has_inflight_requests(&self) -> bool {
        self.request_manager.has_inflight_requests()
    }

    pub fn inflight_mutations(&self) -> usize {
        self.request_manager.inflight_mutations()
    }

    pub fn inflight_actions(&self) -> usize {
        self.request_manager.inflight_actions()
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Installs credentials and queues the `Authenticate` for them, ahead of
    /// anything queued while the token was being fetched.
    pub fn set_auth(&mut self, token: AuthToken) {
        let message = self.state.set_auth(token);
        self.outbox.push_front(message);
    }

    /// Installs credentials without telling the current connection; they go
    /// out with the next `restart()`.
    pub fn set_auth_for_restart(&mut self, token: AuthToken) {
        self.state.set_auth(token);
    }

    /// Drops credentials and queues the logout `Authenticate`.
    pub fn clear_auth(&mut self) {
        if let Some(message) = self.state.clear_auth() {
            self.outbox.push_back(message);
        }
    }

    pub fn has_auth(&self) -> bool {
        self.state.has_auth()
    }

    /// Identity version of the current session.
    pub fn identity_version(&self) -> u32 {
        self.state.identity_version()
    }

    // =========================================================================
    // Server Messages
    // =========================================================================

    /// Applies a server message.
    ///
    /// ## Errors
    /// `VersionMismatch` for a Transition that does not continue the current
    /// version. The session must then be restarted.
    pub fn receive_message(&mut self, message: ServerMessage) -> CoreResult<ReceiveOutcome> {
        match message {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                for modification in &modifications {
                    let query_id = modification.query_id();
                    if self.state.query_token(query_id).is_none() {
                        debug!(query_id, "Ignoring modification for unsubscribed query");
                    }
                }

                let transition = self.remote_query_set.apply_transition(
                    start_version,
                    end_version,
                    modifications,
                )?;

                for query_id in &transition.changed {
                    let journal = self.remote_query_set.journal(*query_id);
                    self.state.save_journal(*query_id, journal);
                }

                let completed = self
                    .request_manager
                    .remove_completed(self.remote_query_set.timestamp());
                let resolved = completed.iter().map(|c| c.request_id).collect();
                let changed_queries = self.refresh_visible(&resolved);

                Ok(ReceiveOutcome {
                    changed_queries,
                    completed,
                    identity_advanced: transition.identity_advanced,
                })
            }
            response @ (ServerMessage::MutationResponse { .. }
            | ServerMessage::ActionResponse { .. }) => {
                let completed = match self
                    .request_manager
                    .on_response(&response, self.remote_query_set.timestamp())
                {
                    Ok(completed) => completed,
                    Err(err @ CoreError::UnknownRequest(_)) => {
                        warn!(error = %err, "Dropping response");
                        None
                    }
                    Err(err) => return Err(err),
                };

                let Some(completed) = completed else {
                    return Ok(ReceiveOutcome::default());
                };
                let changed_queries = self
                    .optimistic_query_results
                    .remove_updates(&BTreeSet::from([completed.request_id]));
                Ok(ReceiveOutcome {
                    changed_queries,
                    completed: vec![completed],
                    identity_advanced: false,
                })
            }
            other => {
                debug!(message_type = other.type_name(), "Not a state message");
                Ok(ReceiveOutcome::default())
            }
        }
    }

    fn refresh_visible(&mut self, resolved: &BTreeSet<RequestId>) -> Vec<QueryToken> {
        let mut confirmed = BTreeMap::new();
        for (token, query_id) in self.state.queries() {
            let Some(result) = self.remote_query_set.result(query_id) else {
                continue;
            };
            if let Some((path, args)) = self.state.query_request(token) {
                confirmed.insert(
                    token.clone(),
                    QueryResultEntry {
                        path: path.clone(),
                        args: args.clone(),
                        result: result.clone(),
                    },
                );
            }
        }
        self.optimistic_query_results
            .ingest_query_results_from_server(confirmed, resolved)
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Drains the messages to send, marking requests as sent.
    pub fn take_outbox(&mut self) -> Vec<ClientMessage> {
        let messages: Vec<ClientMessage> = self.outbox.drain(..).collect();
        for message in &messages {
            if let ClientMessage::Mutation { request_id, .. }
            | ClientMessage::Action { request_id, .. } = message
            {
                self.request_manager.mark_sent(*request_id);
            }
        }
        messages
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Rebuilds the outbox for a brand-new connection.
    ///
    /// The outbox becomes: `Authenticate` (if credentials), a full
    /// `ModifyQuerySet`, then every never-sent request. Returns actions that
    /// were in flight and are now failed.
    pub fn restart(&mut self) -> Vec<CompletedRequest> {
        self.outbox.clear();
        self.outbox.extend(self.state.restart());
        let (resend, failed) = self.request_manager.restart();
        self.outbox.extend(resend);
        self.remote_query_set.restart();
        failed
    }

    pub fn version(&self) -> StateVersion {
        self.remote_query_set.version()
    }

    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.remote_query_set.max_observed_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::LocalStoreView;
    use crate::protocol::StateModification;
    use serde_json::json;
    use std::sync::Arc;

    fn path(raw: &str) -> FunctionPath {
        raw.parse().unwrap()
    }

    fn version(query_set: u32, identity: u32, ts: u64) -> StateVersion {
        StateVersion {
            query_set,
            identity,
            ts,
        }
    }

    fn transition(
        start: StateVersion,
        end: StateVersion,
        modifications: Vec<StateModification>,
    ) -> ServerMessage {
        ServerMessage::Transition {
            start_version: start,
            end_version: end,
            modifications,
        }
    }

    fn updated(query_id: u32, value: Value) -> StateModification {
        StateModification::QueryUpdated {
            query_id,
            value,
            journal: None,
            log_lines: vec![],
        }
    }

    fn set_count(value: i64) -> OptimisticUpdate {
        Arc::new(move |store: &mut LocalStoreView<'_>| {
            store.set_query(&path("counter:get"), &Args::new(), Some(json!(value)));
        })
    }

    #[test]
    fn test_subscribe_queues_modify_query_set() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        let again = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        assert_eq!(token, again);

        let outbox = client.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].type_name(), "ModifyQuerySet");
        assert_eq!(client.local_query_result(&token), Ok(None));
    }

    #[test]
    fn test_transition_updates_visible_result() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        let outcome = client
            .receive_message(transition(
                StateVersion::initial(),
                version(1, 0, 1),
                vec![updated(0, json!(1))],
            ))
            .unwrap();
        assert_eq!(outcome.changed_queries, vec![token.clone()]);
        assert_eq!(client.local_query_result(&token), Ok(Some(json!(1))));
    }

    #[test]
    fn test_transition_for_unsubscribed_query_is_applied_quietly() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        let outcome = client
            .receive_message(transition(
                StateVersion::initial(),
                version(1, 0, 1),
                vec![updated(7, json!("stray")), updated(0, json!(3))],
            ))
            .unwrap();

        assert_eq!(outcome.changed_queries, vec![token.clone()]);
        assert_eq!(client.local_query_result(&token), Ok(Some(json!(3))));
        assert_eq!(client.version(), version(1, 0, 1));
    }

    #[test]
    fn test_mutation_resolves_after_transition_reaches_ts() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        client
            .receive_message(transition(
                StateVersion::initial(),
                version(1, 0, 1),
                vec![updated(0, json!(1))],
            ))
            .unwrap();

        let (request_id, changed) =
            client.mutation(path("counter:inc"), Args::new(), Some(set_count(2)));
        assert_eq!(changed, vec![token.clone()]);
        assert_eq!(client.local_query_result(&token), Ok(Some(json!(2))));
        client.take_outbox();

        let response = ServerMessage::MutationResponse {
            request_id,
            success: true,
            result: Value::Null,
            error_message: None,
            error_data: None,
            ts: Some(5),
            log_lines: vec![],
        };
        let outcome = client.receive_message(response).unwrap();
        assert!(outcome.completed.is_empty());
        assert_eq!(client.local_query_result(&token), Ok(Some(json!(2))));

        let outcome = client
            .receive_message(transition(
                version(1, 0, 1),
                version(1, 0, 5),
                vec![updated(0, json!(2))],
            ))
            .unwrap();
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.completed[0].request_id, request_id);
        assert!(outcome.changed_queries.is_empty());
        assert!(!client.has_unsaved_changes());
    }

    #[test]
    fn test_mutation_failure_rolls_back() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        client
            .receive_message(transition(
                StateVersion::initial(),
                version(1, 0, 1),
                vec![updated(0, json!(1))],
            ))
            .unwrap();
        let before = client.local_query_result(&token);

        let (request_id, _) = client.mutation(path("counter:inc"), Args::new(), Some(set_count(9)));
        let outcome = client
            .receive_message(ServerMessage::MutationResponse {
                request_id,
                success: false,
                result: Value::Null,
                error_message: Some("nope".into()),
                error_data: Some(json!({"reason": "limit"})),
                ts: None,
                log_lines: vec![],
            })
            .unwrap();

        assert_eq!(outcome.changed_queries, vec![token.clone()]);
        let err = outcome.completed[0].result.clone().unwrap_err();
        assert_eq!(err.data, Some(json!({"reason": "limit"})));
        assert_eq!(client.local_query_result(&token), before);
    }

    #[test]
    fn test_version_mismatch_surfaces() {
        let mut client = BaseClient::new();
        let err = client
            .receive_message(transition(version(3, 0, 3), version(4, 0, 4), vec![]))
            .unwrap_err();
        assert!(err.is_protocol_fault());
    }

    #[test]
    fn test_restart_rebuilds_outbox() {
        let mut client = BaseClient::new();
        client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        client.set_auth(AuthToken::User("T1".into()));
        let sent = client.action(path("email:send"), Args::new());
        client.take_outbox();
        let unsent = client.action(path("email:send"), Args::new());

        let failed = client.restart();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request_id, sent);

        let outbox = client.take_outbox();
        let kinds: Vec<_> = outbox.iter().map(|m| m.type_name()).collect();
        assert_eq!(kinds, vec!["Authenticate", "ModifyQuerySet", "Action"]);
        assert!(matches!(
            outbox[2],
            ClientMessage::Action { request_id, .. } if request_id == unsent
        ));
        assert_eq!(client.identity_version(), 1);
    }

    #[test]
    fn test_cancel_rolls_back_and_unqueues() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("counter:get"), &Args::new(), &WatchOptions::default());
        client.take_outbox();
        let (request_id, _) = client.mutation(path("counter:inc"), Args::new(), Some(set_count(3)));
        assert_eq!(client.local_query_result(&token), Ok(Some(json!(3))));

        let changed = client.cancel_request(request_id);
        assert_eq!(changed, vec![token.clone()]);
        assert_eq!(client.local_query_result(&token), Ok(None));
        assert!(client.take_outbox().is_empty());
    }

    #[test]
    fn test_journal_saved_for_reconnect() {
        let mut client = BaseClient::new();
        let token = client.subscribe(&path("messages:page"), &Args::new(), &WatchOptions::default());
        client
            .receive_message(transition(
                StateVersion::initial(),
                version(1, 0, 1),
                vec![StateModification::QueryUpdated {
                    query_id: 0,
                    value: json!([]),
                    journal: Some("cursor-1".into()),
                    log_lines: vec![],
                }],
            ))
            .unwrap();
        assert_eq!(client.query_journal(&token), Some("cursor-1".to_string()));

        client.restart();
        match &client.take_outbox()[0] {
            ClientMessage::ModifyQuerySet { modifications, .. } => {
                assert!(matches!(
                    &modifications[0],
                    crate::protocol::QuerySetModification::Add(q) if q.journal.as_deref() == Some("cursor-1")
                ));
            }
            other => panic!("Expected ModifyQuerySet, got {:?}", other),
        }
    }
}
