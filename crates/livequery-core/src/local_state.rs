//! # Local Sync State
//!
//! The client's *desired* state: which queries it wants and which identity
//! it wants to be. Every change produces the protocol message that tells
//! the server about it.
//!
//! ## Version Counters
//! ```text
//!   subscribe(new token)   query_set_version  n → n+1   ModifyQuerySet{n, n+1, [Add]}
//!   unsubscribe(last ref)  query_set_version  n → n+1   ModifyQuerySet{n, n+1, [Remove]}
//!   set_auth / clear_auth  identity_version   i → i+1   Authenticate{baseVersion: i}
//!
//!   restart()  (new connection)
//!     identity_version  = 0 (or 1 after Authenticate{0, token})
//!     query_set_version = 1 after ModifyQuerySet{0, 1, [every query]}
//! ```

use std::collections::BTreeMap;

use tracing::debug;

use crate::protocol::{ClientMessage, Query, QuerySetModification};
use crate::types::{
    Args, AuthToken, FunctionPath, Journal, PaginationOptions, QueryId, QueryToken, WatchOptions,
};

/// Argument name carrying pagination options to the server.
pub const PAGINATION_ARG: &str = "paginationOpts";

#[derive(Debug, Clone)]
struct LocalQuery {
    id: QueryId,
    path: FunctionPath,
    args: Args,
    pagination_options: Option<PaginationOptions>,
    journal: Option<Journal>,
    num_subscribers: usize,
}

impl LocalQuery {
    fn to_wire(&self) -> Query {
        let mut args = self.args.clone();
        if let Some(options) = &self.pagination_options {
            if let Ok(value) = serde_json::to_value(options) {
                args.insert(PAGINATION_ARG.to_string(), value);
            }
        }
        Query {
            query_id: self.id,
            udf_path: self.path.clone(),
            args,
            journal: self.journal.clone(),
        }
    }
}

/// Result of `LocalSyncState::subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub query_token: QueryToken,
    pub query_id: QueryId,
    /// Present only when this is the first subscriber of the token.
    pub modification: Option<ClientMessage>,
}

/// Desired query set and identity for the current session.
#[derive(Debug, Default)]
pub struct LocalSyncState {
    next_query_id: QueryId,
    query_set_version: u32,
    query_set: BTreeMap<QueryToken, LocalQuery>,
    query_ids: BTreeMap<QueryId, QueryToken>,
    identity_version: u32,
    auth: Option<AuthToken>,
}

impl LocalSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Adds a subscriber for (path, args, pagination).
    ///
    /// Identical requests share one QueryId; only the first produces a
    /// `ModifyQuerySet`.
    pub fn subscribe(
        &mut self,
        path: &FunctionPath,
        args: &Args,
        options: &WatchOptions,
    ) -> SubscribeOutcome {
        let query_token = QueryToken::new(path, args, options.pagination_options.as_ref());

        if let Some(existing) = self.query_set.get_mut(&query_token) {
            existing.num_subscribers += 1;
            return SubscribeOutcome {
                query_token,
                query_id: existing.id,
                modification: None,
            };
        }

        let query_id = self.next_query_id;
        self.next_query_id += 1;

        let query = LocalQuery {
            id: query_id,
            path: path.clone(),
            args: args.clone(),
            pagination_options: options.pagination_options.clone(),
            journal: options.journal.clone(),
            num_subscribers: 1,
        };
        let add = QuerySetModification::Add(query.to_wire());
        self.query_set.insert(query_token.clone(), query);
        self.query_ids.insert(query_id, query_token.clone());

        debug!(query_id, path = %path, "Subscribed query");
        SubscribeOutcome {
            query_token,
            query_id,
            modification: Some(self.bump_query_set(vec![add])),
        }
    }

    /// Removes one subscriber. Returns the removed QueryId and the
    /// `ModifyQuerySet` when the last subscriber leaves.
    pub fn unsubscribe(&mut self, query_token: &QueryToken) -> Option<(QueryId, ClientMessage)> {
        let query = self.query_set.get_mut(query_token)?;
        query.num_subscribers = query.num_subscribers.saturating_sub(1);
        if query.num_subscribers > 0 {
            return None;
        }

        let query_id = query.id;
        self.query_set.remove(query_token);
        self.query_ids.remove(&query_id);
        debug!(query_id, "Unsubscribed query");
        let remove = QuerySetModification::Remove { query_id };
        Some((query_id, self.bump_query_set(vec![remove])))
    }

    fn bump_query_set(&mut self, modifications: Vec<QuerySetModification>) -> ClientMessage {
        let base_version = self.query_set_version;
        self.query_set_version += 1;
        ClientMessage::ModifyQuerySet {
            base_version,
            new_version: self.query_set_version,
            modifications,
        }
    }

    /// Records the latest journal so a reconnect resumes from it.
    pub fn save_journal(&mut self, query_id: QueryId, journal: Option<Journal>) {
        if let Some(token) = self.query_ids.get(&query_id) {
            if let Some(query) = self.query_set.get_mut(token) {
                query.journal = journal;
            }
        }
    }

    pub fn query_token(&self, query_id: QueryId) -> Option<&QueryToken> {
        self.query_ids.get(&query_id)
    }

    pub fn query_id(&self, query_token: &QueryToken) -> Option<QueryId> {
        self.query_set.get(query_token).map(|q| q.id)
    }

    /// Path and arguments of a subscribed query (without pagination).
    pub fn query_request(&self, query_token: &QueryToken) -> Option<(&FunctionPath, &Args)> {
        self.query_set.get(query_token).map(|q| (&q.path, &q.args))
    }

    /// Every subscribed (token, id) pair.
    pub fn queries(&self) -> impl Iterator<Item = (&QueryToken, QueryId)> {
        self.query_set.iter().map(|(token, q)| (token, q.id))
    }

    pub fn query_set_version(&self) -> u32 {
        self.query_set_version
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Installs new credentials and returns the `Authenticate` for them.
    pub fn set_auth(&mut self, token: AuthToken) -> ClientMessage {
        let message = ClientMessage::authenticate(self.identity_version, &token);
        self.identity_version += 1;
        self.auth = match token {
            AuthToken::None => None,
            token => Some(token),
        };
        message
    }

    /// Drops credentials. Returns the logout `Authenticate` if there were any.
    pub fn clear_auth(&mut self) -> Option<ClientMessage> {
        self.auth.take()?;
        let message = ClientMessage::authenticate(self.identity_version, &AuthToken::None);
        self.identity_version += 1;
        Some(message)
    }

    pub fn auth(&self) -> Option<&AuthToken> {
        self.auth.as_ref()
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Identity version of the current session.
    pub fn identity_version(&self) -> u32 {
        self.identity_version
    }

    // =========================================================================
    // Reconnect
    // =========================================================================

    /// Resets counters for a new connection and returns the messages that
    /// re-establish the full desired state on it.
    pub fn restart(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::with_capacity(2);

        self.identity_version = 0;
        if let Some(token) = &self.auth {
            messages.push(ClientMessage::authenticate(0, token));
            self.identity_version = 1;
        }

        let modifications = self
            .query_set
            .values()
            .map(|q| QuerySetModification::Add(q.to_wire()))
            .collect();
        self.query_set_version = 1;
        messages.push(ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: 1,
            modifications,
        });

        messages
    }
}
