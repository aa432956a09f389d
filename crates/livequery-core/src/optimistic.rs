//! # Optimistic Query Results
//!
//! Visible query results = confirmed server results with every pending
//! optimistic update replayed on top, oldest first.
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   visible    ◄── update #7 (request 7) ◄── update #4 ◄── update #2      │
//! │                                                             ▲           │
//! │                                                             │           │
//! │   confirmed  ───────────────────────────────────────────────┘           │
//! │   (RemoteQuerySet, by QueryToken)                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Visible state is always recomputed from the confirmed layer, so dropping
//! an update (rejection, cancellation) restores exactly the state the
//! remaining updates produce, with no residue of the dropped one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::types::{Args, FunctionPath, QueryToken, RemoteQueryResult, RequestId, Value};

/// Caller-supplied speculative write, replayed until its mutation resolves.
pub type OptimisticUpdate = Arc<dyn Fn(&mut LocalStoreView<'_>) + Send + Sync>;

/// A query result together with the request that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultEntry {
    pub path: FunctionPath,
    pub args: Args,
    pub result: RemoteQueryResult,
}

// =============================================================================
// Local Store View
// =============================================================================

/// Read/write view over visible query results handed to optimistic updates.
pub struct LocalStoreView<'a> {
    results: &'a mut BTreeMap<QueryToken, QueryResultEntry>,
    modified: &'a mut BTreeSet<QueryToken>,
}

impl<'a> LocalStoreView<'a> {
    /// Current value of a (non-paginated) query.
    ///
    /// `None` if the query is not loaded or its latest result is an error.
    pub fn get_query(&self, path: &FunctionPath, args: &Args) -> Option<Value> {
        let token = QueryToken::new(path, args, None);
        match self.results.get(&token).map(|e| &e.result) {
            Some(RemoteQueryResult::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Every loaded query of a function, with its arguments.
    pub fn get_all_queries(&self, path: &FunctionPath) -> Vec<(Args, Option<Value>)> {
        self.results
            .values()
            .filter(|entry| &entry.path == path)
            .map(|entry| {
                let value = match &entry.result {
                    RemoteQueryResult::Value(value) => Some(value.clone()),
                    _ => None,
                };
                (entry.args.clone(), value)
            })
            .collect()
    }

    /// Overwrites the visible value of a query; `None` makes it loading.
    pub fn set_query(&mut self, path: &FunctionPath, args: &Args, value: Option<Value>) {
        let token = QueryToken::new(path, args, None);
        let result = match value {
            Some(value) => RemoteQueryResult::Value(value),
            None => RemoteQueryResult::Loading,
        };
        self.results.insert(
            token.clone(),
            QueryResultEntry {
                path: path.clone(),
                args: args.clone(),
                result,
            },
        );
        self.modified.insert(token);
    }
}

// =============================================================================
// Optimistic Query Results
// =============================================================================

/// Confirmed results plus the pending optimistic layer.
#[derive(Default)]
pub struct OptimisticQueryResults {
    confirmed: BTreeMap<QueryToken, QueryResultEntry>,
    updates: Vec<(RequestId, OptimisticUpdate)>,
    visible: BTreeMap<QueryToken, QueryResultEntry>,
}

impl fmt::Debug for OptimisticQueryResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticQueryResults")
            .field("confirmed", &self.confirmed.len())
            .field("updates", &self.updates.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("visible", &self.visible.len())
            .finish()
    }
}

impl OptimisticQueryResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible result of a query.
    pub fn query_result(&self, token: &QueryToken) -> Option<&RemoteQueryResult> {
        self.visible.get(token).map(|e| &e.result)
    }

    /// Applies a new update on top of the visible state and keeps it for replay.
    ///
    /// Returns the tokens whose visible result changed.
    pub fn apply_optimistic_update(
        &mut self,
        update: OptimisticUpdate,
        request_id: RequestId,
    ) -> Vec<QueryToken> {
        let before = self.visible.clone();
        let mut modified = BTreeSet::new();
        {
            let mut view = LocalStoreView {
                results: &mut self.visible,
                modified: &mut modified,
            };
            update(&mut view);
        }
        self.updates.push((request_id, update));
        changed_tokens(&before, &self.visible, modified)
    }

    /// Replaces the confirmed layer, drops updates of resolved requests and
    /// replays the rest.
    ///
    /// Returns the tokens whose visible result changed.
    pub fn ingest_query_results_from_server(
        &mut self,
        confirmed: BTreeMap<QueryToken, QueryResultEntry>,
        resolved_requests: &BTreeSet<RequestId>,
    ) -> Vec<QueryToken> {
        self.confirmed = confirmed;
        self.updates
            .retain(|(request_id, _)| !resolved_requests.contains(request_id));
        self.recompute()
    }

    /// Drops the updates of the given requests.
    pub fn remove_updates(&mut self, request_ids: &BTreeSet<RequestId>) -> Vec<QueryToken> {
        let before = self.updates.len();
        self.updates
            .retain(|(request_id, _)| !request_ids.contains(request_id));
        if self.updates.len() == before {
            return Vec::new();
        }
        self.recompute()
    }

    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    fn recompute(&mut self) -> Vec<QueryToken> {
        let mut visible = self.confirmed.clone();
        let mut modified = BTreeSet::new();
        for (_, update) in &self.updates {
            let mut view = LocalStoreView {
                results: &mut visible,
                modified: &mut modified,
            };
            update(&mut view);
        }
        let candidates = self
            .visible
            .keys()
            .chain(visible.keys())
            .cloned()
            .collect::<BTreeSet<_>>();
        let changed = changed_tokens(&self.visible, &visible, candidates);
        self.visible = visible;
        changed
    }
}

fn changed_tokens(
    before: &BTreeMap<QueryToken, QueryResultEntry>,
    after: &BTreeMap<QueryToken, QueryResultEntry>,
    candidates: BTreeSet<QueryToken>,
) -> Vec<QueryToken> {
    candidates
        .into_iter()
        .filter(|token| before.get(token).map(|e| &e.result) != after.get(token).map(|e| &e.result))
        .collect()
}
