//! # Remote Query Set
//!
//! Server-confirmed results for every subscribed query.
//!
//! ## Transition Application
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     apply_transition(start, end, mods)                  │
//! │                                                                         │
//! │   start == current? ──── no ───► VersionMismatch (nothing applied)     │
//! │          │                                                              │
//! │         yes                                                             │
//! │          ▼                                                              │
//! │   for m in mods (in order)                                             │
//! │     QueryUpdated  → results[id] = Value,  journals[id] = journal       │
//! │     QueryFailed   → results[id] = Error,  journals[id] = journal       │
//! │     QueryRemoved  → drop results[id]                                   │
//! │          │                                                              │
//! │          ▼                                                              │
//! │   current = end;  identity_advanced = end.identity > start.identity    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! After a reconnect the set is `restart()`ed: the version goes back to
//! zero but results stay visible until the first Transition of the new
//! session arrives. Results the server did not re-confirm in that
//! Transition are dropped.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::protocol::StateModification;
use crate::types::{FunctionError, Journal, QueryId, RemoteQueryResult, StateVersion, Timestamp};

/// What a successfully applied Transition changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Queries whose result changed, in modification order.
    pub changed: Vec<QueryId>,

    /// True if `end_version.identity` moved past the previous identity.
    pub identity_advanced: bool,
}

/// Confirmed query results, keyed by per-connection query id.
#[derive(Debug, Default)]
pub struct RemoteQuerySet {
    version: StateVersion,
    results: BTreeMap<QueryId, RemoteQueryResult>,
    journals: BTreeMap<QueryId, Option<Journal>>,
    max_observed_timestamp: Option<Timestamp>,
    /// Results carried over a reconnect, not yet re-confirmed.
    unconfirmed: Option<BTreeSet<QueryId>>,
}

impl RemoteQuerySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the last applied Transition.
    pub fn version(&self) -> StateVersion {
        self.version
    }

    /// Timestamp of the last applied Transition.
    pub fn timestamp(&self) -> Timestamp {
        self.version.ts
    }

    /// Highest timestamp observed across every session.
    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.max_observed_timestamp
    }

    /// Confirmed result for a query, if the server has sent one.
    pub fn result(&self, query_id: QueryId) -> Option<&RemoteQueryResult> {
        self.results.get(&query_id)
    }

    /// Journal the server last sent for a query.
    pub fn journal(&self, query_id: QueryId) -> Option<Journal> {
        self.journals.get(&query_id).cloned().flatten()
    }

    /// Applies a Transition.
    ///
    /// ## Errors
    /// `VersionMismatch` if `start_version` is not the current version; the
    /// set is left untouched in that case.
    pub fn apply_transition(
        &mut self,
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    ) -> CoreResult<TransitionOutcome> {
        if start_version != self.version {
            return Err(CoreError::VersionMismatch {
                expected: self.version,
                received: start_version,
            });
        }

        let mut changed = Vec::with_capacity(modifications.len());
        for modification in modifications {
            let query_id = modification.query_id();
            match modification {
                StateModification::QueryUpdated {
                    value,
                    journal,
                    log_lines,
                    ..
                } => {
                    log_server_lines(query_id, &log_lines);
                    self.results
                        .insert(query_id, RemoteQueryResult::Value(value));
                    self.journals.insert(query_id, journal);
                }
                StateModification::QueryFailed {
                    error_message,
                    error_data,
                    journal,
                    log_lines,
                    ..
                } => {
                    log_server_lines(query_id, &log_lines);
                    self.results.insert(
                        query_id,
                        RemoteQueryResult::Error(FunctionError {
                            message: error_message,
                            data: error_data,
                        }),
                    );
                    self.journals.insert(query_id, journal);
                }
                StateModification::QueryRemoved { .. } => {
                    self.results.remove(&query_id);
                    self.journals.remove(&query_id);
                }
            }
            if let Some(unconfirmed) = self.unconfirmed.as_mut() {
                unconfirmed.remove(&query_id);
            }
            changed.push(query_id);
        }

        if let Some(unconfirmed) = self.unconfirmed.take() {
            for query_id in unconfirmed {
                debug!(query_id, "Dropping result not re-confirmed after reconnect");
                if self.results.remove(&query_id).is_some() {
                    changed.push(query_id);
                }
                self.journals.remove(&query_id);
            }
        }

        let identity_advanced = end_version.identity > start_version.identity;
        self.version = end_version;
        self.max_observed_timestamp = Some(
            self.max_observed_timestamp
                .map_or(end_version.ts, |ts| ts.max(end_version.ts)),
        );

        Ok(TransitionOutcome {
            changed,
            identity_advanced,
        })
    }

    /// Drops everything known about a query the client unsubscribed from.
    pub fn forget(&mut self, query_id: QueryId) {
        self.results.remove(&query_id);
        self.journals.remove(&query_id);
        if let Some(unconfirmed) = self.unconfirmed.as_mut() {
            unconfirmed.remove(&query_id);
        }
    }

    /// Resets the version for a new session, keeping results visible.
    pub fn restart(&mut self) {
        self.version = StateVersion::initial();
        self.unconfirmed = Some(self.results.keys().copied().collect());
    }
}

fn log_server_lines(query_id: QueryId, lines: &[String]) {
    for line in lines {
        info!(query_id, "[server] {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version(query_set: u32, identity: u32, ts: u64) -> StateVersion {
        StateVersion {
            query_set,
            identity,
            ts,
        }
    }

    fn updated(query_id: QueryId, value: serde_json::Value) -> StateModification {
        StateModification::QueryUpdated {
            query_id,
            value,
            journal: None,
            log_lines: vec![],
        }
    }

    #[test]
    fn test_apply_transition_in_order() {
        let mut set = RemoteQuerySet::new();
        let outcome = set
            .apply_transition(
                StateVersion::initial(),
                version(1, 0, 5),
                vec![
                    updated(0, json!(1)),
                    updated(0, json!(2)),
                    StateModification::QueryFailed {
                        query_id: 1,
                        error_message: "boom".into(),
                        error_data: None,
                        journal: Some("j".into()),
                        log_lines: vec!["line".into()],
                    },
                ],
            )
            .unwrap();

        assert_eq!(outcome.changed, vec![0, 0, 1]);
        assert!(!outcome.identity_advanced);
        assert_eq!(set.result(0), Some(&RemoteQueryResult::Value(json!(2))));
        assert!(matches!(set.result(1), Some(RemoteQueryResult::Error(_))));
        assert_eq!(set.journal(1), Some("j".to_string()));
        assert_eq!(set.version(), version(1, 0, 5));
    }

    #[test]
    fn test_version_mismatch_applies_nothing() {
        let mut set = RemoteQuerySet::new();
        set.apply_transition(StateVersion::initial(), version(1, 0, 5), vec![updated(0, json!(1))])
            .unwrap();

        let err = set
            .apply_transition(version(1, 0, 4), version(2, 0, 6), vec![updated(0, json!(9))])
            .unwrap_err();

        assert!(matches!(err, CoreError::VersionMismatch { .. }));
        assert!(err.is_protocol_fault());
        assert_eq!(set.result(0), Some(&RemoteQueryResult::Value(json!(1))));
        assert_eq!(set.version(), version(1, 0, 5));
    }

    #[test]
    fn test_version_continuity_over_many_transitions() {
        let mut set = RemoteQuerySet::new();
        let mut current = StateVersion::initial();
        for ts in 1..=20u64 {
            let next = version(current.query_set + (ts % 2) as u32, 0, ts * 10);
            set.apply_transition(current, next, vec![updated(0, json!(ts))])
                .unwrap();
            current = next;
            assert_eq!(set.version(), current);
        }
        assert_eq!(set.timestamp(), 200);
    }

    #[test]
    fn test_identity_advance_detected() {
        let mut set = RemoteQuerySet::new();
        let outcome = set
            .apply_transition(StateVersion::initial(), version(1, 1, 1), vec![])
            .unwrap();
        assert!(outcome.identity_advanced);
        assert!(outcome.changed.is_empty());
    }

    #[test]
    fn test_query_removed() {
        let mut set = RemoteQuerySet::new();
        set.apply_transition(StateVersion::initial(), version(1, 0, 1), vec![updated(3, json!("x"))])
            .unwrap();
        set.apply_transition(
            version(1, 0, 1),
            version(2, 0, 2),
            vec![StateModification::QueryRemoved { query_id: 3 }],
        )
        .unwrap();
        assert_eq!(set.result(3), None);
    }

    #[test]
    fn test_restart_keeps_results_until_first_transition() {
        let mut set = RemoteQuerySet::new();
        set.apply_transition(
            StateVersion::initial(),
            version(1, 0, 7),
            vec![updated(0, json!("a")), updated(1, json!("b"))],
        )
        .unwrap();

        set.restart();
        assert_eq!(set.version(), StateVersion::initial());
        assert_eq!(set.result(0), Some(&RemoteQueryResult::Value(json!("a"))));

        let outcome = set
            .apply_transition(StateVersion::initial(), version(1, 0, 8), vec![updated(0, json!("a2"))])
            .unwrap();
        assert_eq!(outcome.changed, vec![0, 1]);
        assert_eq!(set.result(0), Some(&RemoteQueryResult::Value(json!("a2"))));
        assert_eq!(set.result(1), None);
        assert_eq!(set.max_observed_timestamp(), Some(8));
    }
}
