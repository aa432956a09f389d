//! # Request Manager
//!
//! Tracks every mutation and action from submission until the caller has
//! been given its result.
//!
//! ## Request Lifecycle
//! ```text
//!  ┌─────────┐  put on the wire  ┌───────────┐  MutationResponse  ┌───────────┐
//!  │ NotSent │ ─────────────────►│ Requested │ ──── success ─────►│ Completed │
//!  └─────────┘                   └───────────┘    (ts = T)        │  (ts = T) │
//!       ▲                              │                          └─────┬─────┘
//!       │ reconnect: re-sent           │ failure / ActionResponse       │ remote ts ≥ T
//!       └──────────────                ▼                                ▼
//!                                   resolved                         resolved
//! ```
//!
//! A successful mutation is not resolved until the confirmed query results
//! include its writes, so the optimistic update is never removed before its
//! real effect becomes visible.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::protocol::{response_outcome, ClientMessage, ServerMessage};
use crate::types::{FunctionError, FunctionResult, RequestId, Timestamp};

/// Message used to fail actions that were in flight when the connection dropped.
pub const ACTION_CONNECTION_LOST: &str = "Connection lost while action was in flight";

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestStatus {
    /// Queued, never written to a connection.
    NotSent,
    /// Written to a connection, no response yet.
    Requested,
    /// Server succeeded at `ts`; waiting for results to catch up.
    Completed { ts: Timestamp, result: FunctionResult },
}

/// One outstanding mutation or action.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Wire message (Mutation or Action).
    pub message: ClientMessage,

    /// Current status.
    pub status: RequestStatus,
}

impl PendingRequest {
    fn is_mutation(&self) -> bool {
        matches!(self.message, ClientMessage::Mutation { .. })
    }
}

/// A request whose result should now be delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest {
    pub request_id: RequestId,
    pub result: FunctionResult,
}

/// Outstanding mutations and actions, keyed by request id.
#[derive(Debug, Default)]
pub struct RequestManager {
    requests: BTreeMap<RequestId, PendingRequest>,
    next_request_id: RequestId,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id.
    pub fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Tracks a new request in `NotSent`.
    pub fn request(&mut self, request_id: RequestId, message: ClientMessage) {
        self.requests.insert(
            request_id,
            PendingRequest {
                message,
                status: RequestStatus::NotSent,
            },
        );
    }

    /// Marks a request as written to the connection.
    pub fn mark_sent(&mut self, request_id: RequestId) {
        if let Some(request) = self.requests.get_mut(&request_id) {
            if request.status == RequestStatus::NotSent {
                request.status = RequestStatus::Requested;
            }
        }
    }

    pub fn status(&self, request_id: RequestId) -> Option<&RequestStatus> {
        self.requests.get(&request_id).map(|r| &r.status)
    }

    /// Handles a `MutationResponse` or `ActionResponse`.
    ///
    /// Returns the request to resolve now, if any. A successful mutation
    /// whose `ts` is ahead of `current_ts` becomes `Completed` and is
    /// resolved later by [`remove_completed`](Self::remove_completed).
    pub fn on_response(
        &mut self,
        response: &ServerMessage,
        current_ts: Timestamp,
    ) -> CoreResult<Option<CompletedRequest>> {
        let (request_id, result, ts, log_lines) = match response {
            ServerMessage::MutationResponse {
                request_id,
                success,
                result,
                error_message,
                error_data,
                ts,
                log_lines,
            } => (
                *request_id,
                response_outcome(*success, result, error_message.as_deref(), error_data.as_ref()),
                if *success { *ts } else { None },
                log_lines,
            ),
            ServerMessage::ActionResponse {
                request_id,
                success,
                result,
                error_message,
                error_data,
                log_lines,
            } => (
                *request_id,
                response_outcome(*success, result, error_message.as_deref(), error_data.as_ref()),
                None,
                log_lines,
            ),
            _ => return Ok(None),
        };

        let request = self
            .requests
            .get_mut(&request_id)
            .ok_or(CoreError::UnknownRequest(request_id))?;

        for line in log_lines {
            info!(request_id, "[server] {}", line);
        }

        match ts {
            Some(ts) if ts > current_ts => {
                debug!(request_id, ts, current_ts, "Mutation completed, waiting for results");
                request.status = RequestStatus::Completed { ts, result };
                Ok(None)
            }
            _ => {
                self.requests.remove(&request_id);
                Ok(Some(CompletedRequest { request_id, result }))
            }
        }
    }

    /// Removes and returns every completed mutation visible at `current_ts`.
    pub fn remove_completed(&mut self, current_ts: Timestamp) -> Vec<CompletedRequest> {
        let ready: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| matches!(r.status, RequestStatus::Completed { ts, .. } if ts <= current_ts))
            .map(|(id, _)| *id)
            .collect();

        ready
            .into_iter()
            .filter_map(|request_id| {
                let request = self.requests.remove(&request_id)?;
                match request.status {
                    RequestStatus::Completed { result, .. } => {
                        Some(CompletedRequest { request_id, result })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Stops tracking a request the caller no longer waits for.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        self.requests.remove(&request_id).is_some()
    }

    /// Prepares for a new connection.
    ///
    /// Returns the never-sent requests to send, in submission order, and the
    /// actions that were in flight, now failed. Sent mutations are not
    /// re-submitted; they remain outstanding until answered or cancelled.
    pub fn restart(&mut self) -> (Vec<ClientMessage>, Vec<CompletedRequest>) {
        let mut resend = Vec::new();
        let mut failed = Vec::new();

        for (request_id, request) in &self.requests {
            match request.status {
                RequestStatus::NotSent => resend.push(request.message.clone()),
                RequestStatus::Requested if !request.is_mutation() => failed.push(*request_id),
                RequestStatus::Requested => {
                    warn!(request_id, "Mutation still awaiting response after reconnect");
                }
                RequestStatus::Completed { .. } => {}
            }
        }

        let failed = failed
            .into_iter()
            .map(|request_id| {
                self.requests.remove(&request_id);
                CompletedRequest {
                    request_id,
                    result: Err(FunctionError::message(ACTION_CONNECTION_LOST)),
                }
            })
            .collect();

        (resend, failed)
    }

    /// True if any request has not been resolved yet.
    pub fn has_incomplete_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// True if any request is on the wire awaiting a response.
    pub fn has_inflight_requests(&self) -> bool {
        self.requests
            .values()
            .any(|r| r.status == RequestStatus::Requested)
    }

    pub fn inflight_mutations(&self) -> usize {
        self.requests.values().filter(|r| r.is_mutation()).count()
    }

    pub fn inflight_actions(&self) -> usize {
        self.requests.values().filter(|r| !r.is_mutation()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Args;
    use serde_json::json;

    fn mutation(request_id: RequestId) -> ClientMessage {
        ClientMessage::Mutation {
            request_id,
            udf_path: "messages:send".parse().unwrap(),
            args: Args::new(),
        }
    }

    fn action(request_id: RequestId) -> ClientMessage {
        ClientMessage::Action {
            request_id,
            udf_path: "email:send".parse().unwrap(),
            args: Args::new(),
        }
    }

    fn mutation_ok(request_id: RequestId, ts: Timestamp) -> ServerMessage {
        ServerMessage::MutationResponse {
            request_id,
            success: true,
            result: json!("ok"),
            error_message: None,
            error_data: None,
            ts: Some(ts),
            log_lines: vec![],
        }
    }

    #[test]
    fn test_success_waits_for_timestamp() {
        let mut manager = RequestManager::new();
        let id = manager.next_request_id();
        manager.request(id, mutation(id));
        manager.mark_sent(id);

        assert_eq!(manager.on_response(&mutation_ok(id, 10), 5).unwrap(), None);
        assert!(matches!(manager.status(id), Some(RequestStatus::Completed { ts: 10, .. })));
        assert!(manager.remove_completed(9).is_empty());

        let done = manager.remove_completed(10);
        assert_eq!(
            done,
            vec![CompletedRequest {
                request_id: id,
                result: Ok(json!("ok"))
            }]
        );
        assert!(!manager.has_incomplete_requests());
    }

    #[test]
    fn test_success_already_visible_resolves_immediately() {
        let mut manager = RequestManager::new();
        let id = manager.next_request_id();
        manager.request(id, mutation(id));
        let done = manager.on_response(&mutation_ok(id, 3), 3).unwrap();
        assert_eq!(done.map(|d| d.request_id), Some(id));
    }

    #[test]
    fn test_failure_resolves_immediately() {
        let mut manager = RequestManager::new();
        let id = manager.next_request_id();
        manager.request(id, mutation(id));
        let response = ServerMessage::MutationResponse {
            request_id: id,
            success: false,
            result: json!(null),
            error_message: Some("denied".into()),
            error_data: None,
            ts: None,
            log_lines: vec!["checking".into()],
        };
        let done = manager.on_response(&response, 0).unwrap().unwrap();
        assert_eq!(done.result.unwrap_err().message, "denied");
    }

    #[test]
    fn test_unknown_request() {
        let mut manager = RequestManager::new();
        let err = manager.on_response(&mutation_ok(42, 1), 0).unwrap_err();
        assert!(matches!(err, CoreError::UnknownRequest(42)));
    }

    #[test]
    fn test_restart_semantics() {
        let mut manager = RequestManager::new();
        let sent_mutation = manager.next_request_id();
        manager.request(sent_mutation, mutation(sent_mutation));
        manager.mark_sent(sent_mutation);
        let sent_action = manager.next_request_id();
        manager.request(sent_action, action(sent_action));
        manager.mark_sent(sent_action);
        let unsent = manager.next_request_id();
        manager.request(unsent, mutation(unsent));

        let (resend, failed) = manager.restart();

        assert_eq!(resend, vec![mutation(unsent)]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request_id, sent_action);
        assert_eq!(
            failed[0].result.as_ref().unwrap_err().message,
            ACTION_CONNECTION_LOST
        );
        assert_eq!(manager.status(sent_mutation), Some(&RequestStatus::Requested));
        assert_eq!(manager.inflight_mutations(), 2);
        assert_eq!(manager.inflight_actions(), 0);
    }

    #[test]
    fn test_cancel() {
        let mut manager = RequestManager::new();
        let id = manager.next_request_id();
        manager.request(id, mutation(id));
        assert!(manager.cancel(id));
        assert!(!manager.cancel(id));
        assert!(!manager.has_incomplete_requests());
    }
}
