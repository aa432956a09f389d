//! # Sync Protocol Messages
//!
//! Message types exchanged between the client and the deployment.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE (every new connection)                                      │
//! │  ─────────                                                             │
//! │  CLIENT ───► Connect { sessionId, connectionCount, lastCloseReason }   │
//! │  CLIENT ───► Authenticate { baseVersion: 0, tokenType, value }         │
//! │  CLIENT ───► ModifyQuerySet { baseVersion: 0, newVersion: 1, [...] }   │
//! │                                                                         │
//! │  QUERY RESULTS                                                         │
//! │  ─────────────                                                         │
//! │  SERVER ───► Transition { startVersion, endVersion, modifications }    │
//! │                                                                         │
//! │  WRITES                                                                │
//! │  ──────                                                                │
//! │  CLIENT ───► Mutation { requestId, udfPath, args }                     │
//! │  SERVER ───► MutationResponse { requestId, success, ts, ... }          │
//! │  CLIENT ───► Action { requestId, udfPath, args }                       │
//! │  SERVER ───► ActionResponse { requestId, success, ... }                │
//! │                                                                         │
//! │  FAILURES                                                              │
//! │  ────────                                                              │
//! │  SERVER ───► AuthError { error, baseVersion, authUpdateAttempted }     │
//! │  SERVER ───► FatalError { error }                                      │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  SERVER ───► Ping                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Messages are internally tagged JSON with camelCase fields:
//! ```json
//! { "type": "Mutation", "requestId": 0, "udfPath": "messages:send", "args": {} }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Args, AuthToken, FunctionError, FunctionPath, FunctionResult, Journal, QueryId, RequestId,
    StateVersion, Timestamp, Value,
};

// =============================================================================
// Client → Server
// =============================================================================

/// All messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message on every connection.
    #[serde(rename_all = "camelCase")]
    Connect {
        session_id: String,
        connection_count: u32,
        last_close_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_observed_timestamp: Option<Timestamp>,
    },

    /// Change the subscribed query set.
    #[serde(rename_all = "camelCase")]
    ModifyQuerySet {
        base_version: u32,
        new_version: u32,
        modifications: Vec<QuerySetModification>,
    },

    /// Run a mutation.
    #[serde(rename_all = "camelCase")]
    Mutation {
        request_id: RequestId,
        udf_path: FunctionPath,
        args: Args,
    },

    /// Run an action.
    #[serde(rename_all = "camelCase")]
    Action {
        request_id: RequestId,
        udf_path: FunctionPath,
        args: Args,
    },

    /// Change the connection's identity.
    #[serde(rename_all = "camelCase")]
    Authenticate {
        base_version: u32,
        token_type: AuthenticationTokenType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

/// Token kind as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationTokenType {
    User,
    PlaintextUser,
    None,
}

/// One change to the subscribed query set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuerySetModification {
    /// Subscribe a query.
    Add(Query),

    /// Unsubscribe a query.
    #[serde(rename_all = "camelCase")]
    Remove { query_id: QueryId },
}

/// A subscribed query as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Per-connection identifier.
    pub query_id: QueryId,

    /// Canonical function reference.
    pub udf_path: FunctionPath,

    /// Arguments (includes `paginationOpts` for paginated queries).
    pub args: Args,

    /// Journal to resume from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<Journal>,
}

// =============================================================================
// Server → Client
// =============================================================================

/// All messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Version-stamped diff of query results.
    #[serde(rename_all = "camelCase")]
    Transition {
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    },

    /// Outcome of a mutation.
    #[serde(rename_all = "camelCase")]
    MutationResponse {
        request_id: RequestId,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        /// Server timestamp at which the mutation's writes become visible.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Timestamp>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// Outcome of an action.
    #[serde(rename_all = "camelCase")]
    ActionResponse {
        request_id: RequestId,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// The server rejected the connection's credentials.
    #[serde(rename_all = "camelCase")]
    AuthError {
        error: String,
        /// Identity version the error refers to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u32>,
        /// True if the error was caused by an `Authenticate` update.
        #[serde(default)]
        auth_update_attempted: bool,
    },

    /// Unrecoverable server-side session error.
    FatalError { error: String },

    /// Keepalive.
    Ping,
}

/// One change within a Transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateModification {
    /// New value for a query.
    #[serde(rename_all = "camelCase")]
    QueryUpdated {
        query_id: QueryId,
        #[serde(default)]
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journal: Option<Journal>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// The query threw.
    #[serde(rename_all = "camelCase")]
    QueryFailed {
        query_id: QueryId,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journal: Option<Journal>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// The server no longer tracks the query.
    #[serde(rename_all = "camelCase")]
    QueryRemoved { query_id: QueryId },
}

impl StateModification {
    /// Query the modification applies to.
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. }
            | StateModification::QueryRemoved { query_id } => *query_id,
        }
    }
}

// =============================================================================
// Helper Methods
// =============================================================================

impl ClientMessage {
    /// Get the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "Connect",
            ClientMessage::ModifyQuerySet { .. } => "ModifyQuerySet",
            ClientMessage::Mutation { .. } => "Mutation",
            ClientMessage::Action { .. } => "Action",
            ClientMessage::Authenticate { .. } => "Authenticate",
        }
    }

    /// Builds an `Authenticate` message for the given credentials.
    pub fn authenticate(base_version: u32, token: &AuthToken) -> Self {
        let (token_type, value) = match token {
            AuthToken::User(value) => (AuthenticationTokenType::User, Some(value.clone())),
            AuthToken::PlaintextUser(value) => {
                (AuthenticationTokenType::PlaintextUser, Some(value.clone()))
            }
            AuthToken::None => (AuthenticationTokenType::None, None),
        };
        ClientMessage::Authenticate {
            base_version,
            token_type,
            value,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    /// Get the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Transition { .. } => "Transition",
            ServerMessage::MutationResponse { .. } => "MutationResponse",
            ServerMessage::ActionResponse { .. } => "ActionResponse",
            ServerMessage::AuthError { .. } => "AuthError",
            ServerMessage::FatalError { .. } => "FatalError",
            ServerMessage::Ping => "Ping",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    ///
    /// A frame that does not decode is a protocol fault.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

/// Builds the caller-facing result of a mutation or action response.
pub fn response_outcome(
    success: bool,
    result: &Value,
    error_message: Option<&str>,
    error_data: Option<&Value>,
) -> FunctionResult {
    if success {
        Ok(result.clone())
    } else {
        Err(FunctionError {
            message: error_message.unwrap_or("Server error").to_string(),
            data: error_data.cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Mutation {
            request_id: 3,
            udf_path: "messages:send".parse().unwrap(),
            args: Args::new(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "Mutation", "requestId": 3, "udfPath": "messages:send", "args": {}})
        );
    }

    #[test]
    fn test_authenticate_message() {
        let msg = ClientMessage::authenticate(0, &AuthToken::User("T1".into()));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "Authenticate", "baseVersion": 0, "tokenType": "User", "value": "T1"})
        );

        let logout = ClientMessage::authenticate(2, &AuthToken::None);
        let value: Value = serde_json::from_str(&logout.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "Authenticate", "baseVersion": 2, "tokenType": "None"})
        );
    }

    #[test]
    fn test_modify_query_set_shape() {
        let msg = ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: 1,
            modifications: vec![
                QuerySetModification::Add(Query {
                    query_id: 0,
                    udf_path: "messages:list".parse().unwrap(),
                    args: Args::new(),
                    journal: None,
                }),
                QuerySetModification::Remove { query_id: 4 },
            ],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["modifications"][0]["type"], "Add");
        assert_eq!(value["modifications"][0]["queryId"], 0);
        assert_eq!(value["modifications"][1], json!({"type": "Remove", "queryId": 4}));
    }

    #[test]
    fn test_parse_transition() {
        let raw = r#"{
            "type": "Transition",
            "startVersion": {"querySet": 0, "identity": 0, "ts": 0},
            "endVersion": {"querySet": 1, "identity": 1, "ts": 10},
            "modifications": [
                {"type": "QueryUpdated", "queryId": 0, "value": [1, 2]},
                {"type": "QueryFailed", "queryId": 1, "errorMessage": "boom"}
            ]
        }"#;
        let msg = ServerMessage::from_json(raw).unwrap();
        match msg {
            ServerMessage::Transition {
                end_version,
                modifications,
                ..
            } => {
                assert_eq!(end_version.ts, 10);
                assert_eq!(modifications.len(), 2);
                assert_eq!(modifications[1].query_id(), 1);
            }
            other => panic!("Expected Transition, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_auth_error_defaults() {
        let msg = ServerMessage::from_json(r#"{"type": "AuthError", "error": "expired"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::AuthError {
                error: "expired".into(),
                base_version: None,
                auth_update_attempted: false,
            }
        );
        assert_eq!(msg.type_name(), "AuthError");
    }

    #[test]
    fn test_undecodable_frame_is_protocol_fault() {
        let err = ServerMessage::from_json("{not json").unwrap_err();
        assert!(err.is_protocol_fault());
        let err = ServerMessage::from_json(r#"{"type": "Nope"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Decode(_)));
    }

    #[test]
    fn test_response_outcome() {
        assert_eq!(
            response_outcome(true, &json!(1), None, None),
            Ok(json!(1))
        );
        let err = response_outcome(false, &Value::Null, Some("denied"), Some(&json!({"code": 7})))
            .unwrap_err();
        assert_eq!(err.message, "denied");
        assert_eq!(err.data, Some(json!({"code": 7})));
    }
}
