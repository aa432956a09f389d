//! # Domain Types
//!
//! Core types shared by every layer of the livequery client.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  FunctionPath   │   │   QueryToken    │   │  StateVersion   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  "mod:func"     │──►│  path + args +  │   │  query_set      │       │
//! │  │  canonical form │   │  pagination     │   │  identity       │       │
//! │  └─────────────────┘   └─────────────────┘   │  ts             │       │
//! │                                              └─────────────────┘       │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │RemoteQueryResult│   │  FunctionError  │   │   AuthToken     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Loading        │   │  message        │   │  User           │       │
//! │  │  Value          │   │  data (opt.)    │   │  PlaintextUser  │       │
//! │  │  Error          │   └─────────────────┘   │  None           │       │
//! │  └─────────────────┘                         └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Pattern
//! Every subscription has two identities:
//! - `QueryToken`: derived from (path, args, pagination), stable across
//!   connections, used as the map key by every caller-facing structure
//! - `QueryId`: small integer assigned per connection, used on the wire

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::validation::parse_function_path;

/// Opaque application value.
pub type Value = serde_json::Value;

/// Function arguments. Sorted keys give a canonical encoding.
pub type Args = BTreeMap<String, Value>;

/// Per-connection wire identifier of a subscribed query.
pub type QueryId = u32;

/// Identifier of a mutation or action request, in submission order.
pub type RequestId = u32;

/// Logical server timestamp.
pub type Timestamp = u64;

/// Opaque pagination cursor state kept by the server for a query.
pub type Journal = String;

// =============================================================================
// Function Path
// =============================================================================

/// Canonical reference to a server function: `"module/path:function"`.
///
/// ## Canonicalization
/// ```text
/// "messages"            →  "messages:default"
/// "messages.js:list"    →  "messages:list"
/// "chat/rooms:get"      →  "chat/rooms:get"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionPath {
    module: String,
    function: String,
}

impl FunctionPath {
    pub(crate) fn from_parts(module: String, function: String) -> Self {
        FunctionPath { module, function }
    }

    /// Module part (file path without extension).
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Exported function name.
    pub fn function(&self) -> &str {
        &self.function
    }
}

impl fmt::Display for FunctionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

impl FromStr for FunctionPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_function_path(s)
    }
}

impl Serialize for FunctionPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FunctionPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Pagination & Watch Options
// =============================================================================

/// Pagination request attached to a paginated query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationOptions {
    /// Number of items requested per page.
    pub num_items: u32,

    /// Cursor to continue from (None = first page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// Distinguishes otherwise-identical paginated subscriptions.
    #[serde(default)]
    pub id: u32,
}

/// Options accepted when creating a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Journal to resume a paginated query from.
    pub journal: Option<Journal>,

    /// Pagination request (part of the query's identity).
    pub pagination_options: Option<PaginationOptions>,
}

// =============================================================================
// Query Token
// =============================================================================

/// Stable identity of a logical subscription.
///
/// Two requests with the same function, arguments and pagination options
/// produce equal tokens and therefore share one server subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryToken(String);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenKey<'a> {
    udf_path: String,
    args: &'a Args,
    #[serde(skip_serializing_if = "Option::is_none")]
    pagination_options: Option<&'a PaginationOptions>,
}

impl QueryToken {
    /// Derives the token for a (path, args, pagination) triple.
    pub fn new(
        path: &FunctionPath,
        args: &Args,
        pagination_options: Option<&PaginationOptions>,
    ) -> Self {
        let key = TokenKey {
            udf_path: path.to_string(),
            args,
            pagination_options,
        };
        // Serializing a struct of strings, integers and JSON values cannot fail.
        let encoded = serde_json::to_string(&key).unwrap_or_else(|_| path.to_string());
        QueryToken(encoded)
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// State Version
// =============================================================================

/// Version triple identifying one consistent server snapshot.
///
/// ```text
///   query_set  ── bumps when the subscribed query set changes
///   identity   ── bumps when the authenticated principal changes
///   ts         ── advances with every confirmed server snapshot
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVersion {
    /// Query set version acknowledged by the server.
    pub query_set: u32,

    /// Identity version acknowledged by the server.
    pub identity: u32,

    /// Server timestamp of the snapshot.
    pub ts: Timestamp,
}

impl StateVersion {
    /// Version of a brand-new session.
    pub const fn initial() -> Self {
        StateVersion {
            query_set: 0,
            identity: 0,
            ts: 0,
        }
    }
}

// =============================================================================
// Function Results
// =============================================================================

/// Error produced by a server function.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct FunctionError {
    /// Human-readable error message.
    pub message: String,

    /// Structured payload for application-level errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FunctionError {
    /// Creates an error with only a message.
    pub fn message(message: impl Into<String>) -> Self {
        FunctionError {
            message: message.into(),
            data: None,
        }
    }
}

/// Outcome of a mutation, action or query execution.
pub type FunctionResult = Result<Value, FunctionError>;

/// Confirmed (or optimistic) state of one subscribed query.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteQueryResult {
    /// Subscribed, no result from the server yet.
    Loading,
    /// Latest value.
    Value(Value),
    /// The query threw.
    Error(FunctionError),
}

impl RemoteQueryResult {
    /// Converts to the caller-facing shape: `Ok(None)` while loading.
    pub fn to_local(&self) -> Result<Option<Value>, FunctionError> {
        match self {
            RemoteQueryResult::Loading => Ok(None),
            RemoteQueryResult::Value(value) => Ok(Some(value.clone())),
            RemoteQueryResult::Error(error) => Err(error.clone()),
        }
    }
}

impl From<FunctionResult> for RemoteQueryResult {
    fn from(result: FunctionResult) -> Self {
        match result {
            Ok(value) => RemoteQueryResult::Value(value),
            Err(error) => RemoteQueryResult::Error(error),
        }
    }
}

// =============================================================================
// Authentication Tokens
// =============================================================================

/// Kind of token a fetcher produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    /// JWT issued by an identity provider; eligible for proactive refresh.
    User,
    /// Opaque token accepted as-is (insecure / development setups).
    PlaintextUser,
}

/// Credentials the client presents to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthToken {
    /// JWT-shaped user token.
    User(String),
    /// Opaque user token.
    PlaintextUser(String),
    /// No credentials (logged out).
    None,
}

impl AuthToken {
    /// Builds a token of the given type.
    pub fn new(token_type: TokenType, value: String) -> Self {
        match token_type {
            TokenType::User => AuthToken::User(value),
            TokenType::PlaintextUser => AuthToken::PlaintextUser(value),
        }
    }

    /// Returns the raw token value, if any.
    pub fn value(&self) -> Option<&str> {
        match self {
            AuthToken::User(value) | AuthToken::PlaintextUser(value) => Some(value),
            AuthToken::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_query_token_is_canonical() {
        let path: FunctionPath = "messages:list".parse().unwrap();
        let a = QueryToken::new(&path, &args(json!({"channel": 1, "author": "x"})), None);
        let b = QueryToken::new(&path, &args(json!({"author": "x", "channel": 1})), None);
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            r#"{"udfPath":"messages:list","args":{"author":"x","channel":1}}"#
        );
    }

    #[test]
    fn test_query_token_includes_pagination() {
        let path: FunctionPath = "messages:list".parse().unwrap();
        let empty = Args::new();
        let plain = QueryToken::new(&path, &empty, None);
        let opts = PaginationOptions {
            num_items: 10,
            cursor: None,
            id: 1,
        };
        let paginated = QueryToken::new(&path, &empty, Some(&opts));
        assert_ne!(plain, paginated);
        assert!(paginated.as_str().contains("\"numItems\":10"));
    }

    #[test]
    fn test_remote_query_result_to_local() {
        assert_eq!(RemoteQueryResult::Loading.to_local(), Ok(None));
        assert_eq!(
            RemoteQueryResult::Value(json!(3)).to_local(),
            Ok(Some(json!(3)))
        );
        let err = FunctionError::message("boom");
        assert_eq!(RemoteQueryResult::Error(err.clone()).to_local(), Err(err));
    }

    #[test]
    fn test_auth_token_value() {
        assert_eq!(
            AuthToken::new(TokenType::User, "abc".into()).value(),
            Some("abc")
        );
        assert_eq!(AuthToken::None.value(), None);
    }
}
