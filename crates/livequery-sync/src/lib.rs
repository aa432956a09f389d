//! # livequery-sync: Connection & Client Layer for livequery
//!
//! This crate runs [`livequery_core::BaseClient`] over a live WebSocket:
//! it connects, reconnects with backoff, fetches and refreshes auth tokens,
//! and hands results to callers as watches, streams and futures.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Client Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │              SyncClient handles (cheap, cloneable)               │  │
//! │  │   watch_query / subscribe / mutation / action / set_auth         │  │
//! │  └───────────────┬──────────────────────────────▲───────────────────┘  │
//! │       requests   │ (mpsc)         results,      │ status (watch)        │
//! │                  ▼                listeners     │                       │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                     Worker (one tokio task)                      │  │
//! │  │                                                                  │  │
//! │  │   BaseClient ◄── frames ── ProtocolConnection ── backoff timer   │  │
//! │  │       │                          ▲                               │  │
//! │  │       └── outbox ────────────────┘                               │  │
//! │  │                                                                  │  │
//! │  │   AuthenticationManager ── token fetches, refresh timer          │  │
//! │  └───────────────────────────────┬──────────────────────────────────┘  │
//! │                                  │                                      │
//! │  ┌───────────────────────────────▼──────────────────────────────────┐  │
//! │  │         Transport: WebSocketTransport or TestTransport           │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - `SyncClient`, `Watch` and subscription handles
//! - [`config`] - Client configuration (deployment URL, backoff, auth leeway)
//! - [`connection`] - Connection state machine and reconnect scheduling
//! - [`auth`] - Token fetching, confirmation and refresh
//! - [`transport`] - WebSocket transport
//! - [`testing`] - In-memory transport for tests
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livequery_sync::SyncClient;
//! use serde_json::json;
//!
//! let client = SyncClient::connect("https://happy-otter-123.example.cloud")?;
//! client.set_auth(|args| fetch_jwt(args.force_refresh_token), |signed_in| {
//!     println!("Signed in: {}", signed_in);
//! })?;
//!
//! let count = client.query("counter:get", json!({})).await?;
//! client.mutation("counter:increment", json!({ "by": 1 })).await??;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod testing;
pub mod transport;

mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthState, FetchTokenArgs};
pub use client::{QuerySetSubscription, QuerySubscription, Subscription, SyncClient, Watch};
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{SyncError, SyncResult};
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};
pub use worker::{ClientStatus, LocalResult, QuerySetSnapshot};

pub use livequery_core::{
    Args, FunctionError, FunctionResult, LocalStoreView, QueriesObserver, QueryRequest,
    QueryToken, Value, WatchOptions,
};
