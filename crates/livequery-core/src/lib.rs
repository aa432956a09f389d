//! # livequery-core: Pure Sync State for livequery
//!
//! This crate is the protocol **brain** of the livequery client. It holds
//! every piece of sync state as plain data with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        livequery Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Application / UI bindings                       │   │
//! │  │    QueriesObserver ──► QueryWatch ──► mutation / action         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 livequery-sync (I/O shell)                      │   │
//! │  │    SyncClient, worker loop, WebSocket transport, auth timers   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ livequery-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐ ┌───────────┐ │   │
//! │  │  │ LocalSync   │ │ RemoteQuery │ │  Request    │ │Optimistic │ │   │
//! │  │  │ State       │ │ Set         │ │  Manager    │ │ Results   │ │   │
//! │  │  └─────────────┘ └─────────────┘ └─────────────┘ └───────────┘ │   │
//! │  │                 composed by BaseClient                          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TIMERS • NO NETWORK • DETERMINISTIC               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (FunctionPath, QueryToken, StateVersion, ...)
//! - [`protocol`] - Client/server wire messages
//! - [`remote_query_set`] - Server-confirmed results and version continuity
//! - [`local_state`] - Desired query set and identity
//! - [`request_manager`] - Mutation/action lifecycle
//! - [`optimistic`] - Optimistic update layering and rollback
//! - [`base_client`] - Composition of all of the above
//! - [`observer`] - QueriesObserver de-duplication layer
//! - [`error`] - Domain error types
//! - [`validation`] - Function reference and argument validation
//!
//! ## Example Usage
//!
//! ```rust
//! use livequery_core::{Args, BaseClient, WatchOptions};
//!
//! let mut client = BaseClient::new();
//! let path = "messages:list".parse().unwrap();
//! let token = client.subscribe(&path, &Args::new(), &WatchOptions::default());
//!
//! // The subscription is queued for the connection to send.
//! assert_eq!(client.take_outbox()[0].type_name(), "ModifyQuerySet");
//! assert_eq!(client.local_query_result(&token), Ok(None));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod base_client;
pub mod error;
pub mod local_state;
pub mod observer;
pub mod optimistic;
pub mod protocol;
pub mod remote_query_set;
pub mod request_manager;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use base_client::{BaseClient, ReceiveOutcome};
pub use error::{CoreError, CoreResult, ValidationError};
pub use observer::{CreateWatch, Listener, QueriesObserver, QueryRequest, QueryWatch, Unsubscribe};
pub use optimistic::{LocalStoreView, OptimisticUpdate};
pub use protocol::{ClientMessage, ServerMessage, StateModification};
pub use request_manager::CompletedRequest;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Longest accepted function reference.
pub const MAX_FUNCTION_PATH_LEN: usize = 1024;
