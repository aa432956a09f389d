//! # Queries Observer
//!
//! Maps a caller's named query requests onto the smallest set of watches,
//! diffing each new request map against the current one.
//!
//! ## set_queries Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for (id, request) in new map                                           │
//! │     absent            → create watch, subscribe                          │
//! │     same request      → untouched                                        │
//! │     different request → create + subscribe NEW, then unsubscribe OLD     │
//! │                         (the client can share identical subscriptions)  │
//! │  for id in current map but not in new map                               │
//! │     unsubscribe, drop                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Watches are obtained through a [`CreateWatch`] factory so the observer
//! can be moved to a different client with [`QueriesObserver::set_create_watch`]
//! without losing pagination journals.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Args, FunctionError, FunctionPath, Journal, PaginationOptions, Value, WatchOptions,
};

/// Callback invoked when a watched result may have changed.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Removes a listener when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// External-store capability of one query, consumed by UI bindings.
pub trait QueryWatch: Send {
    /// Current local value: `Ok(None)` while loading, `Err` if the query threw.
    fn local_query_result(&self) -> Result<Option<Value>, FunctionError>;

    /// Registers a listener; the query stays subscribed while any listener is.
    fn on_update(&self, listener: Listener) -> Unsubscribe;

    /// Pagination journal of the query, if any.
    fn journal(&self) -> Option<Journal>;
}

/// Factory for watches.
pub type CreateWatch =
    Arc<dyn Fn(&FunctionPath, &Args, WatchOptions) -> Box<dyn QueryWatch> + Send + Sync>;

/// One named query request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: FunctionPath,
    pub args: Args,
    pub pagination_options: Option<PaginationOptions>,
}

struct TrackedQuery {
    request: QueryRequest,
    watch: Box<dyn QueryWatch>,
    unsubscribe: Unsubscribe,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

fn lock(registry: &Mutex<ListenerRegistry>) -> MutexGuard<'_, ListenerRegistry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// De-duplicating owner of a caller's query watches.
pub struct QueriesObserver {
    create_watch: CreateWatch,
    queries: BTreeMap<String, TrackedQuery>,
    listeners: Arc<Mutex<ListenerRegistry>>,
}

impl QueriesObserver {
    pub fn new(create_watch: CreateWatch) -> Self {
        QueriesObserver {
            create_watch,
            queries: BTreeMap::new(),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
        }
    }

    /// Reconciles tracked watches with `new_queries`.
    pub fn set_queries(&mut self, new_queries: BTreeMap<String, QueryRequest>) -> CoreResult<()> {
        for (identifier, request) in &new_queries {
            match self.queries.get(identifier) {
                None => self.add_query(identifier, request.clone(), None)?,
                Some(existing) if existing.request == *request => {}
                Some(_) => {
                    let replacement = self.watch_query(request.clone(), None);
                    if let Some(old) = self.queries.insert(identifier.clone(), replacement) {
                        (old.unsubscribe)();
                    }
                    debug!(identifier = %identifier, "Replaced query");
                }
            }
        }

        let stale: Vec<String> = self
            .queries
            .keys()
            .filter(|identifier| !new_queries.contains_key(*identifier))
            .cloned()
            .collect();
        for identifier in stale {
            self.remove_query(&identifier)?;
        }
        Ok(())
    }

    /// Starts tracking a new identifier.
    ///
    /// ## Errors
    /// `DuplicateQuery` if the identifier is already tracked.
    pub fn add_query(
        &mut self,
        identifier: &str,
        request: QueryRequest,
        journal: Option<Journal>,
    ) -> CoreResult<()> {
        if self.queries.contains_key(identifier) {
            return Err(CoreError::DuplicateQuery(identifier.to_string()));
        }
        let tracked = self.watch_query(request, journal);
        self.queries.insert(identifier.to_string(), tracked);
        Ok(())
    }

    /// Stops tracking an identifier.
    ///
    /// ## Errors
    /// `QueryNotFound` if the identifier is not tracked.
    pub fn remove_query(&mut self, identifier: &str) -> CoreResult<()> {
        let tracked = self
            .queries
            .remove(identifier)
            .ok_or_else(|| CoreError::QueryNotFound(identifier.to_string()))?;
        (tracked.unsubscribe)();
        Ok(())
    }

    fn watch_query(&self, request: QueryRequest, journal: Option<Journal>) -> TrackedQuery {
        let options = WatchOptions {
            journal,
            pagination_options: request.pagination_options.clone(),
        };
        let watch = (self.create_watch)(&request.query, &request.args, options);
        let registry = Arc::clone(&self.listeners);
        let unsubscribe = watch.on_update(Arc::new(move || notify(&registry)));
        TrackedQuery {
            request,
            watch,
            unsubscribe,
        }
    }

    /// Reads current values through transient watches that are never
    /// subscribed. Query errors become `Err` values; panics propagate.
    pub fn get_local_results(
        &self,
        queries: &BTreeMap<String, QueryRequest>,
    ) -> BTreeMap<String, Result<Option<Value>, FunctionError>> {
        queries
            .iter()
            .map(|(identifier, request)| {
                let watch = (self.create_watch)(
                    &request.query,
                    &request.args,
                    WatchOptions {
                        journal: None,
                        pagination_options: request.pagination_options.clone(),
                    },
                );
                (identifier.clone(), watch.local_query_result())
            })
            .collect()
    }

    /// Current results of every tracked query.
    pub fn current_results(&self) -> BTreeMap<String, Result<Option<Value>, FunctionError>> {
        self.queries
            .iter()
            .map(|(identifier, tracked)| (identifier.clone(), tracked.watch.local_query_result()))
            .collect()
    }

    /// Moves every tracked watch to a new factory, preserving journals.
    pub fn set_create_watch(&mut self, create_watch: CreateWatch) {
        self.create_watch = create_watch;
        let identifiers: Vec<String> = self.queries.keys().cloned().collect();
        for identifier in identifiers {
            let Some(old) = self.queries.remove(&identifier) else {
                continue;
            };
            let journal = old.watch.journal();
            (old.unsubscribe)();
            let replacement = self.watch_query(old.request, journal);
            self.queries.insert(identifier, replacement);
        }
    }

    /// Registers a listener for changes to any tracked query.
    pub fn subscribe(&self, listener: Listener) -> Unsubscribe {
        let id = {
            let mut registry = lock(&self.listeners);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, listener);
            id
        };
        let registry = Arc::clone(&self.listeners);
        Box::new(move || {
            lock(&registry).listeners.remove(&id);
        })
    }

    /// Unsubscribes every watch and drops every listener.
    pub fn destroy(&mut self) {
        for (_, tracked) in std::mem::take(&mut self.queries) {
            (tracked.unsubscribe)();
        }
        lock(&self.listeners).listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl Drop for QueriesObserver {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn notify(registry: &Mutex<ListenerRegistry>) {
    let listeners: Vec<Listener> = lock(registry).listeners.values().cloned().collect();
    for listener in listeners {
        listener();
    }
}
