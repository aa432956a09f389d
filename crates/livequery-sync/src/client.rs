//! # Sync Client
//!
//! The caller-facing handle. Cheap to clone; every clone talks to the same
//! worker task.
//!
//! ## Usage
//! ```rust,ignore
//! let client = SyncClient::connect("https://happy-otter-123.example.cloud")?;
//!
//! // Reactive query
//! let mut messages = client.subscribe("messages:list", json!({ "channel": "general" }))?;
//! while let Some(result) = messages.next().await {
//!     println!("{:?}", result);
//! }
//!
//! // Mutation with an optimistic update
//! let outcome = client
//!     .mutation_with_optimistic_update("messages:send", json!({ "body": "hi" }), |store| {
//!         // ...
//!     })
//!     .await?;
//! ```
//!
//! Errors are layered: `Err(SyncError)` means the call could not be made
//! (bad arguments, client closed), `Ok(Err(FunctionError))` means the
//! server ran the function and it failed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use livequery_core::validation::args_from_value;
use livequery_core::{
    Args, CreateWatch, FunctionPath, FunctionResult, Journal, Listener, LocalStoreView,
    OptimisticUpdate, QueryToken, QueryWatch, TokenType, Unsubscribe, Value, WatchOptions,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::auth::{AuthChangeCallback, AuthenticationManager, FetchTokenArgs, TokenFetcher};
use crate::config::ClientConfig;
use crate::connection::ProtocolConnection;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, WebSocketTransport};
use crate::worker::{ClientRequest, ClientStatus, LocalResult, QuerySetSnapshot, SharedStore, Worker};

struct ClientInner {
    requests: mpsc::UnboundedSender<ClientRequest>,
    store: Arc<SharedStore>,
    status_rx: watch::Receiver<ClientStatus>,
    next_ticket: AtomicU64,
}

impl ClientInner {
    fn send(&self, request: ClientRequest) -> SyncResult<()> {
        self.requests
            .send(request)
            .map_err(|_| SyncError::ShuttingDown)
    }
}

/// Real-time client for one deployment.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Connects to the deployment named in `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> SyncResult<Self> {
        let transport =
            WebSocketTransport::new(config.connect_timeout(), config.ping_interval());
        Self::with_transport(config, Arc::new(transport))
    }

    /// Default configuration pointed at `deployment_url`.
    pub fn connect(deployment_url: &str) -> SyncResult<Self> {
        Self::new(ClientConfig::for_deployment(deployment_url))
    }

    /// Like [`Self::new`] with a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        config.validate()?;
        let url = config.sync_url()?;
        let runtime = Handle::try_current().map_err(|e| SyncError::Internal(e.to_string()))?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::default());
        let store = Arc::new(SharedStore::default());

        let connection = ProtocolConnection::new(
            transport,
            url,
            config.create_backoff(),
            connection_tx,
            config.client.verbose,
        );
        let auth = AuthenticationManager::new(config.refresh_leeway(), auth_tx);
        let worker = Worker::new(
            connection,
            connection_rx,
            auth,
            auth_rx,
            config,
            store.clone(),
            status_tx,
        );
        runtime.spawn(worker.run(requests_rx));

        Ok(Self {
            inner: Arc::new(ClientInner {
                requests: requests_tx,
                store,
                status_rx,
                next_ticket: AtomicU64::new(0),
            }),
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// A watch over one query. Nothing is subscribed until the first
    /// [`Watch::on_update`].
    ///
    /// ## Errors
    /// `InvalidArgument` for a malformed function name or non-object args.
    pub fn watch_query(&self, name: &str, args: Value, options: WatchOptions) -> SyncResult<Watch> {
        let path: FunctionPath = name.parse()?;
        let args = args_from_value(args)?;
        Ok(self.watch(path, args, options))
    }

    fn watch(&self, path: FunctionPath, args: Args, options: WatchOptions) -> Watch {
        let token = QueryToken::new(&path, &args, options.pagination_options.as_ref());
        Watch {
            inner: self.inner.clone(),
            path,
            args,
            options,
            token,
        }
    }

    /// Stream of a query's results. Loading states are skipped.
    pub fn subscribe(&self, name: &str, args: Value) -> SyncResult<QuerySubscription> {
        let query_watch = self.watch_query(name, args, WatchOptions::default())?;
        let (result_tx, result_rx) = watch::channel(settled(query_watch.local_query_result()));

        let store = self.inner.store.clone();
        let token = query_watch.token.clone();
        let subscription = query_watch.on_update(Arc::new(move || {
            result_tx.send_replace(settled(store.result(&token)));
        }));

        Ok(QuerySubscription {
            token: query_watch.token,
            results: Box::pin(WatchStream::new(result_rx).filter_map(|result| result)),
            _subscription: subscription,
        })
    }

    /// Stream of the settled results of every subscribed query.
    ///
    /// Yields the current set first, then a new snapshot each time any
    /// result changes. Subscribes nothing by itself; look entries up with
    /// [`QuerySubscription::query_token`] or [`Watch::query_token`].
    pub fn watch_all(&self) -> QuerySetSubscription {
        QuerySetSubscription {
            snapshots: Box::pin(WatchStream::new(self.inner.store.watch_snapshots())),
        }
    }

    /// First settled result of a query.
    pub async fn query(&self, name: &str, args: Value) -> SyncResult<FunctionResult> {
        let mut subscription = self.subscribe(name, args)?;
        subscription.next().await.ok_or(SyncError::ShuttingDown)
    }

    /// Factory for [`livequery_core::QueriesObserver`].
    pub fn create_watch_fn(&self) -> CreateWatch {
        let client = self.clone();
        Arc::new(
            move |path: &FunctionPath, args: &Args, options: WatchOptions| -> Box<dyn QueryWatch> {
                Box::new(client.watch(path.clone(), args.clone(), options))
            },
        )
    }

    // =========================================================================
    // Mutations & Actions
    // =========================================================================

    /// Runs a mutation.
    ///
    /// The request is queued when this is called, not when the future is
    /// first polled. Dropping the future before it resolves cancels the
    /// request and rolls back its optimistic update.
    pub fn mutation(
        &self,
        name: &str,
        args: Value,
    ) -> impl Future<Output = SyncResult<FunctionResult>> + Send + 'static {
        self.submit_mutation(name, args, None)
    }

    /// Runs a mutation, applying `update` to local results.
    ///
    /// The update runs on the worker before the request is sent, so a
    /// [`Watch::local_query_result`] read straight after this call may not
    /// reflect it yet. Listeners registered with [`Watch::on_update`] are
    /// called once it has been applied.
    pub fn mutation_with_optimistic_update<F>(
        &self,
        name: &str,
        args: Value,
        update: F,
    ) -> impl Future<Output = SyncResult<FunctionResult>> + Send + 'static
    where
        F: Fn(&mut LocalStoreView<'_>) + Send + Sync + 'static,
    {
        self.submit_mutation(name, args, Some(Arc::new(update)))
    }

    fn submit_mutation(
        &self,
        name: &str,
        args: Value,
        update: Option<OptimisticUpdate>,
    ) -> impl Future<Output = SyncResult<FunctionResult>> + Send + 'static {
        let submitted = self.parse_request(name, args).and_then(|(path, args)| {
            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (reply, response) = oneshot::channel();
            self.inner.send(ClientRequest::Mutation {
                ticket,
                path,
                args,
                update,
                reply,
            })?;
            Ok(PendingReply::new(self.inner.clone(), ticket, response))
        });
        async move { submitted?.await }
    }

    /// Runs an action. In-flight actions fail if the connection drops.
    pub fn action(
        &self,
        name: &str,
        args: Value,
    ) -> impl Future<Output = SyncResult<FunctionResult>> + Send + 'static {
        let submitted = self.parse_request(name, args).and_then(|(path, args)| {
            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (reply, response) = oneshot::channel();
            self.inner.send(ClientRequest::Action {
                ticket,
                path,
                args,
                reply,
            })?;
            Ok(PendingReply::new(self.inner.clone(), ticket, response))
        });
        async move { submitted?.await }
    }

    fn parse_request(&self, name: &str, args: Value) -> SyncResult<(FunctionPath, Args)> {
        let path: FunctionPath = name.parse()?;
        let args = args_from_value(args)?;
        Ok((path, args))
    }

    // =========================================================================
    // Auth
    // =========================================================================

    /// Authenticates with tokens from `fetch_token`.
    ///
    /// `on_change(true)` is called once the server accepts a token,
    /// `on_change(false)` when credentials are lost.
    pub fn set_auth<F, Fut, C>(&self, fetch_token: F, on_change: C) -> SyncResult<()>
    where
        F: Fn(FetchTokenArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
        C: Fn(bool) + Send + Sync + 'static,
    {
        self.install_auth(TokenType::User, fetch_token, on_change)
    }

    /// Like [`Self::set_auth`] for plaintext admin/test tokens, which are
    /// never refreshed.
    pub fn set_auth_insecure<F, Fut, C>(&self, fetch_token: F, on_change: C) -> SyncResult<()>
    where
        F: Fn(FetchTokenArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
        C: Fn(bool) + Send + Sync + 'static,
    {
        self.install_auth(TokenType::PlaintextUser, fetch_token, on_change)
    }

    fn install_auth<F, Fut, C>(&self, token_type: TokenType, fetch_token: F, on_change: C) -> SyncResult<()>
    where
        F: Fn(FetchTokenArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
        C: Fn(bool) + Send + Sync + 'static,
    {
        let fetcher: TokenFetcher = Arc::new(move |args| fetch_token(args).boxed());
        let on_change: AuthChangeCallback = Arc::new(on_change);
        self.inner.send(ClientRequest::SetAuth {
            fetcher,
            token_type,
            on_change,
        })
    }

    /// Signs out. The previous `on_change` hears `false` once the server
    /// confirms.
    pub fn clear_auth(&self) -> SyncResult<()> {
        self.inner.send(ClientRequest::ClearAuth)
    }

    // =========================================================================
    // Status & Lifecycle
    // =========================================================================

    pub fn status(&self) -> ClientStatus {
        self.inner.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status_rx.clone()
    }

    /// Requests not yet confirmed, as of the worker's last status update.
    pub fn has_unsaved_changes(&self) -> bool {
        self.inner.status_rx.borrow().has_unsaved_changes
    }

    /// Stops the worker. Pending mutations and actions fail with
    /// [`SyncError::ShuttingDown`].
    pub async fn close(&self) -> SyncResult<()> {
        let (reply, closed) = oneshot::channel();
        if self.inner.send(ClientRequest::Close { reply }).is_err() {
            return Ok(());
        }
        let _ = closed.await;
        Ok(())
    }
}

fn settled(result: LocalResult) -> Option<FunctionResult> {
    match result {
        Ok(Some(value)) => Some(Ok(value)),
        Ok(None) => None,
        Err(error) => Some(Err(error)),
    }
}

// =============================================================================
// Pending Requests
// =============================================================================

/// Reply for one mutation or action. Cancels the request when dropped early.
struct PendingReply {
    inner: Arc<ClientInner>,
    ticket: u64,
    response: oneshot::Receiver<FunctionResult>,
    done: bool,
}

impl PendingReply {
    fn new(inner: Arc<ClientInner>, ticket: u64, response: oneshot::Receiver<FunctionResult>) -> Self {
        Self {
            inner,
            ticket,
            response,
            done: false,
        }
    }
}

impl Future for PendingReply {
    type Output = SyncResult<FunctionResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.response).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.map_err(|_| SyncError::ShuttingDown))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            debug!(ticket = self.ticket, "Request abandoned, cancelling");
            let _ = self.inner.send(ClientRequest::Cancel {
                ticket: self.ticket,
            });
        }
    }
}

// =============================================================================
// Watches
// =============================================================================

/// One query as seen by the caller.
pub struct Watch {
    inner: Arc<ClientInner>,
    path: FunctionPath,
    args: Args,
    options: WatchOptions,
    token: QueryToken,
}

impl Watch {
    pub fn query_token(&self) -> &QueryToken {
        &self.token
    }

    /// `Ok(None)` while loading or when nothing holds the query.
    pub fn local_query_result(&self) -> LocalResult {
        self.inner.store.result(&self.token)
    }

    /// Subscribes the query (if needed) and calls `listener` on each change.
    pub fn on_update(&self, listener: Listener) -> Subscription {
        let listener_id = self.inner.store.add_listener(&self.token, listener);
        let _ = self.inner.send(ClientRequest::Subscribe {
            path: self.path.clone(),
            args: self.args.clone(),
            options: self.options.clone(),
        });
        Subscription {
            inner: self.inner.clone(),
            token: self.token.clone(),
            listener_id,
        }
    }

    /// Journal from the server, or the one this watch was created with.
    pub fn journal(&self) -> Option<Journal> {
        self.inner
            .store
            .journal(&self.token)
            .or_else(|| self.options.journal.clone())
    }
}

impl QueryWatch for Watch {
    fn local_query_result(&self) -> LocalResult {
        Watch::local_query_result(self)
    }

    fn on_update(&self, listener: Listener) -> Unsubscribe {
        let subscription = Watch::on_update(self, listener);
        Box::new(move || drop(subscription))
    }

    fn journal(&self) -> Option<Journal> {
        Watch::journal(self)
    }
}

/// Keeps a query subscribed and its listener registered.
#[must_use = "the query is unsubscribed when this is dropped"]
pub struct Subscription {
    inner: Arc<ClientInner>,
    token: QueryToken,
    listener_id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.store.remove_listener(&self.token, self.listener_id);
        let _ = self.inner.send(ClientRequest::Unsubscribe {
            token: self.token.clone(),
        });
    }
}

/// Stream of settled results for one query.
pub struct QuerySubscription {
    token: QueryToken,
    results: Pin<Box<dyn Stream<Item = FunctionResult> + Send>>,
    _subscription: Subscription,
}

impl QuerySubscription {
    pub fn query_token(&self) -> &QueryToken {
        &self.token
    }
}

impl Stream for QuerySubscription {
    type Item = FunctionResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.as_mut().poll_next(cx)
    }
}

/// Stream of [`QuerySetSnapshot`]s from [`SyncClient::watch_all`].
pub struct QuerySetSubscription {
    snapshots: Pin<Box<dyn Stream<Item = QuerySetSnapshot> + Send>>,
}

impl Stream for QuerySetSubscription {
    type Item = QuerySetSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.snapshots.as_mut().poll_next(cx)
    }
}
