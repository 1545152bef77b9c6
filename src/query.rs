//! HTTP queries with caching, cancellation and key-driven refetching.
//!
//! This module provides the [`Query`] engine and the [`QueryClient`] that
//! creates queries and mutations, similar to SWR or TanStack Query.
//!
//! # Lifecycle
//!
//! A query is bound to a key, which may be static or a [`Signal`]. On creation
//! and on every change of the key value, the query runs a *cycle*:
//!
//! 1. `status` becomes [`QueryStatus::Loading`] and `data` is seeded from the
//!    cache, so consumers see the last known value instead of nothing
//! 2. The previous cycle's request is cancelled and a new `GET` is dispatched
//! 3. On success the reshaped response is written to `data` and the cache
//! 4. On failure the error is stored; a server error status also evicts the
//!    cached value, while a network failure keeps it visible
//!
//! A superseded cycle never writes to the query state, even if its transport
//! ignores the cancellation.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use tears_query::prelude::*;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! # async fn run(client: QueryClient) {
//! let user_id = Signal::new("/users/1".to_string());
//! let user = client.query(QueryOptions::<User>::new(&user_id));
//!
//! let result = user.settled().await;
//! if let Some(user) = result.data() {
//!     println!("{}", user.name);
//! }
//!
//! // Changing the key cancels the pending request and fetches the new one.
//! user_id.set("/users/2".to_string());
//! # }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::Cache;
use crate::mutation::{Mutation, MutationOptions};
use crate::signal::{MaybeSignal, Signal, WatchHandle, watch};
use crate::transport::{Headers, Request, Response, Transport};

/// A query key: a static string or a reactive one.
pub type Key = MaybeSignal<String>;

/// Maps the raw JSON payload to the public response shape.
pub type Reshaper<T> = Arc<dyn Fn(Value) -> Result<T, ReshapeError> + Send + Sync>;

/// Error returned by a reshaper.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ReshapeError(pub String);

impl ReshapeError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for ReshapeError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Applies `reshaper` to the payload of `response`.
///
/// A panicking reshaper is reported as a [`ReshapeError`] instead of unwinding
/// through the engine.
pub(crate) fn reshape<T>(
    reshaper: &Reshaper<T>,
    response: Response<Value>,
) -> Result<Response<T>, ReshapeError> {
    response.try_map(|raw| {
        panic::catch_unwind(AssertUnwindSafe(|| reshaper(raw)))
            .unwrap_or_else(|payload| Err(ReshapeError::new(panic_message(payload.as_ref()))))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("reshaper panicked: {message}")
}

/// Error type for query and mutation operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// No response was received (connection refused, timeout, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("Request failed with status {status}")]
    Status { status: u16, data: Value },

    #[error("Reshape failed: {0}")]
    Reshape(#[from] ReshapeError),

    /// The request could not be built (bad URL, header or body).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl QueryError {
    /// The HTTP status of the response, if one was received.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if no response was received.
    ///
    /// Network errors keep cached data: it may be stale, but it is still the
    /// last value the server confirmed.
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        self.status().is_none()
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// A request is in flight.
    Loading,
    /// The last request succeeded.
    Done,
    /// The last request failed.
    Error,
}

impl QueryStatus {
    #[must_use]
    pub const fn is_loading(self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns `true` once the latest cycle has settled.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !self.is_loading()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of a query's state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    /// The reshaped response of the last successful cycle, or a cached one.
    pub data: Option<Response<T>>,
    pub error: Option<QueryError>,
}

impl<T> QueryResult<T> {
    /// Returns the reshaped payload, if any.
    pub const fn data(&self) -> Option<&T> {
        match &self.data {
            Some(response) => Some(&response.data),
            None => None,
        }
    }

    pub const fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Done)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if the data shown was not confirmed by the latest cycle:
    /// a cached value during loading, or a kept value after a network error.
    pub const fn is_stale(&self) -> bool {
        self.data.is_some() && !self.is_success()
    }
}

/// Options for creating a [`Query`].
pub struct QueryOptions<T> {
    key: Key,
    reshaper: Reshaper<T>,
    headers: Headers,
    cache: Option<Cache<Response<T>>>,
}

impl<T: DeserializeOwned + 'static> QueryOptions<T> {
    /// Creates options that deserialize the payload into `T`.
    ///
    /// With `T = serde_json::Value` the payload is passed through unchanged.
    pub fn new(key: impl Into<Key>) -> Self {
        Self::with_reshaper(key, |raw| Ok(serde_json::from_value(raw)?))
    }
}

impl<T> QueryOptions<T> {
    /// Creates options with a custom reshaper.
    ///
    /// A reshaper error fails the cycle like a network error: cached data is
    /// kept.
    pub fn with_reshaper<F>(key: impl Into<Key>, reshaper: F) -> Self
    where
        F: Fn(Value) -> Result<T, ReshapeError> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            reshaper: Arc::new(reshaper),
            headers: Headers::new(),
            cache: None,
        }
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces all request headers.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Uses `cache` instead of the client's cache for `T`.
    #[must_use]
    pub fn cache(mut self, cache: Cache<Response<T>>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Creates queries and mutations over a shared transport.
///
/// The client keeps one cache per response type; queries with the same `T`
/// share it unless [`QueryOptions::cache`] overrides it.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use tears_query::prelude::*;
///
/// let transport = MockTransport::new();
/// transport.reply("/users/1", MockReply::ok(json!({"id": 1})));
///
/// let client = QueryClient::new(transport);
/// let cache = client.cache::<serde_json::Value>();
/// assert!(cache.is_empty());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    transport: Arc<dyn Transport>,
    caches: Arc<DashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("caches", &self.caches.len())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    /// Creates a client over an already shared transport.
    #[must_use]
    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            caches: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Returns the cache shared by queries returning `T`.
    #[must_use]
    pub fn cache<T: Clone + Send + Sync + 'static>(&self) -> Cache<Response<T>> {
        let entry = self
            .caches
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Cache::<Response<T>>::new()));
        entry
            .downcast_ref::<Cache<Response<T>>>()
            .cloned()
            .unwrap_or_default()
    }

    /// Creates a query and starts its first cycle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn query<T: Clone + Send + Sync + 'static>(&self, options: QueryOptions<T>) -> Query<T> {
        let cache = options.cache.clone().unwrap_or_else(|| self.cache::<T>());
        Query::mount(Arc::clone(&self.transport), cache, options)
    }

    /// Creates a mutation. Nothing is sent until [`Mutation::run`].
    pub fn mutation<T: Clone + Send + Sync + 'static>(
        &self,
        options: MutationOptions<T>,
    ) -> Mutation<T> {
        Mutation::new(Arc::clone(&self.transport), options)
    }
}

#[derive(Default)]
struct CycleState {
    generation: u64,
    in_flight: Option<CancellationToken>,
    /// Key of the latest started cycle.
    key: Option<String>,
}

/// A dispatched cycle.
struct Cycle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct QueryInner<T> {
    key: Key,
    headers: Headers,
    reshaper: Reshaper<T>,
    cache: Cache<Response<T>>,
    transport: Arc<dyn Transport>,
    status: Signal<QueryStatus>,
    data: Signal<Option<Response<T>>>,
    error: Signal<Option<QueryError>>,
    cycle: Mutex<CycleState>,
}

impl<T> QueryInner<T> {
    fn lock_cycle(&self) -> MutexGuard<'_, CycleState> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_in_flight(&self) {
        if let Some(token) = self.lock_cycle().in_flight.take() {
            token.cancel();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> QueryInner<T> {
    /// Starts a cycle for the current key, superseding any cycle in flight.
    fn start(self: &Arc<Self>) -> Cycle {
        let mut cycle = self.lock_cycle();
        if let Some(previous) = cycle.in_flight.take() {
            previous.cancel();
        }
        cycle.generation += 1;
        let generation = cycle.generation;

        let key = self.key.get();
        let token = CancellationToken::new();
        cycle.in_flight = Some(token.clone());
        cycle.key = Some(key.clone());

        self.status.set(QueryStatus::Loading);
        self.data.set(self.cache.get(&key));
        debug!(%key, generation, "starting query cycle");

        let request = Request::get(key.clone())
            .with_headers(self.headers.clone())
            .with_cancel(token.clone());
        let pending = self.transport.request(request);
        drop(cycle);

        let join = tokio::spawn({
            let inner = Arc::clone(self);
            let token = token.clone();
            async move {
                let outcome = pending
                    .await
                    .and_then(|response| Ok(reshape(&inner.reshaper, response)?));
                inner.settle(generation, &key, &token, outcome);
            }
        });

        Cycle { token, join }
    }

    /// Commits the outcome of a cycle unless it was superseded.
    ///
    /// A cycle whose key no longer matches the current key value is
    /// superseded even if the watcher has not started the next cycle yet.
    fn settle(
        &self,
        generation: u64,
        key: &str,
        token: &CancellationToken,
        outcome: Result<Response<T>, QueryError>,
    ) {
        let mut cycle = self.lock_cycle();
        if token.is_cancelled() || cycle.generation != generation || self.key.get() != key {
            trace!(key, generation, "discarding superseded query cycle");
            return;
        }
        cycle.in_flight = None;

        match outcome {
            Ok(response) => {
                self.cache.set(key, response.clone());
                self.data.set(Some(response));
                self.error.set(None);
                self.status.set(QueryStatus::Done);
                debug!(key, generation, "query cycle done");
            }
            Err(err) => {
                if !err.is_network_error() {
                    self.cache.delete(key);
                    self.data.set(None);
                }
                debug!(key, generation, error = %err, "query cycle failed");
                self.error.set(Some(err));
                self.status.set(QueryStatus::Error);
            }
        }
    }
}

/// A query bound to a key.
///
/// Created by [`QueryClient::query`]. The query refetches whenever its key
/// signal changes. Dropping it stops watching the key and cancels the request
/// in flight.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
    watcher: Option<WatchHandle>,
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("status", &self.inner.status)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
    fn mount(
        transport: Arc<dyn Transport>,
        cache: Cache<Response<T>>,
        options: QueryOptions<T>,
    ) -> Self {
        let QueryOptions {
            key,
            reshaper,
            headers,
            ..
        } = options;
        let seeded = cache.get(&key.get());

        let inner = Arc::new(QueryInner {
            key,
            headers,
            reshaper,
            cache,
            transport,
            status: Signal::new(QueryStatus::Loading),
            data: Signal::new(seeded),
            error: Signal::new(None),
            cycle: Mutex::new(CycleState::default()),
        });

        let watcher = inner.key.as_signal().map(|key| {
            let inner = Arc::clone(&inner);
            watch(key, move |_, _, invalidation| {
                let token = inner.start().token;
                invalidation.on_invalidate(move || token.cancel());
            })
        });

        inner.start();

        Self { inner, watcher }
    }

    /// The query status.
    #[must_use]
    pub fn status(&self) -> &Signal<QueryStatus> {
        &self.inner.status
    }

    /// The reshaped response of the last successful cycle, or a cached one.
    #[must_use]
    pub fn data(&self) -> &Signal<Option<Response<T>>> {
        &self.inner.data
    }

    /// The error of the last failed cycle.
    #[must_use]
    pub fn error(&self) -> &Signal<Option<QueryError>> {
        &self.inner.error
    }

    /// The current key value.
    #[must_use]
    pub fn key(&self) -> String {
        self.inner.key.get()
    }

    #[must_use]
    pub fn snapshot(&self) -> QueryResult<T> {
        QueryResult {
            status: self.inner.status.get(),
            data: self.inner.data.get(),
            error: self.inner.error.get(),
        }
    }

    /// Waits until a cycle for the current key value has settled and returns
    /// the state.
    ///
    /// Right after the key signal is set, the previous key's settled state is
    /// not returned: this waits for the cycle the key change starts.
    pub async fn settled(&self) -> QueryResult<T> {
        let mut status = self.inner.status.subscribe();
        loop {
            let settled = status.borrow_and_update().is_settled();
            if settled && self.is_current_cycle() {
                return self.snapshot();
            }
            if status.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    fn is_current_cycle(&self) -> bool {
        let key = self.inner.key.get();
        self.inner.lock_cycle().key.as_deref() == Some(key.as_str())
    }

    /// Runs a new cycle for the current key, even if it has not changed.
    ///
    /// Resolves once the cycle has settled or been superseded.
    pub async fn refetch(&self) {
        let Cycle { join, .. } = self.inner.start();
        if let Err(err) = join.await {
            if err.is_panic() {
                panic::resume_unwind(err.into_panic());
            }
        }
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.inner.cancel_in_flight();
    }
}
