//! HTTP mutations for creating, updating, or deleting resources.
//!
//! This module provides the [`Mutation`] type for POST, PUT, PATCH and DELETE
//! requests, similar to mutations in TanStack Query.
//!
//! Unlike queries, mutations are never run automatically and never touch the
//! cache. Each call to [`Mutation::run`] sends one request, updates the
//! mutation's `status`/`data`/`error` signals, and returns the outcome so the
//! caller can react to it (for example, roll back an optimistic update).
//!
//! # Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tears_query::prelude::*;
//!
//! #[derive(Serialize)]
//! struct NewUser<'a> {
//!     name: &'a str,
//! }
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Created {
//!     id: u32,
//! }
//!
//! # async fn run(client: QueryClient) -> Result<(), QueryError> {
//! let create_user = client.mutation(MutationOptions::<Created>::new("/users"));
//!
//! match create_user.run(&NewUser { name: "B" }).await {
//!     Ok(created) => println!("created user {}", created.data.id),
//!     Err(err) => eprintln!("could not create user: {err}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::query::{Key, QueryError, ReshapeError, Reshaper, reshape};
use crate::signal::Signal;
use crate::transport::{Headers, Method, Request, Response, Transport};

/// The status of a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    /// Not run yet.
    #[default]
    Idle,
    /// A request is in flight.
    Loading,
    /// The last run succeeded.
    Done,
    /// The last run failed.
    Error,
}

impl MutationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of a mutation's state.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    pub status: MutationStatus,
    pub data: Option<Response<T>>,
    pub error: Option<QueryError>,
}

impl<T> MutationResult<T> {
    /// Returns the reshaped payload of the last successful run, if any.
    pub const fn data(&self) -> Option<&T> {
        match &self.data {
            Some(response) => Some(&response.data),
            None => None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self.status, MutationStatus::Idle)
    }

    pub const fn is_loading(&self) -> bool {
        matches!(self.status, MutationStatus::Loading)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, MutationStatus::Done)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, MutationStatus::Error)
    }
}

/// Options for creating a [`Mutation`].
pub struct MutationOptions<T> {
    url: Key,
    method: Method,
    reshaper: Reshaper<T>,
    headers: Headers,
}

impl<T: DeserializeOwned + 'static> MutationOptions<T> {
    /// Creates `POST` options that deserialize the payload into `T`.
    pub fn new(url: impl Into<Key>) -> Self {
        Self::with_reshaper(url, |raw| Ok(serde_json::from_value(raw)?))
    }
}

impl<T> MutationOptions<T> {
    /// Creates `POST` options with a custom reshaper.
    pub fn with_reshaper<F>(url: impl Into<Key>, reshaper: F) -> Self
    where
        F: Fn(Value) -> Result<T, ReshapeError> + Send + Sync + 'static,
    {
        Self {
            url: url.into(),
            method: Method::POST,
            reshaper: Arc::new(reshaper),
            headers: Headers::new(),
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

struct MutationInner<T> {
    url: Key,
    method: Method,
    headers: Headers,
    reshaper: Reshaper<T>,
    transport: Arc<dyn Transport>,
    status: Signal<MutationStatus>,
    data: Signal<Option<Response<T>>>,
    error: Signal<Option<QueryError>>,
}

/// A manually triggered write request.
///
/// Created by [`QueryClient::mutation`](crate::query::QueryClient::mutation).
/// Clones share the same state.
///
/// Concurrent runs are neither queued nor deduplicated: each one writes the
/// shared state when it settles, so the last run to settle wins.
pub struct Mutation<T> {
    inner: Arc<MutationInner<T>>,
}

impl<T> Clone for Mutation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Mutation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("url", &self.inner.url)
            .field("method", &self.inner.method)
            .field("status", &self.inner.status)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Mutation<T> {
    pub(crate) fn new(transport: Arc<dyn Transport>, options: MutationOptions<T>) -> Self {
        let MutationOptions {
            url,
            method,
            reshaper,
            headers,
        } = options;

        Self {
            inner: Arc::new(MutationInner {
                url,
                method,
                headers,
                reshaper,
                transport,
                status: Signal::new(MutationStatus::Idle),
                data: Signal::new(None),
                error: Signal::new(None),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> &Signal<MutationStatus> {
        &self.inner.status
    }

    /// The reshaped response of the last successful run.
    #[must_use]
    pub fn data(&self) -> &Signal<Option<Response<T>>> {
        &self.inner.data
    }

    /// The error of the last failed run.
    #[must_use]
    pub fn error(&self) -> &Signal<Option<QueryError>> {
        &self.inner.error
    }

    #[must_use]
    pub fn snapshot(&self) -> MutationResult<T> {
        MutationResult {
            status: self.inner.status.get(),
            data: self.inner.data.get(),
            error: self.inner.error.get(),
        }
    }

    /// Sends `body` as JSON and returns the reshaped response.
    ///
    /// A body that serializes to `null`, such as `()`, sends no body at all.
    ///
    /// Dropping the returned future before it resolves abandons the run and
    /// restores the status the mutation had before it started.
    ///
    /// # Errors
    ///
    /// Returns the transport or reshape error after storing it in
    /// [`Mutation::error`].
    pub async fn run<B>(&self, body: &B) -> Result<Response<T>, QueryError>
    where
        B: Serialize + ?Sized,
    {
        let inner = &self.inner;
        let guard = RestoreOnDrop::new(&inner.status);

        let outcome = self.send(body).await;
        guard.disarm();
        match &outcome {
            Ok(response) => {
                inner.data.set(Some(response.clone()));
                inner.error.set(None);
                inner.status.set(MutationStatus::Done);
                debug!(method = %inner.method, status = response.status, "mutation done");
            }
            Err(err) => {
                inner.error.set(Some(err.clone()));
                inner.status.set(MutationStatus::Error);
                debug!(method = %inner.method, error = %err, "mutation failed");
            }
        }
        outcome
    }

    async fn send<B>(&self, body: &B) -> Result<Response<T>, QueryError>
    where
        B: Serialize + ?Sized,
    {
        let inner = &self.inner;
        let body = serde_json::to_value(body)
            .map_err(|e| QueryError::InvalidRequest(format!("body: {e}")))?;
        let url = inner.url.get();
        debug!(method = %inner.method, %url, "running mutation");

        let request = Request::new(inner.method.clone(), url)
            .with_headers(inner.headers.clone())
            .with_body((!body.is_null()).then_some(body));

        let response = inner.transport.request(request).await?;
        Ok(reshape(&inner.reshaper, response)?)
    }
}

/// Marks a mutation as loading and puts back the previous status if the run
/// is dropped before it settles.
struct RestoreOnDrop<'a> {
    status: &'a Signal<MutationStatus>,
    previous: Option<MutationStatus>,
}

impl<'a> RestoreOnDrop<'a> {
    fn new(status: &'a Signal<MutationStatus>) -> Self {
        let previous = status.get();
        status.set(MutationStatus::Loading);
        Self {
            status,
            previous: Some(previous),
        }
    }

    fn disarm(mut self) {
        self.previous = None;
    }
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        // Another run may have settled in the meantime.
        if self.status.get() == MutationStatus::Loading {
            debug!(status = %previous, "mutation run abandoned");
            self.status.set(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryClient;
    use crate::transport::{MockReply, MockTransport};
    use serde_json::json;

    #[test]
    fn test_mutation_result_data() {
        let result = MutationResult {
            status: MutationStatus::Done,
            data: Some(Response::new(201, 42)),
            error: None,
        };
        assert_eq!(result.data(), Some(&42));

        let result: MutationResult<i32> = MutationResult {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        };
        assert_eq!(result.data(), None);
    }

    #[test]
    fn test_mutation_result_predicates() {
        let idle: MutationResult<i32> = MutationResult {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        };
        assert!(idle.is_idle());
        assert!(!idle.is_loading());
        assert!(!idle.is_success());
        assert!(!idle.is_error());

        let loading: MutationResult<i32> = MutationResult {
            status: MutationStatus::Loading,
            ..idle.clone()
        };
        assert!(loading.is_loading());

        let error: MutationResult<i32> = MutationResult {
            status: MutationStatus::Error,
            error: Some(QueryError::Network("down".to_string())),
            ..idle
        };
        assert!(error.is_error());
        assert!(!error.is_success());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MutationStatus::default(), MutationStatus::Idle);
        assert_eq!(MutationStatus::Idle.to_string(), "idle");
        assert_eq!(MutationStatus::Done.to_string(), "done");
    }

    #[tokio::test]
    async fn test_unit_body_sends_no_body() {
        let mock = MockTransport::new();
        mock.reply("/users/1", MockReply::ok(Value::Null));

        let client = QueryClient::new(mock.clone());
        let delete = client.mutation(MutationOptions::<Value>::new("/users/1").method(Method::DELETE));

        let response = delete.run(&()).await.expect("delete should succeed");
        assert_eq!(response.data, Value::Null);

        let requests = mock.requests();
        assert_eq!(requests[0].method, Method::DELETE);
        assert_eq!(requests[0].body, None);
    }

    #[tokio::test]
    async fn test_reactive_url_is_read_per_run() {
        let mock = MockTransport::new();
        mock.reply("/users/1", MockReply::ok(json!({"ok": true})));
        mock.reply("/users/2", MockReply::ok(json!({"ok": true})));

        let url = Signal::new("/users/1".to_string());
        let client = QueryClient::new(mock.clone());
        let update = client.mutation(MutationOptions::<Value>::new(&url).method(Method::PUT));

        update.run(&json!({"name": "A"})).await.expect("first run");
        url.set("/users/2".to_string());
        update.run(&json!({"name": "B"})).await.expect("second run");

        let urls: Vec<_> = mock.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["/users/1", "/users/2"]);
        assert_eq!(mock.request_count(), 2, "mutations never run on their own");
    }

    #[tokio::test]
    async fn test_dropped_run_restores_status() {
        let mock = MockTransport::new();
        let _pending = mock.defer("/users");

        let client = QueryClient::new(mock.clone());
        let create = client.mutation(MutationOptions::<Value>::new("/users"));

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(20), create.run(&json!({}))).await;
        assert!(abandoned.is_err(), "deferred reply never arrives");
        assert_eq!(mock.request_count(), 1);

        let result = create.snapshot();
        assert!(result.is_idle());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_panicking_reshaper_fails_the_run() {
        let mock = MockTransport::new();
        mock.reply("/users", MockReply::ok(json!({"id": "two"})));

        let client = QueryClient::new(mock);
        let create = client.mutation(MutationOptions::with_reshaper("/users", |raw: Value| {
            Ok(raw["id"].as_u64().expect("id should be a number"))
        }));

        let err = create.run(&json!({})).await.expect_err("reshaper panics");
        assert!(matches!(err, QueryError::Reshape(_)));
        assert_eq!(create.snapshot().status, MutationStatus::Error);
    }

    #[tokio::test]
    async fn test_reshape_failure_is_reported() {
        let mock = MockTransport::new();
        mock.reply("/users", MockReply::ok(json!({"unexpected": true})));

        #[derive(Debug, Clone, serde::Deserialize)]
        struct Created {
            #[allow(dead_code)]
            id: u32,
        }

        let client = QueryClient::new(mock);
        let create = client.mutation(MutationOptions::<Created>::new("/users"));

        let err = create.run(&json!({})).await.expect_err("shape mismatch");
        assert!(matches!(err, QueryError::Reshape(_)));
        assert_eq!(create.snapshot().status, MutationStatus::Error);
        assert!(create.snapshot().data.is_none());
    }
}
