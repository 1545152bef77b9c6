//! Transport adapters that perform HTTP requests for queries and mutations.
//!
//! The engines only talk to the [`Transport`] trait. Two implementations ship
//! with the crate:
//!
//! - [`HttpTransport`]: a reqwest-backed client for real servers.
//! - [`MockTransport`]: a scripted transport for deterministic tests.
//!
//! Every transport must honor two rules:
//!
//! 1. **Cooperative cancellation**: when the request's cancellation token
//!    fires, the returned future resolves to [`QueryError::Cancelled`] as soon
//!    as possible.
//! 2. **Failure classification**: a server response with a non-success status
//!    becomes [`QueryError::Status`]; a failure without any response (connect
//!    refused, timeout, reset) becomes [`QueryError::Network`].

pub mod http;
pub mod mock;

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::query::QueryError;

pub use http::HttpTransport;
pub use mock::{MockReply, MockTransport, RecordedRequest, Responder};
pub use reqwest::Method;

/// Request headers, by name.
pub type Headers = BTreeMap<String, String>;

/// A request handed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// Token that aborts the request when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl Request {
    /// Creates a request without headers, body or cancellation token.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
            cancel: None,
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns `true` if the request's token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// A successful response: the HTTP status and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    pub status: u16,
    pub data: T,
}

impl<T> Response<T> {
    #[must_use]
    pub const fn new(status: u16, data: T) -> Self {
        Self { status, data }
    }

    /// Maps the payload, keeping the status.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            status: self.status,
            data: f(self.data),
        }
    }

    /// Maps the payload with a fallible function, keeping the status.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `f`.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Response<U>, E> {
        Ok(Response {
            status: self.status,
            data: f(self.data)?,
        })
    }
}

/// Performs HTTP requests on behalf of queries and mutations.
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` and resolves with the raw JSON payload.
    ///
    /// The returned future must resolve to [`QueryError::Cancelled`] once the
    /// request's token is cancelled.
    fn request(&self, request: Request) -> BoxFuture<'static, Result<Response<Value>, QueryError>>;
}
