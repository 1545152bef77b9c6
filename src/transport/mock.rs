//! Mock transport for testing.
//!
//! [`MockTransport`] answers requests from a per-URL queue of scripted
//! replies, so query and mutation behavior can be tested deterministically
//! without sockets or timers.
//!
//! # Basic Usage
//!
//! ```
//! use serde_json::json;
//! use tears_query::transport::{MockReply, MockTransport};
//!
//! let mock = MockTransport::new();
//! mock.reply("/users/1", MockReply::ok(json!({"id": 1, "name": "A"})));
//! mock.reply("/users/1", MockReply::status(404, json!(null)));
//! mock.reply("/users/1", MockReply::network("timeout"));
//! ```
//!
//! # Controlling Settlement
//!
//! [`MockTransport::defer`] queues a reply that stays pending until the test
//! resolves it through the returned [`Responder`]. This makes it possible to
//! change a query key while a request is still in flight:
//!
//! ```
//! # use serde_json::json;
//! # use tears_query::transport::{MockReply, MockTransport};
//! let mock = MockTransport::new();
//! let responder = mock.defer("/users/1");
//!
//! // ... start a query, change its key ...
//!
//! responder.resolve(MockReply::ok(json!({"id": 1})));
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tracing::trace;

use crate::query::QueryError;

use super::{Headers, Method, Request, Response, Transport};

/// A scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// A response with a success status.
    Ok { status: u16, data: Value },
    /// A response with an error status.
    Status { status: u16, data: Value },
    /// A failure without a response.
    Network(String),
}

impl MockReply {
    /// `200 OK` with `data`.
    #[must_use]
    pub const fn ok(data: Value) -> Self {
        Self::Ok { status: 200, data }
    }

    /// An error status with `data` as the body.
    #[must_use]
    pub const fn status(status: u16, data: Value) -> Self {
        Self::Status { status, data }
    }

    /// A network failure, e.g. `"connection refused"` or `"timeout"`.
    #[must_use]
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network(reason.into())
    }

    fn into_result(self) -> Result<Response<Value>, QueryError> {
        match self {
            Self::Ok { status, data } => Ok(Response::new(status, data)),
            Self::Status { status, data } => Err(QueryError::Status { status, data }),
            Self::Network(reason) => Err(QueryError::Network(reason)),
        }
    }
}

enum Scripted {
    Ready(MockReply),
    Deferred(oneshot::Receiver<MockReply>),
}

/// Resolves a reply queued with [`MockTransport::defer`].
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<MockReply>,
}

impl Responder {
    /// Delivers `reply` to the waiting request.
    ///
    /// Returns `false` if nobody is waiting anymore, e.g. because the request
    /// was cancelled.
    pub fn resolve(self, reply: MockReply) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// A request observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Inner {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    requested: Notify,
    cancelled: AtomicUsize,
    ignore_cancellation: AtomicBool,
}

/// A [`Transport`] that answers from scripted replies.
///
/// Replies are queued per URL and consumed in order. A request for a URL with
/// no queued reply fails as a network error. Cloning yields another handle to
/// the same script and request log.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.request_count())
            .field("cancelled", &self.cancelled_count())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reply` for the next request to `url`.
    pub fn reply(&self, url: impl Into<String>, reply: MockReply) {
        self.push(url.into(), Scripted::Ready(reply));
    }

    /// Queues a reply for `url` that stays pending until resolved.
    #[must_use]
    pub fn defer(&self, url: impl Into<String>) -> Responder {
        let (tx, rx) = oneshot::channel();
        self.push(url.into(), Scripted::Deferred(rx));
        Responder { tx }
    }

    /// Makes the mock ignore cancellation tokens, delivering replies to
    /// requests that were cancelled.
    ///
    /// Models a transport that cannot abort a request once it was sent.
    pub fn ignore_cancellation(&self, ignore: bool) {
        self.inner.ignore_cancellation.store(ignore, Ordering::SeqCst);
    }

    /// Every request seen so far, in dispatch order.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of requests that resolved as cancelled.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` requests have been dispatched.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.inner.requested.notified();
            if self.request_count() >= count {
                return;
            }
            notified.await;
        }
    }

    fn push(&self, url: String, scripted: Scripted) {
        self.inner
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url)
            .or_default()
            .push_back(scripted);
    }

    fn next_reply(&self, url: &str) -> Option<Scripted> {
        self.inner
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(url)
            .and_then(VecDeque::pop_front)
    }
}

impl Transport for MockTransport {
    fn request(&self, request: Request) -> BoxFuture<'static, Result<Response<Value>, QueryError>> {
        let inner = Arc::clone(&self.inner);
        let scripted = self.next_reply(&request.url);

        trace!(method = %request.method, url = %request.url, "mock request");
        inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            });
        inner.requested.notify_waiters();

        let url = request.url;
        let token = request
            .cancel
            .filter(|_| !inner.ignore_cancellation.load(Ordering::SeqCst));

        Box::pin(async move {
            let reply = async move {
                match scripted {
                    Some(Scripted::Ready(reply)) => reply,
                    Some(Scripted::Deferred(rx)) => rx
                        .await
                        .unwrap_or_else(|_| MockReply::network("responder dropped")),
                    None => MockReply::network(format!("no mock reply for {url}")),
                }
            };

            let Some(token) = token else {
                return reply.await.into_result();
            };

            tokio::select! {
                biased;
                () = token.cancelled() => {
                    inner.cancelled.fetch_add(1, Ordering::SeqCst);
                    Err(QueryError::Cancelled)
                }
                reply = reply => reply.into_result(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_replies_in_order() {
        let mock = MockTransport::new();
        mock.reply("/a", MockReply::ok(json!(1)));
        mock.reply("/a", MockReply::status(500, json!("boom")));

        let first = mock.request(Request::get("/a")).await;
        assert_eq!(first, Ok(Response::new(200, json!(1))));

        let second = mock.request(Request::get("/a")).await;
        assert_eq!(
            second,
            Err(QueryError::Status {
                status: 500,
                data: json!("boom")
            })
        );
    }

    #[tokio::test]
    async fn test_missing_reply_is_network_error() {
        let mock = MockTransport::new();
        let result = mock.request(Request::get("/nothing")).await;
        assert!(result.expect_err("no reply").is_network_error());
    }

    #[tokio::test]
    async fn test_records_requests() {
        let mock = MockTransport::new();
        mock.reply("/users", MockReply::ok(json!({"id": 2})));

        let request = Request::new(Method::POST, "/users").with_body(Some(json!({"name": "B"})));
        let _ = mock.request(request).await;

        let recorded = mock.requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].method, Method::POST);
        assert_eq!(recorded[0].body, Some(json!({"name": "B"})));
    }

    #[tokio::test]
    async fn test_deferred_reply() {
        let mock = MockTransport::new();
        let responder = mock.defer("/slow");

        let pending = tokio::spawn(mock.request(Request::get("/slow")));
        mock.wait_for_requests(1).await;
        assert!(responder.resolve(MockReply::ok(json!("done"))));

        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("should settle")
            .expect("task should not panic");
        assert_eq!(result, Ok(Response::new(200, json!("done"))));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let mock = MockTransport::new();
        let responder = mock.defer("/slow");
        let token = CancellationToken::new();

        let pending = mock.request(Request::get("/slow").with_cancel(token.clone()));
        token.cancel();

        assert_eq!(pending.await, Err(QueryError::Cancelled));
        assert_eq!(mock.cancelled_count(), 1);
        assert!(!responder.resolve(MockReply::ok(json!("late"))));
    }

    #[tokio::test]
    async fn test_ignore_cancellation_delivers_reply() {
        let mock = MockTransport::new();
        mock.ignore_cancellation(true);
        mock.reply("/a", MockReply::ok(json!(1)));
        let token = CancellationToken::new();
        token.cancel();

        let result = mock.request(Request::get("/a").with_cancel(token)).await;
        assert_eq!(result, Ok(Response::new(200, json!(1))));
        assert_eq!(mock.cancelled_count(), 0);
    }
}
