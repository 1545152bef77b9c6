//! # Tears Query - Reactive HTTP Queries and Mutations
//!
//! Tears Query is a small data-fetching layer for async Rust applications. It
//! binds HTTP `GET` requests to reactive keys, caches the last successful
//! response per key, and cancels superseded requests, similar to SWR or
//! TanStack Query.
//!
//! ## Core Components
//!
//! - [`Signal`](signal::Signal): An observable value cell used for keys and state
//! - [`QueryClient`](query::QueryClient): Creates queries and mutations over a transport
//! - [`Query`](query::Query): A `GET` request bound to a key, refetched when the key changes
//! - [`Mutation`](mutation::Mutation): A manually triggered write request
//! - [`Cache`](cache::Cache): Last-known-good responses, cleared with [`clear_cache`]
//! - [`Transport`](transport::Transport): The seam to the network, with
//!   [`HttpTransport`](transport::HttpTransport) and
//!   [`MockTransport`](transport::MockTransport) implementations
//!
//! ## Query Semantics
//!
//! - Changing the key cancels the request in flight and starts a new one.
//! - While loading, `data` shows the cached value for the new key, if any.
//! - A server error status evicts the cached value; a network failure keeps it.
//! - A superseded request never writes to the query state.
//!
//! ## Example
//!
//! ```rust
//! use serde::Deserialize;
//! use serde_json::json;
//! use tears_query::prelude::*;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let transport = MockTransport::new();
//! transport.reply("/users/1", MockReply::ok(json!({"id": 1, "name": "A"})));
//!
//! let client = QueryClient::new(transport);
//! let user = client.query(QueryOptions::<User>::new("/users/1"));
//!
//! let result = user.settled().await;
//! assert_eq!(result.status, QueryStatus::Done);
//! assert_eq!(result.data().map(|u| u.name.as_str()), Some("A"));
//! # }
//! ```
//!
//! ## Design Inspiration
//!
//! The query and mutation API follows [TanStack Query](https://tanstack.com/query)
//! and [SWR](https://swr.vercel.app/), adapted to tokio and watch channels.

pub mod cache;
pub mod config;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod signal;
pub mod transport;

pub use cache::clear_cache;
