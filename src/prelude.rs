//! Prelude module for convenient imports.
//!
//! ```
//! use tears_query::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Signal`], [`MaybeSignal`] and [`watch`] - Reactive primitives
//! - [`QueryClient`] - Creates queries and mutations
//! - [`Query`] and [`QueryOptions`] - Key-driven `GET` requests
//! - [`Mutation`] and [`MutationOptions`] - Manually triggered writes
//! - [`Cache`] and [`clear_cache`] - Response caching
//! - [`Transport`], [`HttpTransport`] and [`MockTransport`] - Network adapters

pub use crate::cache::{Cache, clear_cache};
pub use crate::config::TransportConfig;
pub use crate::mutation::{Mutation, MutationOptions, MutationResult, MutationStatus};
pub use crate::query::{
    Query, QueryClient, QueryError, QueryOptions, QueryResult, QueryStatus, ReshapeError,
};
pub use crate::signal::{MaybeSignal, Signal, watch};
pub use crate::transport::{
    HttpTransport, Method, MockReply, MockTransport, Response, Transport,
};
