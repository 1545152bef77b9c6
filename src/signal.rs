//! Reactive primitives: observable cells and watchers.
//!
//! This module provides the small reactive core the query and mutation engines
//! are built on:
//!
//! - [`Signal`]: an observable value cell. Reads are synchronous, writes notify
//!   every subscriber.
//! - [`MaybeSignal`]: either a static value or a [`Signal`], so APIs can accept
//!   both `"/users/1"` and a reactive key.
//! - [`watch`]: reruns a callback whenever a signal changes, handing it an
//!   [`Invalidation`] hook to register cleanup for the current run.
//!
//! # Example
//!
//! ```rust
//! use tears_query::signal::{Signal, watch};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let page = Signal::new(1_u32);
//!
//! let handle = watch(&page, |new, old, invalidation| {
//!     println!("page {old} -> {new}");
//!     let new = *new;
//!     invalidation.on_invalidate(move || println!("page {new} superseded"));
//! });
//!
//! page.set(2);
//! # handle.cancel().await;
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch as channel;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

/// An observable value cell.
///
/// Cloning a `Signal` yields another handle to the same cell. Every `set` or
/// `update` notifies all subscribers, including [`watch`]ers and streams
/// created with [`Signal::stream`].
pub struct Signal<T> {
    tx: Arc<channel::Sender<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&*self.tx.borrow()).finish()
    }
}

impl<T: Default + Send + Sync + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Send + Sync + 'static> Signal<T> {
    /// Creates a new signal holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        let (tx, _rx) = channel::channel(value);
        Self { tx: Arc::new(tx) }
    }

    /// Runs `f` with a reference to the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replaces the value and notifies subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutates the value in place and notifies subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Returns a receiver that observes subsequent changes.
    ///
    /// The current value is marked as seen, so `changed()` only resolves on
    /// the next write.
    #[must_use]
    pub fn subscribe(&self) -> channel::Receiver<T> {
        self.tx.subscribe()
    }

    /// Returns `true` if both handles point at the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    /// Returns a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Returns a stream yielding the current value followed by every change.
    ///
    /// Rapid successive writes may be coalesced; the stream always yields the
    /// latest value.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, T> {
        WatchStream::new(self.tx.subscribe()).boxed()
    }

    /// Waits until the value satisfies `predicate` and returns it.
    ///
    /// Resolves immediately if the current value already matches.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&T) -> bool) -> T {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|value| predicate(value)).await {
            Ok(value) => T::clone(&value),
            // The sender lives in `self`, so the channel cannot close while we wait.
            Err(_) => self.get(),
        }
    }
}

/// A value that is either fixed or backed by a [`Signal`].
#[derive(Debug, Clone)]
pub enum MaybeSignal<T> {
    /// A value that never changes.
    Static(T),
    /// A reactive value.
    Reactive(Signal<T>),
}

impl<T: Clone + Send + Sync + 'static> MaybeSignal<T> {
    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> T {
        match self {
            Self::Static(value) => value.clone(),
            Self::Reactive(signal) => signal.get(),
        }
    }

    /// Returns the underlying signal, if this value is reactive.
    #[must_use]
    pub const fn as_signal(&self) -> Option<&Signal<T>> {
        match self {
            Self::Static(_) => None,
            Self::Reactive(signal) => Some(signal),
        }
    }

    /// Returns `true` if the value is backed by a signal.
    #[must_use]
    pub const fn is_reactive(&self) -> bool {
        matches!(self, Self::Reactive(_))
    }
}

impl<T> From<Signal<T>> for MaybeSignal<T> {
    fn from(signal: Signal<T>) -> Self {
        Self::Reactive(signal)
    }
}

impl<T> From<&Signal<T>> for MaybeSignal<T> {
    fn from(signal: &Signal<T>) -> Self {
        Self::Reactive(signal.clone())
    }
}

impl From<String> for MaybeSignal<String> {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

impl From<&str> for MaybeSignal<String> {
    fn from(value: &str) -> Self {
        Self::Static(value.to_owned())
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Registration point for cleanup of a single watcher run.
///
/// A cleanup registered with [`Invalidation::on_invalidate`] runs exactly once:
/// right before the watcher runs again, or when the watcher is torn down.
#[derive(Clone, Default)]
pub struct Invalidation {
    slot: Arc<Mutex<Option<Cleanup>>>,
}

impl fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invalidation")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Invalidation {
    /// Registers `cleanup` for the current run.
    ///
    /// Registering again within the same run replaces the earlier cleanup,
    /// which is then run immediately so that it still runs exactly once.
    pub fn on_invalidate(&self, cleanup: impl FnOnce() + Send + 'static) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Box::new(cleanup));
        if let Some(previous) = previous {
            previous();
        }
    }

    fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs the pending cleanup, if any.
    fn invalidate(&self) {
        let pending = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cleanup) = pending {
            cleanup();
        }
    }
}

/// Handle for a running watcher task.
///
/// Dropping the handle stops the watcher; [`WatchHandle::cancel`] additionally
/// waits until the pending cleanup has run.
#[derive(Debug)]
pub struct WatchHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stops the watcher without waiting for the task to finish.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stops the watcher and waits for the task to complete.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Returns `true` once the watcher has been asked to stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Watches `signal` and calls `callback(new, old, invalidation)` on every change.
///
/// The callback does not run for the initial value, and writes that leave the
/// value equal to the previous one are skipped. Before each rerun, and when the
/// watcher is torn down, the cleanup registered through the [`Invalidation`]
/// of the previous run is invoked exactly once.
///
/// The watcher subscribes before returning, so writes made right after this
/// call are observed. Must be called from within a tokio runtime.
pub fn watch<T, F>(signal: &Signal<T>, mut callback: F) -> WatchHandle
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(&T, &T, &Invalidation) + Send + 'static,
{
    let mut rx = signal.subscribe();
    let mut old = rx.borrow_and_update().clone();
    let token = CancellationToken::new();
    let invalidation = Invalidation::default();

    let join = tokio::spawn({
        let token = token.clone();
        async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let new = rx.borrow_and_update().clone();
                        if new == old {
                            continue;
                        }
                        invalidation.invalidate();
                        callback(&new, &old, &invalidation);
                        old = new;
                    }
                }
            }
            invalidation.invalidate();
        }
    });

    WatchHandle {
        token,
        join: Some(join),
    }
}
