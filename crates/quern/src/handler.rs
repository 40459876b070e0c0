//! Handler definitions, the type-erased handler registry, and the change
//! stream observable handlers use to signal external invalidation.
//!
//! A handler supplies the computation for one query type. Handlers are async
//! and request dependencies through the [`QueryContext`] they receive; every
//! such request is captured as a dependency edge of the query being
//! evaluated.
//!
//! ```rust
//! use quern::{Handler, HandlerError, Query, QueryContext};
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Doubled(u64);
//!
//! impl Query for Doubled {
//!     type Value = u64;
//! }
//!
//! struct DoubledHandler;
//!
//! impl Handler<Doubled> for DoubledHandler {
//!     async fn evaluate(
//!         &self,
//!         query: &Doubled,
//!         _ctx: &QueryContext,
//!     ) -> Result<u64, HandlerError> {
//!         Ok(query.0 * 2)
//!     }
//! }
//! ```

use std::{
    any::{Any, TypeId},
    fmt::{self, Debug},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::{
    engine::QueryContext,
    query::{BoxFuture, DynValue, Query, QueryKey},
};

/// A memoized evaluation failure.
///
/// The payload is an arbitrary comparable value: two failures compare equal
/// exactly when their payloads do, which is what lets the graph decide
/// whether a re-raised failure counts as a change. Cloning is cheap.
#[derive(Clone)]
pub struct HandlerError(Arc<dyn DynValue>);

impl HandlerError {
    /// Wraps a failure payload.
    pub fn new<T: 'static + Send + Sync + Debug + PartialEq>(
        payload: T,
    ) -> Self {
        Self(Arc::new(payload))
    }

    /// Attempts to downcast the payload to a concrete type.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl PartialEq for HandlerError {
    fn eq(&self, other: &Self) -> bool { self.0.eq_dyn(other.0.as_ref()) }
}

impl Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerError").field(&self.0).finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dbg_dyn(f)
    }
}

impl std::error::Error for HandlerError {}

/// Error raised while assembling an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum BuildError {
    /// The same query type was registered twice.
    #[error("multiple handlers registered for query type `{0}`")]
    MultipleHandlers(&'static str),
}

/// Defines the computation for a specific query type.
///
/// Handlers are registered with the [`EngineBuilder`] and invoked by the
/// engine when a query of their type must be (re)computed. The engine issues
/// at most one concurrent invocation per distinct query; beyond that,
/// handlers must be `Send + Sync` because distinct queries may run in
/// parallel.
///
/// Any I/O or mutable state lives in the handler's own fields; the engine
/// only observes the returned result and the dependencies requested through
/// the context.
///
/// [`EngineBuilder`]: crate::engine::EngineBuilder
pub trait Handler<Q: Query>: 'static + Send + Sync {
    /// Computes the value for `query`, requesting dependencies through
    /// `ctx`.
    ///
    /// Returning an error does not abort anything upstream by itself: the
    /// failure is cached like a success and replayed to every caller until
    /// the query is invalidated.
    fn evaluate<'s, 'q, 'c>(
        &'s self,
        query: &'q Q,
        ctx: &'c QueryContext,
    ) -> impl Future<Output = Result<Q::Value, HandlerError>>
    + Send
    + use<'s, 'q, 'c, Self, Q>;

    /// The stream of queries whose external facts changed, for handlers
    /// observing the outside world.
    ///
    /// When this returns a stream, the engine subscribes to it at build time
    /// and routes every emitted query to graph invalidation. The default is
    /// `None`.
    fn changes(&self) -> Option<&ChangeStream> { None }
}

type InvokeHandlerFn = for<'a> fn(
    handler: &'a (dyn Any + Send + Sync),
    query: &'a (dyn Any + Send + Sync),
    ctx: &'a QueryContext,
) -> BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>>;

fn invoke_handler<'a, Q: Query, H: Handler<Q>>(
    handler: &'a (dyn Any + Send + Sync),
    query: &'a (dyn Any + Send + Sync),
    ctx: &'a QueryContext,
) -> BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>> {
    let handler = handler.downcast_ref::<H>().expect("handler type mismatch");
    let query = query.downcast_ref::<Q>().expect("query key type mismatch");

    Box::pin(async move {
        handler
            .evaluate(query, ctx)
            .await
            .map(|value| Arc::new(value) as Arc<dyn DynValue>)
    })
}

/// A registered handler with its monomorphized invocation bridge.
pub(crate) struct Entry {
    handler: Arc<dyn Any + Send + Sync>,
    invoke: InvokeHandlerFn,
}

impl Entry {
    fn new<Q: Query, H: Handler<Q>>(handler: Arc<H>) -> Self {
        Self { handler, invoke: invoke_handler::<Q, H> }
    }

    pub(crate) fn invoke<'a>(
        &'a self,
        query: &'a (dyn Any + Send + Sync),
        ctx: &'a QueryContext,
    ) -> BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>> {
        (self.invoke)(self.handler.as_ref(), query, ctx)
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").finish_non_exhaustive()
    }
}

/// Maps each query type to its registered handler.
#[derive(Debug, Default)]
pub(crate) struct HandlerRegistry {
    handlers_by_type_id: FxHashMap<TypeId, Entry>,
}

impl HandlerRegistry {
    pub(crate) fn register<Q: Query, H: Handler<Q>>(
        &mut self,
        handler: Arc<H>,
    ) -> Result<(), BuildError> {
        match self.handlers_by_type_id.entry(TypeId::of::<Q>()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(
                BuildError::MultipleHandlers(std::any::type_name::<Q>()),
            ),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Entry::new::<Q, H>(handler));
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, type_id: &TypeId) -> Option<&Entry> {
        self.handlers_by_type_id.get(type_id)
    }
}

type ChangeCallback = Arc<dyn Fn(&QueryKey) + Send + Sync>;

#[derive(Default)]
struct StreamInner {
    subscribers: Mutex<FxHashMap<u64, ChangeCallback>>,
    next_id: AtomicU64,
}

/// A single-producer, multi-subscriber push stream of changed queries.
///
/// An observable handler owns one of these, hands it out through
/// [`Handler::changes`], and emits the query whose external facts changed;
/// the engine's subscription turns each emission into a graph invalidation.
/// Emission delivers synchronously to the subscribers present at that
/// moment; ordering across subscribers is unspecified.
///
/// Cloning the stream produces another handle to the same subscriber list.
#[derive(Clone, Default)]
pub struct ChangeStream {
    inner: Arc<StreamInner>,
}

impl ChangeStream {
    /// Creates a stream with no subscribers.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Registers a subscriber; it is removed when the returned handle is
    /// dropped.
    pub fn subscribe(
        &self,
        callback: impl Fn(&QueryKey) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.subscribers.lock().insert(id, Arc::new(callback));

        Subscription { stream: Arc::downgrade(&self.inner), id }
    }

    /// Emits a changed query to every current subscriber.
    pub fn emit<Q: Query>(&self, query: &Q) {
        self.emit_key(&QueryKey::new(query));
    }

    /// Emits an already type-erased changed query.
    pub fn emit_key(&self, key: &QueryKey) {
        // snapshot the subscriber list so callbacks run outside the lock
        let subscribers: Vec<ChangeCallback> =
            self.inner.subscribers.lock().values().cloned().collect();

        for subscriber in subscribers {
            subscriber(key);
        }
    }
}

impl Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream").finish_non_exhaustive()
    }
}

/// A live subscription to a [`ChangeStream`]; dropping it unsubscribes.
pub struct Subscription {
    stream: Weak<StreamInner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.stream.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
