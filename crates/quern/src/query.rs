//! Query definitions and the type-erased interfaces the engine stores them
//! behind.
//!
//! A query is a plain value with structural identity: two queries of the same
//! type with equal fields name the same node in the dependency graph. The
//! query type declares the result type it evaluates to through the
//! [`Query::Value`] associated type; the engine preserves that binding at the
//! public API and erases it internally.
//!
//! # Defining Queries
//!
//! ```rust
//! use quern::Query;
//!
//! /// Length of a file's contents.
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct FileLength {
//!     path: String,
//! }
//!
//! impl Query for FileLength {
//!     type Value = usize;
//! }
//! ```

use std::{
    any::{Any, TypeId},
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    pin::Pin,
    sync::Arc,
};

use crate::{engine::QueryContext, handler::HandlerError};

/// A boxed, type-erased future, the unit of suspension inside the engine.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The query interface of the engine.
///
/// A type implementing [`Query`] is an input key associated with a specific
/// output value type. The query itself only defines the *what*; the
/// computation is supplied by a registered [`Handler`] or, for self-handling
/// queries, by [`Query::self_evaluate`].
///
/// # Identity
///
/// Node identity in the dependency graph is structural: the runtime type of
/// the query plus `Eq`/`Hash` over its fields. All of the required traits can
/// be derived.
///
/// # Value Requirements
///
/// The associated `Value` must be cheap to clone (cached values are handed
/// out by clone) and comparable with `PartialEq`: the engine compares a
/// freshly computed result against the cached one to decide whether
/// dependents must be invalidated.
///
/// [`Handler`]: crate::handler::Handler
pub trait Query:
    Any + Eq + Hash + Clone + Debug + Send + Sync + 'static
{
    /// The output value type associated with this query.
    type Value: 'static + Send + Sync + Clone + Debug + PartialEq;

    /// The query's built-in handler, used only when no handler is registered
    /// for this query type.
    ///
    /// The default returns `None`, which makes an unregistered query type
    /// fail with [`EvaluateError::NotHandled`]. A self-handling query
    /// overrides this to return its own evaluation future; the future runs
    /// under the same capturing context as a registered handler would.
    ///
    /// [`EvaluateError::NotHandled`]: crate::engine::EvaluateError::NotHandled
    fn self_evaluate<'a>(
        &'a self,
        ctx: &'a QueryContext,
    ) -> Option<BoxFuture<'a, Result<Self::Value, HandlerError>>> {
        let _ = ctx;
        None
    }
}

/// Type-erased interface for queries.
///
/// Automatically implemented for every [`Query`] type; the engine uses it to
/// store heterogeneous query keys in one graph. You typically don't interact
/// with this trait directly.
pub trait DynQuery: 'static + Send + Sync + Any {
    /// Returns the runtime type id of the concrete query type.
    fn query_type_id(&self) -> TypeId;

    /// Returns the name of the concrete query type.
    fn query_type_name(&self) -> &'static str;

    /// Compares this query with another type-erased query for equality.
    fn eq_dyn(&self, other: &dyn DynQuery) -> bool;

    /// Hashes this query's fields into the given hasher.
    fn hash_dyn(&self, state: &mut dyn Hasher);

    /// Formats this query for debugging.
    fn dbg_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    /// Upcasts to [`Any`] for downcasting back to the concrete type.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Bridges [`Query::self_evaluate`] across the type erasure boundary.
    fn self_invoke<'a>(
        &'a self,
        ctx: &'a QueryContext,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>>>;
}

impl<Q: Query> DynQuery for Q {
    fn query_type_id(&self) -> TypeId { TypeId::of::<Q>() }

    fn query_type_name(&self) -> &'static str { std::any::type_name::<Q>() }

    fn eq_dyn(&self, other: &dyn DynQuery) -> bool {
        let Some(other) = other.as_any().downcast_ref::<Q>() else {
            return false;
        };

        self == other
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        Hash::hash(self, &mut state);
    }

    fn dbg_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) { self }

    fn self_invoke<'a>(
        &'a self,
        ctx: &'a QueryContext,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>>> {
        let future = self.self_evaluate(ctx)?;

        Some(Box::pin(async move {
            future.await.map(|value| Arc::new(value) as Arc<dyn DynValue>)
        }))
    }
}

/// A cheap-to-clone handle identifying a query node in the dependency graph.
///
/// Equality and hash are structural and delegate to the underlying query
/// value; the hash additionally mixes the runtime type id so two query types
/// with identical field layouts never collide on the same node.
#[derive(Clone)]
pub struct QueryKey(Arc<dyn DynQuery>);

impl QueryKey {
    /// Creates a key for the given query value.
    pub fn new<Q: Query>(query: &Q) -> Self { Self(Arc::new(query.clone())) }

    /// Attempts to downcast the key back to a concrete query type.
    #[must_use]
    pub fn downcast_ref<Q: Query>(&self) -> Option<&Q> {
        self.0.as_any().downcast_ref()
    }

    /// Returns the runtime type id of the underlying query.
    #[must_use]
    pub fn query_type_id(&self) -> TypeId { self.0.query_type_id() }

    /// Returns the type name of the underlying query.
    #[must_use]
    pub fn query_type_name(&self) -> &'static str {
        self.0.query_type_name()
    }

    pub(crate) fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.0.as_any()
    }

    pub(crate) fn self_invoke<'a>(
        &'a self,
        ctx: &'a QueryContext,
    ) -> Option<BoxFuture<'a, Result<Arc<dyn DynValue>, HandlerError>>> {
        self.0.self_invoke(ctx)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool { self.0.eq_dyn(other.0.as_ref()) }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.query_type_id().hash(state);
        self.0.hash_dyn(state);
    }
}

impl Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dbg_dyn(f)
    }
}

/// Type-erased interface for cached query values and failure payloads.
///
/// Automatically implemented for every type satisfying the [`Query::Value`]
/// bounds. Structural comparison through [`DynValue::eq_dyn`] is what drives
/// change detection: a `put` whose result compares equal to the cached one
/// does not invalidate dependents.
pub trait DynValue: 'static + Send + Sync + Any {
    /// Compares this value with another type-erased value.
    fn eq_dyn(&self, other: &dyn DynValue) -> bool;

    /// Formats the value for debugging.
    fn dbg_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T: 'static + Send + Sync + Debug + PartialEq> DynValue for T {
    fn eq_dyn(&self, other: &dyn DynValue) -> bool {
        let as_any = other as &dyn Any;

        as_any.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn dbg_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl dyn DynValue {
    /// Attempts to downcast the value to a concrete type.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        let as_any = self as &dyn Any;

        as_any.downcast_ref::<T>()
    }
}

impl Debug for dyn DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dbg_dyn(f)
    }
}
