//! The query engine: demand-driven evaluation over the dependency graph.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Engine                              │
//! │  ┌──────────────────────┐   ┌──────────────────────────┐   │
//! │  │   DependencyGraph    │   │     HandlerRegistry      │   │
//! │  │  - cached results    │   │  query type → handler    │   │
//! │  │  - deps / dependents │   └──────────────────────────┘   │
//! │  │  - validity          │   ┌──────────────────────────┐   │
//! │  └──────────────────────┘   │  in-flight map (dedup)   │   │
//! │                             └──────────────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//!                             │ handler invocation
//!                             ▼
//!                      QueryContext ── evaluate(q') ──▶ Engine
//! ```
//!
//! `evaluate` consults the graph first: a valid node returns its cached
//! result (successes and failures alike), a weakly invalid node probes its
//! direct dependencies and is promoted back to valid when none of them
//! changed, and anything else dispatches the handler under a capturing
//! context that records every nested `evaluate` as a dependency edge.
//!
//! Concurrent requests for the same query are deduplicated through an
//! in-flight map, so a handler runs at most once per distinct query at any
//! time. A query that transitively evaluates itself waits on its own
//! in-flight entry, so a cycle deadlocks instead of being detected.

use std::sync::Arc;

use dashmap::DashMap;
use fxhash::{FxBuildHasher, FxHashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::{
    graph::{DependencyGraph, QueryResult, Validity},
    handler::{
        BuildError, ChangeStream, Handler, HandlerError, HandlerRegistry,
        Subscription,
    },
    query::{BoxFuture, DynValue, Query, QueryKey},
};

/// Error surfaced by [`Engine::evaluate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluateError {
    /// No handler is registered for the query's type and the query does not
    /// carry a built-in one.
    #[error("no handler registered for query `{0:?}`")]
    NotHandled(QueryKey),

    /// The query's handler failed; the same failure is replayed from the
    /// cache until the query is invalidated.
    #[error("query failed: {0}")]
    Failed(#[from] HandlerError),
}

impl From<EvaluateError> for HandlerError {
    /// Lets handlers propagate dependency errors with `?`.
    ///
    /// A cached dependency failure passes through unchanged, so the payload
    /// observed by the outermost caller is the original one.
    fn from(error: EvaluateError) -> Self {
        match error {
            EvaluateError::Failed(error) => error,
            other => Self::new(other),
        }
    }
}

/// Assembles an [`Engine`]: handlers, observable subscriptions, and an
/// optional starting graph.
///
/// ```rust
/// use std::sync::Arc;
///
/// use quern::{EngineBuilder, Handler, HandlerError, Query, QueryContext};
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct Constant;
///
/// impl Query for Constant {
///     type Value = i64;
/// }
///
/// struct ConstantHandler;
///
/// impl Handler<Constant> for ConstantHandler {
///     async fn evaluate(
///         &self,
///         _query: &Constant,
///         _ctx: &QueryContext,
///     ) -> Result<i64, HandlerError> {
///         Ok(42)
///     }
/// }
///
/// let mut builder = EngineBuilder::new();
/// builder
///     .register_handler::<Constant, _>(Arc::new(ConstantHandler))
///     .unwrap();
/// let engine = builder.build();
/// ```
#[derive(Debug, Default)]
pub struct EngineBuilder {
    registry: HandlerRegistry,
    graph: DependencyGraph,
    streams: Vec<ChangeStream>,
}

impl EngineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Registers a handler for the given query type.
    ///
    /// Registering the same query type twice fails with
    /// [`BuildError::MultipleHandlers`]. If the handler is observable, the
    /// engine subscribes to its change stream at build time.
    pub fn register_handler<Q: Query, H: Handler<Q>>(
        &mut self,
        handler: Arc<H>,
    ) -> Result<(), BuildError> {
        let stream = handler.changes().cloned();

        self.registry.register::<Q, H>(handler)?;

        if let Some(stream) = stream {
            self.streams.push(stream);
        }

        Ok(())
    }

    /// Runs a registration pack against this builder.
    ///
    /// This is the explicit-registry counterpart to discovery-by-annotation:
    /// a library exposes one function that registers its canonical handlers,
    /// and callers install it wholesale.
    pub fn install(
        &mut self,
        pack: impl FnOnce(&mut Self) -> Result<(), BuildError>,
    ) -> Result<(), BuildError> {
        pack(self)
    }

    /// Starts the engine from a clone of an existing graph.
    pub fn with_graph(&mut self, graph: &DependencyGraph) -> &mut Self {
        self.graph = graph.clone();
        self
    }

    /// Builds the engine and wires observable handlers into invalidation.
    #[must_use]
    pub fn build(self) -> Engine {
        let core = Arc::new(EngineCore {
            graph: RwLock::new(self.graph),
            registry: self.registry,
            pending: DashMap::with_hasher(FxBuildHasher::default()),
            subscriptions: Mutex::new(Vec::new()),
        });

        // route external change signals into invalidation; the subscription
        // must not keep the engine alive, hence the weak reference
        let subscriptions = self
            .streams
            .iter()
            .map(|stream| {
                let weak = Arc::downgrade(&core);

                stream.subscribe(move |key| {
                    if let Some(core) = weak.upgrade() {
                        tracing::debug!(query = ?key, "external change signal");
                        core.graph.write().invalidate(key);
                    }
                })
            })
            .collect();

        *core.subscriptions.lock() = subscriptions;

        Engine { core }
    }
}

/// The incremental query engine.
///
/// Cloning produces another handle to the same engine; all clones share the
/// graph, the handler registry, and the in-flight map. The change-stream
/// subscriptions installed at build time are released when the last handle
/// is dropped.
#[derive(Debug, Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> EngineBuilder { EngineBuilder::new() }

    /// Evaluates a query, reusing the cached result when it is still valid.
    ///
    /// Concurrent calls for the same query share one handler invocation and
    /// observe the same success or the same failure. May suspend at the
    /// in-flight map, while awaiting another caller's evaluation, or inside
    /// the handler itself.
    pub async fn evaluate<Q: Query>(
        &self,
        query: &Q,
    ) -> Result<Q::Value, EvaluateError> {
        let value =
            self.core.clone().evaluate_key(QueryKey::new(query)).await?;

        Ok(value
            .downcast_ref::<Q::Value>()
            .expect(
                "cached value type differs from the query's declared `Value`",
            )
            .clone())
    }

    /// Marks the query strongly invalid and weakens every transitive
    /// dependent, forcing re-evaluation on the next request.
    pub fn invalidate<Q: Query>(&self, query: &Q) {
        self.invalidate_key(&QueryKey::new(query));
    }

    /// Type-erased variant of [`Self::invalidate`].
    pub fn invalidate_key(&self, key: &QueryKey) {
        self.core.graph.write().invalidate(key);
    }

    /// Removes the query's node from the graph.
    pub fn remove<Q: Query>(&self, query: &Q) {
        self.core.graph.write().remove(&QueryKey::new(query));
    }

    /// Returns a deep copy of the current graph, suitable for serialization
    /// or inspection.
    #[must_use]
    pub fn snapshot(&self) -> DependencyGraph {
        self.core.graph.read().clone()
    }
}

static_assertions::assert_impl_all!(Engine: Send, Sync);
static_assertions::assert_impl_all!(QueryContext: Send, Sync);

#[derive(Debug)]
struct EngineCore {
    graph: RwLock<DependencyGraph>,
    registry: HandlerRegistry,
    pending: DashMap<QueryKey, Arc<Notify>, FxBuildHasher>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Removes the in-flight entry and wakes waiters when the owning evaluation
/// finishes, whether it completed or was cancelled mid-flight.
struct PendingGuard<'a> {
    core: &'a EngineCore,
    key: &'a QueryKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some((_, notify)) = self.core.pending.remove(self.key) {
            notify.notify_waiters();
        }
    }
}

impl EngineCore {
    /// The deduplicated entry point shared by external callers, capturing
    /// contexts, and weak-path probes.
    ///
    /// Boxed so the evaluation recursion stays finitely sized.
    fn evaluate_key(
        self: Arc<Self>,
        key: QueryKey,
    ) -> BoxFuture<'static, Result<Arc<dyn DynValue>, EvaluateError>> {
        Box::pin(async move {
            loop {
                match self.pending.entry(key.clone()) {
                    dashmap::Entry::Occupied(entry) => {
                        // someone else is evaluating this query; register
                        // interest before releasing the shard lock so the
                        // wake-up cannot be missed, then retry from the cache
                        let mut notified =
                            Box::pin(entry.get().clone().notified_owned());
                        notified.as_mut().enable();
                        drop(entry);

                        notified.await;
                    }

                    dashmap::Entry::Vacant(vacant) => {
                        vacant.insert(Arc::new(Notify::new()));

                        let guard = PendingGuard { core: &self, key: &key };
                        let result = self.evaluate_inner(&key).await;
                        drop(guard);

                        return result;
                    }
                }
            }
        })
    }

    async fn evaluate_inner(
        self: &Arc<Self>,
        key: &QueryKey,
    ) -> Result<Arc<dyn DynValue>, EvaluateError> {
        // weak fast path: probe direct dependencies and try to revalidate
        if self.graph.read().validity(key) == Validity::WeaklyInvalid {
            let dependencies = self.graph.read().dependencies(key);

            for dependency in dependencies.iter() {
                // probe errors update the dependency's node and, if its
                // result changed, this node's validity; the error itself
                // resurfaces through the cache below
                let _ = self.clone().evaluate_key(dependency.clone()).await;

                if self.graph.read().validity(key)
                    == Validity::StronglyInvalid
                {
                    break;
                }
            }

            self.graph.write().validate_weak(key);
        }

        // cached-valid path: replay the memoized success or failure
        {
            let graph = self.graph.read();

            if graph.validity(key) == Validity::Valid {
                let result = graph
                    .get(key)
                    .expect("a valid node always has a cached result")
                    .clone();
                drop(graph);

                return match result {
                    QueryResult::Success(value) => Ok(value),
                    QueryResult::Failure(error) => {
                        Err(EvaluateError::Failed(error))
                    }
                };
            }
        }

        // recompute path: dispatch the handler under a capturing context
        tracing::trace!(query = ?key, "dispatching handler");

        let ctx = QueryContext {
            core: self.clone(),
            captured: Mutex::new(FxHashSet::default()),
        };

        let outcome = match self.registry.get(&key.query_type_id()) {
            Some(entry) => entry.invoke(key.as_any(), &ctx).await,
            None => match key.self_invoke(&ctx) {
                Some(future) => future.await,
                None => return Err(EvaluateError::NotHandled(key.clone())),
            },
        };

        let captured = ctx.into_captured();

        let result = match &outcome {
            Ok(value) => QueryResult::Success(value.clone()),
            Err(error) => QueryResult::Failure(error.clone()),
        };

        self.graph.write().put(key.clone(), result, captured);

        outcome.map_err(EvaluateError::Failed)
    }
}

/// The evaluation context handed to handlers.
///
/// Its only operation is [`evaluate`](Self::evaluate): requesting a
/// dependency re-enters the engine and records the requested query in the
/// dependency set of the query currently being computed, whether the
/// request was served from the cache or recomputed.
#[derive(Debug)]
pub struct QueryContext {
    core: Arc<EngineCore>,
    captured: Mutex<FxHashSet<QueryKey>>,
}

impl QueryContext {
    /// Evaluates a dependency of the query currently being computed.
    pub async fn evaluate<Q: Query>(
        &self,
        query: &Q,
    ) -> Result<Q::Value, EvaluateError> {
        let key = QueryKey::new(query);

        self.captured.lock().insert(key.clone());

        let value = self.core.clone().evaluate_key(key).await?;

        Ok(value
            .downcast_ref::<Q::Value>()
            .expect(
                "cached value type differs from the query's declared `Value`",
            )
            .clone())
    }

    fn into_captured(self) -> FxHashSet<QueryKey> {
        self.captured.into_inner()
    }
}
