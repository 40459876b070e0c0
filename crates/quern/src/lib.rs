//! # QUERN, a demand-driven incremental query engine
//!
//! Computation is expressed as **queries**: plain values with structural
//! identity whose results are produced by registered **handlers**. The
//! engine memoizes every result, tracks the dynamic data-flow dependencies
//! between queries, and, when something changes, re-evaluates only the
//! queries whose results can actually differ. The memo table can be dumped
//! to disk and restored with a coherent validity state.
//!
//! ## Key Concepts
//!
//! - **Query** ([`Query`]): an input key with a declared output type. Two
//!   queries of the same type with equal fields are the same node.
//! - **Handler** ([`Handler`]): the async computation for one query type. It
//!   requests dependencies through a [`QueryContext`], and every request is
//!   recorded as a dependency edge, cached or not.
//! - **Validity** ([`Validity`]): each cached result is *valid*, *weakly
//!   invalid* (something upstream changed, the value might still be right),
//!   or *strongly invalid* (a direct input changed; recompute). Weakly
//!   invalid nodes are revalidated by probing just their direct
//!   dependencies, which is what keeps rebuilds sparse.
//! - **Dump** ([`serialize::Dump`]): a topologically ordered snapshot of the
//!   serializable part of the graph.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use quern::{EngineBuilder, Handler, HandlerError, Query, QueryContext};
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct Fibonacci(u64);
//!
//! impl Query for Fibonacci {
//!     type Value = u64;
//! }
//!
//! struct FibonacciHandler;
//!
//! impl Handler<Fibonacci> for FibonacciHandler {
//!     async fn evaluate(
//!         &self,
//!         query: &Fibonacci,
//!         ctx: &QueryContext,
//!     ) -> Result<u64, HandlerError> {
//!         Ok(match query.0 {
//!             0 | 1 => query.0,
//!             n => {
//!                 ctx.evaluate(&Fibonacci(n - 1)).await?
//!                     + ctx.evaluate(&Fibonacci(n - 2)).await?
//!             }
//!         })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut builder = EngineBuilder::new();
//! builder
//!     .register_handler::<Fibonacci, _>(Arc::new(FibonacciHandler))
//!     .unwrap();
//! let engine = builder.build();
//!
//! assert_eq!(engine.evaluate(&Fibonacci(10)).await, Ok(55));
//!
//! // every sub-query was computed exactly once and is now cached
//! assert_eq!(engine.evaluate(&Fibonacci(9)).await, Ok(34));
//! # }
//! ```
//!
//! ## Invalidation
//!
//! External facts change through [`Engine::invalidate`] or through an
//! observable handler's [`ChangeStream`]. Either way the affected query goes
//! strongly invalid and its transitive dependents weakly invalid; the next
//! `evaluate` of a weakly invalid query probes its direct dependencies and
//! only re-runs its handler when one of them actually produced a different
//! value.
//!
//! ## Concurrency
//!
//! The engine is `Send + Sync` and handlers of distinct queries may run in
//! parallel; concurrent requests for the *same* query share one handler
//! invocation. Cycle detection is a non-goal: a query that transitively
//! evaluates itself deadlocks.

pub mod engine;
pub mod graph;
pub mod handler;
pub mod query;
pub mod serialize;
pub mod visualize;

pub use engine::{Engine, EngineBuilder, EvaluateError, QueryContext};
pub use graph::{DependencyGraph, Node, QueryResult, Validity};
pub use handler::{
    BuildError, ChangeStream, Handler, HandlerError, Subscription,
};
pub use query::{BoxFuture, DynQuery, DynValue, Query, QueryKey};
pub use serialize::{
    CodecError, Dump, DumpError, Entry, LoadError, SerializerRegistry,
};
