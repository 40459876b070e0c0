//! The dependency graph: cached results, dependency edges, and the
//! three-state validity lattice.
//!
//! Every node is keyed by a [`QueryKey`] and stores the last computed
//! [`QueryResult`], its [`Validity`], and the set of queries it used during
//! its last evaluation. The graph also maintains the exact reverse of every
//! dependency edge so invalidation can walk *dependents* without scanning.
//!
//! All mutators are total: they never fail, and a query that is not in the
//! graph reads as strongly invalid with an empty dependency set.

use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    sync::Arc,
};

use enum_as_inner::EnumAsInner;
use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::{
    handler::HandlerError,
    query::{DynValue, QueryKey},
};

/// How a cached value may be used.
///
/// The variants are ordered so that `max` yields the more invalid state:
/// `Valid < WeaklyInvalid < StronglyInvalid`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Validity {
    /// The cached value is current and may be returned as-is.
    Valid,

    /// Some transitive dependency changed; the cached value *might* still be
    /// correct, but direct dependencies must be probed before use.
    WeaklyInvalid,

    /// A direct dependency changed, or the node was externally invalidated.
    /// The cached value must not be returned; the query must re-evaluate.
    StronglyInvalid,
}

/// The memoized outcome of a query evaluation.
///
/// Failures are cached exactly like successes: a dependent that re-asks for
/// a failed query receives the same failure without re-running its handler.
#[derive(Clone, EnumAsInner)]
pub enum QueryResult {
    /// The handler returned a value.
    Success(Arc<dyn DynValue>),

    /// The handler failed with the given payload.
    Failure(HandlerError),
}

impl QueryResult {
    /// Wraps a concrete value as a successful result.
    pub fn success<T: 'static + Send + Sync + Debug + PartialEq>(
        value: T,
    ) -> Self {
        Self::Success(Arc::new(value))
    }
}

impl PartialEq for QueryResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Success(a), Self::Success(b)) => a.eq_dyn(b.as_ref()),
            (Self::Failure(a), Self::Failure(b)) => a == b,
            _ => false,
        }
    }
}

impl Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(value) => {
                f.debug_tuple("Success").field(value).finish()
            }
            Self::Failure(error) => {
                f.debug_tuple("Failure").field(error).finish()
            }
        }
    }
}

/// The per-query state stored in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    result: QueryResult,
    validity: Validity,
    dependencies: Arc<FxHashSet<QueryKey>>,
}

impl Node {
    /// The cached result of the last evaluation.
    #[must_use]
    pub const fn result(&self) -> &QueryResult { &self.result }

    /// The node's current validity.
    #[must_use]
    pub const fn validity(&self) -> Validity { self.validity }

    /// The queries used during the last evaluation.
    ///
    /// The set is immutable-by-convention and shared across graph clones.
    #[must_use]
    pub const fn dependencies(&self) -> &Arc<FxHashSet<QueryKey>> {
        &self.dependencies
    }
}

/// The memo table: nodes plus exact forward and reverse dependency edges.
///
/// The graph is a plain single-threaded data structure; the engine serializes
/// access to it behind a lock. [`Clone`] produces a deep copy of both edge
/// maps, sharing only the immutable dependency sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: FxHashMap<QueryKey, Node>,
    dependents: FxHashMap<QueryKey, FxHashSet<QueryKey>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Returns the cached result for the query, if the node exists.
    #[must_use]
    pub fn get(&self, query: &QueryKey) -> Option<&QueryResult> {
        self.nodes.get(query).map(Node::result)
    }

    /// Returns the node for the query, if it exists.
    #[must_use]
    pub fn node(&self, query: &QueryKey) -> Option<&Node> {
        self.nodes.get(query)
    }

    /// Returns the query's validity.
    ///
    /// A query that is not in the graph reads as
    /// [`Validity::StronglyInvalid`].
    #[must_use]
    pub fn validity(&self, query: &QueryKey) -> Validity {
        self.nodes
            .get(query)
            .map_or(Validity::StronglyInvalid, Node::validity)
    }

    /// Returns the query's dependency set (empty for missing nodes).
    #[must_use]
    pub fn dependencies(&self, query: &QueryKey) -> Arc<FxHashSet<QueryKey>> {
        self.nodes
            .get(query)
            .map_or_else(Arc::default, |node| node.dependencies.clone())
    }

    /// Returns the set of queries that name `query` in their dependencies.
    #[must_use]
    pub fn dependents(&self, query: &QueryKey) -> FxHashSet<QueryKey> {
        self.dependents.get(query).cloned().unwrap_or_default()
    }

    /// Returns every query reachable from `query` through dependency edges.
    ///
    /// `query` itself is included only when a cycle leads back to it.
    #[must_use]
    pub fn transitive_dependencies(
        &self,
        query: &QueryKey,
    ) -> FxHashSet<QueryKey> {
        self.reachable(query, |graph, current| {
            graph
                .nodes
                .get(current)
                .map(|node| node.dependencies.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Returns every query reachable from `query` through reverse edges.
    ///
    /// `query` itself is included only when a cycle leads back to it.
    #[must_use]
    pub fn transitive_dependents(
        &self,
        query: &QueryKey,
    ) -> FxHashSet<QueryKey> {
        self.reachable(query, |graph, current| {
            graph
                .dependents
                .get(current)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Iterates over every node in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = (&QueryKey, &Node)> {
        self.nodes.iter()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize { self.nodes.len() }

    /// Returns whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    /// Writes a node with the given result and dependency set, marking it
    /// [`Validity::Valid`].
    ///
    /// If the result differs from the cached one (or nothing was cached),
    /// every direct dependent becomes strongly invalid and every further
    /// transitive dependent at least weakly invalid; an already strongly
    /// invalid dependent is never downgraded.
    pub fn put(
        &mut self,
        query: QueryKey,
        result: QueryResult,
        dependencies: FxHashSet<QueryKey>,
    ) {
        self.put_with_validity(query, result, dependencies, Validity::Valid);
    }

    /// [`Self::put`] with an explicitly assigned validity.
    ///
    /// The caller is responsible for supplying a validity consistent with
    /// the node's dependencies; the serializer relies on this when restoring
    /// a dump.
    pub fn put_with_validity(
        &mut self,
        query: QueryKey,
        result: QueryResult,
        dependencies: FxHashSet<QueryKey>,
        validity: Validity,
    ) {
        let changed = self
            .nodes
            .get(&query)
            .is_none_or(|node| node.result != result);

        if changed {
            self.mark_dependents_of_changed(&query);
        }

        // reconcile reverse edges against the previous dependency set
        let dependencies = Arc::new(dependencies);
        let previous = self
            .nodes
            .get(&query)
            .map_or_else(Arc::default, |node| node.dependencies.clone());

        for removed in previous.iter().filter(|d| !dependencies.contains(*d)) {
            self.unlink_dependent(removed, &query);
        }

        for added in dependencies.iter().filter(|d| !previous.contains(*d)) {
            self.dependents
                .entry(added.clone())
                .or_default()
                .insert(query.clone());
        }

        self.nodes.insert(query, Node { result, validity, dependencies });
    }

    /// Forces `query` to [`Validity::StronglyInvalid`] and marks every
    /// transitive dependent at least weakly invalid.
    ///
    /// An already strongly invalid dependent keeps that state.
    pub fn invalidate(&mut self, query: &QueryKey) {
        tracing::debug!(query = ?query, "invalidating");

        self.set_validity(query, Validity::StronglyInvalid);

        let mut visited: FxHashSet<QueryKey> = FxHashSet::default();
        visited.insert(query.clone());

        let mut queue: VecDeque<QueryKey> =
            self.dependents(query).into_iter().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }

            self.weaken(&current);
            queue.extend(self.dependents(&current));
        }
    }

    /// Deletes the node, propagating like a changed result first: direct
    /// dependents become strongly invalid, further transitive dependents
    /// weakly invalid.
    ///
    /// The reverse set for `query` is kept: dependents still name `query` in
    /// their dependency sets and will rediscover it on recomputation.
    pub fn remove(&mut self, query: &QueryKey) {
        self.mark_dependents_of_changed(query);

        if let Some(node) = self.nodes.remove(query) {
            for dependency in node.dependencies.iter() {
                self.unlink_dependent(dependency, query);
            }
        }
    }

    /// Promotes a weakly invalid node back to valid when every one of its
    /// dependencies is valid; otherwise leaves the node unchanged.
    ///
    /// This is the only upgrade path that does not go through
    /// [`Self::put`].
    pub fn validate_weak(&mut self, query: &QueryKey) {
        let Some(node) = self.nodes.get(query) else { return };

        if node.validity != Validity::WeaklyInvalid {
            return;
        }

        let dependencies = node.dependencies.clone();

        if dependencies.iter().all(|d| self.validity(d) == Validity::Valid) {
            self.set_validity(query, Validity::Valid);
        }
    }

    /// Marks direct dependents strongly invalid and every further transitive
    /// dependent at least weakly invalid. Strong dominates weak throughout.
    fn mark_dependents_of_changed(&mut self, query: &QueryKey) {
        let direct: Vec<QueryKey> =
            self.dependents(query).into_iter().collect();

        let mut visited: FxHashSet<QueryKey> =
            direct.iter().cloned().collect();
        visited.insert(query.clone());

        for dependent in &direct {
            self.set_validity(dependent, Validity::StronglyInvalid);
        }

        let mut queue: VecDeque<QueryKey> = direct.into();

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if visited.insert(dependent.clone()) {
                    self.weaken(&dependent);
                    queue.push_back(dependent);
                }
            }
        }
    }

    fn set_validity(&mut self, query: &QueryKey, validity: Validity) {
        if let Some(node) = self.nodes.get_mut(query) {
            node.validity = validity;
        }
    }

    /// Downgrades a valid node to weakly invalid; weak and strong states are
    /// left as they are.
    fn weaken(&mut self, query: &QueryKey) {
        if let Some(node) = self.nodes.get_mut(query)
            && node.validity == Validity::Valid
        {
            node.validity = Validity::WeaklyInvalid;
        }
    }

    fn unlink_dependent(&mut self, from: &QueryKey, dependent: &QueryKey) {
        if let Some(set) = self.dependents.get_mut(from) {
            set.remove(dependent);

            if set.is_empty() {
                self.dependents.remove(from);
            }
        }
    }

    /// Iterative BFS over one edge direction; tolerates cycles.
    fn reachable(
        &self,
        from: &QueryKey,
        neighbors: impl Fn(&Self, &QueryKey) -> Vec<QueryKey>,
    ) -> FxHashSet<QueryKey> {
        let mut reached = FxHashSet::default();
        let mut queue: VecDeque<QueryKey> = neighbors(self, from).into();

        while let Some(current) = queue.pop_front() {
            if reached.insert(current.clone()) {
                queue.extend(neighbors(self, &current));
            }
        }

        reached
    }
}
