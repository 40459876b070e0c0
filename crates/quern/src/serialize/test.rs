use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::{DumpError, LoadError, SerializerRegistry};
use crate::{
    graph::{DependencyGraph, QueryResult, Validity},
    handler::HandlerError,
    query::{Query, QueryKey},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
struct Term(u32);

impl Query for Term {
    type Value = i64;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
struct Extra(u32);

impl Query for Extra {
    type Value = i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Opaque(u32);

impl Query for Opaque {
    type Value = i64;
}

fn term(n: u32) -> QueryKey { QueryKey::new(&Term(n)) }

fn success(value: i64) -> QueryResult { QueryResult::success(value) }

fn deps(keys: &[QueryKey]) -> FxHashSet<QueryKey> {
    keys.iter().cloned().collect()
}

fn registry() -> SerializerRegistry {
    let mut registry = SerializerRegistry::new();
    registry.add_value_serializer::<Term>("term");
    registry
}

/// Term(1)=1, Term(2)=2 strongly invalid, Term(3)=3 weakly invalid on top.
fn sample_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();

    graph.put(term(1), success(1), deps(&[]));
    graph.put_with_validity(
        term(2),
        success(2),
        deps(&[term(1)]),
        Validity::StronglyInvalid,
    );
    graph.put_with_validity(
        term(3),
        success(3),
        deps(&[term(2)]),
        Validity::WeaklyInvalid,
    );

    graph
}

#[test]
fn text_round_trip_is_lossless() {
    let registry = registry();
    let graph = sample_graph();

    let dump = registry.dump_text(&graph).expect("dumps cleanly");
    let loaded = registry.load_text(&dump).expect("loads cleanly");

    assert_eq!(loaded, graph);
}

#[test]
fn binary_round_trip_is_lossless() {
    let registry = registry();
    let graph = sample_graph();

    let dump = registry.dump_binary(&graph).expect("dumps cleanly");
    let loaded = registry.load_binary(&dump).expect("loads cleanly");

    assert_eq!(loaded, graph);
}

#[test]
fn hex_round_trip_is_lossless() {
    let registry = registry();
    let graph = sample_graph();

    let dump = registry.dump_hex(&graph).expect("dumps cleanly");

    for entry in &dump.entries {
        assert!(entry.query.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    let loaded = registry.load_hex(&dump).expect("loads cleanly");

    assert_eq!(loaded, graph);
}

#[test]
fn dump_load_dump_is_stable() {
    let registry = registry();
    let graph = sample_graph();

    let first = registry.dump_text(&graph).expect("dumps cleanly");
    let reloaded = registry.load_text(&first).expect("loads cleanly");
    let second = registry.dump_text(&reloaded).expect("dumps cleanly");

    assert_eq!(
        registry.load_text(&second).expect("loads cleanly"),
        reloaded
    );
    assert_eq!(first.entries.len(), second.entries.len());
}

#[test]
fn entries_are_topologically_ordered() {
    let registry = registry();
    let dump = registry.dump_text(&sample_graph()).expect("dumps cleanly");

    assert_eq!(dump.entries.len(), 3);

    for (index, entry) in dump.entries.iter().enumerate() {
        assert!(entry.local_deps.iter().all(|&dep| dep < index));
    }
}

#[test]
fn valid_entries_over_invalid_local_deps_are_demoted() {
    let registry = registry();

    let mut graph = DependencyGraph::new();
    graph.put(term(1), success(1), deps(&[]));
    graph.put_with_validity(
        term(2),
        success(2),
        deps(&[term(1)]),
        Validity::StronglyInvalid,
    );
    // valid on top of a strongly invalid dependency
    graph.put(term(3), success(3), deps(&[term(2)]));

    let dump = registry.dump_text(&graph).expect("dumps cleanly");
    let loaded = registry.load_text(&dump).expect("loads cleanly");

    assert_eq!(loaded.validity(&term(3)), Validity::WeaklyInvalid);
    assert_eq!(loaded.validity(&term(2)), Validity::StronglyInvalid);
    assert_eq!(loaded.validity(&term(1)), Validity::Valid);
}

#[test]
fn failure_nodes_become_transient_dependencies() {
    let registry = registry();

    let mut graph = DependencyGraph::new();
    graph.put(
        term(9),
        QueryResult::Failure(HandlerError::new("read failed".to_owned())),
        deps(&[]),
    );
    graph.put(term(10), success(10), deps(&[term(9)]));

    let dump = registry.dump_text(&graph).expect("dumps cleanly");

    // the failure has no entry of its own but survives as a transient dep
    assert_eq!(dump.entries.len(), 1);
    assert_eq!(dump.entries[0].transient_deps.len(), 1);
    assert_eq!(dump.entries[0].validity, Validity::StronglyInvalid);

    let loaded = registry.load_text(&dump).expect("loads cleanly");

    assert!(loaded.get(&term(9)).is_none());
    assert!(loaded.dependencies(&term(10)).contains(&term(9)));
    assert_eq!(loaded.validity(&term(10)), Validity::StronglyInvalid);
}

#[test]
fn unregistered_dependency_class_skips_the_entry() {
    let registry = registry();

    let mut graph = DependencyGraph::new();
    graph.put(term(1), success(1), deps(&[]));
    // Opaque has no query serializer at all, so term(5) cannot be named
    // coherently on disk
    graph.put(
        term(5),
        success(5),
        deps(&[QueryKey::new(&Opaque(1))]),
    );

    let dump = registry.dump_text(&graph).expect("dumps cleanly");

    assert_eq!(dump.entries.len(), 1);

    let loaded = registry.load_text(&dump).expect("loads cleanly");

    assert!(loaded.get(&term(5)).is_none());
    assert_eq!(loaded.get(&term(1)), Some(&success(1)));
}

#[test]
fn query_only_registrations_allow_transient_dependencies() {
    let mut registry = registry();
    registry.add_query_serializer::<Extra>("extra");

    let mut graph = DependencyGraph::new();
    graph.put(term(5), success(5), deps(&[QueryKey::new(&Extra(1))]));

    let dump = registry.dump_text(&graph).expect("dumps cleanly");

    assert_eq!(dump.entries.len(), 1);
    assert_eq!(dump.entries[0].transient_deps.len(), 1);

    let loaded = registry.load_text(&dump).expect("loads cleanly");

    assert!(loaded.dependencies(&term(5)).contains(&QueryKey::new(&Extra(1))));
    assert_eq!(loaded.validity(&term(5)), Validity::StronglyInvalid);
}

#[test]
fn cyclic_serializable_subgraph_is_rejected() {
    let registry = registry();

    let mut graph = DependencyGraph::new();
    graph.put(term(1), success(1), deps(&[term(2)]));
    graph.put(term(2), success(2), deps(&[term(1)]));

    assert!(matches!(
        registry.dump_text(&graph),
        Err(DumpError::CyclicDependency)
    ));
}

#[test]
fn unknown_tags_on_load_leave_holes_and_demote_referers() {
    let mut full = SerializerRegistry::new();
    full.add_value_serializer::<Term>("term");
    full.add_value_serializer::<Extra>("extra");

    let mut graph = DependencyGraph::new();
    let extra = QueryKey::new(&Extra(1));
    graph.put(extra.clone(), success(1), deps(&[]));
    graph.put(term(2), success(2), deps(&[extra]));

    let dump = full.dump_text(&graph).expect("dumps cleanly");
    assert_eq!(dump.entries.len(), 2);

    // a reader that only knows about Term skips the Extra entry
    let partial = registry();
    let loaded = partial.load_text(&dump).expect("loads cleanly");

    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.get(&term(2)), Some(&success(2)));
    assert!(loaded.dependencies(&term(2)).is_empty());
    assert_eq!(loaded.validity(&term(2)), Validity::StronglyInvalid);
}

#[test]
fn forward_references_are_rejected() {
    let registry = registry();

    let mut graph = DependencyGraph::new();
    graph.put(term(1), success(1), deps(&[]));

    let mut dump = registry.dump_text(&graph).expect("dumps cleanly");
    dump.entries[0].local_deps.insert(0);

    assert!(matches!(
        registry.load_text(&dump),
        Err(LoadError::ForwardReference { entry: 0, dependency: 0 })
    ));
}
