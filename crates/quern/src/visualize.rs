//! Graphviz DOT rendering of dependency-graph snapshots.
//!
//! Intended for debugging: feed the output to `dot -Tsvg` to see which nodes
//! went weakly or strongly invalid after a change.

use std::fmt::{self, Write};

use fxhash::FxHashMap;

use crate::{
    graph::{DependencyGraph, Validity},
    query::QueryKey,
};

const fn fill_color(validity: Validity) -> &'static str {
    match validity {
        Validity::Valid => "palegreen",
        Validity::WeaklyInvalid => "khaki",
        Validity::StronglyInvalid => "lightcoral",
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Writes the graph in DOT syntax.
///
/// Nodes are colored by validity; dependencies referenced by some node but
/// absent from the graph are rendered dashed.
pub fn write_dot(
    graph: &DependencyGraph,
    writer: &mut impl Write,
) -> fmt::Result {
    writeln!(writer, "digraph dependencies {{")?;
    writeln!(writer, "    rankdir=BT;")?;
    writeln!(writer, "    node [shape=box, style=filled];")?;

    // stable ids for every key that appears as a node or as a dependency
    let mut ids: FxHashMap<QueryKey, usize> = FxHashMap::default();
    let id_of = |key: &QueryKey, ids: &mut FxHashMap<QueryKey, usize>| {
        if let Some(&id) = ids.get(key) {
            id
        } else {
            let id = ids.len();
            ids.insert(key.clone(), id);
            id
        }
    };

    for (key, node) in graph.nodes() {
        let id = id_of(key, &mut ids);

        writeln!(
            writer,
            "    q{id} [label=\"{}\", fillcolor={}];",
            escape(&format!("{key:?}")),
            fill_color(node.validity()),
        )?;
    }

    for (key, node) in graph.nodes() {
        let id = id_of(key, &mut ids);

        for dependency in node.dependencies().iter() {
            let dep_id = id_of(dependency, &mut ids);

            if graph.node(dependency).is_none() {
                writeln!(
                    writer,
                    "    q{dep_id} [label=\"{}\", style=dashed, \
                     fillcolor=white];",
                    escape(&format!("{dependency:?}")),
                )?;
            }

            writeln!(writer, "    q{id} -> q{dep_id};")?;
        }
    }

    writeln!(writer, "}}")
}

/// [`write_dot`] into a fresh string.
#[must_use]
pub fn to_dot(graph: &DependencyGraph) -> String {
    let mut out = String::new();

    write_dot(graph, &mut out)
        .expect("formatting into a string cannot fail");

    out
}

#[cfg(test)]
mod test {
    use fxhash::FxHashSet;

    use super::to_dot;
    use crate::{
        graph::{DependencyGraph, QueryResult},
        query::{Query, QueryKey},
    };

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Label(&'static str);

    impl Query for Label {
        type Value = i64;
    }

    #[test]
    fn renders_nodes_edges_and_dangling_dependencies() {
        let mut graph = DependencyGraph::new();

        let base = QueryKey::new(&Label("base"));
        let derived = QueryKey::new(&Label("derived"));
        let missing = QueryKey::new(&Label("missing"));

        graph.put(base.clone(), QueryResult::success(1_i64), FxHashSet::default());
        graph.put(
            derived,
            QueryResult::success(2_i64),
            [base, missing].into_iter().collect(),
        );

        let dot = to_dot(&graph);

        assert!(dot.starts_with("digraph dependencies {"));
        assert!(dot.contains("Label(\\\"base\\\")"));
        assert!(dot.contains("style=dashed"));
        assert!(dot.contains("->"));
        assert!(dot.contains("fillcolor=palegreen"));
    }
}
