//! Snapshotting the memo table to a [`Dump`] and restoring it with a
//! coherent validity state.
//!
//! Query types have no identity that survives a process restart, so
//! serialization is registration-driven: [`SerializerRegistry`] binds each
//! query type to a stable string tag together with codecs for the query and,
//! optionally, its value. A dump contains only successful, fully
//! serializable nodes, topologically ordered so every entry's local
//! dependencies point backwards; everything else a node depends on travels
//! as a *transient* dependency (an encoded query without an entry of its
//! own) and demotes the node to strongly invalid, since a reader has
//! nothing to probe.
//!
//! The dump/load algorithms are parameterised over an encoding lambda pair;
//! [`dump_text`](SerializerRegistry::dump_text) /
//! [`dump_binary`](SerializerRegistry::dump_binary) /
//! [`dump_hex`](SerializerRegistry::dump_hex) (and the matching `load_*`
//! functions) bind them to JSON, postcard, and hex-wrapped postcard
//! respectively.

use std::{any::TypeId, collections::{BTreeSet, VecDeque}, sync::Arc};

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    graph::{DependencyGraph, QueryResult, Validity},
    query::{DynValue, Query, QueryKey},
};

/// A persistable snapshot of the serializable part of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump<E> {
    /// Entries in topological order: every local dependency index points to
    /// an earlier entry.
    pub entries: Vec<Entry<E>>,
}

/// One node of a [`Dump`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<E> {
    /// The encoded query.
    pub query: E,

    /// The encoded value.
    pub value: E,

    /// The validity to restore, already demoted for anything the reader
    /// cannot probe.
    pub validity: Validity,

    /// Indices of dependencies that are entries of this dump.
    pub local_deps: BTreeSet<usize>,

    /// Encoded dependency queries that did not get an entry of their own.
    pub transient_deps: Vec<E>,
}

/// Error produced by the per-class codecs and the format bindings.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Postcard (de)serialization failed.
    #[error(transparent)]
    Binary(#[from] postcard::Error),

    /// A hex payload could not be decoded.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// Error produced while emitting a [`Dump`].
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    /// The serializable subgraph contains a dependency cycle, so no
    /// topological order exists.
    #[error("the serializable subgraph contains a dependency cycle")]
    CyclicDependency,

    /// A codec rejected a query or value.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Error produced while restoring a [`Dump`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// An entry referenced a local dependency at or after its own position.
    #[error(
        "entry {entry} references local dependency {dependency} at or after \
         itself"
    )]
    ForwardReference {
        /// Index of the malformed entry.
        entry: usize,
        /// The out-of-range dependency index.
        dependency: usize,
    },

    /// A codec rejected an encoded query or value.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

type EncodeQueryTextFn =
    fn(&QueryKey) -> Result<serde_json::Value, CodecError>;
type DecodeQueryTextFn =
    fn(serde_json::Value) -> Result<QueryKey, CodecError>;
type EncodeQueryBinaryFn = fn(&QueryKey) -> Result<Vec<u8>, CodecError>;
type DecodeQueryBinaryFn = fn(&[u8]) -> Result<QueryKey, CodecError>;

type EncodeValueTextFn =
    fn(&dyn DynValue) -> Result<serde_json::Value, CodecError>;
type DecodeValueTextFn =
    fn(serde_json::Value) -> Result<Arc<dyn DynValue>, CodecError>;
type EncodeValueBinaryFn = fn(&dyn DynValue) -> Result<Vec<u8>, CodecError>;
type DecodeValueBinaryFn =
    fn(&[u8]) -> Result<Arc<dyn DynValue>, CodecError>;

fn encode_query_text<Q: Query + Serialize>(
    key: &QueryKey,
) -> Result<serde_json::Value, CodecError> {
    let query = key
        .downcast_ref::<Q>()
        .expect("query codec registered under a different type");

    Ok(serde_json::to_value(query)?)
}

fn decode_query_text<Q: Query + DeserializeOwned>(
    body: serde_json::Value,
) -> Result<QueryKey, CodecError> {
    let query: Q = serde_json::from_value(body)?;

    Ok(QueryKey::new(&query))
}

fn encode_query_binary<Q: Query + Serialize>(
    key: &QueryKey,
) -> Result<Vec<u8>, CodecError> {
    let query = key
        .downcast_ref::<Q>()
        .expect("query codec registered under a different type");

    Ok(postcard::to_allocvec(query)?)
}

fn decode_query_binary<Q: Query + DeserializeOwned>(
    body: &[u8],
) -> Result<QueryKey, CodecError> {
    let query: Q = postcard::from_bytes(body)?;

    Ok(QueryKey::new(&query))
}

fn encode_value_text<Q: Query>(
    value: &dyn DynValue,
) -> Result<serde_json::Value, CodecError>
where
    Q::Value: Serialize,
{
    let value = value
        .downcast_ref::<Q::Value>()
        .expect("cached value type differs from the query's declared `Value`");

    Ok(serde_json::to_value(value)?)
}

fn decode_value_text<Q: Query>(
    body: serde_json::Value,
) -> Result<Arc<dyn DynValue>, CodecError>
where
    Q::Value: DeserializeOwned,
{
    let value: Q::Value = serde_json::from_value(body)?;

    Ok(Arc::new(value))
}

fn encode_value_binary<Q: Query>(
    value: &dyn DynValue,
) -> Result<Vec<u8>, CodecError>
where
    Q::Value: Serialize,
{
    let value = value
        .downcast_ref::<Q::Value>()
        .expect("cached value type differs from the query's declared `Value`");

    Ok(postcard::to_allocvec(value)?)
}

fn decode_value_binary<Q: Query>(
    body: &[u8],
) -> Result<Arc<dyn DynValue>, CodecError>
where
    Q::Value: DeserializeOwned,
{
    let value: Q::Value = postcard::from_bytes(body)?;

    Ok(Arc::new(value))
}

struct QueryCodec {
    tag: &'static str,
    encode_text: EncodeQueryTextFn,
    decode_text: DecodeQueryTextFn,
    encode_binary: EncodeQueryBinaryFn,
    decode_binary: DecodeQueryBinaryFn,
}

struct ValueCodec {
    encode_text: EncodeValueTextFn,
    decode_text: DecodeValueTextFn,
    encode_binary: EncodeValueBinaryFn,
    decode_binary: DecodeValueBinaryFn,
}

struct CodecEntry {
    query: QueryCodec,
    value: Option<ValueCodec>,
}

/// The query envelope of the textual encoding.
#[derive(Serialize, Deserialize)]
struct TextEnvelope {
    tag: String,
    body: serde_json::Value,
}

/// The query envelope of the binary encoding.
type BinaryEnvelope = (String, Vec<u8>);

/// Per-class serializer registrations, keyed internally by runtime type and
/// externally by a stable string tag.
#[derive(Default)]
pub struct SerializerRegistry {
    codecs_by_type_id: FxHashMap<TypeId, CodecEntry>,
    type_ids_by_tag: FxHashMap<&'static str, TypeId>,
}

impl SerializerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Registers a query-only serializer.
    ///
    /// Values of this query type are never encoded, but the query itself may
    /// appear in another entry's transient dependencies.
    ///
    /// # Panics
    ///
    /// Panics when the type or the tag was already registered.
    pub fn add_query_serializer<Q>(&mut self, tag: &'static str)
    where
        Q: Query + Serialize + DeserializeOwned,
    {
        self.insert::<Q>(tag, None);
    }

    /// Registers a full serializer: the query codec plus the value codec
    /// needed to give the query its own dump entry.
    ///
    /// # Panics
    ///
    /// Panics when the type or the tag was already registered.
    pub fn add_value_serializer<Q>(&mut self, tag: &'static str)
    where
        Q: Query + Serialize + DeserializeOwned,
        Q::Value: Serialize + DeserializeOwned,
    {
        self.insert::<Q>(tag, Some(ValueCodec {
            encode_text: encode_value_text::<Q>,
            decode_text: decode_value_text::<Q>,
            encode_binary: encode_value_binary::<Q>,
            decode_binary: decode_value_binary::<Q>,
        }));
    }

    fn insert<Q>(&mut self, tag: &'static str, value: Option<ValueCodec>)
    where
        Q: Query + Serialize + DeserializeOwned,
    {
        let entry = CodecEntry {
            query: QueryCodec {
                tag,
                encode_text: encode_query_text::<Q>,
                decode_text: decode_query_text::<Q>,
                encode_binary: encode_query_binary::<Q>,
                decode_binary: decode_query_binary::<Q>,
            },
            value,
        };

        assert!(
            self.type_ids_by_tag.insert(tag, TypeId::of::<Q>()).is_none(),
            "serializer tag `{tag}` registered twice"
        );
        assert!(
            self.codecs_by_type_id.insert(TypeId::of::<Q>(), entry).is_none(),
            "serializer for query type `{}` registered twice",
            std::any::type_name::<Q>()
        );
    }

    fn entry_of(&self, key: &QueryKey) -> Option<&CodecEntry> {
        self.codecs_by_type_id.get(&key.query_type_id())
    }

    fn has_query_codec(&self, key: &QueryKey) -> bool {
        self.entry_of(key).is_some()
    }

    fn has_value_codec(&self, key: &QueryKey) -> bool {
        self.entry_of(key).is_some_and(|entry| entry.value.is_some())
    }

    /// Emits a dump through a caller-supplied encoding lambda pair.
    ///
    /// `encode_query` is only invoked for query classes with a registered
    /// query serializer, `encode_value` only for classes with a registered
    /// value serializer.
    ///
    /// # Errors
    ///
    /// [`DumpError::CyclicDependency`] when the serializable subgraph has no
    /// topological order; codec errors are passed through.
    pub fn dump_with<E>(
        &self,
        graph: &DependencyGraph,
        encode_query: impl Fn(&QueryKey) -> Result<E, CodecError>,
        encode_value: impl Fn(&QueryKey, &dyn DynValue) -> Result<E, CodecError>,
    ) -> Result<Dump<E>, DumpError> {
        // an entry is emitted when it is a serializable success and every
        // dependency's class can at least be named on disk
        let mut emittable: FxHashSet<QueryKey> = FxHashSet::default();

        for (key, node) in graph.nodes() {
            let eligible = node.result().is_success()
                && self.has_value_codec(key)
                && node.dependencies().iter().all(|d| self.has_query_codec(d));

            if eligible {
                emittable.insert(key.clone());
            }
        }

        // Kahn's algorithm over the dependency edges between emittable nodes
        let mut remaining: FxHashMap<QueryKey, usize> = FxHashMap::default();
        let mut ready: VecDeque<QueryKey> = VecDeque::new();

        for key in &emittable {
            let blocking = graph
                .dependencies(key)
                .iter()
                .filter(|d| emittable.contains(*d))
                .count();

            if blocking == 0 {
                ready.push_back(key.clone());
            } else {
                remaining.insert(key.clone(), blocking);
            }
        }

        let mut ordered: Vec<QueryKey> = Vec::with_capacity(emittable.len());
        let mut index_of: FxHashMap<QueryKey, usize> = FxHashMap::default();

        while let Some(key) = ready.pop_front() {
            index_of.insert(key.clone(), ordered.len());
            ordered.push(key.clone());

            for dependent in graph.dependents(&key) {
                if let Some(blocking) = remaining.get_mut(&dependent) {
                    *blocking -= 1;

                    if *blocking == 0 {
                        remaining.remove(&dependent);
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(DumpError::CyclicDependency);
        }

        let mut entries: Vec<Entry<E>> = Vec::with_capacity(ordered.len());
        let mut emitted_validity: Vec<Validity> =
            Vec::with_capacity(ordered.len());

        for key in &ordered {
            let node = graph
                .node(key)
                .expect("ordered keys come from the graph's node map");

            let mut local_deps = BTreeSet::new();
            let mut transient_deps = Vec::new();
            let mut weakened_by_local = false;

            for dependency in node.dependencies().iter() {
                if let Some(&index) = index_of.get(dependency) {
                    local_deps.insert(index);

                    if emitted_validity[index] != Validity::Valid {
                        weakened_by_local = true;
                    }
                } else {
                    transient_deps.push(encode_query(dependency)?);
                }
            }

            // the reader cannot probe a transient dependency at all, and a
            // non-valid local dependency still demands a probe
            let validity = if transient_deps.is_empty() {
                if weakened_by_local {
                    node.validity().max(Validity::WeaklyInvalid)
                } else {
                    node.validity()
                }
            } else {
                Validity::StronglyInvalid
            };

            let value = node
                .result()
                .as_success()
                .expect("only successful nodes are emitted");

            entries.push(Entry {
                query: encode_query(key)?,
                value: encode_value(key, value.as_ref())?,
                validity,
                local_deps,
                transient_deps,
            });
            emitted_validity.push(validity);
        }

        Ok(Dump { entries })
    }

    /// Restores a dump through a caller-supplied decoding lambda pair.
    ///
    /// `decode_query` returns `None` for query classes unknown to this
    /// registry; such entries are skipped, their slot becomes a hole, and
    /// entries referencing the hole are demoted to strongly invalid.
    /// `decode_value` returns `None` when the class has no value serializer,
    /// which skips the entry the same way.
    ///
    /// # Errors
    ///
    /// [`LoadError::ForwardReference`] for malformed dumps; codec errors are
    /// passed through.
    pub fn load_with<E>(
        &self,
        dump: &Dump<E>,
        decode_query: impl Fn(&E) -> Result<Option<QueryKey>, CodecError>,
        decode_value: impl Fn(&QueryKey, &E) -> Result<Option<Arc<dyn DynValue>>, CodecError>,
    ) -> Result<DependencyGraph, LoadError> {
        let mut graph = DependencyGraph::new();
        let mut decoded: Vec<Option<QueryKey>> =
            Vec::with_capacity(dump.entries.len());

        for (index, entry) in dump.entries.iter().enumerate() {
            let Some(key) = decode_query(&entry.query)? else {
                decoded.push(None);
                continue;
            };

            let Some(value) = decode_value(&key, &entry.value)? else {
                decoded.push(None);
                continue;
            };

            let mut validity = entry.validity;
            let mut dependencies: FxHashSet<QueryKey> = FxHashSet::default();

            for &dep_index in &entry.local_deps {
                if dep_index >= index {
                    return Err(LoadError::ForwardReference {
                        entry: index,
                        dependency: dep_index,
                    });
                }

                match &decoded[dep_index] {
                    Some(dependency) => {
                        dependencies.insert(dependency.clone());
                    }
                    // the dependency entry was skipped on this load; nothing
                    // to probe, so the value cannot be trusted
                    None => validity = Validity::StronglyInvalid,
                }
            }

            for transient in &entry.transient_deps {
                match decode_query(transient)? {
                    Some(dependency) => {
                        dependencies.insert(dependency);
                    }
                    None => validity = Validity::StronglyInvalid,
                }
            }

            graph.put_with_validity(
                key.clone(),
                QueryResult::Success(value),
                dependencies,
                validity,
            );
            decoded.push(Some(key));
        }

        Ok(graph)
    }

    /// Dumps with the textual (JSON) encoding.
    pub fn dump_text(
        &self,
        graph: &DependencyGraph,
    ) -> Result<Dump<String>, DumpError> {
        self.dump_with(
            graph,
            |key| self.encode_query_text(key),
            |key, value| self.encode_value_text(key, value),
        )
    }

    /// Loads a textual (JSON) dump.
    pub fn load_text(
        &self,
        dump: &Dump<String>,
    ) -> Result<DependencyGraph, LoadError> {
        self.load_with(
            dump,
            |payload| self.decode_query_text(payload),
            |key, payload| self.decode_value_text(key, payload),
        )
    }

    /// Dumps with the binary (postcard) encoding.
    pub fn dump_binary(
        &self,
        graph: &DependencyGraph,
    ) -> Result<Dump<Vec<u8>>, DumpError> {
        self.dump_with(
            graph,
            |key| self.encode_query_binary(key),
            |key, value| self.encode_value_binary(key, value),
        )
    }

    /// Loads a binary (postcard) dump.
    pub fn load_binary(
        &self,
        dump: &Dump<Vec<u8>>,
    ) -> Result<DependencyGraph, LoadError> {
        self.load_with(
            dump,
            |payload| self.decode_query_binary(payload),
            |key, payload| self.decode_value_binary(key, payload),
        )
    }

    /// Dumps with the hex-textual encoding: the binary encoding, hex-encoded
    /// field by field.
    pub fn dump_hex(
        &self,
        graph: &DependencyGraph,
    ) -> Result<Dump<String>, DumpError> {
        self.dump_with(
            graph,
            |key| self.encode_query_binary(key).map(hex::encode),
            |key, value| {
                self.encode_value_binary(key, value).map(hex::encode)
            },
        )
    }

    /// Loads a hex-textual dump.
    pub fn load_hex(
        &self,
        dump: &Dump<String>,
    ) -> Result<DependencyGraph, LoadError> {
        self.load_with(
            dump,
            |payload| {
                let bytes = hex::decode(payload).map_err(CodecError::from)?;
                self.decode_query_binary(&bytes)
            },
            |key, payload| {
                let bytes = hex::decode(payload).map_err(CodecError::from)?;
                self.decode_value_binary(key, &bytes)
            },
        )
    }

    fn encode_query_text(
        &self,
        key: &QueryKey,
    ) -> Result<String, CodecError> {
        let codec = &self
            .entry_of(key)
            .expect("dump only encodes registered query classes")
            .query;

        let envelope = TextEnvelope {
            tag: codec.tag.to_owned(),
            body: (codec.encode_text)(key)?,
        };

        Ok(serde_json::to_string(&envelope)?)
    }

    fn decode_query_text(
        &self,
        payload: &String,
    ) -> Result<Option<QueryKey>, CodecError> {
        let envelope: TextEnvelope = serde_json::from_str(payload)?;

        let Some(type_id) = self.type_ids_by_tag.get(envelope.tag.as_str())
        else {
            return Ok(None);
        };

        let codec = &self.codecs_by_type_id[type_id].query;

        Ok(Some((codec.decode_text)(envelope.body)?))
    }

    fn encode_value_text(
        &self,
        key: &QueryKey,
        value: &dyn DynValue,
    ) -> Result<String, CodecError> {
        let codec = self
            .entry_of(key)
            .and_then(|entry| entry.value.as_ref())
            .expect("dump only encodes values of registered query classes");

        Ok(serde_json::to_string(&(codec.encode_text)(value)?)?)
    }

    fn decode_value_text(
        &self,
        key: &QueryKey,
        payload: &String,
    ) -> Result<Option<Arc<dyn DynValue>>, CodecError> {
        let Some(codec) =
            self.entry_of(key).and_then(|entry| entry.value.as_ref())
        else {
            return Ok(None);
        };

        let body: serde_json::Value = serde_json::from_str(payload)?;

        Ok(Some((codec.decode_text)(body)?))
    }

    fn encode_query_binary(
        &self,
        key: &QueryKey,
    ) -> Result<Vec<u8>, CodecError> {
        let codec = &self
            .entry_of(key)
            .expect("dump only encodes registered query classes")
            .query;

        let envelope: BinaryEnvelope =
            (codec.tag.to_owned(), (codec.encode_binary)(key)?);

        Ok(postcard::to_allocvec(&envelope)?)
    }

    fn decode_query_binary(
        &self,
        payload: &[u8],
    ) -> Result<Option<QueryKey>, CodecError> {
        let (tag, body): BinaryEnvelope = postcard::from_bytes(payload)?;

        let Some(type_id) = self.type_ids_by_tag.get(tag.as_str()) else {
            return Ok(None);
        };

        let codec = &self.codecs_by_type_id[type_id].query;

        Ok(Some((codec.decode_binary)(&body)?))
    }

    fn encode_value_binary(
        &self,
        key: &QueryKey,
        value: &dyn DynValue,
    ) -> Result<Vec<u8>, CodecError> {
        let codec = self
            .entry_of(key)
            .and_then(|entry| entry.value.as_ref())
            .expect("dump only encodes values of registered query classes");

        (codec.encode_binary)(value)
    }

    fn decode_value_binary(
        &self,
        key: &QueryKey,
        payload: &[u8],
    ) -> Result<Option<Arc<dyn DynValue>>, CodecError> {
        let Some(codec) =
            self.entry_of(key).and_then(|entry| entry.value.as_ref())
        else {
            return Ok(None);
        };

        Ok(Some((codec.decode_binary)(payload)?))
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("registered", &self.type_ids_by_tag.keys())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test;
