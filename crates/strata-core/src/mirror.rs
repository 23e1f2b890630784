// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Materialized shadow of one coordinate.
//!
//! A [`Mirror`] owns plain maps, never a reference into the engine. It moves
//! forward only by applying deltas that start exactly where it stands, and it
//! notifies its own subscribers about facts that actually changed. Optimistic
//! setters let a caller reflect fire-and-forget writes before the next pull.
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::{AttrDelta, CodecError, Delta, GraphDelta};
use crate::engine::{Engine, EngineError};
use crate::fact_store::FactStore;
use crate::history::HistoryError;
use crate::ident::{Btt, EdgeIndex, GraphKind, GraphName, Key, NodeName, RuleName, RulebookName, Value};
use crate::signal::{Callback, Change, ChangeEvent, Entity, SubscriptionId, Subscribers};

/// Attributes of one entity.
pub type Attrs = BTreeMap<Key, Value>;

/// Everything known about one graph at a coordinate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    /// Graph flavour.
    pub kind: GraphKind,
    /// Graph attributes.
    pub graph_val: Attrs,
    /// Live nodes and their attributes.
    pub nodes: BTreeMap<NodeName, Attrs>,
    /// Live edges, `orig → dest → idx → attributes`.
    pub edges: BTreeMap<NodeName, BTreeMap<NodeName, BTreeMap<EdgeIndex, Attrs>>>,
    /// Avatars of this graph, `graph → nodes`.
    pub avatars: BTreeMap<GraphName, BTreeSet<NodeName>>,
    /// Assigned rulebook.
    pub rulebook: Option<RulebookName>,
}

impl GraphState {
    fn edge_mut(&mut self, orig: &str, dest: &str, idx: EdgeIndex) -> Option<&mut Attrs> {
        self.edges.get_mut(orig)?.get_mut(dest)?.get_mut(&idx)
    }

    fn remove_edge(&mut self, orig: &str, dest: &str, idx: EdgeIndex) -> bool {
        let Some(by_dest) = self.edges.get_mut(orig) else {
            return false;
        };
        let Some(by_idx) = by_dest.get_mut(dest) else {
            return false;
        };
        let removed = by_idx.remove(&idx).is_some();
        if by_idx.is_empty() {
            by_dest.remove(dest);
        }
        if by_dest.is_empty() {
            self.edges.remove(orig);
        }
        removed
    }

    fn incident(&self, node: &str) -> Vec<(NodeName, NodeName, EdgeIndex)> {
        let mut out = Vec::new();
        for (orig, by_dest) in &self.edges {
            for (dest, by_idx) in by_dest {
                if orig == node || dest == node {
                    out.extend(by_idx.keys().map(|idx| (orig.clone(), dest.clone(), *idx)));
                }
            }
        }
        out
    }
}

/// Every graph and rulebook at a coordinate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorState {
    /// Graphs by name.
    pub graphs: BTreeMap<GraphName, GraphState>,
    /// Rulebook contents.
    pub rulebooks: BTreeMap<RulebookName, Vec<RuleName>>,
}

fn attrs_of<S: FactStore>(engine: &Engine<S>, entity: &Entity, at: &Btt) -> Attrs {
    engine
        .attr_keys_at(entity, at)
        .into_iter()
        .filter_map(|key| {
            let value = engine.attr_at(entity, &key, at).found().cloned();
            value.map(|v| (key, v))
        })
        .collect()
}

impl MirrorState {
    /// Reads the full state of `engine` at `at`.
    pub fn read<S: FactStore>(engine: &Engine<S>, at: &Btt) -> Self {
        let mut state = Self::default();
        for name in engine.rulebook_names_at(at) {
            if let Some(rules) = engine.rulebook_at(&name, at) {
                state.rulebooks.insert(name, rules);
            }
        }
        for (name, kind) in engine.graphs() {
            let mut graph = GraphState {
                kind,
                graph_val: attrs_of(engine, &Entity::Graph(name.clone()), at),
                rulebook: engine.character_rulebook_at(name, at),
                ..GraphState::default()
            };
            for node in engine.nodes_at(name, at) {
                for dest in engine.successors_at(name, &node, at) {
                    for idx in engine.edge_indices_at(name, &node, &dest, at) {
                        let entity = Entity::Edge(name.clone(), node.clone(), dest.clone(), idx);
                        graph
                            .edges
                            .entry(node.clone())
                            .or_default()
                            .entry(dest.clone())
                            .or_default()
                            .insert(idx, attrs_of(engine, &entity, at));
                    }
                }
                let attrs = attrs_of(engine, &Entity::Node(name.clone(), node.clone()), at);
                graph.nodes.insert(node, attrs);
            }
            for other in engine.avatar_graphs_at(name, at) {
                let nodes: BTreeSet<NodeName> = engine.avatars_at(name, &other, at).into_iter().collect();
                if !nodes.is_empty() {
                    graph.avatars.insert(other, nodes);
                }
            }
            state.graphs.insert(name.clone(), graph);
        }
        state
    }

    /// blake3 over the canonical CBOR encoding.
    pub fn digest(&self) -> Result<blake3::Hash, CodecError> {
        let mut hasher = blake3::Hasher::new();
        ciborium::ser::into_writer(self, &mut hasher).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(hasher.finalize())
    }
}

/// Mirror failures.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The delta does not start where the mirror stands.
    #[error("delta starts at {delta}, mirror is at {mirror}")]
    Stale {
        /// Mirror coordinate.
        mirror: Btt,
        /// Delta origin.
        delta: Btt,
    },
    /// Graph unknown to the mirror.
    #[error("no such graph: {0}")]
    NoSuchGraph(GraphName),
    /// Node unknown to the mirror.
    #[error("no such node: {graph}.{node}")]
    NoSuchNode {
        /// Graph.
        graph: GraphName,
        /// Node.
        node: NodeName,
    },
    /// Edge unknown to the mirror.
    #[error("no such edge: {graph}.{orig}->{dest}[{idx}]")]
    NoSuchEdge {
        /// Graph.
        graph: GraphName,
        /// Origin.
        orig: NodeName,
        /// Destination.
        dest: NodeName,
        /// Index.
        idx: EdgeIndex,
    },
    /// `null` was offered as a value.
    #[error("null is not a storable value")]
    NullValue,
    /// State could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

type Events = Vec<(Entity, Change)>;

fn put_attr(attrs: &mut Attrs, key: &Key, value: Option<&Value>) -> bool {
    match value {
        Some(v) => attrs.insert(key.clone(), v.clone()).as_ref() != Some(v),
        None => attrs.remove(key).is_some(),
    }
}

fn apply_attrs(attrs: &mut Attrs, delta: &AttrDelta, entity: &Entity, events: &mut Events) {
    for (key, value) in delta {
        if put_attr(attrs, key, value.as_ref()) {
            events.push((
                entity.clone(),
                Change::Attr {
                    key: key.clone(),
                    value: value.clone(),
                },
            ));
        }
    }
}

fn flip_edge(
    g: &mut GraphState,
    name: &GraphName,
    orig: &NodeName,
    dest: &NodeName,
    idx: EdgeIndex,
    exists: bool,
    events: &mut Events,
) {
    let changed = if exists {
        let slot = g.edges.entry(orig.clone()).or_default().entry(dest.clone()).or_default();
        match slot.entry(idx) {
            Entry::Vacant(v) => {
                v.insert(Attrs::new());
                true
            }
            Entry::Occupied(_) => false,
        }
    } else {
        g.remove_edge(orig, dest, idx)
    };
    if changed {
        let entity = Entity::Edge(name.clone(), orig.clone(), dest.clone(), idx);
        events.push((entity, Change::Exists(exists)));
    }
}

fn apply_graph(name: &GraphName, g: &mut GraphState, d: &GraphDelta, events: &mut Events) {
    for (node, _) in d.nodes.iter().filter(|(_, e)| **e) {
        if !g.nodes.contains_key(node) {
            g.nodes.insert(node.clone(), Attrs::new());
            events.push((Entity::Node(name.clone(), node.clone()), Change::Exists(true)));
        }
    }
    let multi = g.kind.is_multigraph() || !d.multiedges.is_empty();
    for (orig, by_dest) in &d.multiedges {
        for (dest, by_idx) in by_dest {
            for (idx, exists) in by_idx {
                flip_edge(g, name, orig, dest, *idx, *exists, events);
            }
        }
    }
    for (orig, by_dest) in &d.edges {
        for (dest, exists) in by_dest {
            if !multi {
                flip_edge(g, name, orig, dest, 0, *exists, events);
            } else if !exists {
                let live: Vec<EdgeIndex> = g
                    .edges
                    .get(orig)
                    .and_then(|m| m.get(dest))
                    .map(|m| m.keys().copied().collect())
                    .unwrap_or_default();
                for idx in live {
                    flip_edge(g, name, orig, dest, idx, false, events);
                }
            }
        }
    }
    for (node, _) in d.nodes.iter().filter(|(_, e)| !**e) {
        for (orig, dest, idx) in g.incident(node) {
            flip_edge(g, name, &orig, &dest, idx, false, events);
        }
        if g.nodes.remove(node).is_some() {
            events.push((Entity::Node(name.clone(), node.clone()), Change::Exists(false)));
        }
    }
    for (node, attrs) in &d.node_val {
        if let Some(cur) = g.nodes.get_mut(node) {
            apply_attrs(cur, attrs, &Entity::Node(name.clone(), node.clone()), events);
        }
    }
    let indexed = d
        .edge_val
        .iter()
        .flat_map(|(o, m)| m.iter().map(move |(dst, a)| (o, dst, 0, a)))
        .chain(d.multiedge_val.iter().flat_map(|(o, m)| {
            m.iter()
                .flat_map(move |(dst, by_idx)| by_idx.iter().map(move |(i, a)| (o, dst, *i, a)))
        }));
    for (orig, dest, idx, attrs) in indexed {
        if let Some(cur) = g.edge_mut(orig, dest, idx) {
            let entity = Entity::Edge(name.clone(), orig.clone(), dest.clone(), idx);
            apply_attrs(cur, attrs, &entity, events);
        }
    }
    apply_attrs(&mut g.graph_val, &d.graph_val, &Entity::Graph(name.clone()), events);
    for (graph, nodes) in &d.avatars {
        for (node, is_avatar) in nodes {
            let set = g.avatars.entry(graph.clone()).or_default();
            let changed = if *is_avatar {
                set.insert(node.clone())
            } else {
                set.remove(node)
            };
            if set.is_empty() {
                g.avatars.remove(graph);
            }
            if changed {
                events.push((
                    Entity::Graph(name.clone()),
                    Change::Avatar {
                        graph: graph.clone(),
                        node: node.clone(),
                        is_avatar: *is_avatar,
                    },
                ));
            }
        }
    }
    if let Some(rulebook) = &d.character_rulebook {
        if g.rulebook != *rulebook {
            g.rulebook.clone_from(rulebook);
            events.push((Entity::Graph(name.clone()), Change::Rulebook(rulebook.clone())));
        }
    }
}

/// Shadow copy of the engine at one coordinate.
#[derive(Debug)]
pub struct Mirror {
    btt: Btt,
    state: MirrorState,
    subscribers: Subscribers,
}

impl Mirror {
    /// Wraps an existing state.
    pub fn new(btt: Btt, state: MirrorState) -> Self {
        Self {
            btt,
            state,
            subscribers: Subscribers::default(),
        }
    }

    /// Reads `engine` at `btt`.
    pub fn capture<S: FactStore>(engine: &Engine<S>, btt: &Btt) -> Result<Self, EngineError> {
        if !engine.tree().contains(&btt.branch) {
            return Err(HistoryError::UnknownBranch(btt.branch.clone()).into());
        }
        Ok(Self::new(btt.clone(), MirrorState::read(engine, btt)))
    }

    /// Coordinate the mirror reflects.
    pub fn btt(&self) -> &Btt {
        &self.btt
    }

    /// Materialized state.
    pub fn state(&self) -> &MirrorState {
        &self.state
    }

    /// One graph.
    pub fn graph(&self, name: &str) -> Option<&GraphState> {
        self.state.graphs.get(name)
    }

    /// A node attribute.
    pub fn node_val(&self, graph: &str, node: &str, key: &str) -> Option<&Value> {
        self.graph(graph)?.nodes.get(node)?.get(key)
    }

    /// blake3 digest of the state.
    pub fn digest(&self) -> Result<blake3::Hash, MirrorError> {
        Ok(self.state.digest()?)
    }

    /// Watches one entity.
    pub fn subscribe(&mut self, entity: Entity, callback: Callback) -> SubscriptionId {
        self.subscribers.subscribe(entity, callback)
    }

    /// Watches everything.
    pub fn subscribe_all(&mut self, callback: Callback) -> SubscriptionId {
        self.subscribers.subscribe_all(callback)
    }

    /// Drops a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn emit(&mut self, events: Events) {
        for (entity, change) in events {
            self.subscribers.notify(&ChangeEvent {
                btt: self.btt.clone(),
                entity,
                change,
            });
        }
    }

    /// Applies a delta that starts at the mirror's coordinate, then moves to
    /// its end coordinate.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<(), MirrorError> {
        if delta.from != self.btt {
            return Err(MirrorError::Stale {
                mirror: self.btt.clone(),
                delta: delta.from.clone(),
            });
        }
        for (rulebook, rules) in &delta.rulebooks {
            match rules {
                Some(rules) => {
                    self.state.rulebooks.insert(rulebook.clone(), rules.clone());
                }
                None => {
                    self.state.rulebooks.remove(rulebook);
                }
            }
        }
        let mut events = Events::new();
        for (name, graph_delta) in &delta.graphs {
            let graph = self.state.graphs.entry(name.clone()).or_default();
            apply_graph(name, graph, graph_delta, &mut events);
        }
        self.btt = delta.to.clone();
        self.emit(events);
        Ok(())
    }

    fn graph_mut(&mut self, graph: &str) -> Result<&mut GraphState, MirrorError> {
        self.state
            .graphs
            .get_mut(graph)
            .ok_or_else(|| MirrorError::NoSuchGraph(graph.to_owned()))
    }

    /// Registers a graph locally.
    pub fn add_graph(&mut self, name: &str, kind: GraphKind) {
        self.state
            .graphs
            .entry(name.to_owned())
            .or_insert_with(|| GraphState {
                kind,
                ..GraphState::default()
            });
    }

    /// Optimistic node creation.
    pub fn add_node(&mut self, graph: &str, node: &str) -> Result<(), MirrorError> {
        let g = self.graph_mut(graph)?;
        if g.nodes.contains_key(node) {
            return Ok(());
        }
        g.nodes.insert(node.to_owned(), Attrs::new());
        self.emit(vec![(
            Entity::Node(graph.to_owned(), node.to_owned()),
            Change::Exists(true),
        )]);
        Ok(())
    }

    /// Optimistic node removal, with its incident edges.
    pub fn del_node(&mut self, graph: &str, node: &str) -> Result<(), MirrorError> {
        let name = graph.to_owned();
        let g = self.graph_mut(graph)?;
        if !g.nodes.contains_key(node) {
            return Err(MirrorError::NoSuchNode {
                graph: name,
                node: node.to_owned(),
            });
        }
        let mut events = Events::new();
        for (orig, dest, idx) in g.incident(node) {
            flip_edge(g, &name, &orig, &dest, idx, false, &mut events);
        }
        g.nodes.remove(node);
        events.push((Entity::Node(name, node.to_owned()), Change::Exists(false)));
        self.emit(events);
        Ok(())
    }

    /// Optimistic edge creation.
    pub fn add_edge(&mut self, graph: &str, orig: &str, dest: &str, idx: EdgeIndex) -> Result<(), MirrorError> {
        let name = graph.to_owned();
        let g = self.graph_mut(graph)?;
        for node in [orig, dest] {
            if !g.nodes.contains_key(node) {
                return Err(MirrorError::NoSuchNode {
                    graph: name,
                    node: node.to_owned(),
                });
            }
        }
        let mut events = Events::new();
        if g.edge_mut(orig, dest, idx).is_none() {
            flip_edge(g, &name, &orig.to_owned(), &dest.to_owned(), idx, true, &mut events);
        }
        self.emit(events);
        Ok(())
    }

    /// Optimistic edge removal.
    pub fn del_edge(&mut self, graph: &str, orig: &str, dest: &str, idx: EdgeIndex) -> Result<(), MirrorError> {
        let name = graph.to_owned();
        let g = self.graph_mut(graph)?;
        let mut events = Events::new();
        flip_edge(g, &name, &orig.to_owned(), &dest.to_owned(), idx, false, &mut events);
        if events.is_empty() {
            return Err(MirrorError::NoSuchEdge {
                graph: name,
                orig: orig.to_owned(),
                dest: dest.to_owned(),
                idx,
            });
        }
        self.emit(events);
        Ok(())
    }

    /// Optimistic attribute write on any entity; `None` deletes.
    pub fn set_attr(&mut self, entity: &Entity, key: &str, value: Option<Value>) -> Result<(), MirrorError> {
        if value.as_ref().is_some_and(Value::is_null) {
            return Err(MirrorError::NullValue);
        }
        let attrs = match entity {
            Entity::Graph(g) => &mut self.graph_mut(g)?.graph_val,
            Entity::Node(g, n) => {
                let missing = || MirrorError::NoSuchNode {
                    graph: g.clone(),
                    node: n.clone(),
                };
                self.graph_mut(g)?.nodes.get_mut(n).ok_or_else(missing)?
            }
            Entity::Edge(g, o, d, idx) => {
                let missing = || MirrorError::NoSuchEdge {
                    graph: g.clone(),
                    orig: o.clone(),
                    dest: d.clone(),
                    idx: *idx,
                };
                self.graph_mut(g)?.edge_mut(o, d, *idx).ok_or_else(missing)?
            }
        };
        let key = key.to_owned();
        if put_attr(attrs, &key, value.as_ref()) {
            self.emit(vec![(entity.clone(), Change::Attr { key, value })]);
        }
        Ok(())
    }

    /// Optimistic node attribute write.
    pub fn set_node_val(&mut self, graph: &str, node: &str, key: &str, value: Option<Value>) -> Result<(), MirrorError> {
        self.set_attr(&Entity::Node(graph.to_owned(), node.to_owned()), key, value)
    }

    /// Optimistic graph attribute write.
    pub fn set_graph_val(&mut self, graph: &str, key: &str, value: Option<Value>) -> Result<(), MirrorError> {
        self.set_attr(&Entity::Graph(graph.to_owned()), key, value)
    }

    /// Optimistic edge attribute write.
    pub fn set_edge_val(
        &mut self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), MirrorError> {
        self.set_attr(
            &Entity::Edge(graph.to_owned(), orig.to_owned(), dest.to_owned(), idx),
            key,
            value,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::fact_store::MemoryFactStore;

    fn engine() -> Engine {
        let mut e = Engine::new(MemoryFactStore::new(), EngineConfig::default());
        e.new_graph("g", GraphKind::DiGraph).unwrap();
        e.add_node("g", "n").unwrap();
        e
    }

    #[test]
    fn stale_delta_is_refused() {
        let mut e = engine();
        let mut m = Mirror::capture(&e, e.btt()).unwrap();
        let start = e.btt().clone();
        e.set_node_val("g", "n", "hp", Some(json!(1))).unwrap();
        let mid = e.btt().clone();
        e.set_node_val("g", "n", "hp", Some(json!(2))).unwrap();
        let late = e.diff(&mid, e.btt()).unwrap();
        assert!(matches!(m.apply_delta(&late), Err(MirrorError::Stale { .. })));
        m.apply_delta(&e.diff(&start, e.btt()).unwrap()).unwrap();
        assert_eq!(m.node_val("g", "n", "hp"), Some(&json!(2)));
        assert_eq!(m.btt(), e.btt());
    }

    #[test]
    fn optimistic_write_is_not_renotified_by_the_delta() {
        let mut e = engine();
        let mut m = Mirror::capture(&e, e.btt()).unwrap();
        let seen = Arc::new(Mutex::new(0_u32));
        let sink = Arc::clone(&seen);
        m.subscribe_all(Box::new(move |_| *sink.lock().unwrap() += 1));
        m.set_node_val("g", "n", "hp", Some(json!(5))).unwrap();
        let from = m.btt().clone();
        e.set_node_val("g", "n", "hp", Some(json!(5))).unwrap();
        m.apply_delta(&e.diff(&from, e.btt()).unwrap()).unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(m.digest().unwrap(), MirrorState::read(&e, e.btt()).digest().unwrap());
    }

    #[test]
    fn optimistic_writes_validate_targets() {
        let e = engine();
        let mut m = Mirror::capture(&e, e.btt()).unwrap();
        assert!(matches!(
            m.set_node_val("g", "ghost", "hp", Some(json!(1))),
            Err(MirrorError::NoSuchNode { .. })
        ));
        assert!(matches!(
            m.set_graph_val("g", "k", Some(Value::Null)),
            Err(MirrorError::NullValue)
        ));
        assert!(matches!(m.del_edge("g", "n", "n", 0), Err(MirrorError::NoSuchEdge { .. })));
    }
}
