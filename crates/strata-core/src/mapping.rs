// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dict-like views over graphs, nodes, and edges at the engine's cursor.
//!
//! Views borrow the engine. A view over `&Engine` reads; a view over
//! `&mut Engine` also writes, one tick per mutation, through the same
//! primitives the engine exposes. Two views are equal when their
//! materialized snapshots are equal.
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::engine::{Engine, EngineError};
use crate::fact_store::FactStore;
use crate::ident::{Btt, EdgeIndex, GraphKind, GraphName, Key, NodeName, Value};
use crate::signal::{Callback, Entity, SubscriptionId};

/// Read side of an attribute view.
pub trait AttrMapping {
    /// Backing store of the engine.
    type Store: FactStore;

    /// Engine being viewed.
    fn engine(&self) -> &Engine<Self::Store>;

    /// Entity whose attributes this view exposes.
    fn entity(&self) -> Entity;

    /// Value of `key` at the cursor.
    fn get(&self, key: &str) -> Result<Value, EngineError> {
        let engine = self.engine();
        engine
            .attr_at(&self.entity(), key, engine.btt())
            .found()
            .cloned()
            .ok_or_else(|| EngineError::KeyNotFound(key.to_owned()))
    }

    /// Whether `key` is set at the cursor.
    fn contains_key(&self, key: &str) -> bool {
        let engine = self.engine();
        engine.attr_at(&self.entity(), key, engine.btt()).found().is_some()
    }

    /// Keys set at the cursor, sorted.
    fn keys(&self) -> Vec<Key> {
        let engine = self.engine();
        engine.attr_keys_at(&self.entity(), engine.btt())
    }

    /// Number of keys set.
    fn len(&self) -> usize {
        self.keys().len()
    }

    /// No keys set.
    fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Materialized copy of every attribute.
    fn snapshot(&self) -> BTreeMap<Key, Value> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).ok().map(|value| (key, value)))
            .collect()
    }
}

/// Write side of an attribute view.
pub trait AttrMappingMut: AttrMapping {
    /// Engine being viewed, mutably.
    fn engine_mut(&mut self) -> &mut Engine<Self::Store>;

    /// Sets `key` at the next tick.
    fn set(&mut self, key: &str, value: Value) -> Result<Btt, EngineError> {
        let entity = self.entity();
        self.engine_mut().set_attr(&entity, key, Some(value))
    }

    /// Deletes `key` at the next tick.
    fn delete(&mut self, key: &str) -> Result<Btt, EngineError> {
        if !self.contains_key(key) {
            return Err(EngineError::KeyNotFound(key.to_owned()));
        }
        let entity = self.entity();
        self.engine_mut().set_attr(&entity, key, None)
    }

    /// Sets every pair, one tick each.
    fn update(&mut self, items: impl IntoIterator<Item = (Key, Value)>) -> Result<(), EngineError> {
        for (key, value) in items {
            self.set(&key, value)?;
        }
        Ok(())
    }

    /// Deletes every key.
    fn clear(&mut self) -> Result<(), EngineError> {
        for key in self.keys() {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// Watches this entity.
    fn subscribe(&mut self, callback: Callback) -> SubscriptionId {
        let entity = self.entity();
        self.engine_mut().subscribe(entity, callback)
    }
}

macro_rules! attr_view {
    ($view:ident, |$this:ident| $entity:expr) => {
        impl<S: FactStore, E: Deref<Target = Engine<S>>> AttrMapping for $view<E> {
            type Store = S;

            fn engine(&self) -> &Engine<S> {
                &self.engine
            }

            fn entity(&self) -> Entity {
                let $this = self;
                $entity
            }
        }

        impl<S: FactStore, E: DerefMut<Target = Engine<S>>> AttrMappingMut for $view<E> {
            fn engine_mut(&mut self) -> &mut Engine<S> {
                &mut self.engine
            }
        }

        impl<S: FactStore, E: Deref<Target = Engine<S>>> PartialEq for $view<E> {
            fn eq(&self, other: &Self) -> bool {
                self.snapshot() == other.snapshot()
            }
        }
    };
}

/// Graph attributes, plus entry points to its nodes and edges.
#[derive(Debug)]
pub struct GraphMapping<E> {
    engine: E,
    graph: GraphName,
}

/// Node attributes.
#[derive(Debug)]
pub struct NodeMapping<E> {
    engine: E,
    graph: GraphName,
    node: NodeName,
}

/// Edge attributes.
#[derive(Debug)]
pub struct EdgeMapping<E> {
    engine: E,
    graph: GraphName,
    orig: NodeName,
    dest: NodeName,
    idx: EdgeIndex,
}

attr_view!(GraphMapping, |v| Entity::Graph(v.graph.clone()));
attr_view!(NodeMapping, |v| Entity::Node(v.graph.clone(), v.node.clone()));
attr_view!(EdgeMapping, |v| Entity::Edge(
    v.graph.clone(),
    v.orig.clone(),
    v.dest.clone(),
    v.idx
));

impl<S: FactStore, E: Deref<Target = Engine<S>>> NodeMapping<E> {
    /// Node name.
    pub fn name(&self) -> &str {
        &self.node
    }
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> EdgeMapping<E> {
    /// `(orig, dest, idx)`.
    pub fn endpoints(&self) -> (&str, &str, EdgeIndex) {
        (&self.orig, &self.dest, self.idx)
    }
}

fn node_view<S: FactStore, E: Deref<Target = Engine<S>>>(
    engine: E,
    graph: &str,
    node: &str,
) -> Result<NodeMapping<E>, EngineError> {
    if !engine.node_exists_at(graph, node, engine.btt()) {
        return Err(EngineError::NoSuchNode {
            graph: graph.to_owned(),
            node: node.to_owned(),
        });
    }
    Ok(NodeMapping {
        engine,
        graph: graph.to_owned(),
        node: node.to_owned(),
    })
}

fn edge_view<S: FactStore, E: Deref<Target = Engine<S>>>(
    engine: E,
    graph: &str,
    orig: &str,
    dest: &str,
    idx: EdgeIndex,
) -> Result<EdgeMapping<E>, EngineError> {
    if !engine.edge_exists_at(graph, orig, dest, idx, engine.btt()) {
        return Err(EngineError::NoSuchEdge {
            graph: graph.to_owned(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
            idx,
        });
    }
    Ok(EdgeMapping {
        engine,
        graph: graph.to_owned(),
        orig: orig.to_owned(),
        dest: dest.to_owned(),
        idx,
    })
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> GraphMapping<E> {
    /// Graph name.
    pub fn name(&self) -> &str {
        &self.graph
    }

    /// Graph flavour.
    pub fn kind(&self) -> Result<GraphKind, EngineError> {
        self.engine.graph_kind(&self.graph)
    }

    /// Node set.
    pub fn nodes(&self) -> GraphNodes<&Engine<S>> {
        GraphNodes {
            engine: &self.engine,
            graph: self.graph.clone(),
        }
    }

    /// One node; fails when it does not exist at the cursor.
    pub fn node(&self, node: &str) -> Result<NodeMapping<&Engine<S>>, EngineError> {
        node_view(&*self.engine, &self.graph, node)
    }

    /// Edge `orig → dest` at index 0.
    pub fn edge(&self, orig: &str, dest: &str) -> Result<EdgeMapping<&Engine<S>>, EngineError> {
        edge_view(&*self.engine, &self.graph, orig, dest, 0)
    }

    /// Edge `orig → dest` at `idx`.
    pub fn edge_at(&self, orig: &str, dest: &str, idx: EdgeIndex) -> Result<EdgeMapping<&Engine<S>>, EngineError> {
        edge_view(&*self.engine, &self.graph, orig, dest, idx)
    }

    /// Outgoing adjacency of `orig`.
    pub fn successors(&self, orig: &str) -> Successors<&Engine<S>> {
        Successors {
            engine: &self.engine,
            graph: self.graph.clone(),
            orig: orig.to_owned(),
        }
    }

    /// Incoming adjacency of `dest`.
    pub fn predecessors(&self, dest: &str) -> Predecessors<&Engine<S>> {
        Predecessors {
            engine: &self.engine,
            graph: self.graph.clone(),
            dest: dest.to_owned(),
        }
    }

    /// Parallel edges between one pair.
    pub fn multi_edges(&self, orig: &str, dest: &str) -> MultiEdges<&Engine<S>> {
        MultiEdges {
            engine: &self.engine,
            graph: self.graph.clone(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
        }
    }
}

impl<S: FactStore, E: DerefMut<Target = Engine<S>>> GraphMapping<E> {
    /// Mutable node set.
    pub fn nodes_mut(&mut self) -> GraphNodes<&mut Engine<S>> {
        GraphNodes {
            engine: &mut self.engine,
            graph: self.graph.clone(),
        }
    }

    /// One node, mutably.
    pub fn node_mut(&mut self, node: &str) -> Result<NodeMapping<&mut Engine<S>>, EngineError> {
        node_view(&mut *self.engine, &self.graph, node)
    }

    /// Edge at `idx`, mutably.
    pub fn edge_mut(
        &mut self,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
    ) -> Result<EdgeMapping<&mut Engine<S>>, EngineError> {
        edge_view(&mut *self.engine, &self.graph, orig, dest, idx)
    }

    /// Outgoing adjacency, mutably.
    pub fn successors_mut(&mut self, orig: &str) -> Successors<&mut Engine<S>> {
        Successors {
            engine: &mut self.engine,
            graph: self.graph.clone(),
            orig: orig.to_owned(),
        }
    }

    /// Incoming adjacency, mutably.
    pub fn predecessors_mut(&mut self, dest: &str) -> Predecessors<&mut Engine<S>> {
        Predecessors {
            engine: &mut self.engine,
            graph: self.graph.clone(),
            dest: dest.to_owned(),
        }
    }

    /// Parallel edges, mutably.
    pub fn multi_edges_mut(&mut self, orig: &str, dest: &str) -> MultiEdges<&mut Engine<S>> {
        MultiEdges {
            engine: &mut self.engine,
            graph: self.graph.clone(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
        }
    }
}

/// Nodes of one graph at the cursor.
#[derive(Debug)]
pub struct GraphNodes<E> {
    engine: E,
    graph: GraphName,
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> GraphNodes<E> {
    /// Whether `node` exists.
    pub fn contains(&self, node: &str) -> bool {
        self.engine.node_exists_at(&self.graph, node, self.engine.btt())
    }

    /// Node names, sorted.
    pub fn iter(&self) -> impl Iterator<Item = NodeName> {
        self.engine.nodes_at(&self.graph, self.engine.btt()).into_iter()
    }

    /// Node count.
    pub fn len(&self) -> usize {
        self.engine.nodes_at(&self.graph, self.engine.btt()).len()
    }

    /// No nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: FactStore, E: DerefMut<Target = Engine<S>>> GraphNodes<E> {
    /// Creates `node`; no-op when present.
    pub fn add(&mut self, node: &str) -> Result<Btt, EngineError> {
        self.engine.add_node(&self.graph, node)
    }

    /// Deletes `node` with its attributes and edges.
    pub fn remove(&mut self, node: &str) -> Result<Btt, EngineError> {
        self.engine.del_node(&self.graph, node)
    }
}

fn drop_pair<S: FactStore>(engine: &mut Engine<S>, graph: &str, orig: &str, dest: &str) -> Result<Btt, EngineError> {
    let indices = engine.edge_indices_at(graph, orig, dest, engine.btt());
    let mut last = None;
    for idx in indices {
        last = Some(engine.del_edge(graph, orig, dest, idx)?);
    }
    last.ok_or_else(|| EngineError::NoSuchEdge {
        graph: graph.to_owned(),
        orig: orig.to_owned(),
        dest: dest.to_owned(),
        idx: 0,
    })
}

/// Successors of one node.
#[derive(Debug)]
pub struct Successors<E> {
    engine: E,
    graph: GraphName,
    orig: NodeName,
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> Successors<E> {
    /// Whether any edge `orig → dest` exists.
    pub fn contains(&self, dest: &str) -> bool {
        self.engine.has_edge_at(&self.graph, &self.orig, dest, self.engine.btt())
    }

    /// Destinations, sorted.
    pub fn iter(&self) -> impl Iterator<Item = NodeName> {
        self.engine.successors_at(&self.graph, &self.orig, self.engine.btt()).into_iter()
    }

    /// Destination count.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No successors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edge to `dest` at index 0.
    pub fn edge(&self, dest: &str) -> Result<EdgeMapping<&Engine<S>>, EngineError> {
        edge_view(&*self.engine, &self.graph, &self.orig, dest, 0)
    }
}

impl<S: FactStore, E: DerefMut<Target = Engine<S>>> Successors<E> {
    /// Adds `orig → dest` at index 0.
    pub fn add(&mut self, dest: &str) -> Result<Btt, EngineError> {
        self.engine.add_edge(&self.graph, &self.orig, dest, 0)
    }

    /// Removes every edge `orig → dest`.
    pub fn remove(&mut self, dest: &str) -> Result<Btt, EngineError> {
        drop_pair(&mut *self.engine, &self.graph, &self.orig, dest)
    }
}

/// Predecessors of one node.
#[derive(Debug)]
pub struct Predecessors<E> {
    engine: E,
    graph: GraphName,
    dest: NodeName,
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> Predecessors<E> {
    /// Whether any edge `orig → dest` exists.
    pub fn contains(&self, orig: &str) -> bool {
        self.engine.has_edge_at(&self.graph, orig, &self.dest, self.engine.btt())
    }

    /// Origins, sorted.
    pub fn iter(&self) -> impl Iterator<Item = NodeName> {
        self.engine.predecessors_at(&self.graph, &self.dest, self.engine.btt()).into_iter()
    }

    /// Origin count.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No predecessors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: FactStore, E: DerefMut<Target = Engine<S>>> Predecessors<E> {
    /// Adds `orig → dest` at index 0.
    pub fn add(&mut self, orig: &str) -> Result<Btt, EngineError> {
        self.engine.add_edge(&self.graph, orig, &self.dest, 0)
    }

    /// Removes every edge `orig → dest`.
    pub fn remove(&mut self, orig: &str) -> Result<Btt, EngineError> {
        drop_pair(&mut *self.engine, &self.graph, orig, &self.dest)
    }
}

/// Parallel edges between one ordered pair.
#[derive(Debug)]
pub struct MultiEdges<E> {
    engine: E,
    graph: GraphName,
    orig: NodeName,
    dest: NodeName,
}

impl<S: FactStore, E: Deref<Target = Engine<S>>> MultiEdges<E> {
    /// Live indices, ascending.
    pub fn iter(&self) -> impl Iterator<Item = EdgeIndex> {
        self.engine
            .edge_indices_at(&self.graph, &self.orig, &self.dest, self.engine.btt())
            .into_iter()
    }

    /// Whether `idx` is live.
    pub fn contains(&self, idx: EdgeIndex) -> bool {
        self.engine
            .edge_exists_at(&self.graph, &self.orig, &self.dest, idx, self.engine.btt())
    }

    /// Live edge count.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No live edges.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One parallel edge.
    pub fn edge(&self, idx: EdgeIndex) -> Result<EdgeMapping<&Engine<S>>, EngineError> {
        edge_view(&*self.engine, &self.graph, &self.orig, &self.dest, idx)
    }
}

impl<S: FactStore, E: DerefMut<Target = Engine<S>>> MultiEdges<E> {
    /// Adds a parallel edge under a fresh index.
    pub fn add(&mut self) -> Result<EdgeIndex, EngineError> {
        let (idx, _) = self.engine.new_edge(&self.graph, &self.orig, &self.dest)?;
        Ok(idx)
    }

    /// Removes the edge at `idx`.
    pub fn remove(&mut self, idx: EdgeIndex) -> Result<Btt, EngineError> {
        self.engine.del_edge(&self.graph, &self.orig, &self.dest, idx)
    }
}

impl<S: FactStore> Engine<S> {
    /// Read view of `graph`.
    pub fn graph(&self, graph: &str) -> Result<GraphMapping<&Self>, EngineError> {
        self.graph_kind(graph)?;
        Ok(GraphMapping {
            engine: self,
            graph: graph.to_owned(),
        })
    }

    /// Read-write view of `graph`.
    pub fn graph_mut(&mut self, graph: &str) -> Result<GraphMapping<&mut Self>, EngineError> {
        self.graph_kind(graph)?;
        Ok(GraphMapping {
            engine: self,
            graph: graph.to_owned(),
        })
    }
}
