// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Minimal change sets between two coordinates.
//!
//! A [`Delta`] lists only facts that differ between `from` and `to`. The
//! candidates come from the caches' settings indices along the path
//! `from → lca → to`, so computing one costs time proportional to what was
//! recorded on that path, not to the size of the world.
//!
//! Shape rules:
//!
//! - An existence flip appears only in `nodes` / `edges` / `multiedges`.
//! - Attributes of entities absent at `to` are omitted.
//! - An entity that comes into existence lists all of its attributes.
//! - `None` always means "no longer present".
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::engine::{Engine, EngineError};
use crate::fact_store::FactStore;
use crate::history::HistoryError;
use crate::ident::{Btt, EdgeIndex, GraphName, Key, NodeName, RuleName, RulebookName, Value};
use crate::signal::Entity;

/// Attribute changes: `None` means deleted.
pub type AttrDelta = BTreeMap<Key, Option<Value>>;

/// CBOR failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("encode: {0}")]
    Encode(String),
    /// Decoding failed.
    #[error("decode: {0}")]
    Decode(String),
}

fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Changes to one graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    /// Node existence flips.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<NodeName, bool>,
    /// Pair-level edge existence flips, `orig → dest`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edges: BTreeMap<NodeName, BTreeMap<NodeName, bool>>,
    /// Node attribute changes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_val: BTreeMap<NodeName, AttrDelta>,
    /// Attribute changes of edge index 0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edge_val: BTreeMap<NodeName, BTreeMap<NodeName, AttrDelta>>,
    /// Per-index existence flips; multigraphs only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub multiedges: BTreeMap<NodeName, BTreeMap<NodeName, BTreeMap<EdgeIndex, bool>>>,
    /// Attribute changes of edge indices above 0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub multiedge_val: BTreeMap<NodeName, BTreeMap<NodeName, BTreeMap<EdgeIndex, AttrDelta>>>,
    /// Graph attribute changes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graph_val: AttrDelta,
    /// Avatar flips of this character, `graph → node`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub avatars: BTreeMap<GraphName, BTreeMap<NodeName, bool>>,
    /// New rulebook assignment; `Some(None)` clears it.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub character_rulebook: Option<Option<RulebookName>>,
}

impl GraphDelta {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.edges.is_empty()
            && self.node_val.is_empty()
            && self.edge_val.is_empty()
            && self.multiedges.is_empty()
            && self.multiedge_val.is_empty()
            && self.graph_val.is_empty()
            && self.avatars.is_empty()
            && self.character_rulebook.is_none()
    }

    /// Attribute changes of one edge, routed by index.
    pub fn edge_attrs(&mut self, orig: NodeName, dest: NodeName, idx: EdgeIndex) -> &mut AttrDelta {
        if idx == 0 {
            self.edge_val.entry(orig).or_default().entry(dest).or_default()
        } else {
            self.multiedge_val
                .entry(orig)
                .or_default()
                .entry(dest)
                .or_default()
                .entry(idx)
                .or_default()
        }
    }
}

/// Everything that differs between two coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Coordinate the delta applies to.
    pub from: Btt,
    /// Coordinate the delta leads to.
    pub to: Btt,
    /// Per-graph changes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graphs: BTreeMap<GraphName, GraphDelta>,
    /// Rulebook changes; `None` means deleted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rulebooks: BTreeMap<RulebookName, Option<Vec<RuleName>>>,
}

impl Delta {
    /// A delta that changes nothing.
    pub fn empty(from: Btt, to: Btt) -> Self {
        Self {
            from,
            to,
            graphs: BTreeMap::new(),
            rulebooks: BTreeMap::new(),
        }
    }

    /// Whether applying this delta would change no state.
    pub fn is_empty(&self) -> bool {
        self.rulebooks.is_empty() && self.graphs.values().all(GraphDelta::is_empty)
    }

    /// Changes for `graph`, created on demand.
    pub fn graph(&mut self, graph: &str) -> &mut GraphDelta {
        self.graphs.entry(graph.to_owned()).or_default()
    }

    /// CBOR encoding.
    pub fn to_cbor(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Inverse of [`Delta::to_cbor`].
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CodecError> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl<S: FactStore> Engine<S> {
    /// Computes the delta leading from `a` to `b`.
    pub fn diff(&self, a: &Btt, b: &Btt) -> Result<Delta, EngineError> {
        for at in [a, b] {
            if !self.tree.contains(&at.branch) {
                return Err(HistoryError::UnknownBranch(at.branch.clone()).into());
            }
        }
        let mut delta = Delta::empty(a.clone(), b.clone());
        if a == b {
            return Ok(delta);
        }
        let tree = &self.tree;

        for (graph, key) in self.graph_val.changed_between(tree, a, b) {
            let va = self.graph_val.retrieve_at(tree, &graph, &key, a).found();
            let vb = self.graph_val.retrieve_at(tree, &graph, &key, b).found();
            if va != vb {
                delta.graph(&graph).graph_val.insert(key, vb.cloned());
            }
        }

        let mut born_nodes = Vec::new();
        for (graph, node) in self.nodes.changed_between(tree, a, b) {
            let ea = self.nodes.retrieve_at(tree, &graph, &node, a).is_found();
            let eb = self.nodes.retrieve_at(tree, &graph, &node, b).is_found();
            if ea != eb {
                delta.graph(&graph).nodes.insert(node.clone(), eb);
                if eb {
                    born_nodes.push((graph, node));
                }
            }
        }
        for ((graph, node), key) in self.node_val.changed_between(tree, a, b) {
            if !(self.node_exists_at(&graph, &node, a) && self.node_exists_at(&graph, &node, b)) {
                continue;
            }
            let va = self.node_val_at(&graph, &node, &key, a).found();
            let vb = self.node_val_at(&graph, &node, &key, b).found();
            if va != vb {
                delta
                    .graph(&graph)
                    .node_val
                    .entry(node)
                    .or_default()
                    .insert(key, vb.cloned());
            }
        }
        for (graph, node) in born_nodes {
            let keys = self.node_keys_at(&graph, &node, b);
            if keys.is_empty() {
                continue;
            }
            let attrs = delta.graph(&graph).node_val.entry(node.clone()).or_default();
            for key in keys {
                let value = self.node_val_at(&graph, &node, &key, b).found().cloned();
                attrs.insert(key, value);
            }
        }

        for (graph, orig, dest) in self.edges.pairs_changed_between(tree, a, b) {
            let pa = self.edges.has_edge(tree, &graph, &orig, &dest, a);
            let pb = self.edges.has_edge(tree, &graph, &orig, &dest, b);
            if pa != pb {
                delta
                    .graph(&graph)
                    .edges
                    .entry(orig)
                    .or_default()
                    .insert(dest, pb);
            }
        }
        let mut born_edges = Vec::new();
        for ((graph, orig, dest), idx) in self.edges.indices_changed_between(tree, a, b) {
            let ia = self.edges.has_index(tree, &graph, &orig, &dest, idx, a);
            let ib = self.edges.has_index(tree, &graph, &orig, &dest, idx, b);
            if ia == ib {
                continue;
            }
            if self.graphs.get(&graph).is_some_and(|k| k.is_multigraph()) {
                delta
                    .graph(&graph)
                    .multiedges
                    .entry(orig.clone())
                    .or_default()
                    .entry(dest.clone())
                    .or_default()
                    .insert(idx, ib);
            }
            if ib {
                born_edges.push(Entity::Edge(graph, orig, dest, idx));
            }
        }
        for ((graph, orig, dest, idx), key) in self.edge_val.changed_between(tree, a, b) {
            let entity = Entity::Edge(graph, orig, dest, idx);
            if !(self.exists_at(&entity, a) && self.exists_at(&entity, b)) {
                continue;
            }
            let va = self.attr_at(&entity, &key, a).found();
            let vb = self.attr_at(&entity, &key, b).found();
            if va != vb {
                if let Entity::Edge(graph, orig, dest, idx) = &entity {
                    delta
                        .graph(graph)
                        .edge_attrs(orig.clone(), dest.clone(), *idx)
                        .insert(key, vb.cloned());
                }
            }
        }
        for entity in born_edges {
            let Entity::Edge(graph, orig, dest, idx) = &entity else {
                continue;
            };
            let keys = self.attr_keys_at(&entity, b);
            if keys.is_empty() {
                continue;
            }
            let attrs = delta.graph(graph).edge_attrs(orig.clone(), dest.clone(), *idx);
            for key in keys {
                let value = self.attr_at(&entity, &key, b).found().cloned();
                attrs.insert(key, value);
            }
        }

        for ((character, graph), node) in self.avatars.changed_between(tree, a, b) {
            let xa = self.avatars.is_avatar(tree, &character, &graph, &node, a);
            let xb = self.avatars.is_avatar(tree, &character, &graph, &node, b);
            if xa != xb {
                delta
                    .graph(&character)
                    .avatars
                    .entry(graph)
                    .or_default()
                    .insert(node, xb);
            }
        }
        for ((), character) in self.character_rulebook.changed_between(tree, a, b) {
            let ra = self.character_rulebook.retrieve_at(tree, &(), &character, a).found();
            let rb = self.character_rulebook.retrieve_at(tree, &(), &character, b).found();
            if ra != rb {
                delta.graph(&character).character_rulebook = Some(rb.cloned());
            }
        }
        for ((), rulebook) in self.rulebooks.changed_between(tree, a, b) {
            let ra = self.rulebooks.retrieve_at(tree, &(), &rulebook, a).found();
            let rb = self.rulebooks.retrieve_at(tree, &(), &rulebook, b).found();
            if ra != rb {
                delta.rulebooks.insert(rulebook, rb.cloned());
            }
        }

        delta.graphs.retain(|_, g| !g.is_empty());
        tracing::debug!(
            from = %a,
            to = %b,
            graphs = delta.graphs.len(),
            rulebooks = delta.rulebooks.len(),
            "diff computed"
        );
        Ok(delta)
    }
}
