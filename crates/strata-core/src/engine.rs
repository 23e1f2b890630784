// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The engine: single owner of the timeline, the caches and the cursor.
//!
//! Every mutation follows the same path: pick the coordinate (one tick past
//! the cursor), write through the cache, buffer the row in the query adapter,
//! then notify subscribers. Reads never touch the store.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::json;
use thiserror::Error;

use crate::avatars::AvatarnessCache;
use crate::branch::{Branch, BranchTree};
use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::edges::EdgesCache;
use crate::fact_store::{Fact, FactKey, FactKind, FactStore, FactValue, MemoryFactStore, StoreError};
use crate::history::{HistoryError, Lookup};
use crate::ident::{
    BranchId, Btt, EdgeIndex, GraphKind, GraphName, Key, NodeName, Rev, RuleName, RulebookName, Tick,
    Turn, Value,
};
use crate::query::QueryEngine;
use crate::rules::{HandledRule, RuleEntity, RulesHandledCache};
use crate::signal::{Callback, Change, ChangeEvent, Entity, SubscriptionId, Subscribers, TimeCallback};
use crate::window::WriteMode;

/// Global key the cursor is persisted under.
const CURSOR_KEY: &str = "btt";

/// `(graph, orig, dest, idx)`: parent key of edge attributes.
pub type EdgeKey = (GraphName, NodeName, NodeName, EdgeIndex);

/// One fact of a compound operation. Every part is checked before any is applied.
enum Write {
    Attr(Entity, Key, Option<Value>),
    Node(GraphName, NodeName, bool),
    Edge(GraphName, NodeName, NodeName, EdgeIndex, bool),
}

/// Errors emitted by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Timeline or history precondition failed.
    #[error(transparent)]
    History(#[from] HistoryError),
    /// The fact store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// No value for this key at the current coordinate.
    #[error("key not found: {0}")]
    KeyNotFound(Key),
    /// `null` was offered as a value.
    #[error("null is not a storable value; delete the key instead")]
    NullValue,
    /// Graph is not registered.
    #[error("no such graph: {0}")]
    NoSuchGraph(GraphName),
    /// Graph name already taken.
    #[error("graph already exists: {0}")]
    GraphExists(GraphName),
    /// Node does not exist at the current coordinate.
    #[error("no such node: {graph}.{node}")]
    NoSuchNode {
        /// Graph.
        graph: GraphName,
        /// Node.
        node: NodeName,
    },
    /// Edge does not exist at the current coordinate.
    #[error("no such edge: {graph}.{orig}->{dest}[{idx}]")]
    NoSuchEdge {
        /// Graph.
        graph: GraphName,
        /// Origin node.
        orig: NodeName,
        /// Destination node.
        dest: NodeName,
        /// Edge index.
        idx: EdgeIndex,
    },
    /// Non-zero edge index on a plain digraph.
    #[error("graph {0} is not a multigraph")]
    NotMultigraph(GraphName),
    /// Coordinate precedes the branch's divergence point.
    #[error("{branch} does not exist at turn {turn} tick {tick}")]
    OutOfTimeline {
        /// Branch.
        branch: BranchId,
        /// Requested turn.
        turn: Turn,
        /// Requested tick.
        tick: Tick,
    },
    /// Persisted state is inconsistent.
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

fn cache<P, K, V>(name: &'static str, keycache: bool) -> Cache<P, K, V>
where
    P: Ord + Clone,
    K: Ord + Clone,
    V: Clone,
{
    let cache = Cache::new(name);
    if keycache {
        cache
    } else {
        cache.without_keycache()
    }
}

/// Bitemporal graph engine.
///
/// Single writer: the engine is not shared across threads; a proxy owns it on
/// a dedicated thread instead.
pub struct Engine<S: FactStore = MemoryFactStore> {
    pub(crate) config: EngineConfig,
    pub(crate) tree: BranchTree,
    pub(crate) graphs: BTreeMap<GraphName, GraphKind>,
    pub(crate) graph_val: Cache<GraphName, Key, Value>,
    pub(crate) nodes: Cache<GraphName, NodeName, ()>,
    pub(crate) node_val: Cache<(GraphName, NodeName), Key, Value>,
    pub(crate) edges: EdgesCache,
    pub(crate) edge_val: Cache<EdgeKey, Key, Value>,
    pub(crate) avatars: AvatarnessCache,
    pub(crate) rulebooks: Cache<(), RulebookName, Vec<RuleName>>,
    pub(crate) character_rulebook: Cache<(), GraphName, RulebookName>,
    pub(crate) rules_handled: RulesHandledCache,
    query: QueryEngine<S>,
    subscribers: Subscribers,
    btt: Btt,
    turn_ends: BTreeMap<(BranchId, Turn), Tick>,
    planning: bool,
    mode: WriteMode,
}

impl<S: FactStore> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("btt", &self.btt)
            .field("branches", &self.tree.iter().count())
            .field("graphs", &self.graphs)
            .field("planning", &self.planning)
            .field("mode", &self.mode)
            .field("subscribers", &self.subscribers)
            .finish_non_exhaustive()
    }
}

impl<S: FactStore> Engine<S> {
    /// Creates an empty engine over `store` without reading it.
    pub fn new(store: S, config: EngineConfig) -> Self {
        let tree = BranchTree::new(config.trunk.as_str());
        let btt = Btt::new(tree.trunk().clone(), 0, 0);
        let keyed = config.keycache;
        let edges = if keyed {
            EdgesCache::new()
        } else {
            EdgesCache::new().without_keycache()
        };
        Self {
            tree,
            graphs: BTreeMap::new(),
            graph_val: cache("graph_val", keyed),
            nodes: cache("nodes", keyed),
            node_val: cache("node_val", keyed),
            edges,
            edge_val: cache("edge_val", keyed),
            avatars: AvatarnessCache::default(),
            rulebooks: cache("rulebooks", keyed),
            character_rulebook: cache("character_rulebook", keyed),
            rules_handled: RulesHandledCache::default(),
            query: QueryEngine::new(store),
            subscribers: Subscribers::default(),
            btt,
            turn_ends: BTreeMap::new(),
            planning: false,
            mode: WriteMode::Default,
            config,
        }
    }

    /// Cold start: rebuilds every cache from the store's dumps and restores the
    /// persisted cursor.
    pub fn load(store: S, config: EngineConfig) -> Result<Self, EngineError> {
        let mut engine = Self::new(store, config);
        engine.tree = BranchTree::load(
            engine.config.trunk.as_str(),
            engine.query.branches_dump()?,
        )?;
        engine.graphs.extend(engine.query.graphs_dump()?);
        for (branch, turn, tick) in engine.query.turn_ends_dump()? {
            engine.turn_ends.insert((branch, turn), tick);
        }
        let mut facts = 0_usize;
        for kind in FactKind::ALL {
            for fact in engine.query.dump(kind)? {
                engine.load_fact(fact)?;
                facts += 1;
            }
        }
        for row in engine.query.handled_rules_dump()? {
            engine.rules_handled.load(row);
        }
        if let Some(cursor) = engine.query.global_get(CURSOR_KEY)? {
            let btt: Btt = serde_json::from_value(cursor)
                .map_err(|e| EngineError::Corrupt(format!("cursor: {e}")))?;
            if !engine.tree.contains(&btt.branch) {
                return Err(EngineError::Corrupt(format!(
                    "cursor on unknown branch {}",
                    btt.branch
                )));
            }
            engine.btt = btt;
        }
        tracing::info!(
            branches = engine.tree.iter().count(),
            graphs = engine.graphs.len(),
            facts,
            btt = %engine.btt,
            "engine loaded"
        );
        Ok(engine)
    }

    fn load_fact(&mut self, fact: Fact) -> Result<(), EngineError> {
        let Fact {
            key,
            branch,
            turn,
            tick,
            value,
        } = fact;
        let tree = &self.tree;
        let mode = WriteMode::Planning;
        match (key, value) {
            (FactKey::Node { graph, node }, FactValue::Exists(e)) => {
                self.nodes
                    .store(tree, &graph, &node, &branch, turn, tick, e.then_some(()), mode)?;
            }
            (
                FactKey::Edge {
                    graph,
                    orig,
                    dest,
                    idx,
                },
                FactValue::Exists(e),
            ) => {
                self.edges
                    .store(tree, &graph, &orig, &dest, idx, &branch, turn, tick, e, mode)?;
            }
            (FactKey::GraphVal { graph, key }, FactValue::Value(v)) => {
                self.graph_val
                    .store(tree, &graph, &key, &branch, turn, tick, v, mode)?;
            }
            (FactKey::NodeVal { graph, node, key }, FactValue::Value(v)) => {
                self.node_val
                    .store(tree, &(graph, node), &key, &branch, turn, tick, v, mode)?;
            }
            (
                FactKey::EdgeVal {
                    graph,
                    orig,
                    dest,
                    idx,
                    key,
                },
                FactValue::Value(v),
            ) => {
                self.edge_val.store(
                    tree,
                    &(graph, orig, dest, idx),
                    &key,
                    &branch,
                    turn,
                    tick,
                    v,
                    mode,
                )?;
            }
            (
                FactKey::Avatar {
                    character,
                    graph,
                    node,
                },
                FactValue::Exists(e),
            ) => {
                self.avatars
                    .store(tree, &character, &graph, &node, &branch, turn, tick, e, mode)?;
            }
            (FactKey::Rulebook { rulebook }, FactValue::Value(v)) => {
                match v.map(serde_json::from_value::<Vec<RuleName>>).transpose() {
                    Ok(rules) => {
                        self.rulebooks
                            .store(tree, &(), &rulebook, &branch, turn, tick, rules, mode)?;
                    }
                    Err(err) => tracing::warn!(%rulebook, %err, "skipping malformed rulebook fact"),
                }
            }
            (FactKey::CharacterRulebook { character }, FactValue::Value(v)) => match v {
                None | Some(Value::String(_)) => {
                    let rulebook = v.and_then(|s| s.as_str().map(str::to_owned));
                    self.character_rulebook
                        .store(tree, &(), &character, &branch, turn, tick, rulebook, mode)?;
                }
                Some(other) => {
                    tracing::warn!(%character, %other, "skipping malformed character rulebook fact");
                }
            },
            (key, value) => tracing::warn!(?key, ?value, "skipping fact with mismatched payload"),
        }
        Ok(())
    }

    // ── time ────────────────────────────────────────────────────────────

    /// Current coordinate.
    pub fn btt(&self) -> &Btt {
        &self.btt
    }

    /// Current branch.
    pub fn branch(&self) -> &BranchId {
        &self.btt.branch
    }

    /// Current turn.
    pub fn turn(&self) -> Turn {
        self.btt.turn
    }

    /// Current tick.
    pub fn tick(&self) -> Tick {
        self.btt.tick
    }

    /// Settings the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The branch tree.
    pub fn tree(&self) -> &BranchTree {
        &self.tree
    }

    /// Every known branch.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> + '_ {
        self.tree.iter()
    }

    /// Last tick recorded in `turn` on `branch`, or 0.
    pub fn turn_end(&self, branch: &BranchId, turn: Turn) -> Tick {
        self.turn_ends
            .get(&(branch.clone(), turn))
            .copied()
            .unwrap_or_default()
    }

    fn bump_turn_end(&mut self, branch: &BranchId, turn: Turn, tick: Tick) {
        let end = self.turn_ends.entry((branch.clone(), turn)).or_insert(tick);
        if *end < tick {
            *end = tick;
        }
    }

    /// Moves the cursor.
    ///
    /// An unknown `branch` is created as a child of the current branch,
    /// diverging at the current coordinate. An omitted `tick` means the last
    /// recorded tick of `turn`. A rejected move creates no branch.
    pub fn time_travel(
        &mut self,
        branch: impl Into<BranchId>,
        turn: Turn,
        tick: Option<Tick>,
    ) -> Result<(), EngineError> {
        let branch = branch.into();
        let from = self.btt.clone();
        let (known, diverges_at) = match self.tree.get(&branch) {
            Some(b) => (true, b.parent.as_ref().map(|_| b.parent_rev())),
            None => (false, Some(from.rev())),
        };
        let tick = match tick {
            Some(tick) => tick,
            None if known => self.turn_end(&branch, turn),
            None if turn == from.turn => from.tick,
            None => 0,
        };
        if diverges_at.is_some_and(|rev| (turn, tick) < rev) {
            return Err(EngineError::OutOfTimeline { branch, turn, tick });
        }
        if !known {
            self.fork(&branch, &from)?;
        }
        self.tree.extend(&branch, turn, tick);
        self.bump_turn_end(&branch, turn, tick);
        self.btt = Btt { branch, turn, tick };
        tracing::debug!(%from, to = %self.btt, "time travel");
        let to = self.btt.clone();
        self.subscribers.notify_time(&from, &to);
        Ok(())
    }

    fn fork(&mut self, child: &BranchId, from: &Btt) -> Result<(), EngineError> {
        self.tree
            .check_create(child, &from.branch, from.turn, from.tick)?;
        self.rules_handled
            .fork(&from.branch, from.turn, from.tick, child)?;
        self.tree
            .create(child.clone(), from.branch.clone(), from.turn, from.tick)?;
        self.bump_turn_end(child, from.turn, from.tick);
        Ok(())
    }

    /// Advances to tick 0 of the next turn, committing when the configured
    /// modulus divides the new turn.
    pub fn next_turn(&mut self) -> Result<Btt, EngineError> {
        let (branch, turn) = (self.btt.branch.clone(), self.btt.turn + 1);
        self.time_travel(branch, turn, Some(0))?;
        if let Some(modulus) = self.config.commit_modulus.filter(|m| *m > 0) {
            if turn % modulus == 0 {
                self.commit()?;
            }
        }
        Ok(self.btt.clone())
    }

    /// Claims the next tick of the current turn and returns its coordinate.
    pub fn nbtt(&mut self) -> Btt {
        let at = self.next_btt();
        self.claim(&at);
        at
    }

    fn next_btt(&self) -> Btt {
        Btt {
            tick: self.btt.tick + 1,
            ..self.btt.clone()
        }
    }

    fn claim(&mut self, at: &Btt) {
        self.tree.extend(&at.branch, at.turn, at.tick);
        self.bump_turn_end(&at.branch, at.turn, at.tick);
        self.btt = at.clone();
    }

    /// Mode used for writes when no plan is open.
    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    /// Sets the mode used for writes when no plan is open.
    pub fn set_write_mode(&mut self, mode: WriteMode) {
        self.mode = mode;
    }

    fn mode(&self) -> WriteMode {
        if self.planning {
            WriteMode::Planning
        } else {
            self.mode
        }
    }

    // ── graphs ──────────────────────────────────────────────────────────

    /// Registers a graph.
    pub fn new_graph(&mut self, name: impl Into<GraphName>, kind: GraphKind) -> Result<(), EngineError> {
        let name = name.into();
        if self.graphs.contains_key(&name) {
            return Err(EngineError::GraphExists(name));
        }
        self.query.new_graph(&name, kind)?;
        tracing::debug!(graph = %name, ?kind, "graph created");
        self.graphs.insert(name, kind);
        Ok(())
    }

    /// Registered graphs.
    pub fn graphs(&self) -> impl Iterator<Item = (&GraphName, GraphKind)> + '_ {
        self.graphs.iter().map(|(name, kind)| (name, *kind))
    }

    /// Flavour of a registered graph.
    pub fn graph_kind(&self, name: &str) -> Result<GraphKind, EngineError> {
        self.graphs
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::NoSuchGraph(name.to_owned()))
    }

    // ── entity reads ────────────────────────────────────────────────────

    /// Whether `entity` exists at `at`. Graphs exist at every coordinate once registered.
    pub fn exists_at(&self, entity: &Entity, at: &Btt) -> bool {
        match entity {
            Entity::Graph(g) => self.graphs.contains_key(g),
            Entity::Node(g, n) => self.nodes.retrieve_at(&self.tree, g, n, at).is_found(),
            Entity::Edge(g, o, d, idx) => self.edges.has_index(&self.tree, g, o, d, *idx, at),
        }
    }

    /// Attribute of `entity` at `at`; nothing is visible on a missing entity.
    pub fn attr_at(&self, entity: &Entity, key: &str, at: &Btt) -> Lookup<&Value> {
        if !self.exists_at(entity, at) {
            return Lookup::NotFound;
        }
        let key = key.to_owned();
        match entity {
            Entity::Graph(g) => self.graph_val.retrieve_at(&self.tree, g, &key, at),
            Entity::Node(g, n) => {
                self.node_val
                    .retrieve_at(&self.tree, &(g.clone(), n.clone()), &key, at)
            }
            Entity::Edge(g, o, d, idx) => self.edge_val.retrieve_at(
                &self.tree,
                &(g.clone(), o.clone(), d.clone(), *idx),
                &key,
                at,
            ),
        }
    }

    /// Attribute keys of `entity` at `at`, in key order.
    pub fn attr_keys_at(&self, entity: &Entity, at: &Btt) -> Vec<Key> {
        if !self.exists_at(entity, at) {
            return Vec::new();
        }
        let Btt { branch, turn, tick } = at;
        let tree = &self.tree;
        match entity {
            Entity::Graph(g) => self
                .graph_val
                .iter_keys(tree, g, branch, *turn, *tick, true)
                .cloned()
                .collect(),
            Entity::Node(g, n) => self
                .node_val
                .iter_keys(tree, &(g.clone(), n.clone()), branch, *turn, *tick, true)
                .cloned()
                .collect(),
            Entity::Edge(g, o, d, idx) => self
                .edge_val
                .iter_keys(
                    tree,
                    &(g.clone(), o.clone(), d.clone(), *idx),
                    branch,
                    *turn,
                    *tick,
                    true,
                )
                .cloned()
                .collect(),
        }
    }

    /// Graph attribute at `at`.
    pub fn graph_val_at(&self, graph: &str, key: &str, at: &Btt) -> Lookup<&Value> {
        self.attr_at(&Entity::Graph(graph.to_owned()), key, at)
    }

    /// Whether `graph.node` exists at `at`.
    pub fn node_exists_at(&self, graph: &str, node: &str, at: &Btt) -> bool {
        self.exists_at(&Entity::Node(graph.to_owned(), node.to_owned()), at)
    }

    /// Nodes of `graph` at `at`, in name order.
    pub fn nodes_at(&self, graph: &str, at: &Btt) -> Vec<NodeName> {
        self.nodes
            .iter_keys(&self.tree, &graph.to_owned(), &at.branch, at.turn, at.tick, true)
            .cloned()
            .collect()
    }

    /// Node attribute at `at`.
    pub fn node_val_at(&self, graph: &str, node: &str, key: &str, at: &Btt) -> Lookup<&Value> {
        self.attr_at(&Entity::Node(graph.to_owned(), node.to_owned()), key, at)
    }

    /// Node attribute keys at `at`.
    pub fn node_keys_at(&self, graph: &str, node: &str, at: &Btt) -> Vec<Key> {
        self.attr_keys_at(&Entity::Node(graph.to_owned(), node.to_owned()), at)
    }

    /// Whether edge `idx` from `orig` to `dest` exists at `at`.
    pub fn edge_exists_at(&self, graph: &str, orig: &str, dest: &str, idx: EdgeIndex, at: &Btt) -> bool {
        self.exists_at(
            &Entity::Edge(graph.to_owned(), orig.to_owned(), dest.to_owned(), idx),
            at,
        )
    }

    /// Whether any edge from `orig` to `dest` exists at `at`.
    pub fn has_edge_at(&self, graph: &str, orig: &str, dest: &str, at: &Btt) -> bool {
        self.edges
            .has_edge(&self.tree, &graph.to_owned(), &orig.to_owned(), &dest.to_owned(), at)
    }

    /// Destinations of edges leaving `orig` at `at`.
    pub fn successors_at(&self, graph: &str, orig: &str, at: &Btt) -> Vec<NodeName> {
        self.edges
            .successors(&self.tree, &graph.to_owned(), &orig.to_owned(), at)
            .cloned()
            .collect()
    }

    /// Origins of edges entering `dest` at `at`.
    pub fn predecessors_at(&self, graph: &str, dest: &str, at: &Btt) -> Vec<NodeName> {
        self.edges
            .predecessors(&self.tree, &graph.to_owned(), &dest.to_owned(), at)
            .cloned()
            .collect()
    }

    /// Live edge indices from `orig` to `dest` at `at`.
    pub fn edge_indices_at(&self, graph: &str, orig: &str, dest: &str, at: &Btt) -> Vec<EdgeIndex> {
        self.edges
            .indices(&self.tree, &graph.to_owned(), &orig.to_owned(), &dest.to_owned(), at)
            .copied()
            .collect()
    }

    /// Edge attribute at `at`.
    pub fn edge_val_at(
        &self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
        key: &str,
        at: &Btt,
    ) -> Lookup<&Value> {
        self.attr_at(
            &Entity::Edge(graph.to_owned(), orig.to_owned(), dest.to_owned(), idx),
            key,
            at,
        )
    }

    /// Raw history of a node attribute on one branch.
    pub fn node_val_history(
        &self,
        graph: &str,
        node: &str,
        key: &str,
        branch: &BranchId,
    ) -> Vec<(Rev, Option<Value>)> {
        self.node_val
            .history(&(graph.to_owned(), node.to_owned()), &key.to_owned(), branch)
            .map(|h| h.iter().map(|(rev, v)| (rev, v.clone())).collect())
            .unwrap_or_default()
    }

    /// Latest turn `<= turn` at which a node attribute changed on `branch`.
    pub fn node_val_turn_before(
        &self,
        graph: &str,
        node: &str,
        key: &str,
        branch: &BranchId,
        turn: Turn,
    ) -> Option<Turn> {
        self.node_val
            .turn_before(&(graph.to_owned(), node.to_owned()), &key.to_owned(), branch, turn)
    }

    /// Earliest turn `> turn` at which a node attribute changed on `branch`.
    pub fn node_val_turn_after(
        &self,
        graph: &str,
        node: &str,
        key: &str,
        branch: &BranchId,
        turn: Turn,
    ) -> Option<Turn> {
        self.node_val
            .turn_after(&(graph.to_owned(), node.to_owned()), &key.to_owned(), branch, turn)
    }

    // ── entity writes ───────────────────────────────────────────────────

    fn require(&self, entity: &Entity) -> Result<(), EngineError> {
        match entity {
            Entity::Graph(g) => self.graph_kind(g).map(|_| ()),
            Entity::Node(g, n) => {
                self.graph_kind(g)?;
                if self.exists_at(entity, &self.btt) {
                    Ok(())
                } else {
                    Err(EngineError::NoSuchNode {
                        graph: g.clone(),
                        node: n.clone(),
                    })
                }
            }
            Entity::Edge(g, o, d, idx) => {
                self.graph_kind(g)?;
                if self.exists_at(entity, &self.btt) {
                    Ok(())
                } else {
                    Err(EngineError::NoSuchEdge {
                        graph: g.clone(),
                        orig: o.clone(),
                        dest: d.clone(),
                        idx: *idx,
                    })
                }
            }
        }
    }

    /// Sets (`Some`) or deletes (`None`) an attribute of an existing entity at
    /// the next tick.
    ///
    /// If facts left ahead of the cursor have the entity gone at that tick, it
    /// is brought back first. On error neither the cursor nor any fact moves.
    pub fn set_attr(&mut self, entity: &Entity, key: &str, value: Option<Value>) -> Result<Btt, EngineError> {
        if value.as_ref().is_some_and(Value::is_null) {
            return Err(EngineError::NullValue);
        }
        self.require(entity)?;
        let at = self.next_btt();
        let mut writes = match entity {
            Entity::Graph(_) => Vec::new(),
            Entity::Node(g, n) if !self.node_exists_at(g, n, &at) => {
                vec![(at.clone(), Write::Node(g.clone(), n.clone(), true))]
            }
            Entity::Node(..) => Vec::new(),
            Entity::Edge(g, o, d, idx) => self.raise_edge(g, o, d, *idx, &at),
        };
        let raised = writes.iter().any(|(_, w)| matches!(w, Write::Edge(.., true)));
        writes.push((at.clone(), Write::Attr(entity.clone(), key.to_owned(), value)));
        let at = self.commit_writes(at, writes)?;
        if let (true, Entity::Edge(g, o, d, idx)) = (raised, entity) {
            self.pin_edges(g, &BTreeSet::from([(o.clone(), d.clone(), *idx)]), &at)?;
        }
        Ok(at)
    }

    fn check_write(&self, at: &Btt, write: &Write, mode: WriteMode) -> Result<(), HistoryError> {
        let Btt { branch, turn, tick } = at;
        let (turn, tick) = (*turn, *tick);
        match write {
            Write::Attr(Entity::Graph(g), key, _) => {
                self.graph_val.check_store(g, key, branch, turn, tick, mode)
            }
            Write::Attr(Entity::Node(g, n), key, _) => {
                self.node_val
                    .check_store(&(g.clone(), n.clone()), key, branch, turn, tick, mode)
            }
            Write::Attr(Entity::Edge(g, o, d, idx), key, _) => self.edge_val.check_store(
                &(g.clone(), o.clone(), d.clone(), *idx),
                key,
                branch,
                turn,
                tick,
                mode,
            ),
            Write::Node(g, n, _) => self.nodes.check_store(g, n, branch, turn, tick, mode),
            Write::Edge(g, o, d, idx, _) => {
                self.edges
                    .check_store(g, o, d, *idx, branch, turn, tick, mode)
            }
        }
    }

    /// Checks every write, then claims `at` and applies them in order.
    fn commit_writes(&mut self, at: Btt, writes: Vec<(Btt, Write)>) -> Result<Btt, EngineError> {
        let mode = self.mode();
        for (rev, write) in &writes {
            self.check_write(rev, write, mode)?;
        }
        self.claim(&at);
        for (rev, write) in writes {
            match write {
                Write::Attr(entity, key, value) => self.write_attr(&entity, &key, value, &rev)?,
                Write::Node(g, n, exists) => self.write_node(&g, &n, exists, &rev)?,
                Write::Edge(g, o, d, idx, exists) => self.write_edge(&g, &o, &d, idx, exists, &rev)?,
            }
        }
        Ok(at)
    }

    /// Graph attribute write.
    pub fn set_graph_val(&mut self, graph: &str, key: &str, value: Option<Value>) -> Result<Btt, EngineError> {
        self.set_attr(&Entity::Graph(graph.to_owned()), key, value)
    }

    /// Node attribute write.
    pub fn set_node_val(
        &mut self,
        graph: &str,
        node: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<Btt, EngineError> {
        self.set_attr(&Entity::Node(graph.to_owned(), node.to_owned()), key, value)
    }

    /// Edge attribute write.
    pub fn set_edge_val(
        &mut self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
        key: &str,
        value: Option<Value>,
    ) -> Result<Btt, EngineError> {
        self.set_attr(
            &Entity::Edge(graph.to_owned(), orig.to_owned(), dest.to_owned(), idx),
            key,
            value,
        )
    }

    fn write_attr(
        &mut self,
        entity: &Entity,
        key: &str,
        value: Option<Value>,
        at: &Btt,
    ) -> Result<(), EngineError> {
        let mode = self.mode();
        let key = key.to_owned();
        let Btt { branch, turn, tick } = at;
        let tree = &self.tree;
        match entity {
            Entity::Graph(g) => {
                self.graph_val
                    .store(tree, g, &key, branch, *turn, *tick, value.clone(), mode)?;
                self.query
                    .graph_val_set(g, &key, branch, *turn, *tick, value.clone(), mode);
            }
            Entity::Node(g, n) => {
                self.node_val.store(
                    tree,
                    &(g.clone(), n.clone()),
                    &key,
                    branch,
                    *turn,
                    *tick,
                    value.clone(),
                    mode,
                )?;
                self.query
                    .node_val_set(g, n, &key, branch, *turn, *tick, value.clone(), mode);
            }
            Entity::Edge(g, o, d, idx) => {
                self.edge_val.store(
                    tree,
                    &(g.clone(), o.clone(), d.clone(), *idx),
                    &key,
                    branch,
                    *turn,
                    *tick,
                    value.clone(),
                    mode,
                )?;
                self.query
                    .edge_val_set(g, o, d, *idx, &key, branch, *turn, *tick, value.clone(), mode);
            }
        }
        self.subscribers.notify(&ChangeEvent {
            btt: at.clone(),
            entity: entity.clone(),
            change: Change::Attr { key, value },
        });
        Ok(())
    }

    /// Creates `graph.node`; a no-op if it already exists.
    pub fn add_node(&mut self, graph: &str, node: &str) -> Result<Btt, EngineError> {
        self.graph_kind(graph)?;
        if self.node_exists_at(graph, node, &self.btt) {
            return Ok(self.btt.clone());
        }
        let at = self.next_btt();
        let writes = vec![(at.clone(), Write::Node(graph.to_owned(), node.to_owned(), true))];
        self.commit_writes(at, writes)
    }

    /// Removes `graph.node` together with its attributes and incident edges,
    /// all at one tick.
    ///
    /// Incident edges recorded ahead of the cursor, or on branches that
    /// inherit this point, are ended wherever the node is gone.
    pub fn del_node(&mut self, graph: &str, node: &str) -> Result<Btt, EngineError> {
        let entity = Entity::Node(graph.to_owned(), node.to_owned());
        self.require(&entity)?;
        let at = self.next_btt();
        let (g, n) = (graph.to_owned(), node.to_owned());
        let mut writes: Vec<(Btt, Write)> = self
            .node_val
            .iter_keys(&self.tree, &(g.clone(), n.clone()), &at.branch, at.turn, at.tick, true)
            .map(|key| (at.clone(), Write::Attr(entity.clone(), key.clone(), None)))
            .collect();
        let incident = self.edges.incident_ever(&g, &n);
        // planning keeps later history; pin_edges ends those edges without cutting it
        if self.mode() != WriteMode::Planning {
            for (orig, dest, idx) in &incident {
                let live_now = self.edges.has_index(&self.tree, &g, orig, dest, *idx, &at);
                let live_later = self
                    .edges
                    .facts_after(&g, orig, dest, *idx, &at.branch, at.rev())
                    .iter()
                    .any(|(_, live)| *live);
                if live_now || live_later {
                    writes.extend(self.edge_teardown(&g, orig, dest, *idx, &at));
                }
            }
        }
        writes.push((at.clone(), Write::Node(g.clone(), n, false)));
        let at = self.commit_writes(at, writes)?;
        self.pin_edges(&g, &incident, &at)?;
        Ok(at)
    }

    /// Ends each of `edges` wherever an endpoint is gone, on `from`'s branch at
    /// and after `from` and on every branch inheriting that stretch.
    ///
    /// Where an endpoint comes back, an edge this ended resumes if its own
    /// facts had it alive there. Repairs are recorded without truncation.
    fn pin_edges(
        &mut self,
        g: &GraphName,
        edges: &BTreeSet<(NodeName, NodeName, EdgeIndex)>,
        from: &Btt,
    ) -> Result<(), EngineError> {
        let mut spans = vec![from.clone()];
        for (child, leaves_at) in self.tree.descendants(&from.branch) {
            if leaves_at < from.rev() {
                continue;
            }
            if let Some(b) = self.tree.get(&child) {
                spans.push(Btt::new(child, b.parent_turn, b.parent_tick));
            }
        }
        for start in spans {
            for (o, d, idx) in edges {
                let own = self.edges.facts_after(g, o, d, *idx, &start.branch, start.rev());
                let mut revs = BTreeSet::from([start.rev()]);
                revs.extend(own.iter().map(|(rev, _)| *rev));
                for node in [o, d] {
                    let facts = self.nodes.facts_after(g, node, &start.branch, start.rev());
                    revs.extend(facts.into_iter().map(|(rev, _)| rev));
                }
                let mut ours: Option<bool> = None;
                let mut fixes = Vec::new();
                for rev in revs {
                    let at = start.at(rev);
                    if own.iter().any(|(r, _)| *r == rev) {
                        ours = None;
                    }
                    let recorded = self.edges.has_index(&self.tree, g, o, d, *idx, &at);
                    let ends = self.node_exists_at(g, o, &at) && self.node_exists_at(g, d, &at);
                    let want = recorded && ends;
                    if ours.unwrap_or(recorded) != want {
                        ours = Some(want);
                        fixes.push((at, want));
                    }
                }
                if !fixes.is_empty() {
                    tracing::debug!(
                        graph = %g,
                        orig = %o,
                        dest = %d,
                        idx,
                        branch = %start.branch,
                        fixes = fixes.len(),
                        "edge pinned to its endpoints"
                    );
                }
                for (at, exists) in fixes {
                    self.write_edge_as(g, o, d, *idx, exists, &at, WriteMode::Planning)?;
                }
            }
        }
        Ok(())
    }

    fn write_node(&mut self, graph: &GraphName, node: &NodeName, exists: bool, at: &Btt) -> Result<(), EngineError> {
        let mode = self.mode();
        self.nodes.store(
            &self.tree,
            graph,
            node,
            &at.branch,
            at.turn,
            at.tick,
            exists.then_some(()),
            mode,
        )?;
        self.query
            .exist_node(graph, node, &at.branch, at.turn, at.tick, exists, mode);
        self.subscribers.notify(&ChangeEvent {
            btt: at.clone(),
            entity: Entity::Node(graph.clone(), node.clone()),
            change: Change::Exists(exists),
        });
        Ok(())
    }

    /// Creates edge `idx` from `orig` to `dest`; a no-op if it already exists.
    pub fn add_edge(&mut self, graph: &str, orig: &str, dest: &str, idx: EdgeIndex) -> Result<Btt, EngineError> {
        let kind = self.graph_kind(graph)?;
        if idx != 0 && !kind.is_multigraph() {
            return Err(EngineError::NotMultigraph(graph.to_owned()));
        }
        for node in [orig, dest] {
            if !self.node_exists_at(graph, node, &self.btt) {
                return Err(EngineError::NoSuchNode {
                    graph: graph.to_owned(),
                    node: node.to_owned(),
                });
            }
        }
        if self.edge_exists_at(graph, orig, dest, idx, &self.btt) {
            return Ok(self.btt.clone());
        }
        let at = self.next_btt();
        let (g, o, d) = (graph.to_owned(), orig.to_owned(), dest.to_owned());
        let writes = self.raise_edge(&g, &o, &d, idx, &at);
        let at = self.commit_writes(at, writes)?;
        self.pin_edges(&g, &BTreeSet::from([(o, d, idx)]), &at)?;
        Ok(at)
    }

    /// Writes that make edge `idx` exist at `at`, reviving either endpoint the
    /// facts ahead of the cursor have gone by then.
    fn raise_edge(&self, g: &GraphName, o: &NodeName, d: &NodeName, idx: EdgeIndex, at: &Btt) -> Vec<(Btt, Write)> {
        let mut writes = Vec::new();
        let ends = if o == d { vec![o] } else { vec![o, d] };
        for node in ends {
            if !self.node_exists_at(g, node, at) {
                writes.push((at.clone(), Write::Node(g.clone(), node.clone(), true)));
            }
        }
        if !self.edge_exists_at(g, o, d, idx, at) {
            writes.push((at.clone(), Write::Edge(g.clone(), o.clone(), d.clone(), idx, true)));
        }
        writes
    }

    /// Adds an edge under a fresh index (always 0 on a digraph) and returns it.
    pub fn new_edge(&mut self, graph: &str, orig: &str, dest: &str) -> Result<(EdgeIndex, Btt), EngineError> {
        let idx = if self.graph_kind(graph)?.is_multigraph() {
            self.edges
                .next_index(&graph.to_owned(), &orig.to_owned(), &dest.to_owned())
        } else {
            0
        };
        let at = self.add_edge(graph, orig, dest, idx)?;
        Ok((idx, at))
    }

    /// Removes edge `idx` and its attributes.
    pub fn del_edge(&mut self, graph: &str, orig: &str, dest: &str, idx: EdgeIndex) -> Result<Btt, EngineError> {
        self.require(&Entity::Edge(graph.to_owned(), orig.to_owned(), dest.to_owned(), idx))?;
        let at = self.next_btt();
        let writes = self.edge_teardown(&graph.to_owned(), &orig.to_owned(), &dest.to_owned(), idx, &at);
        self.commit_writes(at, writes)
    }

    /// Deletions of an edge and of every attribute it holds at `at`.
    fn edge_teardown(&self, g: &GraphName, o: &NodeName, d: &NodeName, idx: EdgeIndex, at: &Btt) -> Vec<(Btt, Write)> {
        let entity = Entity::Edge(g.clone(), o.clone(), d.clone(), idx);
        let mut writes: Vec<(Btt, Write)> = self
            .edge_val
            .iter_keys(
                &self.tree,
                &(g.clone(), o.clone(), d.clone(), idx),
                &at.branch,
                at.turn,
                at.tick,
                true,
            )
            .map(|key| (at.clone(), Write::Attr(entity.clone(), key.clone(), None)))
            .collect();
        writes.push((at.clone(), Write::Edge(g.clone(), o.clone(), d.clone(), idx, false)));
        writes
    }

    fn write_edge(
        &mut self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        exists: bool,
        at: &Btt,
    ) -> Result<(), EngineError> {
        self.write_edge_as(graph, orig, dest, idx, exists, at, self.mode())
    }

    fn write_edge_as(
        &mut self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        exists: bool,
        at: &Btt,
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        self.edges.store(
            &self.tree, graph, orig, dest, idx, &at.branch, at.turn, at.tick, exists, mode,
        )?;
        self.query
            .exist_edge(graph, orig, dest, idx, &at.branch, at.turn, at.tick, exists, mode);
        self.subscribers.notify(&ChangeEvent {
            btt: at.clone(),
            entity: Entity::Edge(graph.clone(), orig.clone(), dest.clone(), idx),
            change: Change::Exists(exists),
        });
        Ok(())
    }

    // ── avatars and rules ───────────────────────────────────────────────

    /// Makes `graph.node` an avatar of `character` (or stops it being one).
    pub fn set_avatar(
        &mut self,
        character: &str,
        graph: &str,
        node: &str,
        is_avatar: bool,
    ) -> Result<Btt, EngineError> {
        self.graph_kind(character)?;
        if is_avatar {
            self.require(&Entity::Node(graph.to_owned(), node.to_owned()))?;
        } else {
            self.graph_kind(graph)?;
        }
        let (character, graph, node) = (character.to_owned(), graph.to_owned(), node.to_owned());
        let mode = self.mode();
        let at = self.next_btt();
        self.avatars
            .check_store(&character, &graph, &node, &at.branch, at.turn, at.tick, mode)?;
        self.claim(&at);
        self.avatars.store(
            &self.tree, &character, &graph, &node, &at.branch, at.turn, at.tick, is_avatar, mode,
        )?;
        self.query
            .avatar_set(&character, &graph, &node, &at.branch, at.turn, at.tick, is_avatar, mode);
        self.subscribers.notify(&ChangeEvent {
            btt: at.clone(),
            entity: Entity::Graph(character),
            change: Change::Avatar {
                graph,
                node,
                is_avatar,
            },
        });
        Ok(at)
    }

    /// Whether `graph.node` is an avatar of `character` at `at`.
    pub fn is_avatar_at(&self, character: &str, graph: &str, node: &str, at: &Btt) -> bool {
        self.avatars.is_avatar(
            &self.tree,
            &character.to_owned(),
            &graph.to_owned(),
            &node.to_owned(),
            at,
        )
    }

    /// Avatars of `character` in `graph` at `at`.
    pub fn avatars_at(&self, character: &str, graph: &str, at: &Btt) -> Vec<NodeName> {
        self.avatars
            .avatars(&self.tree, &character.to_owned(), &graph.to_owned(), at)
            .cloned()
            .collect()
    }

    /// Graphs holding avatars of `character` at `at`.
    pub fn avatar_graphs_at(&self, character: &str, at: &Btt) -> Vec<GraphName> {
        self.avatars
            .avatar_graphs(&self.tree, &character.to_owned(), at)
    }

    /// Characters using `graph.node` as an avatar at `at`.
    pub fn users_at(&self, graph: &str, node: &str, at: &Btt) -> Vec<GraphName> {
        self.avatars
            .users(&self.tree, &graph.to_owned(), &node.to_owned(), at)
            .cloned()
            .collect()
    }

    /// Replaces (`Some`) or deletes (`None`) a rulebook's rule list.
    pub fn set_rulebook(&mut self, rulebook: &str, rules: Option<Vec<RuleName>>) -> Result<Btt, EngineError> {
        let name = rulebook.to_owned();
        let mode = self.mode();
        let at = self.next_btt();
        self.rulebooks
            .check_store(&(), &name, &at.branch, at.turn, at.tick, mode)?;
        self.claim(&at);
        self.rulebooks.store(
            &self.tree,
            &(),
            &name,
            &at.branch,
            at.turn,
            at.tick,
            rules.clone(),
            mode,
        )?;
        self.query
            .rulebook_set(&name, &at.branch, at.turn, at.tick, rules.as_deref(), mode);
        Ok(at)
    }

    /// Rules of `rulebook` at `at`.
    pub fn rulebook_at(&self, rulebook: &str, at: &Btt) -> Option<Vec<RuleName>> {
        self.rulebooks
            .retrieve_at(&self.tree, &(), &rulebook.to_owned(), at)
            .found()
            .cloned()
    }

    /// Rulebooks defined at `at`.
    pub fn rulebook_names_at(&self, at: &Btt) -> Vec<RulebookName> {
        self.rulebooks
            .iter_keys(&self.tree, &(), &at.branch, at.turn, at.tick, true)
            .cloned()
            .collect()
    }

    /// Assigns (`Some`) or clears (`None`) the rulebook of a graph.
    pub fn set_character_rulebook(&mut self, character: &str, rulebook: Option<&str>) -> Result<Btt, EngineError> {
        self.graph_kind(character)?;
        let character = character.to_owned();
        let rulebook = rulebook.map(str::to_owned);
        let mode = self.mode();
        let at = self.next_btt();
        self.character_rulebook
            .check_store(&(), &character, &at.branch, at.turn, at.tick, mode)?;
        self.claim(&at);
        self.character_rulebook.store(
            &self.tree,
            &(),
            &character,
            &at.branch,
            at.turn,
            at.tick,
            rulebook.clone(),
            mode,
        )?;
        self.query
            .character_rulebook_set(&character, &at.branch, at.turn, at.tick, rulebook.as_ref(), mode);
        self.subscribers.notify(&ChangeEvent {
            btt: at.clone(),
            entity: Entity::Graph(character),
            change: Change::Rulebook(rulebook),
        });
        Ok(at)
    }

    /// Rulebook assigned to a graph at `at`.
    pub fn character_rulebook_at(&self, character: &str, at: &Btt) -> Option<RulebookName> {
        self.character_rulebook
            .retrieve_at(&self.tree, &(), &character.to_owned(), at)
            .found()
            .cloned()
    }

    /// Records that `rule` ran for `entity` at the current coordinate.
    ///
    /// Returns `false` if it had already run this turn.
    pub fn handle_rule(&mut self, entity: &RuleEntity, rulebook: &str, rule: &str) -> Result<bool, EngineError> {
        let (rulebook, rule) = (rulebook.to_owned(), rule.to_owned());
        let Btt { branch, turn, tick } = self.btt.clone();
        if !self
            .rules_handled
            .store(entity, &rulebook, &rule, &branch, turn, tick)
        {
            return Ok(false);
        }
        self.query.handled_rule(&HandledRule {
            entity: entity.clone(),
            rulebook,
            rule,
            branch,
            turn,
            tick,
        })?;
        Ok(true)
    }

    /// Rules of `rulebook` that have not yet run for `entity` this turn.
    pub fn unhandled_rules(&self, entity: &RuleEntity, rulebook: &str) -> Vec<RuleName> {
        let rules = self.rulebook_at(rulebook, &self.btt).unwrap_or_default();
        self.rules_handled.unhandled_rulebook_rules(
            entity,
            &rulebook.to_owned(),
            &rules,
            &self.btt.branch,
            self.btt.turn,
            self.btt.tick,
        )
    }

    /// Rules of `rulebook` that already ran for `entity` this turn.
    pub fn handled_rules(&self, entity: &RuleEntity, rulebook: &str) -> Vec<RuleName> {
        self.rules_handled
            .handled_rules(
                entity,
                &rulebook.to_owned(),
                &self.btt.branch,
                self.btt.turn,
                self.btt.tick,
            )
            .cloned()
            .collect()
    }

    // ── planning ────────────────────────────────────────────────────────

    /// Whether a plan is open.
    pub fn is_planning(&self) -> bool {
        self.planning
    }

    /// Opens a plan: until it is committed or rolled back, writes use planning
    /// mode and are journaled.
    pub fn plan(&mut self) -> Result<(), EngineError> {
        if self.planning {
            return Err(HistoryError::PlanInProgress.into());
        }
        self.graph_val.begin_plan();
        self.nodes.begin_plan();
        self.node_val.begin_plan();
        self.edges.begin_plan();
        self.edge_val.begin_plan();
        self.avatars.begin_plan();
        self.rulebooks.begin_plan();
        self.character_rulebook.begin_plan();
        self.planning = true;
        tracing::debug!(btt = %self.btt, "plan opened");
        Ok(())
    }

    /// Makes the open plan irrevocable. Returns how many writes it held.
    pub fn commit_plan(&mut self) -> Result<usize, EngineError> {
        if !self.planning {
            return Err(HistoryError::NoActivePlan.into());
        }
        let n = self.graph_val.commit_plan()
            + self.nodes.commit_plan()
            + self.node_val.commit_plan()
            + self.edges.commit_plan()
            + self.edge_val.commit_plan()
            + self.avatars.commit_plan()
            + self.rulebooks.commit_plan()
            + self.character_rulebook.commit_plan();
        self.planning = false;
        tracing::debug!(writes = n, "plan committed");
        Ok(n)
    }

    /// Undoes every write of the open plan, in the caches and in pending or
    /// already flushed rows. Returns how many writes were undone.
    pub fn rollback_plan(&mut self) -> Result<usize, EngineError> {
        if !self.planning {
            return Err(HistoryError::NoActivePlan.into());
        }
        let tree = &self.tree;
        let query = &mut self.query;
        let mut n = 0_usize;
        let exists = |e: Option<()>| FactValue::Exists(e.is_some());
        for u in self.graph_val.rollback_plan(tree) {
            let key = FactKey::GraphVal {
                graph: u.parent,
                key: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(FactValue::Value));
            n += 1;
        }
        for u in self.node_val.rollback_plan(tree) {
            let key = FactKey::NodeVal {
                graph: u.parent.0,
                node: u.parent.1,
                key: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(FactValue::Value));
            n += 1;
        }
        for u in self.edge_val.rollback_plan(tree) {
            let (graph, orig, dest, idx) = u.parent;
            let key = FactKey::EdgeVal {
                graph,
                orig,
                dest,
                idx,
                key: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(FactValue::Value));
            n += 1;
        }
        for u in self.edges.rollback_plan(tree) {
            let (graph, orig, dest) = u.parent;
            let key = FactKey::Edge {
                graph,
                orig,
                dest,
                idx: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(exists));
            n += 1;
        }
        for u in self.nodes.rollback_plan(tree) {
            let key = FactKey::Node {
                graph: u.parent,
                node: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(exists));
            n += 1;
        }
        for u in self.avatars.rollback_plan(tree) {
            let (character, graph) = u.parent;
            let key = FactKey::Avatar {
                character,
                graph,
                node: u.key,
            };
            query.forget_planned(key, u.branch, u.turn, u.tick, u.restored.map(exists));
            n += 1;
        }
        for u in self.rulebooks.rollback_plan(tree) {
            let key = FactKey::Rulebook { rulebook: u.key };
            let restored = u.restored.map(|r| FactValue::Value(r.map(Value::from)));
            query.forget_planned(key, u.branch, u.turn, u.tick, restored);
            n += 1;
        }
        for u in self.character_rulebook.rollback_plan(tree) {
            let key = FactKey::CharacterRulebook { character: u.key };
            let restored = u.restored.map(|r| FactValue::Value(r.map(Value::String)));
            query.forget_planned(key, u.branch, u.turn, u.tick, restored);
            n += 1;
        }
        self.planning = false;
        tracing::debug!(writes = n, "plan rolled back");
        Ok(n)
    }

    // ── persistence ─────────────────────────────────────────────────────

    /// Reads a global key.
    pub fn global_get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.query.global_get(key)?)
    }

    /// Writes a global key.
    pub fn global_set(&mut self, key: &str, value: Value) -> Result<(), EngineError> {
        Ok(self.query.global_set(key, value)?)
    }

    /// Writes buffered facts to the store. Returns the number of rows written.
    pub fn flush(&mut self) -> Result<usize, EngineError> {
        Ok(self.query.flush()?)
    }

    /// Persists the cursor, branches and turn ends, flushes, and makes
    /// everything durable.
    pub fn commit(&mut self) -> Result<usize, EngineError> {
        let cursor = json!({
            "branch": self.btt.branch.as_str(),
            "turn": self.btt.turn,
            "tick": self.btt.tick,
        });
        self.query.global_set(CURSOR_KEY, cursor)?;
        for branch in self.tree.iter() {
            self.query.set_branch(branch)?;
        }
        for ((branch, turn), tick) in &self.turn_ends {
            self.query.set_turn_end(branch, *turn, *tick)?;
        }
        let rows = self.query.commit()?;
        tracing::info!(rows, btt = %self.btt, "committed");
        Ok(rows)
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        self.query.store()
    }

    /// Unwraps the backing store, discarding unflushed rows.
    pub fn into_store(self) -> S {
        self.query.into_store()
    }

    // ── notification ────────────────────────────────────────────────────

    /// Watches one entity.
    pub fn subscribe(&mut self, entity: Entity, callback: Callback) -> SubscriptionId {
        self.subscribers.subscribe(entity, callback)
    }

    /// Watches every change.
    pub fn subscribe_all(&mut self, callback: Callback) -> SubscriptionId {
        self.subscribers.subscribe_all(callback)
    }

    /// Watches cursor moves.
    pub fn on_time(&mut self, callback: TimeCallback) -> SubscriptionId {
        self.subscribers.on_time(callback)
    }

    /// Drops a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }
}
