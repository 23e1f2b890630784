// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistence boundary.
//!
//! The engine treats storage as an ordered fact log: rows keyed by
//! `(fact key, branch, turn, tick)`. [`FactStore`] is the only seam a backend
//! has to implement; [`MemoryFactStore`] is the in-tree implementation, with an
//! optional CBOR file image written atomically on commit.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::branch::Branch;
use crate::ident::{BranchId, EdgeIndex, GraphKind, GraphName, Key, NodeName, Rev, RulebookName, Tick, Turn, Value};
use crate::rules::HandledRule;

/// Identifies one persisted fact family member.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum FactKey {
    /// Node existence.
    Node { graph: GraphName, node: NodeName },
    /// Indexed edge existence.
    Edge {
        graph: GraphName,
        orig: NodeName,
        dest: NodeName,
        idx: EdgeIndex,
    },
    /// Graph attribute.
    GraphVal { graph: GraphName, key: Key },
    /// Node attribute.
    NodeVal {
        graph: GraphName,
        node: NodeName,
        key: Key,
    },
    /// Edge attribute.
    EdgeVal {
        graph: GraphName,
        orig: NodeName,
        dest: NodeName,
        idx: EdgeIndex,
        key: Key,
    },
    /// Avatar relation.
    Avatar {
        character: GraphName,
        graph: GraphName,
        node: NodeName,
    },
    /// Rule list of a rulebook.
    Rulebook { rulebook: RulebookName },
    /// Rulebook assigned to a graph.
    CharacterRulebook { character: GraphName },
}

/// Fact family, in flush order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum FactKind {
    /// [`FactKey::Node`].
    Node,
    /// [`FactKey::Edge`].
    Edge,
    /// [`FactKey::GraphVal`].
    GraphVal,
    /// [`FactKey::NodeVal`].
    NodeVal,
    /// [`FactKey::EdgeVal`].
    EdgeVal,
    /// [`FactKey::Avatar`].
    Avatar,
    /// [`FactKey::Rulebook`].
    Rulebook,
    /// [`FactKey::CharacterRulebook`].
    CharacterRulebook,
}

impl FactKind {
    /// Every kind, in flush and load order.
    pub const ALL: [Self; 8] = [
        Self::Node,
        Self::Edge,
        Self::GraphVal,
        Self::NodeVal,
        Self::EdgeVal,
        Self::Avatar,
        Self::Rulebook,
        Self::CharacterRulebook,
    ];
}

impl FactKey {
    /// Family this key belongs to.
    pub const fn kind(&self) -> FactKind {
        match self {
            Self::Node { .. } => FactKind::Node,
            Self::Edge { .. } => FactKind::Edge,
            Self::GraphVal { .. } => FactKind::GraphVal,
            Self::NodeVal { .. } => FactKind::NodeVal,
            Self::EdgeVal { .. } => FactKind::EdgeVal,
            Self::Avatar { .. } => FactKind::Avatar,
            Self::Rulebook { .. } => FactKind::Rulebook,
            Self::CharacterRulebook { .. } => FactKind::CharacterRulebook,
        }
    }
}

/// Persisted payload.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FactValue {
    /// Existence flag.
    Exists(bool),
    /// Attribute value; `None` records a deletion.
    Value(Option<Value>),
}

/// One row of the fact log.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Fact {
    /// What the row is about.
    pub key: FactKey,
    /// Branch.
    pub branch: BranchId,
    /// Turn.
    pub turn: Turn,
    /// Tick.
    pub tick: Tick,
    /// Payload.
    pub value: FactValue,
}

/// A `(key, branch, turn, tick)` address without a payload.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct FactCoord {
    /// What the row is about.
    pub key: FactKey,
    /// Branch.
    pub branch: BranchId,
    /// Turn.
    pub turn: Turn,
    /// Tick.
    pub tick: Tick,
}

/// Everything one flush writes, applied as a unit.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FlushBatch {
    /// Exact rows to delete (rolled-back plans); applied first.
    pub erasures: Vec<FactCoord>,
    /// Delete every row of `key` on `branch` at or after `(turn, tick)`.
    pub truncations: Vec<FactCoord>,
    /// Rows to insert, replacing any row at the same address.
    pub facts: Vec<Fact>,
}

impl FlushBatch {
    /// Whether the batch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.erasures.is_empty() && self.truncations.is_empty() && self.facts.is_empty()
    }
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The image could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
    /// The image could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// Insert hit an existing row.
    #[error("{0} already exists")]
    Conflict(String),
    /// Update found no row.
    #[error("{0} not found")]
    NotFound(String),
    /// Image written by an incompatible version.
    #[error("unsupported store image version {0}")]
    Version(u32),
    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// Ordered fact log the engine flushes to and cold-starts from.
pub trait FactStore: Send {
    /// Applies erasures, then truncations, then inserts, as one unit.
    ///
    /// # Errors
    ///
    /// A failed apply must leave the store as it was.
    fn apply(&mut self, batch: &FlushBatch) -> Result<(), StoreError>;

    /// Every row of one family, ordered by key then `(branch, turn, tick)`.
    fn dump(&self, kind: FactKind) -> Result<Vec<Fact>, StoreError>;

    /// Inserts a branch record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the branch is already stored.
    fn insert_branch(&mut self, branch: &Branch) -> Result<(), StoreError>;

    /// Replaces a stored branch record.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the branch is not stored.
    fn update_branch(&mut self, branch: &Branch) -> Result<(), StoreError>;

    /// Every stored branch.
    fn branches(&self) -> Result<Vec<Branch>, StoreError>;

    /// Registers a graph.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the name is taken.
    fn insert_graph(&mut self, name: &GraphName, kind: GraphKind) -> Result<(), StoreError>;

    /// Every registered graph.
    fn graphs(&self) -> Result<Vec<(GraphName, GraphKind)>, StoreError>;

    /// Reads a global key.
    fn global_get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Writes a global key.
    fn global_set(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Every global key.
    fn global_items(&self) -> Result<Vec<(String, Value)>, StoreError>;

    /// Records the last tick of a turn.
    fn set_turn_end(&mut self, branch: &BranchId, turn: Turn, tick: Tick) -> Result<(), StoreError>;

    /// Every recorded turn end.
    fn turn_ends(&self) -> Result<Vec<(BranchId, Turn, Tick)>, StoreError>;

    /// Records a handled rule.
    fn insert_handled_rule(&mut self, row: &HandledRule) -> Result<(), StoreError>;

    /// Every handled rule.
    fn handled_rules(&self) -> Result<Vec<HandledRule>, StoreError>;

    /// Makes everything written so far durable.
    fn commit(&mut self) -> Result<(), StoreError>;
}

type FactLog = BTreeMap<FactKey, BTreeMap<BranchId, BTreeMap<Rev, FactValue>>>;

const IMAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoreImage {
    version: u32,
    graphs: Vec<(GraphName, GraphKind)>,
    branches: Vec<Branch>,
    global: Vec<(String, Value)>,
    turn_ends: Vec<(BranchId, Turn, Tick)>,
    handled: Vec<HandledRule>,
    facts: Vec<Fact>,
}

/// BTreeMap-backed [`FactStore`], optionally mirrored to a CBOR file.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    path: Option<PathBuf>,
    facts: FactLog,
    branches: BTreeMap<BranchId, Branch>,
    graphs: BTreeMap<GraphName, GraphKind>,
    global: BTreeMap<String, Value>,
    turn_ends: BTreeMap<(BranchId, Turn), Tick>,
    handled: BTreeSet<HandledRule>,
}

impl MemoryFactStore {
    /// Creates an empty, purely in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or prepares to create) a file-backed store at `path`.
    ///
    /// # Errors
    ///
    /// I/O or decode errors when an existing image cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path: Some(path.clone()),
            ..Self::default()
        };
        if !path.exists() {
            return Ok(store);
        }
        let bytes = std::fs::read(&path)?;
        let image: StoreImage = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if image.version != IMAGE_VERSION {
            return Err(StoreError::Version(image.version));
        }
        store.graphs = image.graphs.into_iter().collect();
        store.branches = image
            .branches
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect();
        store.global = image.global.into_iter().collect();
        store.turn_ends = image
            .turn_ends
            .into_iter()
            .map(|(b, r, t)| ((b, r), t))
            .collect();
        store.handled = image.handled.into_iter().collect();
        for fact in image.facts {
            store.insert_fact(fact);
        }
        tracing::debug!(path = %path.display(), facts = store.len(), "fact store opened");
        Ok(store)
    }

    /// File backing this store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored fact rows.
    pub fn len(&self) -> usize {
        self.facts
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    /// Whether no fact rows are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_fact(&mut self, fact: Fact) {
        self.facts
            .entry(fact.key)
            .or_default()
            .entry(fact.branch)
            .or_default()
            .insert((fact.turn, fact.tick), fact.value);
    }

    fn image(&self) -> StoreImage {
        StoreImage {
            version: IMAGE_VERSION,
            graphs: self.graphs.iter().map(|(g, k)| (g.clone(), *k)).collect(),
            branches: self.branches.values().cloned().collect(),
            global: self
                .global
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            turn_ends: self
                .turn_ends
                .iter()
                .map(|((b, r), t)| (b.clone(), *r, *t))
                .collect(),
            handled: self.handled.iter().cloned().collect(),
            facts: FactKind::ALL
                .into_iter()
                .flat_map(|kind| self.rows(kind))
                .collect(),
        }
    }

    fn rows(&self, kind: FactKind) -> Vec<Fact> {
        self.facts
            .iter()
            .filter(|(key, _)| key.kind() == kind)
            .flat_map(|(key, branches)| {
                branches.iter().flat_map(move |(branch, revs)| {
                    revs.iter().map(move |((turn, tick), value)| Fact {
                        key: key.clone(),
                        branch: branch.clone(),
                        turn: *turn,
                        tick: *tick,
                        value: value.clone(),
                    })
                })
            })
            .collect()
    }
}

impl FactStore for MemoryFactStore {
    fn apply(&mut self, batch: &FlushBatch) -> Result<(), StoreError> {
        for e in &batch.erasures {
            if let Some(revs) = self
                .facts
                .get_mut(&e.key)
                .and_then(|b| b.get_mut(&e.branch))
            {
                revs.remove(&(e.turn, e.tick));
            }
        }
        for t in &batch.truncations {
            if let Some(revs) = self
                .facts
                .get_mut(&t.key)
                .and_then(|b| b.get_mut(&t.branch))
            {
                let _dropped = revs.split_off(&(t.turn, t.tick));
            }
        }
        for fact in &batch.facts {
            self.insert_fact(fact.clone());
        }
        Ok(())
    }

    fn dump(&self, kind: FactKind) -> Result<Vec<Fact>, StoreError> {
        Ok(self.rows(kind))
    }

    fn insert_branch(&mut self, branch: &Branch) -> Result<(), StoreError> {
        if self.branches.contains_key(&branch.id) {
            return Err(StoreError::Conflict(format!("branch {}", branch.id)));
        }
        self.branches.insert(branch.id.clone(), branch.clone());
        Ok(())
    }

    fn update_branch(&mut self, branch: &Branch) -> Result<(), StoreError> {
        match self.branches.get_mut(&branch.id) {
            Some(stored) => {
                *stored = branch.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("branch {}", branch.id))),
        }
    }

    fn branches(&self) -> Result<Vec<Branch>, StoreError> {
        Ok(self.branches.values().cloned().collect())
    }

    fn insert_graph(&mut self, name: &GraphName, kind: GraphKind) -> Result<(), StoreError> {
        if self.graphs.contains_key(name) {
            return Err(StoreError::Conflict(format!("graph {name}")));
        }
        self.graphs.insert(name.clone(), kind);
        Ok(())
    }

    fn graphs(&self) -> Result<Vec<(GraphName, GraphKind)>, StoreError> {
        Ok(self.graphs.iter().map(|(g, k)| (g.clone(), *k)).collect())
    }

    fn global_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.global.get(key).cloned())
    }

    fn global_set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.global.insert(key.to_owned(), value);
        Ok(())
    }

    fn global_items(&self) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .global
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn set_turn_end(&mut self, branch: &BranchId, turn: Turn, tick: Tick) -> Result<(), StoreError> {
        self.turn_ends.insert((branch.clone(), turn), tick);
        Ok(())
    }

    fn turn_ends(&self) -> Result<Vec<(BranchId, Turn, Tick)>, StoreError> {
        Ok(self
            .turn_ends
            .iter()
            .map(|((b, r), t)| (b.clone(), *r, *t))
            .collect())
    }

    fn insert_handled_rule(&mut self, row: &HandledRule) -> Result<(), StoreError> {
        self.handled.insert(row.clone());
        Ok(())
    }

    fn handled_rules(&self) -> Result<Vec<HandledRule>, StoreError> {
        Ok(self.handled.iter().cloned().collect())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.image(), &mut buf)
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), bytes = buf.len(), "fact store image written");
        Ok(())
    }
}
