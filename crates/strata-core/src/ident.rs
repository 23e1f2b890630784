// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and coordinate types.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute values stored on graphs, nodes and edges.
///
/// `Value::Null` is never stored: the engine uses absence to mean "deleted".
pub type Value = serde_json::Value;

/// Coarse revision counter; a turn groups many ticks.
pub type Turn = u64;

/// Fine revision counter within one turn.
pub type Tick = u64;

/// `(turn, tick)` pair; the ordering key within a single branch.
pub type Rev = (Turn, Tick);

/// Name of a graph (a "character" in rule-facing code).
pub type GraphName = String;

/// Name of a node within a graph.
pub type NodeName = String;

/// Attribute key.
pub type Key = String;

/// Name of a rulebook.
pub type RulebookName = String;

/// Name of a rule within a rulebook.
pub type RuleName = String;

/// Index distinguishing parallel edges between the same pair of nodes.
pub type EdgeIndex = u64;

/// Named fork of history.
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    /// Returns the branch name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BranchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address of a point in history: `(branch, turn, tick)`.
///
/// Only coordinates on the same branch (or along an ancestor chain) are
/// temporally comparable, so `Btt` deliberately does not implement `Ord`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Btt {
    /// Branch the coordinate lives on.
    pub branch: BranchId,
    /// Turn within the branch.
    pub turn: Turn,
    /// Tick within the turn.
    pub tick: Tick,
}

impl Btt {
    /// Builds a coordinate.
    pub fn new(branch: impl Into<BranchId>, turn: Turn, tick: Tick) -> Self {
        Self {
            branch: branch.into(),
            turn,
            tick,
        }
    }

    /// The `(turn, tick)` pair, comparable against other revisions on the same branch.
    #[must_use]
    pub const fn rev(&self) -> Rev {
        (self.turn, self.tick)
    }

    /// Another revision on the same branch.
    #[must_use]
    pub fn at(&self, (turn, tick): Rev) -> Self {
        Self {
            branch: self.branch.clone(),
            turn,
            tick,
        }
    }
}

impl fmt::Display for Btt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.branch, self.turn, self.tick)
    }
}

/// Graph flavour. Plain digraphs only ever use edge index 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub enum GraphKind {
    /// At most one edge per ordered node pair.
    #[default]
    DiGraph,
    /// Any number of indexed edges per ordered node pair.
    MultiDiGraph,
}

impl GraphKind {
    /// Whether parallel edges are permitted.
    #[must_use]
    pub const fn is_multigraph(self) -> bool {
        matches!(self, Self::MultiDiGraph)
    }
}
