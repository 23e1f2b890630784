// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Edge existence.
//!
//! Edges are recorded per index (`(graph, orig, dest) → idx`). Two derived
//! caches answer adjacency questions: successors `(graph, orig) → dest` and
//! predecessors `(graph, dest) → orig`. A pair-level fact holds while any
//! index between the pair exists; deleting the last surviving index retracts
//! it.
use std::collections::BTreeSet;

use crate::branch::BranchTree;
use crate::cache::{Cache, PlanUndo};
use crate::history::HistoryError;
use crate::ident::{BranchId, Btt, EdgeIndex, GraphName, NodeName, Rev, Tick, Turn};
use crate::window::WriteMode;

/// `(graph, orig, dest)`.
pub type EdgePair = (GraphName, NodeName, NodeName);

/// Composite edge-existence cache.
#[derive(Clone, Debug)]
pub struct EdgesCache {
    indexed: Cache<EdgePair, EdgeIndex, ()>,
    successors: Cache<(GraphName, NodeName), NodeName, ()>,
    predecessors: Cache<(GraphName, NodeName), NodeName, ()>,
}

impl Default for EdgesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgesCache {
    /// Creates empty caches.
    pub fn new() -> Self {
        Self {
            indexed: Cache::new("edges"),
            successors: Cache::new("successors"),
            predecessors: Cache::new("predecessors"),
        }
    }

    /// Disables keycache maintenance on all three caches.
    #[must_use]
    pub fn without_keycache(self) -> Self {
        Self {
            indexed: self.indexed.without_keycache(),
            successors: self.successors.without_keycache(),
            predecessors: self.predecessors.without_keycache(),
        }
    }

    /// Records that edge `idx` from `orig` to `dest` exists (or not).
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfOrder`] for a forward-mode write into the past.
    pub fn store(
        &mut self,
        tree: &BranchTree,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        exists: bool,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        let pair = (graph.clone(), orig.clone(), dest.clone());
        self.indexed
            .store(tree, &pair, &idx, branch, turn, tick, exists.then_some(()), mode)?;
        self.resync_pair(tree, &pair, branch, (turn, tick), mode)
    }

    /// Whether [`EdgesCache::store`] would accept the write, without making it.
    ///
    /// # Errors
    ///
    /// As [`EdgesCache::store`]. Pair-level facts never reject a write.
    pub fn check_store(
        &self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        let pair = (graph.clone(), orig.clone(), dest.clone());
        self.indexed.check_store(&pair, &idx, branch, turn, tick, mode)
    }

    /// Existence facts of edge `idx` on `branch` strictly after `rev`.
    pub fn facts_after(
        &self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        branch: &BranchId,
        rev: Rev,
    ) -> Vec<(Rev, bool)> {
        let pair = (graph.clone(), orig.clone(), dest.clone());
        self.indexed.facts_after(&pair, &idx, branch, rev)
    }

    /// Every edge ever recorded with `node` at either end, whatever its state.
    pub fn incident_ever(&self, graph: &GraphName, node: &NodeName) -> BTreeSet<(NodeName, NodeName, EdgeIndex)> {
        let at = (graph.clone(), node.clone());
        let outgoing = self
            .successors
            .keys_ever(&at)
            .map(|dest| (node.clone(), dest.clone()));
        let incoming = self
            .predecessors
            .keys_ever(&at)
            .map(|orig| (orig.clone(), node.clone()));
        let mut out = BTreeSet::new();
        for (orig, dest) in outgoing.chain(incoming) {
            let pair = (graph.clone(), orig, dest);
            for idx in self.indexed.keys_ever(&pair) {
                out.insert((pair.1.clone(), pair.2.clone(), *idx));
            }
        }
        out
    }

    /// Re-derives pair-level facts that may observe an index write at `from`.
    fn resync_pair(
        &mut self,
        tree: &BranchTree,
        pair: &EdgePair,
        branch: &BranchId,
        from: Rev,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        // pair facts may already lie ahead of an index's own latest write
        let mode = match mode {
            WriteMode::Forward => WriteMode::Planning,
            other => other,
        };
        let here = self.any_index(tree, pair, branch, from);
        self.write_pair(tree, pair, branch, from, here, mode)?;
        let mut targets = vec![(branch.clone(), self.fact_revs(pair, branch, from))];
        for (child, leaves_at) in tree.descendants(branch) {
            if leaves_at >= from {
                let revs = self.fact_revs(pair, &child, (0, 0));
                targets.push((child, revs));
            }
        }
        for (b, revs) in targets {
            for rev in revs {
                let exists = self.any_index(tree, pair, &b, rev);
                self.write_pair(tree, pair, &b, rev, exists, WriteMode::Planning)?;
            }
        }
        Ok(())
    }

    /// Revisions after `after` (or at it, for `(0, 0)`) holding index or pair facts on `branch`.
    fn fact_revs(&self, pair: &EdgePair, branch: &BranchId, after: Rev) -> BTreeSet<Rev> {
        let keep = |rev: &Rev| *rev > after || (after == (0, 0) && *rev == (0, 0));
        let mut revs: BTreeSet<Rev> = self
            .indexed
            .keys_ever(pair)
            .filter_map(|idx| self.indexed.history(pair, idx, branch))
            .flat_map(|h| h.iter().map(|(rev, _)| rev))
            .filter(keep)
            .collect();
        let (g, o, d) = pair;
        if let Some(h) = self.successors.history(&(g.clone(), o.clone()), d, branch) {
            revs.extend(h.iter().map(|(rev, _)| rev).filter(keep));
        }
        revs
    }

    fn any_index(&self, tree: &BranchTree, pair: &EdgePair, branch: &BranchId, rev: Rev) -> bool {
        self.indexed
            .iter_keys(tree, pair, branch, rev.0, rev.1, true)
            .next()
            .is_some()
    }

    fn write_pair(
        &mut self,
        tree: &BranchTree,
        pair: &EdgePair,
        branch: &BranchId,
        rev: Rev,
        exists: bool,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        let (g, o, d) = pair;
        let fact = exists.then_some(());
        self.successors
            .store(tree, &(g.clone(), o.clone()), d, branch, rev.0, rev.1, fact, mode)?;
        self.predecessors
            .store(tree, &(g.clone(), d.clone()), o, branch, rev.0, rev.1, fact, mode)
    }

    /// Whether any edge from `orig` to `dest` exists at the coordinate.
    pub fn has_edge(
        &self,
        tree: &BranchTree,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        at: &Btt,
    ) -> bool {
        self.successors
            .retrieve_at(tree, &(graph.clone(), orig.clone()), dest, at)
            .is_found()
    }

    /// Whether edge `idx` from `orig` to `dest` exists at the coordinate.
    pub fn has_index(
        &self,
        tree: &BranchTree,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        at: &Btt,
    ) -> bool {
        self.indexed
            .retrieve_at(tree, &(graph.clone(), orig.clone(), dest.clone()), &idx, at)
            .is_found()
    }

    /// Destinations reachable from `orig` at the coordinate.
    pub fn successors<'a>(
        &'a self,
        tree: &'a BranchTree,
        graph: &GraphName,
        orig: &NodeName,
        at: &Btt,
    ) -> impl Iterator<Item = &'a NodeName> + 'a {
        self.successors.iter_keys(
            tree,
            &(graph.clone(), orig.clone()),
            &at.branch,
            at.turn,
            at.tick,
            true,
        )
    }

    /// Origins with an edge into `dest` at the coordinate.
    pub fn predecessors<'a>(
        &'a self,
        tree: &'a BranchTree,
        graph: &GraphName,
        dest: &NodeName,
        at: &Btt,
    ) -> impl Iterator<Item = &'a NodeName> + 'a {
        self.predecessors.iter_keys(
            tree,
            &(graph.clone(), dest.clone()),
            &at.branch,
            at.turn,
            at.tick,
            true,
        )
    }

    /// Live edge indices from `orig` to `dest` at the coordinate.
    pub fn indices<'a>(
        &'a self,
        tree: &'a BranchTree,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        at: &Btt,
    ) -> impl Iterator<Item = &'a EdgeIndex> + 'a {
        self.indexed.iter_keys(
            tree,
            &(graph.clone(), orig.clone(), dest.clone()),
            &at.branch,
            at.turn,
            at.tick,
            true,
        )
    }

    /// Number of destinations reachable from `orig` at the coordinate.
    pub fn count_successors(&self, tree: &BranchTree, graph: &GraphName, orig: &NodeName, at: &Btt) -> usize {
        self.successors(tree, graph, orig, at).count()
    }

    /// One past the highest index ever used between `orig` and `dest`, on any branch.
    pub fn next_index(&self, graph: &GraphName, orig: &NodeName, dest: &NodeName) -> EdgeIndex {
        self.indexed
            .keys_ever(&(graph.clone(), orig.clone(), dest.clone()))
            .max()
            .map_or(0, |idx| idx + 1)
    }

    /// Every `(graph, orig, dest)` ever written, for graph-wide scans.
    pub fn pairs(&self) -> impl Iterator<Item = &EdgePair> + '_ {
        self.indexed.parents()
    }

    /// Candidate `(graph, orig, dest)` pairs whose pair-level fact may differ.
    pub fn pairs_changed_between(&self, tree: &BranchTree, a: &Btt, b: &Btt) -> BTreeSet<EdgePair> {
        self.successors
            .changed_between(tree, a, b)
            .into_iter()
            .map(|((g, o), d)| (g, o, d))
            .collect()
    }

    /// Candidate `(pair, idx)` entries whose indexed fact may differ.
    pub fn indices_changed_between(
        &self,
        tree: &BranchTree,
        a: &Btt,
        b: &Btt,
    ) -> BTreeSet<(EdgePair, EdgeIndex)> {
        self.indexed.changed_between(tree, a, b)
    }

    /// Starts a plan on all three caches.
    pub fn begin_plan(&mut self) {
        self.indexed.begin_plan();
        self.successors.begin_plan();
        self.predecessors.begin_plan();
    }

    /// Commits the plan on all three caches.
    pub fn commit_plan(&mut self) -> usize {
        self.successors.commit_plan();
        self.predecessors.commit_plan();
        self.indexed.commit_plan()
    }

    /// Rolls back the plan; only indexed undos are returned since pair-level
    /// facts are derived.
    pub fn rollback_plan(&mut self, tree: &BranchTree) -> Vec<PlanUndo<EdgePair, EdgeIndex, ()>> {
        let undone = self.indexed.rollback_plan(tree);
        self.successors.rollback_plan(tree);
        self.predecessors.rollback_plan(tree);
        undone
    }
}
