// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Branching timeline.
//!
//! Branches form a tree rooted at the trunk. Each non-root branch records the
//! `(turn, tick)` of its parent it diverged from; that link never changes.
//! The only mutable part of a [`Branch`] is its `end_turn`/`end_tick`
//! high-water mark, which only moves forward.
//!
//! # Invariants
//!
//! - Exactly one branch (the trunk) has no parent.
//! - A branch is created from a point its parent had already reached.
//! - Cycles are impossible: parents are fixed at creation and must pre-exist.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::history::HistoryError;
use crate::ident::{BranchId, Btt, Rev, Tick, Turn};

/// One named fork of history.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name.
    pub id: BranchId,
    /// Parent branch; `None` only for the trunk.
    pub parent: Option<BranchId>,
    /// Parent turn this branch diverged at.
    pub parent_turn: Turn,
    /// Parent tick this branch diverged at.
    pub parent_tick: Tick,
    /// Latest turn reached on this branch.
    pub end_turn: Turn,
    /// Latest tick reached within `end_turn`.
    pub end_tick: Tick,
}

impl Branch {
    /// Divergence point as a revision.
    pub const fn parent_rev(&self) -> Rev {
        (self.parent_turn, self.parent_tick)
    }

    /// High-water mark as a revision.
    pub const fn end_rev(&self) -> Rev {
        (self.end_turn, self.end_tick)
    }
}

/// The tree of all known branches.
#[derive(Clone, Debug)]
pub struct BranchTree {
    trunk: BranchId,
    branches: BTreeMap<BranchId, Branch>,
    children: BTreeMap<BranchId, BTreeSet<BranchId>>,
}

impl BranchTree {
    /// Creates a tree holding only `trunk`.
    pub fn new(trunk: impl Into<BranchId>) -> Self {
        let trunk = trunk.into();
        let mut branches = BTreeMap::new();
        branches.insert(
            trunk.clone(),
            Branch {
                id: trunk.clone(),
                parent: None,
                parent_turn: 0,
                parent_tick: 0,
                end_turn: 0,
                end_tick: 0,
            },
        );
        Self {
            trunk,
            branches,
            children: BTreeMap::new(),
        }
    }

    /// The root branch.
    pub fn trunk(&self) -> &BranchId {
        &self.trunk
    }

    /// Whether `branch` is known.
    pub fn contains(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }

    /// Looks up a branch.
    pub fn get(&self, branch: &BranchId) -> Option<&Branch> {
        self.branches.get(branch)
    }

    /// All branches in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Branch> + '_ {
        self.branches.values()
    }

    /// Parent and divergence point of `branch`, `None` for the trunk or unknown branches.
    pub fn parent_of(&self, branch: &BranchId) -> Option<(&BranchId, Turn, Tick)> {
        let b = self.branches.get(branch)?;
        b.parent
            .as_ref()
            .map(|p| (p, b.parent_turn, b.parent_tick))
    }

    /// Checks that `child` could be created from `parent` at `(turn, tick)`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::BranchExists`], [`HistoryError::UnknownBranch`] or
    /// [`HistoryError::BranchFromFuture`].
    pub fn check_create(
        &self,
        child: &BranchId,
        parent: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), HistoryError> {
        if self.branches.contains_key(child) {
            return Err(HistoryError::BranchExists(child.clone()));
        }
        let p = self
            .branches
            .get(parent)
            .ok_or_else(|| HistoryError::UnknownBranch(parent.clone()))?;
        if (turn, tick) > p.end_rev() {
            return Err(HistoryError::BranchFromFuture {
                child: child.clone(),
                parent: parent.clone(),
                turn,
                tick,
                end_turn: p.end_turn,
                end_tick: p.end_tick,
            });
        }
        Ok(())
    }

    /// Creates `child` diverging from `parent` at `(turn, tick)`.
    ///
    /// # Errors
    ///
    /// See [`BranchTree::check_create`].
    pub fn create(
        &mut self,
        child: BranchId,
        parent: BranchId,
        turn: Turn,
        tick: Tick,
    ) -> Result<&Branch, HistoryError> {
        self.check_create(&child, &parent, turn, tick)?;
        tracing::debug!(%child, %parent, turn, tick, "branch created");
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        let branch = Branch {
            id: child.clone(),
            parent: Some(parent),
            parent_turn: turn,
            parent_tick: tick,
            end_turn: turn,
            end_tick: tick,
        };
        Ok(self.branches.entry(child).or_insert(branch))
    }

    /// Rebuilds a tree from persisted branch records.
    ///
    /// Records may arrive in any order. A record for `trunk` replaces the
    /// fresh root; every other branch must reach the trunk through known
    /// parents and diverge no later than its parent's end.
    ///
    /// # Errors
    ///
    /// [`HistoryError::BrokenLineage`] for a cycle, a missing parent, a
    /// second root or a fork from the parent's future.
    pub fn load(
        trunk: impl Into<BranchId>,
        records: impl IntoIterator<Item = Branch>,
    ) -> Result<Self, HistoryError> {
        let mut tree = Self::new(trunk);
        for branch in records {
            if let Some(parent) = &branch.parent {
                tree.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(branch.id.clone());
            }
            tree.branches.insert(branch.id.clone(), branch);
        }
        tree.check_lineage()?;
        Ok(tree)
    }

    fn check_lineage(&self) -> Result<(), HistoryError> {
        let broken = |branch: &BranchId, reason: String| HistoryError::BrokenLineage {
            branch: branch.clone(),
            reason,
        };
        for b in self.branches.values() {
            let Some(parent) = &b.parent else {
                if b.id != self.trunk {
                    return Err(broken(&b.id, "no parent".to_owned()));
                }
                continue;
            };
            let p = self
                .branches
                .get(parent)
                .ok_or_else(|| broken(&b.id, format!("unknown parent {parent}")))?;
            if b.parent_rev() > p.end_rev() {
                return Err(broken(&b.id, format!("forks from {parent} after its end")));
            }
        }
        // Every parent is known, so a chain longer than the tree revisits a branch.
        for id in self.branches.keys() {
            let mut at = id;
            let mut steps = 0;
            while let Some((up, _, _)) = self.parent_of(at) {
                steps += 1;
                if steps > self.branches.len() {
                    return Err(broken(id, "ancestry loops".to_owned()));
                }
                at = up;
            }
        }
        Ok(())
    }

    /// Advances the high-water mark of `branch` to `(turn, tick)` if that is later.
    ///
    /// Returns `true` when the mark moved.
    pub fn extend(&mut self, branch: &BranchId, turn: Turn, tick: Tick) -> bool {
        match self.branches.get_mut(branch) {
            Some(b) if (turn, tick) > b.end_rev() => {
                b.end_turn = turn;
                b.end_tick = tick;
                true
            }
            _ => false,
        }
    }

    /// Direct children of `branch`.
    pub fn children(&self, branch: &BranchId) -> impl Iterator<Item = &BranchId> + '_ {
        self.children.get(branch).into_iter().flatten()
    }

    /// Every descendant of `branch` with the revision, on `branch`, at which its
    /// line of descent leaves it.
    pub fn descendants(&self, branch: &BranchId) -> Vec<(BranchId, Rev)> {
        let mut out = Vec::new();
        let mut stack: Vec<(BranchId, Rev)> = self
            .children(branch)
            .filter_map(|c| self.branches.get(c).map(|b| (c.clone(), b.parent_rev())))
            .collect();
        while let Some((b, leave)) = stack.pop() {
            stack.extend(
                self.children(&b)
                    .map(|c| (c.clone(), leave)),
            );
            out.push((b, leave));
        }
        out
    }

    /// Whether `ancestor` is `branch` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &BranchId, branch: &BranchId) -> bool {
        let mut cur = Some(branch);
        while let Some(b) = cur {
            if b == ancestor {
                return true;
            }
            cur = self.branches.get(b).and_then(|x| x.parent.as_ref());
        }
        false
    }

    /// Lowest branch that is an ancestor of (or equal to) both `a` and `b`.
    pub fn lca(&self, a: &BranchId, b: &BranchId) -> Option<BranchId> {
        let mut cur = Some(a);
        while let Some(x) = cur {
            if self.is_ancestor(x, b) {
                return Some(x.clone());
            }
            cur = self.branches.get(x).and_then(|br| br.parent.as_ref());
        }
        None
    }

    /// Lazily walks from `(branch, turn, tick)` to the root.
    ///
    /// The first item is the starting coordinate; each subsequent item is the
    /// divergence point on the parent, clamped so that an ancestor is never
    /// consulted later than the requested time.
    pub fn walk_to_root(&self, branch: &BranchId, turn: Turn, tick: Tick) -> AncestorWalk<'_> {
        AncestorWalk {
            tree: self,
            next: Some((branch.clone(), (turn, tick))),
        }
    }

    /// [`BranchTree::walk_to_root`] starting at a [`Btt`].
    pub fn walk_from(&self, btt: &Btt) -> AncestorWalk<'_> {
        self.walk_to_root(&btt.branch, btt.turn, btt.tick)
    }
}

/// Iterator over a coordinate and its ancestor coordinates, nearest first.
#[derive(Debug)]
pub struct AncestorWalk<'a> {
    tree: &'a BranchTree,
    next: Option<(BranchId, Rev)>,
}

impl Iterator for AncestorWalk<'_> {
    type Item = (BranchId, Turn, Tick);

    fn next(&mut self) -> Option<Self::Item> {
        let (branch, rev) = self.next.take()?;
        if let Some((parent, pt, pk)) = self.tree.parent_of(&branch) {
            self.next = Some((parent.clone(), rev.min((pt, pk))));
        }
        Some((branch, rev.0, rev.1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tree() -> BranchTree {
        let mut t = BranchTree::new("trunk");
        t.extend(&"trunk".into(), 5, 0);
        t.create("alt".into(), "trunk".into(), 3, 0).unwrap();
        t.extend(&"alt".into(), 8, 2);
        t.create("alt2".into(), "alt".into(), 6, 1).unwrap();
        t
    }

    fn record(id: &str, parent: Option<&str>, parent_turn: Turn) -> Branch {
        Branch {
            id: id.into(),
            parent: parent.map(BranchId::from),
            parent_turn,
            parent_tick: 0,
            end_turn: parent_turn + 1,
            end_tick: 0,
        }
    }

    #[test]
    fn load_accepts_records_in_any_order() {
        let t = BranchTree::load(
            "trunk",
            [
                record("alt2", Some("alt"), 2),
                record("alt", Some("trunk"), 1),
                record("trunk", None, 0),
            ],
        )
        .unwrap();
        assert!(t.is_ancestor(&"trunk".into(), &"alt2".into()));
        assert_eq!(t.get(&"trunk".into()).unwrap().end_rev(), (1, 0));
    }

    #[test]
    fn load_rejects_parent_cycles() {
        let err = BranchTree::load(
            "trunk",
            [record("x", Some("y"), 0), record("y", Some("x"), 0)],
        )
        .unwrap_err();
        assert!(matches!(err, HistoryError::BrokenLineage { .. }), "{err}");
        let err = BranchTree::load("trunk", [record("x", Some("x"), 0)]).unwrap_err();
        assert!(matches!(err, HistoryError::BrokenLineage { .. }), "{err}");
    }

    #[test]
    fn load_rejects_orphans_and_extra_roots() {
        let err = BranchTree::load("trunk", [record("alt", Some("gone"), 0)]).unwrap_err();
        assert!(err.to_string().contains("unknown parent gone"), "{err}");
        let err = BranchTree::load("trunk", [record("main", None, 0)]).unwrap_err();
        assert!(matches!(err, HistoryError::BrokenLineage { branch, .. } if branch == "main".into()));
        let err = BranchTree::load("trunk", [record("alt", Some("trunk"), 4)]).unwrap_err();
        assert!(err.to_string().contains("after its end"), "{err}");
    }

    #[test]
    fn walk_visits_divergence_points_nearest_first() {
        let t = tree();
        let walk: Vec<_> = t.walk_to_root(&"alt2".into(), 9, 0).collect();
        assert_eq!(
            walk,
            vec![
                ("alt2".into(), 9, 0),
                ("alt".into(), 6, 1),
                ("trunk".into(), 3, 0)
            ]
        );
    }

    #[test]
    fn walk_clamps_to_requested_time() {
        let t = tree();
        let walk: Vec<_> = t.walk_to_root(&"alt".into(), 1, 4).collect();
        assert_eq!(walk, vec![("alt".into(), 1, 4), ("trunk".into(), 1, 4)]);
    }

    #[test]
    fn cannot_branch_from_the_future() {
        let mut t = tree();
        let err = t.create("late".into(), "trunk".into(), 6, 0).unwrap_err();
        assert!(matches!(err, HistoryError::BranchFromFuture { end_turn: 5, .. }));
        assert!(!t.contains(&"late".into()));
        let err = t.create("alt".into(), "trunk".into(), 1, 0).unwrap_err();
        assert_eq!(err, HistoryError::BranchExists("alt".into()));
    }

    #[test]
    fn extend_is_monotonic() {
        let mut t = tree();
        assert!(!t.extend(&"trunk".into(), 4, 9));
        assert!(t.extend(&"trunk".into(), 5, 1));
        assert_eq!(t.get(&"trunk".into()).unwrap().end_rev(), (5, 1));
    }

    #[test]
    fn lca_and_descendants() {
        let mut t = tree();
        t.create("side".into(), "trunk".into(), 4, 0).unwrap();
        assert_eq!(t.lca(&"alt2".into(), &"side".into()), Some("trunk".into()));
        assert_eq!(t.lca(&"alt2".into(), &"alt".into()), Some("alt".into()));
        let mut d = t.descendants(&"trunk".into());
        d.sort();
        assert_eq!(
            d,
            vec![
                ("alt".into(), (3, 0)),
                ("alt2".into(), (3, 0)),
                ("side".into(), (4, 0))
            ]
        );
    }
}
