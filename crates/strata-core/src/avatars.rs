// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Avatar bookkeeping: which nodes of which graphs stand in for a character.
use std::collections::BTreeSet;

use crate::branch::BranchTree;
use crate::cache::{Cache, PlanUndo};
use crate::history::HistoryError;
use crate::ident::{BranchId, Btt, GraphName, NodeName, Tick, Turn};
use crate::window::WriteMode;

/// `(character, graph)`, the parent key of the forward index.
pub type AvatarParent = (GraphName, GraphName);

/// Time-indexed avatar relation with a reverse "users" index.
#[derive(Clone, Debug)]
pub struct AvatarnessCache {
    avatars: Cache<AvatarParent, NodeName, ()>,
    users: Cache<(GraphName, NodeName), GraphName, ()>,
}

impl Default for AvatarnessCache {
    fn default() -> Self {
        Self {
            avatars: Cache::new("avatars"),
            users: Cache::new("avatar_users"),
        }
    }
}

impl AvatarnessCache {
    /// Records whether `graph.node` is an avatar of `character`.
    pub fn store(
        &mut self,
        tree: &BranchTree,
        character: &GraphName,
        graph: &GraphName,
        node: &NodeName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        is_avatar: bool,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        let fact = is_avatar.then_some(());
        self.avatars.store(
            tree,
            &(character.clone(), graph.clone()),
            node,
            branch,
            turn,
            tick,
            fact,
            mode,
        )?;
        self.users.store(
            tree,
            &(graph.clone(), node.clone()),
            character,
            branch,
            turn,
            tick,
            fact,
            mode,
        )
    }

    /// Whether [`AvatarnessCache::store`] would accept the write, without making it.
    ///
    /// # Errors
    ///
    /// As [`AvatarnessCache::store`].
    pub fn check_store(
        &self,
        character: &GraphName,
        graph: &GraphName,
        node: &NodeName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        self.avatars
            .check_store(&(character.clone(), graph.clone()), node, branch, turn, tick, mode)?;
        self.users
            .check_store(&(graph.clone(), node.clone()), character, branch, turn, tick, mode)
    }

    /// Whether `graph.node` is an avatar of `character` at the coordinate.
    pub fn is_avatar(
        &self,
        tree: &BranchTree,
        character: &GraphName,
        graph: &GraphName,
        node: &NodeName,
        at: &Btt,
    ) -> bool {
        self.avatars
            .retrieve_at(tree, &(character.clone(), graph.clone()), node, at)
            .is_found()
    }

    /// Avatars of `character` in `graph`.
    pub fn avatars<'a>(
        &'a self,
        tree: &'a BranchTree,
        character: &GraphName,
        graph: &GraphName,
        at: &Btt,
    ) -> impl Iterator<Item = &'a NodeName> + 'a {
        self.avatars.iter_keys(
            tree,
            &(character.clone(), graph.clone()),
            &at.branch,
            at.turn,
            at.tick,
            true,
        )
    }

    /// Graphs holding at least one avatar of `character`.
    pub fn avatar_graphs(&self, tree: &BranchTree, character: &GraphName, at: &Btt) -> Vec<GraphName> {
        self.avatars
            .parents()
            .filter(|(c, _)| c == character)
            .filter(|parent| {
                self.avatars
                    .iter_keys(tree, parent, &at.branch, at.turn, at.tick, true)
                    .next()
                    .is_some()
            })
            .map(|(_, g)| g.clone())
            .collect()
    }

    /// Characters that have `graph.node` as an avatar.
    pub fn users<'a>(
        &'a self,
        tree: &'a BranchTree,
        graph: &GraphName,
        node: &NodeName,
        at: &Btt,
    ) -> impl Iterator<Item = &'a GraphName> + 'a {
        self.users.iter_keys(
            tree,
            &(graph.clone(), node.clone()),
            &at.branch,
            at.turn,
            at.tick,
            true,
        )
    }

    /// Candidate avatar facts that may differ between two coordinates.
    pub fn changed_between(&self, tree: &BranchTree, a: &Btt, b: &Btt) -> BTreeSet<(AvatarParent, NodeName)> {
        self.avatars.changed_between(tree, a, b)
    }

    /// Starts a plan.
    pub fn begin_plan(&mut self) {
        self.avatars.begin_plan();
        self.users.begin_plan();
    }

    /// Commits the plan.
    pub fn commit_plan(&mut self) -> usize {
        self.users.commit_plan();
        self.avatars.commit_plan()
    }

    /// Rolls back the plan, returning forward-index undos.
    pub fn rollback_plan(&mut self, tree: &BranchTree) -> Vec<PlanUndo<AvatarParent, NodeName, ()>> {
        self.users.rollback_plan(tree);
        self.avatars.rollback_plan(tree)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reverse_index_tracks_forward_index() {
        let tree = BranchTree::new("trunk");
        let mut c = AvatarnessCache::default();
        let (hero, world) = ("hero".to_owned(), "world".to_owned());
        let trunk = BranchId::from("trunk");
        c.store(&tree, &hero, &world, &"n1".into(), &trunk, 0, 1, true, WriteMode::Default)
            .unwrap();
        c.store(&tree, &hero, &world, &"n1".into(), &trunk, 0, 4, false, WriteMode::Default)
            .unwrap();
        let early = Btt::new("trunk", 0, 2);
        let late = Btt::new("trunk", 0, 5);
        assert!(c.is_avatar(&tree, &hero, &world, &"n1".into(), &early));
        assert_eq!(c.users(&tree, &world, &"n1".into(), &early).count(), 1);
        assert_eq!(c.avatar_graphs(&tree, &hero, &early), vec![world.clone()]);
        assert!(!c.is_avatar(&tree, &hero, &world, &"n1".into(), &late));
        assert_eq!(c.users(&tree, &world, &"n1".into(), &late).count(), 0);
        assert!(c.avatar_graphs(&tree, &hero, &late).is_empty());
    }
}
