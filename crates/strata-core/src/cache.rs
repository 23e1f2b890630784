// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Generic versioned cache.
//!
//! A [`Cache`] maps `(parent, key) → branch → turn → tick → fact`, where a
//! fact is `Some(value)` or `None` for a deletion. `parent` is every component
//! of the entity key but the last (`graph`, `(graph, node)`, ...), so all keys
//! of one cache share the same arity by construction.
//!
//! # Key Concepts
//!
//! - **Retrieval** walks the branch tree nearest-first and stops at the first
//!   fact found; a deletion is authoritative and ends the walk.
//! - **Keycache**: per `(parent, branch)`, a history of "keys present" snapshots
//!   recorded at every revision a key under that parent was written. A write
//!   corrects the written key's membership in every later snapshot of its
//!   branch and of descendant branches that observe it.
//! - **Settings index**: per branch, which `(parent, key)` pairs were written at
//!   each exact revision. Diffs use it to enumerate candidates in time
//!   proportional to recorded changes rather than world size.
//! - **Plan journal**: while a plan is open, planning-mode writes remember the
//!   exact entry they replaced so the plan can be rolled back.
use std::collections::{BTreeMap, BTreeSet};

use crate::branch::BranchTree;
use crate::history::{HistoryError, Lookup};
use crate::ident::{BranchId, Btt, Rev, Tick, Turn};
use crate::window::{History, WriteMode};

type Histories<K, V> = BTreeMap<K, BTreeMap<BranchId, History<Option<V>>>>;

/// One planning-mode write undone by [`Cache::rollback_plan`].
#[derive(Clone, Debug, PartialEq)]
pub struct PlanUndo<P, K, V> {
    /// Parent part of the entity key.
    pub parent: P,
    /// Final key component.
    pub key: K,
    /// Branch written.
    pub branch: BranchId,
    /// Turn written.
    pub turn: Turn,
    /// Tick written.
    pub tick: Tick,
    /// Exact entry restored at the coordinate; `None` when the planned entry was
    /// simply removed.
    pub restored: Option<Option<V>>,
}

/// Versioned `(parent, key)` → value store over a branching timeline.
#[derive(Clone, Debug)]
pub struct Cache<P, K, V> {
    name: &'static str,
    histories: BTreeMap<P, Histories<K, V>>,
    keycache: BTreeMap<P, BTreeMap<BranchId, History<BTreeSet<K>>>>,
    settings: BTreeMap<BranchId, History<BTreeSet<(P, K)>>>,
    journal: Option<Vec<PlanUndo<P, K, V>>>,
    use_keycache: bool,
}

impl<P, K, V> Cache<P, K, V>
where
    P: Ord + Clone,
    K: Ord + Clone,
    V: Clone,
{
    /// Creates an empty cache; `name` only appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            histories: BTreeMap::new(),
            keycache: BTreeMap::new(),
            settings: BTreeMap::new(),
            journal: None,
            use_keycache: true,
        }
    }

    /// Disables keycache maintenance; iteration always rescans.
    #[must_use]
    pub fn without_keycache(mut self) -> Self {
        self.use_keycache = false;
        self.keycache.clear();
        self
    }

    /// Name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Records `value` (`None` = delete) for `(parent, key)` at the coordinate.
    ///
    /// In [`WriteMode::Default`] every fact of this key recorded later on the
    /// same branch is discarded first. Sibling keys are never touched.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfOrder`] for a forward-mode write into the past.
    pub fn store(
        &mut self,
        tree: &BranchTree,
        parent: &P,
        key: &K,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        value: Option<V>,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        let journaling = mode == WriteMode::Planning && self.journal.is_some();
        let (removed, previous) = {
            let history = self
                .histories
                .entry(parent.clone())
                .or_default()
                .entry(key.clone())
                .or_default()
                .entry(branch.clone())
                .or_default();
            let previous = journaling.then(|| history.get_exact(turn, tick).cloned());
            (history.store(turn, tick, value, mode)?, previous)
        };
        if !removed.is_empty() {
            tracing::debug!(
                cache = self.name,
                %branch,
                turn,
                tick,
                removed = removed.len(),
                "paradox: truncated later history of key"
            );
            for (rev, _) in &removed {
                self.unmark_setting(branch, *rev, parent, key);
            }
        }
        self.mark_setting(branch, (turn, tick), parent, key);
        if let (Some(journal), Some(restored)) = (self.journal.as_mut(), previous) {
            journal.push(PlanUndo {
                parent: parent.clone(),
                key: key.clone(),
                branch: branch.clone(),
                turn,
                tick,
                restored,
            });
        }
        if self.use_keycache {
            self.reindex_key(tree, parent, key, branch, (turn, tick));
        }
        Ok(())
    }

    /// Whether [`Cache::store`] would accept the write, without making it.
    ///
    /// # Errors
    ///
    /// As [`Cache::store`].
    pub fn check_store(
        &self,
        parent: &P,
        key: &K,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        mode: WriteMode,
    ) -> Result<(), HistoryError> {
        self.history(parent, key, branch)
            .map_or(Ok(()), |h| h.check(turn, tick, mode))
    }

    /// Facts recorded for `(parent, key)` on `branch` strictly after `rev`;
    /// `true` marks a value, `false` a deletion.
    pub fn facts_after(&self, parent: &P, key: &K, branch: &BranchId, rev: Rev) -> Vec<(Rev, bool)> {
        self.history(parent, key, branch)
            .map(|h| h.after(rev).map(|(r, fact)| (r, fact.is_some())).collect())
            .unwrap_or_default()
    }

    /// Fact visible for `(parent, key)` at the coordinate.
    pub fn retrieve(
        &self,
        tree: &BranchTree,
        parent: &P,
        key: &K,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> Lookup<&V> {
        lookup(&self.histories, tree, parent, key, branch, (turn, tick))
    }

    /// [`Cache::retrieve`] at a [`Btt`].
    pub fn retrieve_at(&self, tree: &BranchTree, parent: &P, key: &K, at: &Btt) -> Lookup<&V> {
        self.retrieve(tree, parent, key, &at.branch, at.turn, at.tick)
    }

    /// Whether `(parent, key)` holds a value (not deleted, not missing) at the coordinate.
    pub fn contains(
        &self,
        tree: &BranchTree,
        parent: &P,
        key: &K,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> bool {
        self.retrieve(tree, parent, key, branch, turn, tick).is_found()
    }

    /// Keys under `parent` holding a value at the coordinate, in key order.
    ///
    /// With `forward` set the keycache snapshot is used; otherwise every key
    /// ever written under `parent` is rechecked.
    pub fn iter_keys<'a>(
        &'a self,
        tree: &'a BranchTree,
        parent: &P,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        forward: bool,
    ) -> Box<dyn Iterator<Item = &'a K> + 'a> {
        if forward && self.use_keycache {
            let snapshot = visible_keys(&self.keycache, tree, parent, branch, (turn, tick));
            return Box::new(snapshot.into_iter().flatten());
        }
        let branch = branch.clone();
        Box::new(
            self.histories
                .get(parent)
                .into_iter()
                .flatten()
                .filter(move |(_, by_branch)| {
                    lookup_in(by_branch, tree, &branch, (turn, tick)).is_found()
                })
                .map(|(k, _)| k),
        )
    }

    /// Number of keys [`Cache::iter_keys`] would yield.
    pub fn count(
        &self,
        tree: &BranchTree,
        parent: &P,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> usize {
        self.iter_keys(tree, parent, branch, turn, tick, true).count()
    }

    /// Every key ever written under `parent`, whatever its current state.
    pub fn keys_ever(&self, parent: &P) -> impl Iterator<Item = &K> + '_ {
        self.histories.get(parent).into_iter().flat_map(BTreeMap::keys)
    }

    /// Every parent that has ever had a key written under it.
    pub fn parents(&self) -> impl Iterator<Item = &P> + '_ {
        self.histories.keys()
    }

    /// Raw per-branch history of one key.
    pub fn history(&self, parent: &P, key: &K, branch: &BranchId) -> Option<&History<Option<V>>> {
        self.histories.get(parent)?.get(key)?.get(branch)
    }

    /// Latest turn `<= turn` at which `(parent, key)` changed on `branch`.
    pub fn turn_before(&self, parent: &P, key: &K, branch: &BranchId, turn: Turn) -> Option<Turn> {
        self.history(parent, key, branch)?.turn_before(turn)
    }

    /// Earliest turn `> turn` at which `(parent, key)` changed on `branch`.
    pub fn turn_after(&self, parent: &P, key: &K, branch: &BranchId, turn: Turn) -> Option<Turn> {
        self.history(parent, key, branch)?.turn_after(turn)
    }

    /// Candidate `(parent, key)` pairs whose visible fact may differ between `a` and `b`.
    ///
    /// Collects the settings recorded along the path `a → lca → b`. The result
    /// is a superset of the real changes; callers compare values.
    pub fn changed_between(&self, tree: &BranchTree, a: &Btt, b: &Btt) -> BTreeSet<(P, K)> {
        let mut out = BTreeSet::new();
        let Some(meet) = tree.lca(&a.branch, &b.branch) else {
            return out;
        };
        let mut at_meet = [(0, 0); 2];
        for (side, from) in [a, b].into_iter().enumerate() {
            for (branch, turn, tick) in tree.walk_from(from) {
                if branch == meet {
                    at_meet[side] = (turn, tick);
                    break;
                }
                if let Some(h) = self.settings.get(&branch) {
                    for (_, set) in h.iter().take_while(|(rev, _)| *rev <= (turn, tick)) {
                        out.extend(set.iter().cloned());
                    }
                }
            }
        }
        let lo = at_meet[0].min(at_meet[1]);
        let hi = at_meet[0].max(at_meet[1]);
        if let Some(h) = self.settings.get(&meet) {
            for (_, set) in h.revs_between(lo, hi) {
                out.extend(set.iter().cloned());
            }
        }
        out
    }

    /// Starts journaling planning-mode writes.
    pub fn begin_plan(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Stops journaling; the planned writes become permanent.
    ///
    /// Returns how many writes the plan held.
    pub fn commit_plan(&mut self) -> usize {
        self.journal.take().map_or(0, |j| j.len())
    }

    /// Undoes every planning-mode write since [`Cache::begin_plan`], newest first.
    pub fn rollback_plan(&mut self, tree: &BranchTree) -> Vec<PlanUndo<P, K, V>> {
        let journal = self.journal.take().unwrap_or_default();
        let mut undone = Vec::with_capacity(journal.len());
        for entry in journal.into_iter().rev() {
            let rev = (entry.turn, entry.tick);
            let emptied = match self
                .histories
                .get_mut(&entry.parent)
                .and_then(|m| m.get_mut(&entry.key))
                .and_then(|m| m.get_mut(&entry.branch))
            {
                Some(history) => match &entry.restored {
                    Some(prev) => {
                        history.insert_exact(entry.turn, entry.tick, prev.clone());
                        false
                    }
                    None => {
                        history.remove_exact(entry.turn, entry.tick);
                        true
                    }
                },
                None => false,
            };
            if emptied {
                self.unmark_setting(&entry.branch, rev, &entry.parent, &entry.key);
            }
            if self.use_keycache {
                self.reindex_key(tree, &entry.parent, &entry.key, &entry.branch, rev);
            }
            undone.push(entry);
        }
        undone
    }

    fn mark_setting(&mut self, branch: &BranchId, rev: Rev, parent: &P, key: &K) {
        let h = self.settings.entry(branch.clone()).or_default();
        if let Some(set) = h.get_exact_mut(rev.0, rev.1) {
            set.insert((parent.clone(), key.clone()));
        } else {
            h.insert_exact(rev.0, rev.1, BTreeSet::from([(parent.clone(), key.clone())]));
        }
    }

    fn unmark_setting(&mut self, branch: &BranchId, rev: Rev, parent: &P, key: &K) {
        let Some(h) = self.settings.get_mut(branch) else {
            return;
        };
        let now_empty = h.get_exact_mut(rev.0, rev.1).is_some_and(|set| {
            set.remove(&(parent.clone(), key.clone()));
            set.is_empty()
        });
        if now_empty {
            h.remove_exact(rev.0, rev.1);
        }
    }

    /// Brings every snapshot that can observe the write at `rev` back in line
    /// with the key's history.
    fn reindex_key(&mut self, tree: &BranchTree, parent: &P, key: &K, branch: &BranchId, rev: Rev) {
        let histories = &self.histories;
        let present =
            |b: &BranchId, r: Rev| lookup(histories, tree, parent, key, b, r).is_found();
        let base = visible_keys(&self.keycache, tree, parent, branch, rev)
            .cloned()
            .unwrap_or_default();
        let per_branch = self.keycache.entry(parent.clone()).or_default();
        let snaps = per_branch.entry(branch.clone()).or_default();
        let here = present(branch, rev);
        match snaps.get_exact_mut(rev.0, rev.1) {
            Some(set) => set_membership(set, key, here),
            None => {
                let mut set = base;
                set_membership(&mut set, key, here);
                snaps.insert_exact(rev.0, rev.1, set);
            }
        }
        for (r, set) in snaps.after_mut(rev) {
            set_membership(set, key, present(branch, r));
        }
        for (child, leaves_at) in tree.descendants(branch) {
            if leaves_at < rev {
                continue;
            }
            if let Some(snaps) = per_branch.get_mut(&child) {
                for (r, set) in snaps.after_mut((0, 0)) {
                    set_membership(set, key, present(&child, r));
                }
                if let Some(set) = snaps.get_exact_mut(0, 0) {
                    set_membership(set, key, present(&child, (0, 0)));
                }
            }
        }
    }
}

fn set_membership<K: Ord + Clone>(set: &mut BTreeSet<K>, key: &K, present: bool) {
    if present {
        set.insert(key.clone());
    } else {
        set.remove(key);
    }
}

fn lookup_in<'a, V>(
    by_branch: &'a BTreeMap<BranchId, History<Option<V>>>,
    tree: &BranchTree,
    branch: &BranchId,
    rev: Rev,
) -> Lookup<&'a V> {
    for (b, turn, tick) in tree.walk_to_root(branch, rev.0, rev.1) {
        if let Some(fact) = by_branch.get(&b).and_then(|h| h.retrieve(turn, tick)) {
            return match fact {
                Some(v) => Lookup::Found(v),
                None => Lookup::Deleted,
            };
        }
    }
    Lookup::NotFound
}

fn lookup<'a, P: Ord, K: Ord, V>(
    histories: &'a BTreeMap<P, Histories<K, V>>,
    tree: &BranchTree,
    parent: &P,
    key: &K,
    branch: &BranchId,
    rev: Rev,
) -> Lookup<&'a V> {
    match histories.get(parent).and_then(|m| m.get(key)) {
        Some(by_branch) => lookup_in(by_branch, tree, branch, rev),
        None => Lookup::NotFound,
    }
}

fn visible_keys<'a, P: Ord, K>(
    keycache: &'a BTreeMap<P, BTreeMap<BranchId, History<BTreeSet<K>>>>,
    tree: &BranchTree,
    parent: &P,
    branch: &BranchId,
    rev: Rev,
) -> Option<&'a BTreeSet<K>> {
    let per_branch = keycache.get(parent)?;
    tree.walk_to_root(branch, rev.0, rev.1)
        .find_map(|(b, turn, tick)| per_branch.get(&b)?.retrieve(turn, tick))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    type Attrs = Cache<String, String, i64>;

    fn trunk() -> BranchId {
        "trunk".into()
    }

    fn set(c: &mut Attrs, t: &BranchTree, k: &str, b: &BranchId, turn: Turn, tick: Tick, v: Option<i64>) {
        c.store(t, &"g".to_owned(), &k.to_owned(), b, turn, tick, v, WriteMode::Default)
            .unwrap();
    }

    fn get(c: &Attrs, t: &BranchTree, k: &str, b: &BranchId, turn: Turn, tick: Tick) -> Lookup<i64> {
        c.retrieve(t, &"g".to_owned(), &k.to_owned(), b, turn, tick).cloned()
    }

    fn keys(c: &Attrs, t: &BranchTree, b: &BranchId, turn: Turn, tick: Tick, forward: bool) -> Vec<String> {
        c.iter_keys(t, &"g".to_owned(), b, turn, tick, forward).cloned().collect()
    }

    #[test]
    fn truncation_only_touches_the_written_key() {
        let tree = BranchTree::new("trunk");
        let mut c = Attrs::new("test");
        for tick in [5, 10, 15] {
            set(&mut c, &tree, "k", &trunk(), 0, tick, Some(tick as i64));
            set(&mut c, &tree, "sib", &trunk(), 0, tick, Some(-(tick as i64)));
        }
        set(&mut c, &tree, "k", &trunk(), 0, 8, Some(8));
        assert_eq!(get(&c, &tree, "k", &trunk(), 0, 12), Lookup::Found(8));
        assert_eq!(get(&c, &tree, "k", &trunk(), 0, 20), Lookup::Found(8));
        assert_eq!(get(&c, &tree, "sib", &trunk(), 0, 15), Lookup::Found(-15));
    }

    #[test]
    fn keycache_follows_truncation() {
        let tree = BranchTree::new("trunk");
        let mut c = Attrs::new("test");
        set(&mut c, &tree, "a", &trunk(), 0, 1, Some(1));
        set(&mut c, &tree, "b", &trunk(), 0, 3, Some(1));
        set(&mut c, &tree, "a", &trunk(), 0, 5, None);
        assert_eq!(keys(&c, &tree, &trunk(), 0, 6, true), vec!["b"]);
        // rewriting `a` at tick 2 discards its tick-5 deletion
        set(&mut c, &tree, "a", &trunk(), 0, 2, Some(7));
        for tick in 0..8 {
            assert_eq!(
                keys(&c, &tree, &trunk(), 0, tick, true),
                keys(&c, &tree, &trunk(), 0, tick, false),
                "tick {tick}"
            );
        }
        assert_eq!(keys(&c, &tree, &trunk(), 0, 6, true), vec!["a", "b"]);
    }

    #[test]
    fn keycache_sees_parent_changes_before_divergence() {
        let mut tree = BranchTree::new("trunk");
        tree.extend(&trunk(), 4, 0);
        let mut c = Attrs::new("test");
        set(&mut c, &tree, "a", &trunk(), 1, 0, Some(1));
        tree.create("alt".into(), trunk(), 3, 0).unwrap();
        set(&mut c, &tree, "x", &"alt".into(), 3, 1, Some(1));
        // a retroactive trunk write before the divergence point is visible on alt
        c.store(&tree, &"g".to_owned(), &"b".to_owned(), &trunk(), 2, 0, Some(2), WriteMode::Planning)
            .unwrap();
        assert_eq!(keys(&c, &tree, &"alt".into(), 5, 0, true), vec!["a", "b", "x"]);
        assert_eq!(keys(&c, &tree, &"alt".into(), 5, 0, false), vec!["a", "b", "x"]);
    }

    #[test]
    fn changed_between_spans_the_common_ancestor() {
        let mut tree = BranchTree::new("trunk");
        let mut c = Attrs::new("test");
        set(&mut c, &tree, "early", &trunk(), 0, 0, Some(0));
        tree.extend(&trunk(), 2, 0);
        set(&mut c, &tree, "shared", &trunk(), 1, 0, Some(1));
        tree.create("alt".into(), trunk(), 1, 0).unwrap();
        set(&mut c, &tree, "late", &trunk(), 2, 0, Some(2));
        set(&mut c, &tree, "mine", &"alt".into(), 1, 1, Some(3));
        let got = c.changed_between(&tree, &Btt::new("trunk", 2, 0), &Btt::new("alt", 1, 1));
        let got: Vec<String> = got.into_iter().map(|(_, k)| k).collect();
        assert_eq!(got, vec!["late", "mine"]);
        assert!(c
            .changed_between(&tree, &Btt::new("alt", 1, 1), &Btt::new("alt", 1, 1))
            .is_empty());
    }

    #[test]
    fn rollback_restores_overwritten_entries() {
        let tree = BranchTree::new("trunk");
        let mut c = Attrs::new("test");
        set(&mut c, &tree, "k", &trunk(), 0, 1, Some(1));
        set(&mut c, &tree, "k", &trunk(), 0, 4, Some(4));
        c.begin_plan();
        let g = "g".to_owned();
        c.store(&tree, &g, &"k".to_owned(), &trunk(), 0, 1, Some(10), WriteMode::Planning)
            .unwrap();
        c.store(&tree, &g, &"new".to_owned(), &trunk(), 0, 2, Some(20), WriteMode::Planning)
            .unwrap();
        assert_eq!(get(&c, &tree, "k", &trunk(), 0, 4), Lookup::Found(4));
        let undone = c.rollback_plan(&tree);
        assert_eq!(undone.len(), 2);
        assert_eq!(get(&c, &tree, "k", &trunk(), 0, 2), Lookup::Found(1));
        assert_eq!(get(&c, &tree, "new", &trunk(), 0, 3), Lookup::NotFound);
        assert_eq!(keys(&c, &tree, &trunk(), 0, 3, true), vec!["k"]);
        assert_eq!(c.commit_plan(), 0);
    }

    #[test]
    fn check_store_and_facts_after_leave_the_cache_alone() {
        let tree = BranchTree::new("trunk");
        let mut c = Attrs::new("test");
        set(&mut c, &tree, "k", &trunk(), 0, 2, Some(1));
        set(&mut c, &tree, "k", &trunk(), 1, 0, None);
        set(&mut c, &tree, "k", &trunk(), 1, 4, Some(3));
        let (g, k) = ("g".to_owned(), "k".to_owned());
        assert!(matches!(
            c.check_store(&g, &k, &trunk(), 0, 9, WriteMode::Forward),
            Err(HistoryError::OutOfOrder { latest_turn: 1, latest_tick: 4, .. })
        ));
        assert!(c.check_store(&g, &k, &trunk(), 1, 4, WriteMode::Forward).is_ok());
        assert!(c.check_store(&g, &"new".to_owned(), &trunk(), 0, 0, WriteMode::Forward).is_ok());
        assert_eq!(c.facts_after(&g, &k, &trunk(), (0, 2)), vec![((1, 0), false), ((1, 4), true)]);
        assert_eq!(get(&c, &tree, "k", &trunk(), 2, 0), Lookup::Found(3));
    }
}
