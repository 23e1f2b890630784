// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Windowed per-key histories.
//!
//! A [`WindowDict`] maps a monotonic revision number to a value and answers
//! floor/ceiling queries in O(log n). [`History`] nests two of them
//! (turn → tick → value), which is the shape every cache uses.
//!
//! # Write modes
//!
//! - [`WriteMode::Default`]: a write at `(turn, tick)` discards everything
//!   recorded strictly after it before inserting (paradox overwrite).
//! - [`WriteMode::Forward`]: append-only; writing before the latest recorded
//!   revision is an error.
//! - [`WriteMode::Planning`]: out-of-order writes are accepted and nothing is
//!   discarded.
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::ops::RangeBounds;

use serde::{Deserialize, Serialize};

use crate::history::HistoryError;
use crate::ident::{Rev, Tick, Turn};

/// How a write treats history recorded after it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Truncate the key's future on the branch, then write.
    #[default]
    Default,
    /// Append-only; earlier-than-latest writes are rejected.
    Forward,
    /// Provisional write; nothing is truncated.
    Planning,
}

/// The four queries every windowed history answers.
pub trait Window<V> {
    /// Greatest revision `<= rev` holding data.
    fn rev_before(&self, rev: u64) -> Option<u64>;
    /// Smallest revision `> rev` holding data.
    fn rev_after(&self, rev: u64) -> Option<u64>;
    /// Whether an entry exists exactly at `rev`.
    fn has_exact_rev(&self, rev: u64) -> bool;
    /// Value as of `rev`: the entry at [`Window::rev_before`].
    fn retrieve(&self, rev: u64) -> Option<&V>;
}

/// Ordered revision → value map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowDict<V> {
    entries: BTreeMap<u64, V>,
}

impl<V> Default for WindowDict<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> WindowDict<V> {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded revisions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `value` at `rev`, returning any value it replaced.
    pub fn insert(&mut self, rev: u64, value: V) -> Option<V> {
        self.entries.insert(rev, value)
    }

    /// Entry exactly at `rev`.
    pub fn get(&self, rev: u64) -> Option<&V> {
        self.entries.get(&rev)
    }

    /// Mutable entry exactly at `rev`.
    pub fn get_mut(&mut self, rev: u64) -> Option<&mut V> {
        self.entries.get_mut(&rev)
    }

    /// Entry at `rev`, inserting `f()` first when absent.
    pub fn get_or_insert_with(&mut self, rev: u64, f: impl FnOnce() -> V) -> &mut V {
        self.entries.entry(rev).or_insert_with(f)
    }

    /// Removes the entry exactly at `rev`.
    pub fn remove(&mut self, rev: u64) -> Option<V> {
        self.entries.remove(&rev)
    }

    /// Drops every entry strictly after `rev` and returns them in order.
    pub fn truncate_after(&mut self, rev: u64) -> BTreeMap<u64, V> {
        match rev.checked_add(1) {
            Some(next) => self.entries.split_off(&next),
            None => BTreeMap::new(),
        }
    }

    /// Earliest entry.
    pub fn first(&self) -> Option<(u64, &V)> {
        self.entries.first_key_value().map(|(r, v)| (*r, v))
    }

    /// Latest entry.
    pub fn last(&self) -> Option<(u64, &V)> {
        self.entries.last_key_value().map(|(r, v)| (*r, v))
    }

    /// Entries in revision order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &V)> + '_ {
        self.entries.iter().map(|(r, v)| (*r, v))
    }

    /// Entries whose revision falls within `range`.
    pub fn range<R: RangeBounds<u64>>(
        &self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = (u64, &V)> + '_ {
        self.entries.range(range).map(|(r, v)| (*r, v))
    }

    /// Mutable entries whose revision falls within `range`.
    pub fn range_mut<R: RangeBounds<u64>>(
        &mut self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = (u64, &mut V)> + '_ {
        self.entries.range_mut(range).map(|(r, v)| (*r, v))
    }
}

impl<V> IntoIterator for WindowDict<V> {
    type Item = (u64, V);
    type IntoIter = std::collections::btree_map::IntoIter<u64, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V> Window<V> for WindowDict<V> {
    fn rev_before(&self, rev: u64) -> Option<u64> {
        self.entries.range(..=rev).next_back().map(|(r, _)| *r)
    }

    fn rev_after(&self, rev: u64) -> Option<u64> {
        self.entries
            .range((Excluded(rev), Unbounded))
            .next()
            .map(|(r, _)| *r)
    }

    fn has_exact_rev(&self, rev: u64) -> bool {
        self.entries.contains_key(&rev)
    }

    fn retrieve(&self, rev: u64) -> Option<&V> {
        self.entries.range(..=rev).next_back().map(|(_, v)| v)
    }
}

/// Entries removed by a truncating write, oldest first.
pub type Truncated<V> = Vec<(Rev, V)>;

/// Two-level history: turn → tick → value.
///
/// Empty tick windows are never left behind, so the latest turn window always
/// holds the latest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History<V> {
    turns: WindowDict<WindowDict<V>>,
}

impl<V> Default for History<V> {
    fn default() -> Self {
        Self {
            turns: WindowDict::new(),
        }
    }
}

impl<V> History<V> {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of recorded `(turn, tick)` entries.
    pub fn len(&self) -> usize {
        self.turns.iter().map(|(_, ticks)| ticks.len()).sum()
    }

    /// Records `value` at `(turn, tick)` under `mode`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfOrder`] in forward mode when the write precedes
    /// the latest recorded revision.
    pub fn store(
        &mut self,
        turn: Turn,
        tick: Tick,
        value: V,
        mode: WriteMode,
    ) -> Result<Truncated<V>, HistoryError> {
        self.check(turn, tick, mode)?;
        let removed = match mode {
            WriteMode::Forward | WriteMode::Planning => Vec::new(),
            WriteMode::Default => self.truncate_after(turn, tick),
        };
        self.insert_exact(turn, tick, value);
        Ok(removed)
    }

    /// Whether [`History::store`] would accept a write at `(turn, tick)`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::OutOfOrder`] for a forward write before the latest entry.
    pub fn check(&self, turn: Turn, tick: Tick, mode: WriteMode) -> Result<(), HistoryError> {
        if mode != WriteMode::Forward {
            return Ok(());
        }
        match self.latest() {
            Some(((latest_turn, latest_tick), _)) if (turn, tick) < (latest_turn, latest_tick) => {
                Err(HistoryError::OutOfOrder {
                    turn,
                    tick,
                    latest_turn,
                    latest_tick,
                })
            }
            _ => Ok(()),
        }
    }

    /// Inserts at exactly `(turn, tick)` with no truncation.
    pub fn insert_exact(&mut self, turn: Turn, tick: Tick, value: V) -> Option<V> {
        self.turns
            .get_or_insert_with(turn, WindowDict::new)
            .insert(tick, value)
    }

    /// Entry recorded exactly at `(turn, tick)`.
    pub fn get_exact(&self, turn: Turn, tick: Tick) -> Option<&V> {
        self.turns.get(turn)?.get(tick)
    }

    /// Mutable entry recorded exactly at `(turn, tick)`.
    pub fn get_exact_mut(&mut self, turn: Turn, tick: Tick) -> Option<&mut V> {
        self.turns.get_mut(turn)?.get_mut(tick)
    }

    /// Whether an entry exists exactly at `(turn, tick)`.
    pub fn has_exact(&self, turn: Turn, tick: Tick) -> bool {
        self.turns
            .get(turn)
            .is_some_and(|ticks| ticks.has_exact_rev(tick))
    }

    /// Removes the entry at exactly `(turn, tick)`.
    pub fn remove_exact(&mut self, turn: Turn, tick: Tick) -> Option<V> {
        let ticks = self.turns.get_mut(turn)?;
        let removed = ticks.remove(tick);
        if ticks.is_empty() {
            self.turns.remove(turn);
        }
        removed
    }

    /// Drops every entry strictly after `(turn, tick)`.
    pub fn truncate_after(&mut self, turn: Turn, tick: Tick) -> Truncated<V> {
        let later_turns = self.turns.truncate_after(turn);
        let mut removed = Vec::new();
        if let Some(ticks) = self.turns.get_mut(turn) {
            removed.extend(ticks.truncate_after(tick).into_iter().map(|(t, v)| ((turn, t), v)));
            if ticks.is_empty() {
                self.turns.remove(turn);
            }
        }
        for (r, ticks) in later_turns {
            removed.extend(ticks.into_iter().map(|(t, v)| ((r, t), v)));
        }
        removed
    }

    /// Entry visible at `(turn, tick)` together with the revision it was recorded at.
    ///
    /// When the tick window of `turn` holds nothing at or before `tick`, the
    /// last entry of the previous recorded turn applies.
    pub fn retrieve_entry(&self, turn: Turn, tick: Tick) -> Option<(Rev, &V)> {
        if let Some(ticks) = self.turns.get(turn) {
            if let Some(t) = ticks.rev_before(tick) {
                return ticks.get(t).map(|v| ((turn, t), v));
            }
        }
        let prev = self.turns.rev_before(turn.checked_sub(1)?)?;
        let (t, v) = self.turns.get(prev)?.last()?;
        Some(((prev, t), v))
    }

    /// Value visible at `(turn, tick)`.
    pub fn retrieve(&self, turn: Turn, tick: Tick) -> Option<&V> {
        self.retrieve_entry(turn, tick).map(|(_, v)| v)
    }

    /// Latest entry.
    pub fn latest(&self) -> Option<(Rev, &V)> {
        let (turn, ticks) = self.turns.last()?;
        let (tick, v) = ticks.last()?;
        Some(((turn, tick), v))
    }

    /// Earliest entry.
    pub fn earliest(&self) -> Option<(Rev, &V)> {
        let (turn, ticks) = self.turns.first()?;
        let (tick, v) = ticks.first()?;
        Some(((turn, tick), v))
    }

    /// All entries in `(turn, tick)` order.
    pub fn iter(&self) -> impl Iterator<Item = (Rev, &V)> + '_ {
        self.turns
            .iter()
            .flat_map(|(turn, ticks)| ticks.iter().map(move |(tick, v)| ((turn, tick), v)))
    }

    /// Entries with `lo < rev <= hi`.
    pub fn revs_between(&self, lo: Rev, hi: Rev) -> impl Iterator<Item = (Rev, &V)> + '_ {
        self.turns
            .range(lo.0..=hi.0.max(lo.0))
            .flat_map(|(turn, ticks)| ticks.iter().map(move |(tick, v)| ((turn, tick), v)))
            .filter(move |(rev, _)| *rev > lo && *rev <= hi)
    }

    /// Entries strictly after `rev`.
    pub fn after(&self, rev: Rev) -> impl Iterator<Item = (Rev, &V)> + '_ {
        self.turns
            .range(rev.0..)
            .flat_map(|(turn, ticks)| ticks.iter().map(move |(tick, v)| ((turn, tick), v)))
            .filter(move |(r, _)| *r > rev)
    }

    /// Mutable entries strictly after `rev`.
    pub fn after_mut(&mut self, rev: Rev) -> impl Iterator<Item = (Rev, &mut V)> + '_ {
        self.turns
            .range_mut(rev.0..)
            .flat_map(|(turn, ticks)| ticks.range_mut(..).map(move |(tick, v)| ((turn, tick), v)))
            .filter(move |(r, _)| *r > rev)
    }

    /// Latest turn `<= turn` with a recorded change.
    pub fn turn_before(&self, turn: Turn) -> Option<Turn> {
        self.turns.rev_before(turn)
    }

    /// Earliest turn `> turn` with a recorded change.
    pub fn turn_after(&self, turn: Turn) -> Option<Turn> {
        self.turns.rev_after(turn)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn window_floor_and_ceiling() {
        let mut w = WindowDict::new();
        w.insert(2, "a");
        w.insert(5, "b");
        assert_eq!(w.rev_before(1), None);
        assert_eq!(w.rev_before(4), Some(2));
        assert_eq!(w.rev_before(5), Some(5));
        assert_eq!(w.rev_after(2), Some(5));
        assert_eq!(w.rev_after(5), None);
        assert!(w.has_exact_rev(5));
        assert!(!w.has_exact_rev(4));
        assert_eq!(w.retrieve(9), Some(&"b"));
    }

    #[test]
    fn window_truncate_returns_removed_suffix() {
        let mut w = WindowDict::new();
        for r in 0..6 {
            w.insert(r, r * 10);
        }
        let cut = w.truncate_after(3);
        assert_eq!(cut.into_iter().collect::<Vec<_>>(), vec![(4, 40), (5, 50)]);
        assert_eq!(w.last(), Some((3, &30)));
        assert!(w.truncate_after(u64::MAX).is_empty());
    }

    #[test]
    fn retrieve_crosses_turn_boundary() {
        let mut h = History::new();
        h.store(0, 4, 'a', WriteMode::Default).unwrap();
        h.store(1, 3, 'b', WriteMode::Default).unwrap();
        // turn 1 has nothing at or before tick 1, so turn 0's last entry applies
        assert_eq!(h.retrieve(1, 1), Some(&'a'));
        assert_eq!(h.retrieve(1, 3), Some(&'b'));
        assert_eq!(h.retrieve(0, 3), None);
        assert_eq!(h.retrieve_entry(7, 0), Some(((1, 3), &'b')));
    }

    #[test]
    fn default_mode_truncates_future() {
        let mut h = History::new();
        for tick in [5, 10, 15] {
            h.store(0, tick, tick, WriteMode::Default).unwrap();
        }
        let removed = h.store(0, 8, 8, WriteMode::Default).unwrap();
        assert_eq!(removed, vec![((0, 10), 10), ((0, 15), 15)]);
        assert_eq!(h.retrieve(0, 12), Some(&8));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn forward_mode_rejects_the_past() {
        let mut h = History::new();
        h.store(1, 0, 'x', WriteMode::Forward).unwrap();
        h.store(1, 0, 'y', WriteMode::Forward).unwrap();
        assert!(h.check(0, 9, WriteMode::Forward).is_err());
        assert!(h.check(0, 9, WriteMode::Default).is_ok());
        let err = h.store(0, 9, 'z', WriteMode::Forward).unwrap_err();
        assert!(matches!(err, HistoryError::OutOfOrder { latest_turn: 1, .. }));
        assert_eq!(h.retrieve(1, 0), Some(&'y'));
    }

    #[test]
    fn planning_mode_keeps_future() {
        let mut h = History::new();
        h.store(3, 0, 3, WriteMode::Default).unwrap();
        h.store(1, 0, 1, WriteMode::Planning).unwrap();
        assert_eq!(h.retrieve(2, 0), Some(&1));
        assert_eq!(h.retrieve(3, 0), Some(&3));
    }

    #[test]
    fn revs_between_is_half_open() {
        let mut h = History::new();
        for (turn, tick) in [(0, 1), (0, 2), (1, 0), (2, 5)] {
            h.insert_exact(turn, tick, ());
        }
        let revs: Vec<Rev> = h.revs_between((0, 1), (2, 0)).map(|(r, _)| r).collect();
        assert_eq!(revs, vec![(0, 2), (1, 0)]);
    }

    #[test]
    fn turn_navigation() {
        let mut h = History::new();
        h.insert_exact(2, 0, ());
        h.insert_exact(6, 3, ());
        assert_eq!(h.turn_before(5), Some(2));
        assert_eq!(h.turn_after(2), Some(6));
        assert_eq!(h.turn_after(6), None);
        assert_eq!(h.remove_exact(6, 3), Some(()));
        assert_eq!(h.turn_after(2), None);
    }
}
