// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Batched persistence adapter.
//!
//! Writes are buffered per `(fact key, branch)` and flushed as one
//! [`FlushBatch`]: for every group that saw a truncating write, a single
//! "delete at or after the earliest rewritten coordinate", then every pending
//! row as insert-or-replace. This reproduces the in-memory paradox semantics in
//! the persisted log. Buffers are cleared only once the store accepted the
//! batch, so a failed flush can simply be retried.
use std::collections::{BTreeMap, BTreeSet};

use crate::branch::Branch;
use crate::fact_store::{Fact, FactCoord, FactKey, FactKind, FactStore, FactValue, FlushBatch, StoreError};
use crate::ident::{
    BranchId, EdgeIndex, GraphKind, GraphName, Key, NodeName, Rev, RuleName, RulebookName, Tick, Turn,
    Value,
};
use crate::rules::HandledRule;
use crate::window::WriteMode;

#[derive(Clone, Debug, PartialEq)]
struct PendingRow {
    value: FactValue,
    truncate: bool,
}

/// Buffers fact writes and flushes them to a [`FactStore`].
#[derive(Debug)]
pub struct QueryEngine<S> {
    store: S,
    pending: BTreeMap<(FactKey, BranchId), BTreeMap<Rev, PendingRow>>,
    erasures: BTreeSet<FactCoord>,
}

impl<S: FactStore> QueryEngine<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            erasures: BTreeSet::new(),
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Unwraps the store, discarding anything not yet flushed.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Number of buffered rows and erasures.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum::<usize>() + self.erasures.len()
    }

    /// Buffers one fact.
    ///
    /// A default-mode write also drops buffered rows of the same key and branch
    /// at later coordinates, as the cache just discarded them.
    pub fn record(
        &mut self,
        key: FactKey,
        branch: BranchId,
        turn: Turn,
        tick: Tick,
        value: FactValue,
        mode: WriteMode,
    ) {
        self.erasures.remove(&FactCoord {
            key: key.clone(),
            branch: branch.clone(),
            turn,
            tick,
        });
        let rows = self.pending.entry((key, branch)).or_default();
        let truncate = mode == WriteMode::Default;
        if truncate {
            rows.retain(|rev, _| *rev <= (turn, tick));
        }
        rows.insert((turn, tick), PendingRow { value, truncate });
    }

    /// Node existence.
    pub fn exist_node(
        &mut self,
        graph: &GraphName,
        node: &NodeName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        exists: bool,
        mode: WriteMode,
    ) {
        let key = FactKey::Node {
            graph: graph.clone(),
            node: node.clone(),
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Exists(exists), mode);
    }

    /// Indexed edge existence.
    pub fn exist_edge(
        &mut self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        exists: bool,
        mode: WriteMode,
    ) {
        let key = FactKey::Edge {
            graph: graph.clone(),
            orig: orig.clone(),
            dest: dest.clone(),
            idx,
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Exists(exists), mode);
    }

    /// Graph attribute.
    pub fn graph_val_set(
        &mut self,
        graph: &GraphName,
        key: &Key,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        value: Option<Value>,
        mode: WriteMode,
    ) {
        let key = FactKey::GraphVal {
            graph: graph.clone(),
            key: key.clone(),
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Value(value), mode);
    }

    /// Node attribute.
    pub fn node_val_set(
        &mut self,
        graph: &GraphName,
        node: &NodeName,
        key: &Key,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        value: Option<Value>,
        mode: WriteMode,
    ) {
        let key = FactKey::NodeVal {
            graph: graph.clone(),
            node: node.clone(),
            key: key.clone(),
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Value(value), mode);
    }

    /// Edge attribute.
    pub fn edge_val_set(
        &mut self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIndex,
        key: &Key,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        value: Option<Value>,
        mode: WriteMode,
    ) {
        let key = FactKey::EdgeVal {
            graph: graph.clone(),
            orig: orig.clone(),
            dest: dest.clone(),
            idx,
            key: key.clone(),
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Value(value), mode);
    }

    /// Avatar relation.
    pub fn avatar_set(
        &mut self,
        character: &GraphName,
        graph: &GraphName,
        node: &NodeName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        is_avatar: bool,
        mode: WriteMode,
    ) {
        let key = FactKey::Avatar {
            character: character.clone(),
            graph: graph.clone(),
            node: node.clone(),
        };
        self.record(key, branch.clone(), turn, tick, FactValue::Exists(is_avatar), mode);
    }

    /// Rulebook contents.
    pub fn rulebook_set(
        &mut self,
        rulebook: &RulebookName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        rules: Option<&[RuleName]>,
        mode: WriteMode,
    ) {
        let key = FactKey::Rulebook {
            rulebook: rulebook.clone(),
        };
        let value = rules.map(|r| Value::from(r.to_vec()));
        self.record(key, branch.clone(), turn, tick, FactValue::Value(value), mode);
    }

    /// Rulebook assignment of a graph.
    pub fn character_rulebook_set(
        &mut self,
        character: &GraphName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
        rulebook: Option<&RulebookName>,
        mode: WriteMode,
    ) {
        let key = FactKey::CharacterRulebook {
            character: character.clone(),
        };
        let value = rulebook.map(|r| Value::from(r.as_str()));
        self.record(key, branch.clone(), turn, tick, FactValue::Value(value), mode);
    }

    /// Forgets a rolled-back planned write.
    ///
    /// A still-buffered row is dropped. `restored` (the value the plan had
    /// overwritten) is re-recorded; with nothing to restore, an exact erasure is
    /// scheduled in case the planned row was already flushed.
    pub fn forget_planned(
        &mut self,
        key: FactKey,
        branch: BranchId,
        turn: Turn,
        tick: Tick,
        restored: Option<FactValue>,
    ) {
        let group = (key, branch);
        if let Some(rows) = self.pending.get_mut(&group) {
            rows.remove(&(turn, tick));
            if rows.is_empty() {
                self.pending.remove(&group);
            }
        }
        let (key, branch) = group;
        match restored {
            Some(value) => self.record(key, branch, turn, tick, value, WriteMode::Planning),
            None => {
                self.erasures.insert(FactCoord {
                    key,
                    branch,
                    turn,
                    tick,
                });
            }
        }
    }

    /// Writes every buffered row as one batch. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Whatever the store reports; buffers are kept intact for a retry.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        if self.pending.is_empty() && self.erasures.is_empty() {
            return Ok(0);
        }
        let mut batch = FlushBatch {
            erasures: self.erasures.iter().cloned().collect(),
            ..FlushBatch::default()
        };
        for ((key, branch), rows) in &self.pending {
            if let Some(((turn, tick), _)) = rows.iter().find(|(_, row)| row.truncate) {
                batch.truncations.push(FactCoord {
                    key: key.clone(),
                    branch: branch.clone(),
                    turn: *turn,
                    tick: *tick,
                });
            }
            batch.facts.extend(rows.iter().map(|((turn, tick), row)| Fact {
                key: key.clone(),
                branch: branch.clone(),
                turn: *turn,
                tick: *tick,
                value: row.value.clone(),
            }));
        }
        self.store.apply(&batch)?;
        tracing::debug!(
            rows = batch.facts.len(),
            truncations = batch.truncations.len(),
            erasures = batch.erasures.len(),
            "flushed pending facts"
        );
        self.pending.clear();
        self.erasures.clear();
        Ok(batch.facts.len())
    }

    /// Flushes, then asks the store to make everything durable.
    pub fn commit(&mut self) -> Result<usize, StoreError> {
        let n = self.flush()?;
        self.store.commit()?;
        Ok(n)
    }

    /// Stores a branch record: insert, falling back to update on conflict.
    pub fn set_branch(&mut self, branch: &Branch) -> Result<(), StoreError> {
        match self.store.insert_branch(branch) {
            Err(StoreError::Conflict(_)) => self.store.update_branch(branch),
            other => other,
        }
    }

    /// Registers a graph.
    pub fn new_graph(&mut self, name: &GraphName, kind: GraphKind) -> Result<(), StoreError> {
        self.store.insert_graph(name, kind)
    }

    /// Reads a global key.
    pub fn global_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.store.global_get(key)
    }

    /// Writes a global key.
    pub fn global_set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.store.global_set(key, value)
    }

    /// Records the last tick of a turn.
    pub fn set_turn_end(&mut self, branch: &BranchId, turn: Turn, tick: Tick) -> Result<(), StoreError> {
        self.store.set_turn_end(branch, turn, tick)
    }

    /// Records a handled rule.
    pub fn handled_rule(&mut self, row: &HandledRule) -> Result<(), StoreError> {
        self.store.insert_handled_rule(row)
    }

    /// Rows of one family, for cold start.
    pub fn dump(&self, kind: FactKind) -> Result<Vec<Fact>, StoreError> {
        self.store.dump(kind)
    }

    /// Node existence rows.
    pub fn nodes_dump(&self) -> Result<Vec<Fact>, StoreError> {
        self.dump(FactKind::Node)
    }

    /// Edge existence rows.
    pub fn edges_dump(&self) -> Result<Vec<Fact>, StoreError> {
        self.dump(FactKind::Edge)
    }

    /// Graph attribute rows.
    pub fn graph_val_dump(&self) -> Result<Vec<Fact>, StoreError> {
        self.dump(FactKind::GraphVal)
    }

    /// Node attribute rows.
    pub fn node_val_dump(&self) -> Result<Vec<Fact>, StoreError> {
        self.dump(FactKind::NodeVal)
    }

    /// Edge attribute rows.
    pub fn edge_val_dump(&self) -> Result<Vec<Fact>, StoreError> {
        self.dump(FactKind::EdgeVal)
    }

    /// Stored branches.
    pub fn branches_dump(&self) -> Result<Vec<Branch>, StoreError> {
        self.store.branches()
    }

    /// Registered graphs.
    pub fn graphs_dump(&self) -> Result<Vec<(GraphName, GraphKind)>, StoreError> {
        self.store.graphs()
    }

    /// Recorded turn ends.
    pub fn turn_ends_dump(&self) -> Result<Vec<(BranchId, Turn, Tick)>, StoreError> {
        self.store.turn_ends()
    }

    /// Handled rules.
    pub fn handled_rules_dump(&self) -> Result<Vec<HandledRule>, StoreError> {
        self.store.handled_rules()
    }
}
