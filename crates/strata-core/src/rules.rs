// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rule-execution bookkeeping.
//!
//! Each rule of a rulebook runs at most once per entity per turn. The cache
//! remembers the tick each rule was handled at so a fork can carry over only
//! what ran before the divergence point.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::history::HistoryError;
use crate::ident::{BranchId, GraphName, NodeName, RuleName, RulebookName, Tick, Turn};

/// Entity that owns a rulebook.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum RuleEntity {
    /// A whole graph.
    Character(GraphName),
    /// A node of a graph.
    Node(GraphName, NodeName),
    /// An edge between two nodes of a graph.
    Portal(GraphName, NodeName, NodeName),
}

impl fmt::Display for RuleEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Character(g) => write!(f, "{g}"),
            Self::Node(g, n) => write!(f, "{g}.{n}"),
            Self::Portal(g, o, d) => write!(f, "{g}.{o}->{d}"),
        }
    }
}

/// One persisted "rule handled" record.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct HandledRule {
    /// Rule-owning entity.
    pub entity: RuleEntity,
    /// Rulebook the rule belongs to.
    pub rulebook: RulebookName,
    /// Rule name.
    pub rule: RuleName,
    /// Branch it ran on.
    pub branch: BranchId,
    /// Turn it ran in.
    pub turn: Turn,
    /// Tick it ran at.
    pub tick: Tick,
}

type HandledKey = (RuleEntity, RulebookName, BranchId, Turn);

/// Which rules have run, per entity, rulebook, branch and turn.
#[derive(Clone, Debug, Default)]
pub struct RulesHandledCache {
    handled: BTreeMap<HandledKey, BTreeMap<RuleName, Tick>>,
}

impl RulesHandledCache {
    /// Marks `rule` handled. Returns `false` if it had already run this turn.
    #[must_use]
    pub fn store(
        &mut self,
        entity: &RuleEntity,
        rulebook: &RulebookName,
        rule: &RuleName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> bool {
        let rules = self
            .handled
            .entry((entity.clone(), rulebook.clone(), branch.clone(), turn))
            .or_default();
        if rules.contains_key(rule) {
            return false;
        }
        rules.insert(rule.clone(), tick);
        true
    }

    /// Reinstates a persisted record.
    pub fn load(&mut self, row: HandledRule) {
        self.handled
            .entry((row.entity, row.rulebook, row.branch, row.turn))
            .or_default()
            .insert(row.rule, row.tick);
    }

    /// Rules of `rulebook` that ran for `entity` at or before `tick` of `turn`.
    pub fn handled_rules(
        &self,
        entity: &RuleEntity,
        rulebook: &RulebookName,
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> impl Iterator<Item = &RuleName> + '_ {
        self.handled
            .get(&(entity.clone(), rulebook.clone(), branch.clone(), turn))
            .into_iter()
            .flatten()
            .filter(move |(_, t)| **t <= tick)
            .map(|(r, _)| r)
    }

    /// `rules` (in rulebook order) that have not yet run for `entity` this turn.
    pub fn unhandled_rulebook_rules(
        &self,
        entity: &RuleEntity,
        rulebook: &RulebookName,
        rules: &[RuleName],
        branch: &BranchId,
        turn: Turn,
        tick: Tick,
    ) -> Vec<RuleName> {
        let done = self
            .handled
            .get(&(entity.clone(), rulebook.clone(), branch.clone(), turn));
        rules
            .iter()
            .filter(|r| !done.and_then(|m| m.get(*r)).is_some_and(|t| *t <= tick))
            .cloned()
            .collect()
    }

    /// Copies what had run on `parent` up to `(turn, tick)` into `child`.
    ///
    /// Nothing is copied unless every entry can be: if `child` already has any
    /// handled record at `turn`, the fork fails and the cache is unchanged.
    pub fn fork(
        &mut self,
        parent: &BranchId,
        turn: Turn,
        tick: Tick,
        child: &BranchId,
    ) -> Result<usize, HistoryError> {
        self.check_fork(child, turn)?;
        let copies: Vec<(HandledKey, BTreeMap<RuleName, Tick>)> = self
            .handled
            .iter()
            .filter(|((_, _, b, t), _)| b == parent && *t == turn)
            .map(|((entity, rulebook, _, _), rules)| {
                let carried: BTreeMap<RuleName, Tick> = rules
                    .iter()
                    .filter(|(_, t)| **t <= tick)
                    .map(|(r, t)| (r.clone(), *t))
                    .collect();
                ((entity.clone(), rulebook.clone(), child.clone(), turn), carried)
            })
            .filter(|(_, carried)| !carried.is_empty())
            .collect();
        let n = copies.len();
        self.handled.extend(copies);
        Ok(n)
    }

    /// Fails if `child` already has rules handled at `turn`.
    pub fn check_fork(&self, child: &BranchId, turn: Turn) -> Result<(), HistoryError> {
        match self
            .handled
            .iter()
            .find(|((_, _, b, t), rules)| b == child && *t == turn && !rules.is_empty())
        {
            Some(((entity, rulebook, _, _), _)) => Err(HistoryError::RulesAlreadyHandled {
                entity: entity.to_string(),
                rulebook: rulebook.clone(),
                branch: child.clone(),
                turn,
            }),
            None => Ok(()),
        }
    }

    /// Every handled record, for persistence.
    pub fn iter(&self) -> impl Iterator<Item = HandledRule> + '_ {
        self.handled
            .iter()
            .flat_map(|((entity, rulebook, branch, turn), rules)| {
                rules.iter().map(move |(rule, tick)| HandledRule {
                    entity: entity.clone(),
                    rulebook: rulebook.clone(),
                    rule: rule.clone(),
                    branch: branch.clone(),
                    turn: *turn,
                    tick: *tick,
                })
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ent() -> RuleEntity {
        RuleEntity::Character("world".into())
    }

    #[test]
    fn at_most_once_per_turn() {
        let mut c = RulesHandledCache::default();
        let b = BranchId::from("trunk");
        assert!(c.store(&ent(), &"rb".into(), &"r1".into(), &b, 1, 0));
        assert!(!c.store(&ent(), &"rb".into(), &"r1".into(), &b, 1, 3));
        assert!(c.store(&ent(), &"rb".into(), &"r1".into(), &b, 2, 0));
        let rules: Vec<RuleName> = vec!["r1".into(), "r2".into()];
        assert_eq!(
            c.unhandled_rulebook_rules(&ent(), &"rb".into(), &rules, &b, 1, 5),
            vec!["r2".to_owned()]
        );
    }

    #[test]
    fn fork_carries_rules_run_before_divergence() {
        let mut c = RulesHandledCache::default();
        let (trunk, alt) = (BranchId::from("trunk"), BranchId::from("alt"));
        assert!(c.store(&ent(), &"rb".into(), &"early".into(), &trunk, 3, 1));
        assert!(c.store(&ent(), &"rb".into(), &"late".into(), &trunk, 3, 9));
        assert_eq!(c.fork(&trunk, 3, 4, &alt), Ok(1));
        let on_alt: Vec<_> = c.handled_rules(&ent(), &"rb".into(), &alt, 3, 100).cloned().collect();
        assert_eq!(on_alt, vec!["early".to_owned()]);
    }

    #[test]
    fn fork_onto_handled_target_fails_without_partial_application() {
        let mut c = RulesHandledCache::default();
        let (trunk, alt) = (BranchId::from("trunk"), BranchId::from("alt"));
        let other = RuleEntity::Node("world".into(), "n".into());
        assert!(c.store(&ent(), &"rb".into(), &"r".into(), &trunk, 2, 0));
        assert!(c.store(&other, &"rb".into(), &"r".into(), &trunk, 2, 0));
        assert!(c.store(&other, &"rb".into(), &"r".into(), &alt, 2, 1));
        let before = c.iter().count();
        let err = c.fork(&trunk, 2, 5, &alt).unwrap_err();
        assert!(matches!(err, HistoryError::RulesAlreadyHandled { turn: 2, .. }));
        assert_eq!(c.iter().count(), before);
        assert!(c.check_fork(&alt, 2).is_err());
        assert!(c.check_fork(&alt, 3).is_ok());
    }
}
