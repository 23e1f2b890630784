// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lookup outcomes and history errors.
//!
//! Retrieval never uses errors for control flow: every cache lookup yields a
//! [`Lookup`], and the ancestor walk is an explicit loop over its variants.
//! [`HistoryError`] is reserved for structural violations and for surfacing an
//! authoritative deletion to callers that asked for a value.
use thiserror::Error;

use crate::ident::{BranchId, Tick, Turn};

/// Three-way result of a point-in-time lookup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Lookup<V> {
    /// A value is visible at the coordinate.
    Found(V),
    /// Nothing was ever recorded on the searched path.
    NotFound,
    /// The most recent fact on the searched path is a deletion.
    ///
    /// Ancestors are not consulted past a deletion.
    Deleted,
}

impl<V> Lookup<V> {
    /// `true` for [`Lookup::Found`].
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// `true` for [`Lookup::Deleted`].
    pub const fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// The found value, discarding the distinction between missing and deleted.
    pub fn found(self) -> Option<V> {
        match self {
            Self::Found(v) => Some(v),
            Self::NotFound | Self::Deleted => None,
        }
    }

    /// Turns a deletion into [`HistoryError::Deleted`]; a missing key is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Deleted`] naming `key`.
    pub fn require(self, key: impl std::fmt::Display) -> Result<Option<V>, HistoryError> {
        match self {
            Self::Found(v) => Ok(Some(v)),
            Self::NotFound => Ok(None),
            Self::Deleted => Err(HistoryError::Deleted { key: key.to_string() }),
        }
    }

    /// Borrows the inner value.
    pub const fn as_ref(&self) -> Lookup<&V> {
        match self {
            Self::Found(v) => Lookup::Found(v),
            Self::NotFound => Lookup::NotFound,
            Self::Deleted => Lookup::Deleted,
        }
    }

    /// Maps the found value.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Lookup<U> {
        match self {
            Self::Found(v) => Lookup::Found(f(v)),
            Self::NotFound => Lookup::NotFound,
            Self::Deleted => Lookup::Deleted,
        }
    }
}

impl<V: Clone> Lookup<&V> {
    /// Clones the borrowed value.
    pub fn cloned(self) -> Lookup<V> {
        self.map(Clone::clone)
    }
}

/// Errors raised by history bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The most recent fact for the key is an explicit deletion.
    #[error("{key} was deleted at or before the requested time")]
    Deleted {
        /// Human-readable key description.
        key: String,
    },
    /// A forward-mode write landed before already-recorded history.
    #[error(
        "forward write at turn {turn} tick {tick} precedes latest record at turn {latest_turn} tick {latest_tick}"
    )]
    OutOfOrder {
        /// Attempted turn.
        turn: Turn,
        /// Attempted tick.
        tick: Tick,
        /// Latest recorded turn.
        latest_turn: Turn,
        /// Latest recorded tick.
        latest_tick: Tick,
    },
    /// The branch is not in the tree.
    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),
    /// The branch already exists and cannot be re-created.
    #[error("branch {0} already exists")]
    BranchExists(BranchId),
    /// A branch may only diverge from a point its parent has already reached.
    #[error(
        "cannot branch {child} from {parent} at turn {turn} tick {tick}: parent ends at turn {end_turn} tick {end_tick}"
    )]
    BranchFromFuture {
        /// Branch being created.
        child: BranchId,
        /// Requested parent.
        parent: BranchId,
        /// Requested divergence turn.
        turn: Turn,
        /// Requested divergence tick.
        tick: Tick,
        /// Parent's high-water turn.
        end_turn: Turn,
        /// Parent's high-water tick.
        end_tick: Tick,
    },
    /// A persisted branch does not descend from the trunk.
    #[error("branch {branch} does not descend from the trunk: {reason}")]
    BrokenLineage {
        /// Offending branch.
        branch: BranchId,
        /// What is wrong with its ancestry.
        reason: String,
    },
    /// Rules already ran at the fork target.
    #[error("rules of {rulebook} for {entity} already handled on {branch} at turn {turn}")]
    RulesAlreadyHandled {
        /// Rule-owning entity.
        entity: String,
        /// Rulebook name.
        rulebook: String,
        /// Fork target branch.
        branch: BranchId,
        /// Fork turn.
        turn: Turn,
    },
    /// `plan()` was called while a plan is open.
    #[error("a plan is already in progress")]
    PlanInProgress,
    /// Commit or rollback without an open plan.
    #[error("no plan in progress")]
    NoActivePlan,
}
