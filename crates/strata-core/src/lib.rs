// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! strata-core: bitemporal branching graph store.
//!
//! Every fact (node existence, edge existence, attribute values, avatar
//! membership, rulebook contents, handled rules) is versioned by a
//! `(branch, turn, tick)` coordinate. Histories are windowed per key so that
//! point-in-time reads near the last access stay cheap, and misses walk up
//! the branch tree to the fork point. Writes flow through nested caches into
//! a batching query adapter in front of a pluggable [`FactStore`].
//!
//! Remote views stay in sync through [`Delta`]s computed by
//! [`Engine::diff`] and applied to a [`Mirror`].
#![forbid(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions
)]

mod avatars;
mod branch;
mod cache;
mod config;
mod delta;
mod edges;
mod engine;
mod fact_store;
mod history;
mod ident;
mod mapping;
mod mirror;
mod query;
mod rules;
mod signal;
mod window;

/// Avatar membership facts.
pub use avatars::{AvatarParent, AvatarnessCache};
/// Branch tree and ancestor walks.
pub use branch::{AncestorWalk, Branch, BranchTree};
/// Nested versioned cache.
pub use cache::{Cache, PlanUndo};
/// Engine tuning.
pub use config::EngineConfig;
/// Diffs between coordinates.
pub use delta::{AttrDelta, CodecError, Delta, GraphDelta};
/// Edge existence with adjacency indexes.
pub use edges::{EdgePair, EdgesCache};
/// The engine.
pub use engine::{EdgeKey, Engine, EngineError};
/// Persistence seam and the in-memory backend with its CBOR image file.
pub use fact_store::{
    Fact, FactCoord, FactKey, FactKind, FactStore, FactValue, FlushBatch, MemoryFactStore,
    StoreError,
};
pub use history::{HistoryError, Lookup};
/// Time coordinates and identifiers.
pub use ident::{
    BranchId, Btt, EdgeIndex, GraphKind, GraphName, Key, NodeName, Rev, RuleName, RulebookName,
    Tick, Turn, Value,
};
/// Entity views.
pub use mapping::{
    AttrMapping, AttrMappingMut, EdgeMapping, GraphMapping, GraphNodes, MultiEdges, NodeMapping,
    Predecessors, Successors,
};
/// Materialized shadow state.
pub use mirror::{Attrs, GraphState, Mirror, MirrorError, MirrorState};
pub use query::QueryEngine;
/// Handled-rule bookkeeping.
pub use rules::{HandledRule, RuleEntity, RulesHandledCache};
/// Change notification.
pub use signal::{Callback, Change, ChangeEvent, Entity, Subscribers, SubscriptionId, TimeCallback};
/// Windowed histories.
pub use window::{History, Truncated, Window, WindowDict, WriteMode};
