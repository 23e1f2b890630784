// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code, clippy::unwrap_used)]

use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};
use serde_json::json;
use strata_core::{
    BranchId, BranchTree, Cache, Engine, EngineConfig, GraphKind, Lookup, MemoryFactStore, Tick,
    Turn, WriteMode,
};

/// Plain `parent = "g"` cache used by the history-level properties.
pub type Scalars = Cache<String, String, i64>;

/// Deterministic runner so failures reproduce across machines.
pub fn pinned_runner(seed: u8, cases: u32) -> TestRunner {
    let mut bytes = [0_u8; 32];
    bytes[0] = seed;
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &bytes);
    TestRunner::new_with_rng(
        PropConfig {
            cases,
            ..PropConfig::default()
        },
        rng,
    )
}

pub fn trunk() -> BranchId {
    BranchId::from("trunk")
}

pub fn put(
    cache: &mut Scalars,
    tree: &BranchTree,
    key: &str,
    branch: &BranchId,
    turn: Turn,
    tick: Tick,
    value: Option<i64>,
    mode: WriteMode,
) {
    cache
        .store(tree, &"g".to_owned(), &key.to_owned(), branch, turn, tick, value, mode)
        .unwrap();
}

pub fn get(cache: &Scalars, tree: &BranchTree, key: &str, branch: &BranchId, turn: Turn, tick: Tick) -> Lookup<i64> {
    cache
        .retrieve(tree, &"g".to_owned(), &key.to_owned(), branch, turn, tick)
        .cloned()
}

pub fn keys(cache: &Scalars, tree: &BranchTree, branch: &BranchId, turn: Turn, tick: Tick, forward: bool) -> Vec<String> {
    cache
        .iter_keys(tree, &"g".to_owned(), branch, turn, tick, forward)
        .cloned()
        .collect()
}

pub fn engine() -> Engine {
    Engine::new(MemoryFactStore::new(), EngineConfig::default())
}

/// Digraph `g` with `a -> b`, `a.hp = 1`, and a multigraph `m` with nodes `a`, `b`.
pub fn world() -> Engine {
    let mut e = engine();
    e.new_graph("g", GraphKind::DiGraph).unwrap();
    e.new_graph("m", GraphKind::MultiDiGraph).unwrap();
    for graph in ["g", "m"] {
        e.add_node(graph, "a").unwrap();
        e.add_node(graph, "b").unwrap();
    }
    e.add_edge("g", "a", "b", 0).unwrap();
    e.set_node_val("g", "a", "hp", Some(json!(1))).unwrap();
    e
}
