// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used)]
mod common;

use std::collections::BTreeMap;

use common::{get, keys, pinned_runner, put, trunk, world, Scalars};
use proptest::prelude::*;
use serde_json::json;
use strata_core::{BranchId, BranchTree, Btt, Engine, Lookup, Mirror, MirrorState, WriteMode};

const KEYS: [&str; 4] = ["a", "b", "c", "d"];

fn write_strategy() -> impl Strategy<Value = Vec<(bool, usize, u64, u64, Option<i64>)>> {
    prop::collection::vec(
        (any::<bool>(), 0..KEYS.len(), 0_u64..5, 0_u64..4, prop::option::of(-5_i64..5)),
        1..30,
    )
}

#[test]
fn default_mode_matches_a_last_write_wins_model() {
    pinned_runner(0x21, 96)
        .run(&write_strategy(), |writes| {
            let tree = BranchTree::new("trunk");
            let mut cache = Scalars::new("scalars");
            let mut model: BTreeMap<&str, BTreeMap<(u64, u64), Option<i64>>> = BTreeMap::new();
            for (_, k, turn, tick, value) in writes {
                let key = KEYS[k];
                put(&mut cache, &tree, key, &trunk(), turn, tick, value, WriteMode::Default);
                let revs = model.entry(key).or_default();
                revs.retain(|rev, _| *rev <= (turn, tick));
                revs.insert((turn, tick), value);
            }
            for turn in 0..6 {
                for tick in 0..5 {
                    for key in KEYS {
                        let expected = model
                            .get(key)
                            .and_then(|revs| revs.range(..=(turn, tick)).next_back())
                            .map_or(Lookup::NotFound, |(_, v)| v.map_or(Lookup::Deleted, Lookup::Found));
                        prop_assert_eq!(get(&cache, &tree, key, &trunk(), turn, tick), expected);
                    }
                }
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn keycache_agrees_with_a_full_rescan() {
    pinned_runner(0x22, 96)
        .run(&write_strategy(), |writes| {
            let mut tree = BranchTree::new("trunk");
            tree.extend(&trunk(), 2, 0);
            tree.create("alt".into(), trunk(), 2, 0).unwrap();
            let alt = BranchId::from("alt");
            let mut cache = Scalars::new("scalars");
            for (on_alt, k, turn, tick, value) in writes {
                let (branch, turn) = if on_alt { (alt.clone(), turn + 2) } else { (trunk(), turn) };
                put(&mut cache, &tree, KEYS[k], &branch, turn, tick, value, WriteMode::Default);
            }
            for branch in [trunk(), alt.clone()] {
                let first = if branch == alt { 2 } else { 0 };
                for turn in first..8 {
                    for tick in 0..5 {
                        prop_assert_eq!(
                            keys(&cache, &tree, &branch, turn, tick, true),
                            keys(&cache, &tree, &branch, turn, tick, false),
                            "at {}:{}:{}",
                            branch,
                            turn,
                            tick
                        );
                    }
                }
            }
            Ok(())
        })
        .unwrap();
}

#[derive(Clone, Debug)]
enum Op {
    AddNode(bool, u8),
    DelNode(bool, u8),
    AddEdge(bool, u8, u8),
    DelEdge(bool, u8, u8),
    SetNode(bool, u8, u8, Option<i64>),
    SetEdge(bool, u8, u8, Option<i64>),
    SetGraph(bool, Option<i64>),
    NextTurn,
    Switch(u8),
    Back(u8),
    Plan,
    Rollback,
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let node = 0_u8..4;
    let val = prop::option::of(0_i64..4);
    prop_oneof![
        (any::<bool>(), node.clone()).prop_map(|(m, n)| Op::AddNode(m, n)),
        (any::<bool>(), node.clone()).prop_map(|(m, n)| Op::DelNode(m, n)),
        (any::<bool>(), node.clone(), node.clone()).prop_map(|(m, o, d)| Op::AddEdge(m, o, d)),
        (any::<bool>(), node.clone(), node.clone()).prop_map(|(m, o, d)| Op::DelEdge(m, o, d)),
        (any::<bool>(), node.clone(), 0_u8..2, val.clone()).prop_map(|(m, n, k, v)| Op::SetNode(m, n, k, v)),
        (any::<bool>(), node.clone(), node, val.clone()).prop_map(|(m, o, d, v)| Op::SetEdge(m, o, d, v)),
        (any::<bool>(), val).prop_map(|(m, v)| Op::SetGraph(m, v)),
        Just(Op::NextTurn),
        (0_u8..3).prop_map(Op::Switch),
        any::<u8>().prop_map(Op::Back),
        Just(Op::Plan),
        Just(Op::Rollback),
        Just(Op::Commit),
    ]
}

fn name(n: u8) -> String {
    ["a", "b", "c", "d"][usize::from(n)].to_owned()
}

fn apply(e: &mut Engine, op: &Op, seen: &[Btt]) {
    let graph = |multi: bool| if multi { "m" } else { "g" };
    let at = e.btt().clone();
    match op {
        Op::AddNode(m, n) => {
            e.add_node(graph(*m), &name(*n)).unwrap();
        }
        Op::DelNode(m, n) => {
            if e.node_exists_at(graph(*m), &name(*n), &at) {
                e.del_node(graph(*m), &name(*n)).unwrap();
            }
        }
        Op::AddEdge(m, o, d) => {
            let (g, o, d) = (graph(*m), name(*o), name(*d));
            if e.node_exists_at(g, &o, &at) && e.node_exists_at(g, &d, &at) {
                if *m {
                    e.new_edge(g, &o, &d).unwrap();
                } else {
                    e.add_edge(g, &o, &d, 0).unwrap();
                }
            }
        }
        Op::DelEdge(m, o, d) => {
            let (g, o, d) = (graph(*m), name(*o), name(*d));
            if let Some(idx) = e.edge_indices_at(g, &o, &d, &at).first() {
                e.del_edge(g, &o, &d, *idx).unwrap();
            }
        }
        Op::SetNode(m, n, k, v) => {
            let (g, n) = (graph(*m), name(*n));
            let key = if *k == 0 { "hp" } else { "mp" };
            let present = e.node_val_at(g, &n, key, &at).found().is_some();
            if e.node_exists_at(g, &n, &at) && (v.is_some() || present) {
                e.set_node_val(g, &n, key, v.map(|v| json!(v))).unwrap();
            }
        }
        Op::SetEdge(m, o, d, v) => {
            let (g, o, d) = (graph(*m), name(*o), name(*d));
            if let Some(idx) = e.edge_indices_at(g, &o, &d, &at).last() {
                e.set_edge_val(g, &o, &d, *idx, "w", v.map(|v| json!(v))).unwrap();
            }
        }
        Op::SetGraph(m, v) => {
            e.set_graph_val(graph(*m), "title", v.map(|v| json!(v))).unwrap();
        }
        Op::NextTurn => {
            e.next_turn().unwrap();
        }
        Op::Switch(b) => {
            let id = BranchId::from(format!("b{b}"));
            match e.tree().get(&id).map(|br| br.end_turn) {
                Some(end) => e.time_travel(id, end, None).unwrap(),
                None => e.time_travel(id, at.turn, Some(at.tick)).unwrap(),
            }
        }
        Op::Back(pick) => {
            let fork = e
                .tree()
                .get(&at.branch)
                .and_then(|b| b.parent.as_ref().map(|_| b.parent_rev()));
            let here: Vec<&Btt> = seen
                .iter()
                .filter(|b| b.branch == at.branch && fork.is_none_or(|rev| b.rev() >= rev))
                .collect();
            if let Some(to) = here.get(usize::from(*pick) % here.len().max(1)) {
                e.time_travel(to.branch.clone(), to.turn, Some(to.tick)).unwrap();
            }
        }
        Op::Plan => {
            if !e.is_planning() {
                e.plan().unwrap();
            }
        }
        Op::Rollback => {
            if e.is_planning() {
                e.rollback_plan().unwrap();
            }
        }
        Op::Commit => {
            if e.is_planning() {
                e.commit_plan().unwrap();
            } else {
                e.commit().unwrap();
            }
        }
    }
}

#[test]
fn mirror_plus_delta_equals_a_fresh_read() {
    let ops = prop::collection::vec(op_strategy(), 1..40);
    pinned_runner(0x23, 48)
        .run(&ops, |ops| {
            let mut e = world();
            let mut seen: Vec<Btt> = vec![e.btt().clone()];
            let mut mirror = Mirror::capture(&e, e.btt()).unwrap();
            let mut before_plan: Vec<(Btt, MirrorState)> = Vec::new();
            for op in &ops {
                let prev = e.btt().clone();
                let planning = e.is_planning();
                if matches!(op, Op::Plan) && !planning {
                    before_plan = seen.iter().map(|b| (b.clone(), MirrorState::read(&e, b))).collect();
                }
                apply(&mut e, op, &seen);
                let cur = e.btt().clone();
                if matches!(op, Op::Rollback) && planning {
                    for (at, state) in &before_plan {
                        prop_assert_eq!(&MirrorState::read(&e, at), state, "rolled back at {}", at);
                    }
                    mirror = Mirror::capture(&e, &cur).unwrap();
                } else {
                    mirror.apply_delta(&e.diff(&prev, &cur).unwrap()).unwrap();
                }
                prop_assert_eq!(mirror.state(), &MirrorState::read(&e, &cur), "after {:?} at {}", op, cur);
                seen.push(cur);
            }
            let last = seen[seen.len() - 1].clone();
            for x in seen.iter().step_by(3).chain(std::iter::once(&last)) {
                for y in [&seen[0], &last] {
                    prop_assert!(e.diff(x, x).unwrap().is_empty());
                    let mut mirror = Mirror::capture(&e, x).unwrap();
                    mirror.apply_delta(&e.diff(x, y).unwrap()).unwrap();
                    prop_assert_eq!(mirror.state(), &MirrorState::read(&e, y), "{} -> {}", x, y);
                    prop_assert_eq!(
                        mirror.digest().unwrap(),
                        MirrorState::read(&e, y).digest().unwrap()
                    );
                }
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn deleting_a_node_again_after_travelling_back_ends_its_later_edges() {
    let mut e = world();
    let start = e.btt().clone();
    e.next_turn().unwrap();
    e.add_edge("g", "b", "a", 0).unwrap();
    e.del_node("g", "a").unwrap();
    e.time_travel(start.branch.clone(), start.turn, Some(start.tick)).unwrap();
    e.del_node("g", "a").unwrap();

    let later = start.at((1, 1));
    assert!(!e.node_exists_at("g", "a", &later));
    assert!(!e.edge_exists_at("g", "b", "a", 0, &later));
    assert!(!e.successors_at("g", "b", &later).contains(&"a".to_owned()));

    let mut mirror = Mirror::capture(&e, &start).unwrap();
    mirror.apply_delta(&e.diff(&start, &later).unwrap()).unwrap();
    assert_eq!(mirror.state(), &MirrorState::read(&e, &later));
}
