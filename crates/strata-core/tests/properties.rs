// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used)]
mod common;

use common::{engine, get, pinned_runner, put, trunk, world, Scalars};
use proptest::prelude::*;
use serde_json::json;
use strata_core::{Btt, BranchTree, GraphKind, HistoryError, Lookup, Mirror, MirrorState, WriteMode};

#[test]
fn forward_writes_keep_every_earlier_revision() {
    let steps = prop::collection::vec((0_u64..3, 1_u64..4, any::<i64>()), 1..40);
    pinned_runner(0x11, 64)
        .run(&steps, |steps| {
            let tree = BranchTree::new("trunk");
            let mut cache = Scalars::new("scalars");
            let (mut turn, mut tick) = (0, 0);
            let mut written = Vec::new();
            for (dturn, dtick, value) in steps {
                if dturn > 0 {
                    turn += dturn;
                    tick = 0;
                } else {
                    tick += dtick;
                }
                put(&mut cache, &tree, "k", &trunk(), turn, tick, Some(value), WriteMode::Forward);
                written.push((turn, tick, value));
            }
            for (turn, tick, value) in &written {
                prop_assert_eq!(get(&cache, &tree, "k", &trunk(), *turn, *tick), Lookup::Found(*value));
            }
            let (turn, tick, value) = written[written.len() - 1];
            prop_assert_eq!(get(&cache, &tree, "k", &trunk(), turn + 10, tick), Lookup::Found(value));
            Ok(())
        })
        .unwrap();
}

#[test]
fn paradox_write_truncates_the_future_of_its_key() {
    let tree = BranchTree::new("trunk");
    let mut cache = Scalars::new("scalars");
    for (tick, value) in [(5, 50), (10, 100), (15, 150)] {
        put(&mut cache, &tree, "k", &trunk(), 0, tick, Some(value), WriteMode::Default);
    }
    put(&mut cache, &tree, "k", &trunk(), 0, 8, Some(80), WriteMode::Default);
    assert_eq!(get(&cache, &tree, "k", &trunk(), 0, 12), Lookup::Found(80));
    assert_eq!(get(&cache, &tree, "k", &trunk(), 0, 20), Lookup::Found(80));
    assert_eq!(get(&cache, &tree, "k", &trunk(), 0, 5), Lookup::Found(50));
    let history = cache.history(&"g".to_owned(), &"k".to_owned(), &trunk()).unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn child_falls_back_to_parent_as_of_divergence() {
    let mut tree = BranchTree::new("B");
    let b = "B".into();
    let c = "C".into();
    let mut cache = Scalars::new("scalars");
    put(&mut cache, &tree, "k", &b, 1, 0, Some(1), WriteMode::Default);
    tree.extend(&b, 3, 0);
    tree.create("C".into(), "B".into(), 3, 0).unwrap();
    put(&mut cache, &tree, "k", &b, 4, 0, Some(4), WriteMode::Default);
    assert_eq!(get(&cache, &tree, "k", &c, 5, 0), Lookup::Found(1));
    assert_eq!(get(&cache, &tree, "k", &b, 5, 0), Lookup::Found(4));
}

#[test]
fn deletion_stops_ancestor_fallback() {
    let mut tree = BranchTree::new("trunk");
    let child = "B".into();
    let mut cache = Scalars::new("scalars");
    put(&mut cache, &tree, "k", &trunk(), 0, 0, Some(7), WriteMode::Default);
    tree.extend(&trunk(), 1, 0);
    tree.create("B".into(), trunk(), 1, 0).unwrap();
    put(&mut cache, &tree, "k", &child, 2, 0, None, WriteMode::Default);
    let seen = get(&cache, &tree, "k", &child, 5, 0);
    assert_eq!(seen, Lookup::Deleted);
    assert_eq!(seen.require("g.k"), Err(HistoryError::Deleted { key: "g.k".into() }));
    assert_eq!(get(&cache, &tree, "k", &child, 1, 5), Lookup::Found(7));
}

#[test]
fn delta_takes_a_mirror_from_one_coordinate_to_another() {
    let mut e = world();
    let x = e.btt().clone();
    e.next_turn().unwrap();
    e.set_node_val("g", "a", "hp", Some(json!(2))).unwrap();
    e.add_node("g", "c").unwrap();
    e.set_node_val("g", "c", "name", Some(json!("cee"))).unwrap();
    e.add_edge("g", "b", "c", 0).unwrap();
    e.del_edge("g", "a", "b", 0).unwrap();
    let (idx, _) = e.new_edge("m", "a", "b").unwrap();
    e.set_edge_val("m", "a", "b", idx, "w", Some(json!(0.5))).unwrap();
    e.set_graph_val("g", "title", Some(json!("G"))).unwrap();
    let y = e.btt().clone();

    assert!(e.diff(&x, &x).unwrap().is_empty());
    let mut mirror = Mirror::capture(&e, &x).unwrap();
    mirror.apply_delta(&e.diff(&x, &y).unwrap()).unwrap();
    assert_eq!(mirror.state(), &MirrorState::read(&e, &y));
    assert_eq!(mirror.btt(), &y);

    let mut back = Mirror::capture(&e, &y).unwrap();
    back.apply_delta(&e.diff(&y, &x).unwrap()).unwrap();
    assert_eq!(back.state(), &MirrorState::read(&e, &x));
}

#[test]
fn deleted_node_hides_attributes_and_flips_once() {
    let mut e = world();
    let before = e.btt().clone();
    e.del_node("g", "a").unwrap();
    let after = e.btt().clone();
    assert!(e.node_val_at("g", "a", "hp", &after).found().is_none());
    assert!(!e.edge_exists_at("g", "a", "b", 0, &after));

    let delta = e.diff(&before, &after).unwrap();
    let g = &delta.graphs["g"];
    assert_eq!(g.nodes.get("a"), Some(&false));
    assert!(!g.node_val.contains_key("a"));
    assert_eq!(g.edges["a"].get("b"), Some(&false));
}

#[test]
fn trunk_value_is_inherited_until_alt_deletes_it() {
    let mut e = engine();
    e.new_graph("g", GraphKind::DiGraph).unwrap();
    e.add_node("g", "n").unwrap();
    e.set_node_val("g", "n", "K", Some(json!(1))).unwrap();
    e.time_travel("trunk", 1, Some(0)).unwrap();
    e.set_node_val("g", "n", "K", Some(json!(2))).unwrap();
    let forked_at = e.btt().clone();

    e.time_travel("alt", forked_at.turn, Some(forked_at.tick)).unwrap();
    assert_eq!(e.tree().parent_of(&"alt".into()).map(|(p, _, _)| p.clone()), Some("trunk".into()));
    e.time_travel("alt", 2, Some(0)).unwrap();
    assert_eq!(e.node_val_at("g", "n", "K", e.btt()).cloned(), Lookup::Found(json!(2)));

    e.set_node_val("g", "n", "K", None).unwrap();
    let alt3 = Btt::new("alt", 3, 0);
    let trunk3 = Btt::new("trunk", 3, 0);
    assert_eq!(
        e.node_val_at("g", "n", "K", &alt3).require("g.n.K"),
        Err(HistoryError::Deleted { key: "g.n.K".into() })
    );
    assert_eq!(e.node_val_at("g", "n", "K", &trunk3).cloned(), Lookup::Found(json!(2)));
}
