// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used)]

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::json;
use strata_core::{Btt, ChangeEvent, Engine, EngineConfig, GraphKind, MemoryFactStore, MirrorState};
use strata_proxy::{spawn_engine, ProxyError};
use tokio::time::{timeout, Duration};

async fn within<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(5), fut).await.unwrap()
}

fn engine() -> Engine {
    Engine::new(MemoryFactStore::new(), EngineConfig::default())
}

#[tokio::test]
async fn sync_writes_move_the_mirror_with_the_engine() {
    let (mut proxy, worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::DiGraph)).await.unwrap();
    within(proxy.add_node("g", "a")).await.unwrap();
    within(proxy.add_node("g", "b")).await.unwrap();
    within(proxy.add_edge("g", "a", "b", 0)).await.unwrap();
    within(proxy.set_node_val("g", "a", "hp", Some(json!(5)))).await.unwrap();

    assert_eq!(proxy.mirror().btt(), &Btt::new("trunk", 0, 4));
    assert_eq!(proxy.mirror().node_val("g", "a", "hp"), Some(&json!(5)));
    assert!(proxy.mirror().graph("g").unwrap().edges["a"]["b"].contains_key(&0));

    let mirror_state = proxy.mirror().state().clone();
    drop(proxy);
    let engine = worker.join().unwrap();
    assert_eq!(MirrorState::read(&engine, engine.btt()), mirror_state);
}

#[tokio::test]
async fn remote_errors_surface_without_moving_the_cursor() {
    let (mut proxy, _worker) = spawn_engine(engine()).unwrap();
    let err = within(proxy.add_node("missing", "a")).await.unwrap_err();
    assert!(matches!(err, ProxyError::Remote(ref msg) if msg.contains("missing")));
    assert_eq!(within(proxy.btt()).await.unwrap(), Btt::new("trunk", 0, 0));
}

#[tokio::test]
async fn silent_writes_are_optimistic_and_notify_once() {
    let (mut proxy, _worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::DiGraph)).await.unwrap();
    within(proxy.add_node("g", "a")).await.unwrap();

    let seen: Arc<Mutex<Vec<ChangeEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    proxy
        .mirror_mut()
        .subscribe_all(Box::new(move |ev| sink.lock().unwrap().push(ev.clone())));

    proxy
        .set_node_val_silent("g", "a", "mood", Some(json!("calm")))
        .unwrap();
    assert_eq!(proxy.mirror().node_val("g", "a", "mood"), Some(&json!("calm")));
    assert_eq!(proxy.mirror().btt(), &Btt::new("trunk", 0, 1));

    let delta = within(proxy.pull()).await.unwrap();
    assert_eq!(delta.to, Btt::new("trunk", 0, 2));
    assert_eq!(proxy.mirror().btt(), &Btt::new("trunk", 0, 2));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn silent_writes_to_unknown_nodes_fail_locally() {
    let (mut proxy, _worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::DiGraph)).await.unwrap();
    let err = proxy
        .set_node_val_silent("g", "ghost", "hp", Some(json!(1)))
        .unwrap_err();
    assert!(matches!(err, ProxyError::Mirror(_)));
}

#[tokio::test]
async fn time_travel_rewinds_the_mirror() {
    let (mut proxy, _worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::MultiDiGraph)).await.unwrap();
    within(proxy.add_node("g", "a")).await.unwrap();
    within(proxy.next_turn()).await.unwrap();
    within(proxy.set_node_val("g", "a", "hp", Some(json!(9)))).await.unwrap();
    within(proxy.add_node("g", "b")).await.unwrap();

    let back = within(proxy.time_travel("trunk", 0, None)).await.unwrap();
    assert_eq!(back, Btt::new("trunk", 0, 1));
    assert_eq!(proxy.mirror().btt(), &back);
    let g = proxy.mirror().graph("g").unwrap();
    assert!(g.nodes.contains_key("a"));
    assert!(!g.nodes.contains_key("b"));
    assert_eq!(proxy.mirror().node_val("g", "a", "hp"), None);

    within(proxy.time_travel("alt", 0, Some(1))).await.unwrap();
    within(proxy.set_node_val("g", "a", "hp", Some(json!(1)))).await.unwrap();
    assert_eq!(proxy.mirror().btt(), &Btt::new("alt", 0, 2));
    assert_eq!(proxy.mirror().node_val("g", "a", "hp"), Some(&json!(1)));
}

#[tokio::test]
async fn requests_run_in_arrival_order() {
    let (mut proxy, worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::DiGraph)).await.unwrap();
    within(proxy.add_node("g", "n")).await.unwrap();
    for i in 0..20 {
        proxy
            .set_node_val_silent("g", "n", "count", Some(json!(i)))
            .unwrap();
    }
    within(proxy.set_node_val("g", "n", "done", Some(json!(true)))).await.unwrap();
    assert_eq!(proxy.mirror().node_val("g", "n", "count"), Some(&json!(19)));
    assert_eq!(proxy.mirror().btt(), &Btt::new("trunk", 0, 22));

    drop(proxy);
    let engine = worker.join().unwrap();
    assert_eq!(
        engine.node_val_at("g", "n", "count", engine.btt()).require("count").unwrap(),
        Some(&json!(19))
    );
}

#[tokio::test]
async fn commit_reaches_the_store() {
    let (mut proxy, worker) = spawn_engine(engine()).unwrap();
    within(proxy.new_graph("g", GraphKind::DiGraph)).await.unwrap();
    within(proxy.add_node("g", "a")).await.unwrap();
    within(proxy.commit()).await.unwrap();
    drop(proxy);

    let store = worker.join().unwrap().into_store();
    let reloaded = Engine::load(store, EngineConfig::default()).unwrap();
    assert!(reloaded.node_exists_at("g", "a", reloaded.btt()));
}
