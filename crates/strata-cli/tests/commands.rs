// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used)]

use std::path::PathBuf;

use clap::Parser;
use serde_json::{json, Value};
use strata_cli::{config_service, run, Cli};
use strata_config::CliPrefs;
use strata_core::{Engine, EngineConfig, GraphKind, MemoryFactStore};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn store(&self) -> PathBuf {
        self.dir.path().join("world.strata")
    }

    fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<Value> {
        let store = self.store();
        let config_dir = self.config_dir();
        let mut argv = vec![
            "strata",
            "--store",
            store.to_str().unwrap(),
            "--config-dir",
            config_dir.to_str().unwrap(),
        ];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        let config = config_service(cli.config_dir.as_deref()).unwrap();
        let prefs: CliPrefs = config.load().unwrap();
        run(cli, &config, &prefs)
    }

    /// trunk: `a` born at 0:1, hp 1 at 0:2, hp 2 at 1:1; alt forks at 0:2 and sets hp 7.
    fn seed(&self) {
        let store = MemoryFactStore::open(self.store()).unwrap();
        let mut engine = Engine::load(store, EngineConfig::default()).unwrap();
        engine.new_graph("g", GraphKind::DiGraph).unwrap();
        engine.add_node("g", "a").unwrap();
        engine.set_node_val("g", "a", "hp", Some(json!(1))).unwrap();
        engine.next_turn().unwrap();
        engine.set_node_val("g", "a", "hp", Some(json!(2))).unwrap();
        engine.time_travel("trunk", 0, Some(2)).unwrap();
        engine.time_travel("alt", 0, Some(2)).unwrap();
        engine.set_node_val("g", "a", "hp", Some(json!(7))).unwrap();
        engine.commit().unwrap();
    }
}

#[test]
fn init_creates_graphs_and_refuses_to_clobber() {
    let fx = Fixture::new();
    let out = fx
        .run(&["init", "--graph", "physical", "--multigraph", "roads"])
        .unwrap();
    assert!(fx.store().is_file());
    assert_eq!(out["btt"], json!({"branch": "trunk", "turn": 0, "tick": 0}));

    let graphs = fx.run(&["graphs"]).unwrap();
    assert_eq!(
        graphs,
        json!([
            {"name": "physical", "kind": "DiGraph"},
            {"name": "roads", "kind": "MultiDiGraph"},
        ])
    );
    assert!(fx.run(&["init"]).is_err());
}

#[test]
fn inspection_needs_an_existing_store() {
    let fx = Fixture::new();
    let err = fx.run(&["branches"]).unwrap_err();
    assert!(err.to_string().contains("strata init"));
}

#[test]
fn show_reads_any_coordinate() {
    let fx = Fixture::new();
    fx.seed();

    let now = fx.run(&["show", "g"]).unwrap();
    assert_eq!(now["btt"]["branch"], "alt");
    assert_eq!(now["graph"]["nodes"]["a"]["hp"], 7);

    let then = fx.run(&["show", "g", "--at", "trunk:1"]).unwrap();
    assert_eq!(then["graph"]["nodes"]["a"]["hp"], 2);

    let before = fx.run(&["show", "g", "--at", "trunk:0:0"]).unwrap();
    assert_eq!(before["graph"]["nodes"], json!({}));

    assert!(fx.run(&["show", "nope"]).is_err());
    assert!(fx.run(&["show", "g", "--at", "ghost:0"]).is_err());
}

#[test]
fn diff_lists_only_what_changed() {
    let fx = Fixture::new();
    fx.seed();
    let delta = fx.run(&["diff", "trunk:1:1", "alt:0:3"]).unwrap();
    assert_eq!(delta["graphs"]["g"]["node_val"]["a"]["hp"], 7);
    assert!(delta["graphs"]["g"].get("nodes").is_none());

    let none = fx.run(&["diff", "alt:0:3", "alt:0:3"]).unwrap();
    assert!(none.get("graphs").is_none());
}

#[test]
fn digest_tracks_content_not_coordinates() {
    let fx = Fixture::new();
    fx.seed();
    let fork = fx.run(&["digest", "--at", "alt:0:2"]).unwrap();
    let parent = fx.run(&["digest", "--at", "trunk:0:2"]).unwrap();
    let later = fx.run(&["digest", "--at", "trunk:1:1"]).unwrap();
    assert_eq!(fork["digest"], parent["digest"]);
    assert_ne!(parent["digest"], later["digest"]);
    assert_eq!(parent["digest"].as_str().unwrap().len(), 64);
}

#[test]
fn history_lists_one_branch() {
    let fx = Fixture::new();
    fx.seed();
    let trunk = fx.run(&["history", "g", "a", "hp", "--branch", "trunk"]).unwrap();
    assert_eq!(
        trunk["entries"],
        json!([
            {"turn": 0, "tick": 2, "value": 1},
            {"turn": 1, "tick": 1, "value": 2},
        ])
    );
    let alt = fx.run(&["history", "g", "a", "hp"]).unwrap();
    assert_eq!(alt["branch"], "alt");
    assert_eq!(alt["entries"], json!([{"turn": 0, "tick": 3, "value": 7}]));
}

#[test]
fn prefs_and_engine_config_come_from_the_config_dir() {
    let fx = Fixture::new();
    let saved = fx
        .run(&["prefs", "--default-store", "/tmp/elsewhere.strata", "--log-filter", "debug"])
        .unwrap();
    assert_eq!(saved["log_filter"], "debug");

    let config = config_service(Some(fx.config_dir().as_path())).unwrap();
    let prefs: CliPrefs = config.load().unwrap();
    assert_eq!(prefs.store, Some(PathBuf::from("/tmp/elsewhere.strata")));

    config
        .save(&EngineConfig {
            trunk: "main".into(),
            ..EngineConfig::default()
        })
        .unwrap();
    let out = fx.run(&["init"]).unwrap();
    assert_eq!(out["btt"]["branch"], "main");
}
