// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs, clippy::unwrap_used)]

use std::path::PathBuf;

use strata_config::{CliPrefs, ConfigError, ConfigService, ConfigStore, FsConfigStore};
use strata_core::EngineConfig;

#[test]
fn prefs_round_trip_through_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let svc = ConfigService::new(FsConfigStore::with_dir(dir.path().join("nested")).unwrap());
    assert_eq!(svc.load::<CliPrefs>().unwrap(), CliPrefs::default());

    let prefs = CliPrefs {
        store: Some(PathBuf::from("/tmp/world.strata")),
        log_filter: "strata_core=debug".into(),
    };
    svc.save(&prefs).unwrap();
    assert!(dir.path().join("nested").join("cli.json").is_file());
    assert_eq!(svc.load::<CliPrefs>().unwrap(), prefs);
}

#[test]
fn engine_settings_are_pretty_printed_without_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let svc = ConfigService::new(FsConfigStore::with_dir(dir.path()).unwrap());
    svc.update(|cfg: &mut EngineConfig| cfg.trunk = "main".into()).unwrap();
    let text = std::fs::read_to_string(dir.path().join("engine.json")).unwrap();
    assert!(text.contains("\n  \"trunk\": \"main\""));
    assert!(text.ends_with('\n'));
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, ["engine.json"]);
}

#[test]
fn a_hand_edited_zero_modulus_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("engine.json"), r#"{"commit_modulus": 0}"#).unwrap();
    let svc = ConfigService::new(FsConfigStore::with_dir(dir.path()).unwrap());
    let err = svc.load::<EngineConfig>().unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "engine", .. }), "{err}");
}

#[test]
fn keys_cannot_escape_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsConfigStore::with_dir(dir.path()).unwrap();
    for key in ["../evil", "a/b", "", ".hidden", "Engine"] {
        assert!(matches!(store.save_raw(key, b"{}"), Err(ConfigError::BadKey(_))), "{key}");
    }
    assert!(store.load_raw("missing").unwrap().is_none());
}
