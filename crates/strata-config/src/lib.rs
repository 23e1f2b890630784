// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Configuration for Strata tools.
//! Engine settings and CLI preferences are [`ConfigDoc`]s: validated JSON
//! documents loaded through a [`ConfigService`] over a pluggable
//! [`ConfigStore`]. [`FsConfigStore`] keeps them in one directory.

pub mod doc;
pub mod fs;
pub mod prefs;
pub mod service;

pub use doc::ENGINE_CONFIG_KEY;
pub use fs::{FsConfigStore, CONFIG_DIR_ENV};
pub use prefs::{CliPrefs, CLI_PREFS_KEY};
pub use service::{ConfigDoc, ConfigError, ConfigService, ConfigStore};
