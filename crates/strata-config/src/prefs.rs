// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Saved preferences for Strata command-line tools.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::service::ConfigDoc;

/// Key the CLI preferences are stored under.
pub const CLI_PREFS_KEY: &str = "cli";

/// Defaults applied when a flag is omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliPrefs {
    /// Fact store file used when `--store` is not given.
    pub store: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for CliPrefs {
    fn default() -> Self {
        Self {
            store: None,
            log_filter: "info".to_owned(),
        }
    }
}

impl ConfigDoc for CliPrefs {
    const KEY: &'static str = CLI_PREFS_KEY;

    fn validate(&self) -> Result<(), String> {
        if self.log_filter.trim().is_empty() {
            return Err("log_filter is empty".to_owned());
        }
        if self.store.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err("default store path is empty".to_owned());
        }
        Ok(())
    }
}
