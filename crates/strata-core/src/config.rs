// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine settings.
use serde::{Deserialize, Serialize};

/// Settings the engine is constructed with.
///
/// Binaries load this through `strata-config`; missing fields take their
/// defaults so an empty `{}` is a valid configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the root branch.
    pub trunk: String,
    /// Commit automatically on every turn divisible by this.
    pub commit_modulus: Option<u64>,
    /// Maintain key snapshots for fast iteration.
    pub keycache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trunk: "trunk".to_owned(),
            commit_modulus: None,
            keycache: true,
        }
    }
}
