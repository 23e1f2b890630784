// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine settings as a stored document.

use strata_core::EngineConfig;

use crate::service::ConfigDoc;

/// Key the engine settings are stored under.
pub const ENGINE_CONFIG_KEY: &str = "engine";

impl ConfigDoc for EngineConfig {
    const KEY: &'static str = ENGINE_CONFIG_KEY;

    fn validate(&self) -> Result<(), String> {
        if self.trunk.trim().is_empty() {
            return Err("trunk branch name is empty".to_owned());
        }
        if self.trunk.trim() != self.trunk {
            return Err(format!("trunk branch name {:?} has surrounding whitespace", self.trunk));
        }
        if self.commit_modulus == Some(0) {
            return Err("commit_modulus must be at least 1; omit it to disable".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn unusable_trunks_and_moduli_are_rejected() {
        for trunk in ["", "  ", " main"] {
            let cfg = EngineConfig {
                trunk: trunk.into(),
                ..EngineConfig::default()
            };
            assert!(cfg.validate().is_err(), "{trunk:?}");
        }
        let cfg = EngineConfig {
            commit_modulus: Some(0),
            ..EngineConfig::default()
        };
        assert!(cfg.validate().unwrap_err().contains("commit_modulus"));
    }
}
