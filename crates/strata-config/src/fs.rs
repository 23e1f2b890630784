// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed [`ConfigStore`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::debug;

use crate::service::{ConfigError, ConfigStore};

/// Environment variable that overrides the platform config directory.
pub const CONFIG_DIR_ENV: &str = "STRATA_CONFIG_DIR";

/// Stores documents as `{key}.json` files in one directory.
///
/// Saves go through a sibling temp file and a rename, so a crash mid-write
/// leaves the previous document in place.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Opens `$STRATA_CONFIG_DIR`, or the platform dir (e.g. `~/.config/strata`).
    pub fn new() -> Result<Self, ConfigError> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
            return Self::with_dir(PathBuf::from(dir));
        }
        let proj =
            ProjectDirs::from("dev", "flyingrobots", "Strata").ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(proj.config_dir())
    }

    /// Opens `dir`, creating it if needed.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = dir.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|source| io_error(&base, source))?;
        debug!(dir = %base.display(), "config dir opened");
        Ok(Self { base })
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.base
    }

    /// Path the document under `key` lives at.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, ConfigError> {
        let plain = key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if key.is_empty() || !plain {
            return Err(ConfigError::BadKey(key.to_owned()));
        }
        Ok(self.base.join(format!("{key}.json")))
    }
}

fn io_error(path: &Path, source: io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|source| io_error(&tmp, source))?;
        fs::rename(&tmp, &path).map_err(|source| io_error(&path, source))?;
        debug!(key, bytes = data.len(), "config saved");
        Ok(())
    }
}
