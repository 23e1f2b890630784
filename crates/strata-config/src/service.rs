// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed config documents over a raw blob store.

use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// A settings document persisted under a fixed key.
///
/// Missing documents load as [`Default::default`]; every load and save runs
/// [`ConfigDoc::validate`] so a bad file never reaches the engine.
pub trait ConfigDoc: Serialize + DeserializeOwned + Default {
    /// Logical name; the filesystem store keeps it in `{KEY}.json`.
    const KEY: &'static str;

    /// Rejects values the consumer cannot run with.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Storage port for raw config blobs, keyed by logical name.
pub trait ConfigStore {
    /// Loads a raw blob, `Ok(None)` when nothing was saved under `key`.
    fn load_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError>;
    /// Persists a raw blob, replacing any previous one.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither an override nor a platform config directory is available.
    #[error("could not resolve a config directory")]
    NoConfigDir,
    /// Key would not map to a plain file name.
    #[error("invalid config key {0:?}")]
    BadKey(String),
    /// I/O error while reading or writing.
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Stored document is not valid JSON for its type.
    #[error("malformed {key} config: {source}")]
    Parse {
        /// Document key.
        key: &'static str,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Document parsed but failed [`ConfigDoc::validate`].
    #[error("invalid {key} config: {reason}")]
    Invalid {
        /// Document key.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Loads and saves [`ConfigDoc`]s through a [`ConfigStore`].
#[derive(Debug)]
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Creates a service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrows the inner store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Loads `T`, falling back to its default when absent or blank.
    pub fn load<T: ConfigDoc>(&self) -> Result<T, ConfigError> {
        let doc = match self.store.load_raw(T::KEY)? {
            Some(bytes) if !bytes.trim_ascii().is_empty() => {
                serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                    key: T::KEY,
                    source,
                })?
            }
            _ => T::default(),
        };
        check(&doc)?;
        Ok(doc)
    }

    /// Validates `doc` and persists it as pretty JSON.
    pub fn save<T: ConfigDoc>(&self, doc: &T) -> Result<(), ConfigError> {
        check(doc)?;
        let mut data = serde_json::to_vec_pretty(doc).map_err(|source| ConfigError::Parse {
            key: T::KEY,
            source,
        })?;
        data.push(b'\n');
        self.store.save_raw(T::KEY, &data)
    }

    /// Loads `T`, applies `edit` and saves the result.
    ///
    /// Nothing is written when the edited document fails validation.
    pub fn update<T: ConfigDoc>(&self, edit: impl FnOnce(&mut T)) -> Result<T, ConfigError> {
        let mut doc = self.load::<T>()?;
        edit(&mut doc);
        self.save(&doc)?;
        Ok(doc)
    }
}

fn check<T: ConfigDoc>(doc: &T) -> Result<(), ConfigError> {
    doc.validate()
        .map_err(|reason| ConfigError::Invalid { key: T::KEY, reason })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Default)]
    struct MemStore(RefCell<BTreeMap<String, Vec<u8>>>);

    impl ConfigStore for MemStore {
        fn load_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
            Ok(self.0.borrow().get(key).cloned())
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Window {
        turns: u64,
    }

    impl ConfigDoc for Window {
        const KEY: &'static str = "window";

        fn validate(&self) -> Result<(), String> {
            if self.turns > 100 {
                return Err(format!("{} turns is too wide", self.turns));
            }
            Ok(())
        }
    }

    #[test]
    fn absent_and_blank_documents_load_as_default() {
        let svc = ConfigService::new(MemStore::default());
        assert_eq!(svc.load::<Window>().unwrap(), Window::default());
        svc.store().save_raw("window", b"  \n").unwrap();
        assert_eq!(svc.load::<Window>().unwrap(), Window::default());
    }

    #[test]
    fn update_persists_the_edit() {
        let svc = ConfigService::new(MemStore::default());
        let doc = svc.update(|w: &mut Window| w.turns = 4).unwrap();
        assert_eq!(doc.turns, 4);
        assert_eq!(svc.load::<Window>().unwrap(), Window { turns: 4 });
    }

    #[test]
    fn rejected_edits_leave_the_stored_document_alone() {
        let svc = ConfigService::new(MemStore::default());
        svc.save(&Window { turns: 7 }).unwrap();
        let err = svc.update(|w: &mut Window| w.turns = 500).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "window", .. }));
        assert_eq!(svc.load::<Window>().unwrap().turns, 7);
    }

    #[test]
    fn invalid_stored_documents_fail_to_load() {
        let svc = ConfigService::new(MemStore::default());
        svc.store().save_raw("window", br#"{"turns": 101}"#).unwrap();
        assert!(matches!(svc.load::<Window>(), Err(ConfigError::Invalid { .. })));
        svc.store().save_raw("window", b"{not json").unwrap();
        assert!(matches!(svc.load::<Window>(), Err(ConfigError::Parse { key: "window", .. })));
    }
}
