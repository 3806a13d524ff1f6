//! File-backed key share store.
//!
//! A share is written exactly once: the file for a given pool public key is
//! immutable after creation, and a save against an existing file is a no-op
//! that returns the existing path. Writes for distinct keys go to distinct
//! files, so serializing by filename is enough to keep the store consistent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no local state for public key {0}")]
    NotFound(String),

    #[error("io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A writer panicked mid-save; the store can no longer be trusted.
    #[error("state write lock poisoned")]
    LockPoisoned,
}

/// The saved share for one pool public key.
///
/// `local_party_save_data` is the MPC library's opaque serialized share;
/// this layer never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenLocalState {
    #[serde(rename = "LocalPartySaveData")]
    pub local_party_save_data: String,
    #[serde(rename = "ParticipantKeys")]
    pub participant_keys: Vec<String>,
    #[serde(rename = "LocalPartyKey")]
    pub local_party_key: String,
}

/// Contract the server programs against; file-backed in production,
/// swappable for tests.
pub trait LocalStateManager: Send + Sync {
    /// Persist the share for `pool_pub_key`, returning where it lives.
    /// Saving over an existing share is a no-op.
    fn save_local_state(
        &self,
        pool_pub_key: &str,
        state: &KeygenLocalState,
    ) -> Result<PathBuf, StorageError>;

    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState, StorageError>;

    fn has_local_state(&self, pool_pub_key: &str) -> bool;

    /// Replace the stored address book.
    fn save_address_book(
        &self,
        entries: &HashMap<String, Vec<String>>,
    ) -> Result<(), StorageError>;

    /// Addresses saved by a previous run; empty when none were saved.
    fn retrieve_address_book(&self) -> Result<HashMap<String, Vec<String>>, StorageError>;
}

const ADDRESS_BOOK_FILE: &str = "address_book.json";

/// Stores each share as `<base_folder>/<bech32 pool key>`.
pub struct FileStateMgr {
    base_folder: PathBuf,
    // Serializes writes per manager; distinct keys land in distinct files so
    // one lock over the whole store is sufficient.
    write_lock: Mutex<()>,
}

impl FileStateMgr {
    pub fn new(base_folder: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_folder = base_folder.as_ref().to_path_buf();
        fs::create_dir_all(&base_folder).map_err(|source| StorageError::Io {
            path: base_folder.clone(),
            source,
        })?;
        Ok(Self {
            base_folder,
            write_lock: Mutex::new(()),
        })
    }

    fn share_path(&self, pool_pub_key: &str) -> PathBuf {
        self.base_folder.join(pool_pub_key)
    }

    fn address_book_path(&self) -> PathBuf {
        self.base_folder.join(ADDRESS_BOOK_FILE)
    }
}

impl LocalStateManager for FileStateMgr {
    fn save_local_state(
        &self,
        pool_pub_key: &str,
        state: &KeygenLocalState,
    ) -> Result<PathBuf, StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        let path = self.share_path(pool_pub_key);
        if path.exists() {
            debug!(pool_pub_key, "share already on disk, keeping existing file");
            return Ok(path);
        }
        let data = serde_json::to_vec_pretty(state).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, data).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        info!(pool_pub_key, path = %path.display(), "saved keygen local state");
        Ok(path)
    }

    fn get_local_state(&self, pool_pub_key: &str) -> Result<KeygenLocalState, StorageError> {
        let path = self.share_path(pool_pub_key);
        if !path.exists() {
            return Err(StorageError::NotFound(pool_pub_key.to_string()));
        }
        let data = fs::read(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|e| StorageError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    fn has_local_state(&self, pool_pub_key: &str) -> bool {
        self.share_path(pool_pub_key).exists()
    }

    fn save_address_book(
        &self,
        entries: &HashMap<String, Vec<String>>,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        let path = self.address_book_path();
        let data = serde_json::to_vec_pretty(entries).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, data).map_err(|source| StorageError::Io { path, source })
    }

    fn retrieve_address_book(&self) -> Result<HashMap<String, Vec<String>>, StorageError> {
        let path = self.address_book_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|e| StorageError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> KeygenLocalState {
        KeygenLocalState {
            local_party_save_data: "{\"secret\":\"aa\"}".to_string(),
            participant_keys: vec!["k1".to_string(), "k2".to_string()],
            local_party_key: "k1".to_string(),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();

        let path = mgr.save_local_state("poolkey1", &sample_state()).unwrap();
        assert!(path.exists());
        assert!(mgr.has_local_state("poolkey1"));

        let loaded = mgr.get_local_state("poolkey1").unwrap();
        assert_eq!(loaded, sample_state());
    }

    #[test]
    fn test_share_file_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();

        let path = mgr.save_local_state("poolkey1", &sample_state()).unwrap();
        let original = std::fs::read(&path).unwrap();

        let mut altered = sample_state();
        altered.local_party_key = "k2".to_string();
        let second = mgr.save_local_state("poolkey1", &altered).unwrap();
        assert_eq!(path, second);

        // The original bytes survive the second save untouched.
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(mgr.get_local_state("poolkey1").unwrap(), sample_state());
    }

    #[test]
    fn test_missing_state_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        assert!(!mgr.has_local_state("nope"));
        assert!(matches!(
            mgr.get_local_state("nope"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_state_file_uses_canonical_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        let path = mgr.save_local_state("poolkey1", &sample_state()).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("LocalPartySaveData"));
        assert!(raw.contains("ParticipantKeys"));
        assert!(raw.contains("LocalPartyKey"));
    }

    #[test]
    fn test_address_book_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        assert!(mgr.retrieve_address_book().unwrap().is_empty());

        let mut entries = HashMap::new();
        entries.insert(
            "peer1".to_string(),
            vec!["/ip4/127.0.0.1/tcp/1234".to_string()],
        );
        mgr.save_address_book(&entries).unwrap();
        assert_eq!(mgr.retrieve_address_book().unwrap(), entries);
    }
}
