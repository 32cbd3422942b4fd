use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const STATE_SCHEMA_VERSION: u32 = 1;
pub const STATE_FILE_NAME: &str = "session.v1.json";
const STATE_DIR_NAME: &str = "llm-gateway";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The write would take the store past its byte budget. Nothing was written.
    #[error("storage quota exceeded: {required} bytes needed, {limit} allowed")]
    QuotaExceeded { required: usize, limit: usize },
    #[error("storage encode failed: {0}")]
    Encode(String),
    #[error("storage write failed: {0}")]
    Write(String),
}

/// String key/value storage with the semantics of a browser storage area:
/// reads never fail, writes may.
pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

type Entries = BTreeMap<String, String>;

fn lock_entries(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_quota(
    entries: &BTreeMap<String, String>,
    key: &str,
    value: &str,
    limit: Option<usize>,
) -> Result<(), StorageError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let required = entries
        .iter()
        .filter(|(existing, _)| existing.as_str() != key)
        .map(|(existing, stored)| existing.len() + stored.len())
        .sum::<usize>()
        + key.len()
        + value.len();
    if required > limit {
        return Err(StorageError::QuotaExceeded { required, limit });
    }
    Ok(())
}

/// In-process storage that lives as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once keys plus values exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock_entries(&self.entries).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = lock_entries(&self.entries);
        check_quota(&entries, key, value, self.quota_bytes)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        lock_entries(&self.entries).remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Storage persisted as one JSON document, rewritten on every change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn load_default() -> Self {
        Self::load(default_state_path())
    }

    /// Opens the document at `path`. A missing, unreadable or foreign-version
    /// file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StateDocument>(raw.as_str()) {
                Ok(document) if document.version == STATE_SCHEMA_VERSION => document.entries,
                Ok(document) => {
                    tracing::warn!(
                        path = %path.display(),
                        version = document.version,
                        "ignoring state file with unknown schema version"
                    );
                    BTreeMap::new()
                }
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "ignoring unreadable state file"
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|error| StorageError::Write(format!("state mkdir failed: {error}")))?;
        }
        let encoded = serde_json::to_string_pretty(&StateDocument {
            version: STATE_SCHEMA_VERSION,
            entries: entries.clone(),
        })
        .map_err(|error| StorageError::Encode(error.to_string()))?;
        fs::write(&self.path, encoded).map_err(|error| StorageError::Write(error.to_string()))
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock_entries(&self.entries).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = lock_entries(&self.entries);
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(error) = self.flush(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(error);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = lock_entries(&self.entries);
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.flush(&entries)
    }
}

/// `<data_local_dir>/llm-gateway/session.v1.json`, falling back to the home
/// directory and finally the working directory.
pub fn default_state_path() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push(STATE_DIR_NAME);
        data_dir.push(STATE_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(format!(".{STATE_DIR_NAME}"));
        home_dir.push(STATE_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(STATE_FILE_NAME)
}
