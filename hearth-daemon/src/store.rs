//! Local key-value stores (`local.json`, `chat.json`).
//!
//! Each store is one JSON document. Writes use the atomic `.tmp` + rename
//! pattern. [`LocalStore::force_open`] never fails on a corrupt file: the
//! damaged copy is moved aside to `<name>.corrupt` and an empty store is
//! created in its place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::guard::lock;

/// On-disk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFile {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl LocalStore {
    /// Open `path`, creating it (and its directory) when missing and
    /// replacing it when unreadable as JSON.
    pub fn force_open(path: &Path) -> Result<Self, DaemonError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }

        let entries = match load(path) {
            Ok(Some(file)) => file.entries,
            Ok(None) => BTreeMap::new(),
            Err(DaemonError::CorruptStore { path, source }) => {
                let aside = path.with_extension("corrupt");
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %source,
                    "local store is corrupt; starting empty",
                );
                std::fs::rename(&path, &aside).map_err(|e| io_err(&path, e))?;
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };

        let store = Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        };
        // Writing once up front surfaces permission problems at startup.
        store.persist(&lock(&store.entries))?;
        tracing::debug!(path = %path.display(), "opened local store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DaemonError> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DaemonError> {
        let value = serde_json::to_value(value)?;
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    pub fn delete(&self, key: &str) -> Result<bool, DaemonError> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<(), DaemonError> {
        let file = StoreFile {
            saved_at: Utc::now(),
            entries: entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<StoreFile>, DaemonError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| DaemonError::CorruptStore {
            path: path.to_path_buf(),
            source,
        })
}
