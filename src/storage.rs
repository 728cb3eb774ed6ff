//! Storage adapters for persisted SDK state.
//!
//! The SDK persists three kinds of records: the per-installation current-user
//! identifier, one serialized entitlement snapshot per user, and one pending
//! attribute map per user. All of them go through the [`StorageAdapter`]
//! trait so host applications can plug in their own persistence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Storage keys
pub mod keys {
    /// Per-installation current user identifier.
    pub const CURRENT_USER: &str = concat!("purchases:", "current_user");

    /// Serialized entitlement snapshot for one user.
    pub fn snapshot(user_id: &str) -> String {
        format!("purchases:snapshot:{user_id}")
    }

    /// Pending attribute map for one user.
    pub fn attributes(user_id: &str) -> String {
        format!("purchases:attributes:{user_id}")
    }
}

/// Storage adapter trait for custom persistence implementations
pub trait StorageAdapter: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &str) -> Option<String>;

    /// Set a value by key
    fn set(&self, key: &str, value: &str);

    /// Remove a value by key
    fn remove(&self, key: &str);
}

/// In-memory storage adapter. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

/// File-backed storage adapter.
///
/// Keeps the full key/value map in memory and mirrors every change to
/// `purchases.json` in the chosen directory, so snapshots, pending
/// attributes, and the current-user pointer survive process restarts.
/// Writes go through a temp file followed by a rename, so a crash mid-write
/// leaves the previous state intact rather than a truncated file.
pub struct FileStorage {
    path: std::path::PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl FileStorage {
    /// Open (or start) persisted state in `storage_dir/purchases.json`.
    ///
    /// Returns `None` if the directory does not exist. An unreadable or
    /// corrupt state file is discarded with a warning; the SDK then starts
    /// from empty state rather than failing construction.
    pub fn new(storage_dir: &Path) -> Option<Self> {
        if !storage_dir.is_dir() {
            return None;
        }

        let path = storage_dir.join("purchases.json");
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), %err, "discarding unreadable sdk state file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Some(Self {
            path,
            values: RwLock::new(values),
        })
    }

    fn save(&self) {
        let contents = {
            let values = match self.values.read() {
                Ok(values) => values,
                Err(_) => return,
            };
            match serde_json::to_string_pretty(&*values) {
                Ok(contents) => contents,
                Err(_) => return,
            }
        };

        let staged = self.path.with_extension("json.tmp");
        let written = std::fs::write(&staged, contents)
            .and_then(|_| std::fs::rename(&staged, &self.path));
        if let Err(err) = written {
            tracing::warn!(path = %self.path.display(), %err, "failed to persist sdk state");
        }
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
        self.save();
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
        self.save();
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}
