//! In-memory `storage` area served to sandboxed code.
//!
//! One [`CapabilityStorage`] exists per generation. It is never shared
//! between generations: carrying state into a rebuild goes through an
//! explicit [`StorageSnapshot`] copy.
//!
//! Quotas are enforced on the JSON-serialised size of values, and the key
//! count is only checked for keys that do not exist yet.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

use preview_error::CapabilityError;

/// Key validation regex: alphanumerics plus `_`, `-`, `.`, `:`, `/`, `@`, 1–256 chars.
static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-.:/@]{1,256}$").expect("static regex is valid"));

/// Quotas for one storage area.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of distinct keys (default: 512).
    pub max_keys: usize,
    /// Maximum size of one JSON-serialised value in bytes (default: 1 MiB).
    pub max_value_size: usize,
    /// Maximum combined size of all values in bytes (default: 5 MiB).
    pub max_total_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_keys: 512,
            max_value_size: 1024 * 1024,
            max_total_size: 5 * 1024 * 1024,
        }
    }
}

/// Errors returned by [`CapabilityStorage`] operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    /// The area already holds the maximum number of keys.
    #[error("storage key limit exceeded (max {max} keys)")]
    KeyLimitExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// The serialised value exceeds the per-value limit.
    #[error("storage value too large ({size} bytes, max {max} bytes)")]
    ValueTooLarge {
        /// Actual size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// Storing the value would push the area past its total quota.
    #[error("storage quota exceeded ({total} bytes, max {max} bytes)")]
    QuotaExceeded {
        /// Projected total.
        total: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The key is longer than 256 characters.
    #[error("storage key too long ({len} chars, max 256)")]
    KeyTooLong {
        /// Actual length.
        len: usize,
    },
    /// The key is empty or has characters outside the allowed set.
    #[error("storage key contains invalid characters")]
    InvalidKey,
}

impl From<StorageError> for CapabilityError {
    fn from(e: StorageError) -> Self {
        CapabilityError::Storage {
            message: e.to_string(),
        }
    }
}

/// Validate a storage key.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey);
    }
    if key.len() > 256 {
        return Err(StorageError::KeyTooLong { len: key.len() });
    }
    if !KEY_RE.is_match(key) {
        return Err(StorageError::InvalidKey);
    }
    Ok(())
}

/// Point-in-time copy of a storage area, used to carry state into a rebuild.
pub type StorageSnapshot = BTreeMap<String, Value>;

struct StoredValue {
    value: Value,
    size_bytes: usize,
}

#[derive(Default)]
struct StorageState {
    entries: HashMap<String, StoredValue>,
    total_size: usize,
}

/// A generation's storage area.
pub struct CapabilityStorage {
    state: Mutex<StorageState>,
    config: StorageConfig,
}

impl CapabilityStorage {
    /// Create an empty area.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            state: Mutex::new(StorageState::default()),
            config,
        }
    }

    /// Create an area pre-filled from a snapshot of a previous generation.
    ///
    /// Entries the new quotas refuse are dropped and logged.
    pub fn seeded(config: StorageConfig, snapshot: StorageSnapshot) -> Self {
        let storage = Self::new(config);
        for (key, value) in snapshot {
            if let Err(e) = storage.set(&key, value) {
                tracing::warn!(key = %key, error = %e, "dropping carried-forward storage entry");
            }
        }
        storage
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        validate_key(key)?;
        Ok(self.state.lock().entries.get(key).map(|e| e.value.clone()))
    }

    /// Store a value, replacing any previous one.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        validate_key(key)?;

        let value_size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if value_size > self.config.max_value_size {
            return Err(StorageError::ValueTooLarge {
                size: value_size,
                max: self.config.max_value_size,
            });
        }

        let mut state = self.state.lock();
        let old_size = match state.entries.get(key) {
            Some(existing) => existing.size_bytes,
            None => {
                if state.entries.len() >= self.config.max_keys {
                    return Err(StorageError::KeyLimitExceeded {
                        max: self.config.max_keys,
                    });
                }
                0
            }
        };

        let new_total = state.total_size - old_size + value_size;
        if new_total > self.config.max_total_size {
            return Err(StorageError::QuotaExceeded {
                total: new_total,
                max: self.config.max_total_size,
            });
        }

        state.total_size = new_total;
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                size_bytes: value_size,
            },
        );
        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let mut state = self.state.lock();
        match state.entries.remove(key) {
            Some(old) => {
                state.total_size -= old.size_bytes;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every key.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_size = 0;
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> StorageSnapshot {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the area is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Combined serialised size of all values.
    pub fn total_size(&self) -> usize {
        self.state.lock().total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small() -> StorageConfig {
        StorageConfig {
            max_keys: 2,
            max_value_size: 32,
            max_total_size: 48,
        }
    }

    #[test]
    fn set_get_remove() {
        let storage = CapabilityStorage::new(StorageConfig::default());
        storage.set("prefs", json!({"theme": "dark"})).unwrap();
        assert_eq!(storage.get("prefs").unwrap(), Some(json!({"theme": "dark"})));
        assert!(storage.remove("prefs").unwrap());
        assert!(!storage.remove("prefs").unwrap());
        assert_eq!(storage.get("prefs").unwrap(), None);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn rejects_bad_keys() {
        let storage = CapabilityStorage::new(StorageConfig::default());
        assert_eq!(storage.set("", json!(1)), Err(StorageError::InvalidKey));
        assert_eq!(storage.set("a b", json!(1)), Err(StorageError::InvalidKey));
        assert_eq!(
            storage.get(&"k".repeat(300)),
            Err(StorageError::KeyTooLong { len: 300 })
        );
    }

    #[test]
    fn key_limit_only_applies_to_new_keys() {
        let storage = CapabilityStorage::new(small());
        storage.set("a", json!(1)).unwrap();
        storage.set("b", json!(2)).unwrap();
        assert_eq!(
            storage.set("c", json!(3)),
            Err(StorageError::KeyLimitExceeded { max: 2 })
        );
        storage.set("a", json!(10)).unwrap();
        assert_eq!(storage.get("a").unwrap(), Some(json!(10)));
    }

    #[test]
    fn value_and_total_quotas() {
        let storage = CapabilityStorage::new(small());
        let big = json!("x".repeat(40));
        assert!(matches!(
            storage.set("a", big),
            Err(StorageError::ValueTooLarge { max: 32, .. })
        ));

        // 22 + 22 bytes serialised fits in 48, a third would not
        storage.set("a", json!("x".repeat(20))).unwrap();
        assert!(matches!(
            storage.set("b", json!("y".repeat(30))),
            Err(StorageError::QuotaExceeded { max: 48, .. })
        ));
        // a failed write leaves accounting untouched
        assert_eq!(storage.total_size(), 22);
    }

    #[test]
    fn replacement_recomputes_total() {
        let storage = CapabilityStorage::new(StorageConfig::default());
        storage.set("a", json!("abcd")).unwrap();
        storage.set("a", json!("ab")).unwrap();
        assert_eq!(storage.total_size(), 4);
    }

    #[test]
    fn snapshot_seeds_an_independent_area() {
        let first = CapabilityStorage::new(StorageConfig::default());
        first.set("count", json!(1)).unwrap();

        let second = CapabilityStorage::seeded(StorageConfig::default(), first.snapshot());
        second.set("count", json!(2)).unwrap();

        assert_eq!(first.get("count").unwrap(), Some(json!(1)));
        assert_eq!(second.get("count").unwrap(), Some(json!(2)));
    }

    #[test]
    fn seeding_drops_entries_over_quota() {
        let mut snapshot = StorageSnapshot::new();
        snapshot.insert("a".into(), json!(1));
        snapshot.insert("b".into(), json!(2));
        snapshot.insert("c".into(), json!(3));
        let storage = CapabilityStorage::seeded(small(), snapshot);
        assert_eq!(storage.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn storage_error_maps_to_capability_error() {
        let err: CapabilityError = StorageError::InvalidKey.into();
        assert_eq!(err.code(), "STORAGE");
        assert!(!err.retryable());
    }
}
