use crate::error::StorageError;
use ahash::AHashMap;
use aspect_model::Value;
use std::collections::BTreeMap;

/// Serialized form of a saved context: persistable aspect name -> value.
///
/// Ordered so encoded blobs are stable across runs.
pub type ValueMap = BTreeMap<String, Value>;

/// Key/value blob persistence boundary.
///
/// The engine hands providers only values whose aspect is flagged
/// persistable; a line collection's entry is its row map verbatim. Providers
/// are free to store blobs however they like.
pub trait StorageProvider {
    /// Load the value map stored under `key`.
    ///
    /// A missing key is not an error: providers return an empty map and the
    /// facade falls back to its empty-data path.
    fn load(&self, key: &str) -> Result<ValueMap, StorageError>;

    /// Store `data` under `key`, replacing any previous blob.
    fn store(&mut self, key: &str, data: &ValueMap) -> Result<(), StorageError>;

    /// Remove the blob stored under `key`, if any.
    fn delete(&mut self, key: &str);
}

/// In-memory provider encoding contexts as JSON blobs.
///
/// This is the default provider and the one used in tests; it exercises the
/// same encode/decode path a durable provider would.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: AHashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the blob under `key` to `new_key`.
    pub fn duplicate(&mut self, key: &str, new_key: &str) {
        if let Some(blob) = self.blobs.get(key).cloned() {
            self.blobs.insert(new_key.to_string(), blob);
        }
    }

    /// Inject a raw blob, bypassing encoding. Used to simulate corrupt data.
    pub fn insert_raw(&mut self, key: &str, blob: impl Into<String>) {
        self.blobs.insert(key.to_string(), blob.into());
    }
}

impl StorageProvider for MemoryStorage {
    fn load(&self, key: &str) -> Result<ValueMap, StorageError> {
        let Some(blob) = self.blobs.get(key) else {
            log::warn!("no stored context '{key}', returning empty map");
            return Ok(ValueMap::new());
        };
        serde_json::from_str(blob).map_err(|e| StorageError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn store(&mut self, key: &str, data: &ValueMap) -> Result<(), StorageError> {
        let blob = serde_json::to_string(data).map_err(|e| StorageError::Encode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.blobs.insert(key.to_string(), blob);
        Ok(())
    }

    fn delete(&mut self, key: &str) {
        self.blobs.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_a_value_map() {
        let mut storage = MemoryStorage::new();
        let mut map = ValueMap::new();
        map.insert("hp".into(), Value::Number(12.0));
        map.insert("title".into(), Value::Text("dm".into()));
        storage.store("ctx", &map).unwrap();
        assert_eq!(storage.load("ctx").unwrap(), map);
    }

    #[test]
    fn corrupt_blob_is_a_decode_error() {
        let mut storage = MemoryStorage::new();
        storage.insert_raw("ctx", "{not json");
        assert!(matches!(
            storage.load("ctx"),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn missing_key_loads_empty() {
        let storage = MemoryStorage::new();
        assert!(storage.load("nowhere").unwrap().is_empty());
    }
}
