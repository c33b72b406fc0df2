//! Write-through persistence for metadata records.
//!
//! Each record type lives in its own JSON file under the resources cache
//! directory (`cache-cri-<kind>.json`). Writes are atomic: the full map is
//! written to a tmp file which is then renamed over the previous file.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use multicri_core::error::{CriError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Backing store for one record collection, addressed by record ID.
pub trait Persist<T>: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<T>>;
    fn put(&self, id: &str, record: &T) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    /// All persisted records.
    fn list(&self) -> Result<Vec<T>>;
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
struct RecordFile<T> {
    records: HashMap<String, T>,
}

/// JSON-file persistence for one record type.
#[derive(Debug)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    /// Store for `kind` inside `cache_dir`.
    pub fn in_cache(cache_dir: &Path, kind: &str) -> Self {
        Self::new(cache_dir.join(format!("cache-cri-{}.json", kind)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, T>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            CriError::Other(format!(
                "failed to read cache file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let file: RecordFile<T> = serde_json::from_str(&data)?;
        Ok(file.records)
    }

    fn save(&self, records: HashMap<String, T>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CriError::Other(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(&RecordFile { records })?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| {
            CriError::Other(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            CriError::Other(format!(
                "failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

impl<T> Persist<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.load()?.remove(id))
    }

    fn put(&self, id: &str, record: &T) -> Result<()> {
        let mut records = self.load()?;
        records.insert(id.to_string(), record.clone());
        self.save(records)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.load()?;
        if records.remove(id).is_some() {
            self.save(records)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<T>> {
        Ok(self.load()?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
    }

    fn record(name: &str) -> Record {
        Record {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Record> = JsonFileStore::in_cache(tmp.path(), "images");
        assert!(store.list().unwrap().is_empty());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_put_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Record> = JsonFileStore::in_cache(tmp.path(), "containers");

        store.put("a", &record("first")).unwrap();
        store.put("b", &record("second")).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(record("first")));
        assert_eq!(store.list().unwrap().len(), 2);

        store.put("a", &record("replaced")).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(record("replaced")));

        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.list().unwrap(), vec![record("second")]);
    }

    #[test]
    fn test_file_name_and_no_tmp_left() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Record> = JsonFileStore::in_cache(tmp.path(), "sandboxes");
        store.put("a", &record("x")).unwrap();

        assert!(tmp.path().join("cache-cri-sandboxes.json").exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        JsonFileStore::<Record>::in_cache(tmp.path(), "images")
            .put("a", &record("kept"))
            .unwrap();

        let reopened: JsonFileStore<Record> = JsonFileStore::in_cache(tmp.path(), "images");
        assert_eq!(reopened.get("a").unwrap(), Some(record("kept")));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Record> = JsonFileStore::in_cache(tmp.path(), "images");
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.list(), Err(CriError::Serialization(_))));
    }
}
