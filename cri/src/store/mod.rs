//! Metadata store: sandboxes, containers and images.
//!
//! Each collection sits behind its own mutex, held for the whole of every
//! mutation or listing and never across an adapter call. An optional
//! [`Persist`] hook receives every add, update and remove under the same key.

pub mod container;
pub mod image;
pub mod persist;
pub mod sandbox;

use std::collections::HashMap;

use multicri_core::error::{CriError, Result};
use multicri_core::{ContainerMetadata, ImageMetadata, SandboxMetadata};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use container::ContainerStore;
pub use image::ImageStore;
pub use persist::{JsonFileStore, Persist};
pub use sandbox::SandboxStore;

/// A record kept in one of the store's collections.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + 'static {
    /// Collection name, used for the cache file and log messages.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn not_found(id: &str) -> CriError;
}

impl Record for SandboxMetadata {
    const KIND: &'static str = "sandboxes";

    fn id(&self) -> &str {
        &self.id
    }

    fn not_found(id: &str) -> CriError {
        CriError::sandbox_not_found(id)
    }
}

impl Record for ContainerMetadata {
    const KIND: &'static str = "containers";

    fn id(&self) -> &str {
        &self.id
    }

    fn not_found(id: &str) -> CriError {
        CriError::container_not_found(id)
    }
}

impl Record for ImageMetadata {
    const KIND: &'static str = "images";

    fn id(&self) -> &str {
        &self.id
    }

    fn not_found(id: &str) -> CriError {
        CriError::image_not_found(id)
    }
}

/// A keyed record collection with write-through persistence.
pub(crate) struct Collection<T: Record> {
    records: Mutex<HashMap<String, T>>,
    persist: Option<Box<dyn Persist<T>>>,
}

impl<T: Record> Collection<T> {
    pub(crate) fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            persist: None,
        }
    }

    /// Load every persisted record, deleting the ones `keep` rejects.
    pub(crate) fn load(persist: Box<dyn Persist<T>>, keep: impl Fn(&T) -> bool) -> Result<Self> {
        let mut records = HashMap::new();
        for record in persist.list()? {
            if keep(&record) {
                records.insert(record.id().to_string(), record);
            } else {
                tracing::info!(kind = T::KIND, id = %record.id(), "Dropping stale record");
                persist.delete(record.id())?;
            }
        }
        tracing::debug!(kind = T::KIND, count = records.len(), "Loaded records");
        Ok(Self {
            records: Mutex::new(records),
            persist: Some(persist),
        })
    }

    fn put_through(&self, record: &T) {
        if let Some(persist) = &self.persist {
            if let Err(e) = persist.put(record.id(), record) {
                tracing::error!(kind = T::KIND, id = %record.id(), error = %e, "Failed to persist record");
            }
        }
    }

    fn delete_through(&self, id: &str) {
        if let Some(persist) = &self.persist {
            if let Err(e) = persist.delete(id) {
                tracing::error!(kind = T::KIND, id = %id, error = %e, "Failed to delete persisted record");
            }
        }
    }

    /// Insert a new record. A duplicate key is logged and overwritten.
    pub(crate) fn add(&self, record: T) {
        let mut records = self.records.lock();
        if records.contains_key(record.id()) {
            tracing::warn!(kind = T::KIND, id = %record.id(), "Record already exists, overwriting");
        }
        self.put_through(&record);
        records.insert(record.id().to_string(), record);
    }

    pub(crate) fn update(&self, record: T) {
        let mut records = self.records.lock();
        self.put_through(&record);
        records.insert(record.id().to_string(), record);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<T> {
        let mut records = self.records.lock();
        let removed = records.remove(id);
        if removed.is_some() {
            self.delete_through(id);
        }
        removed
    }

    pub(crate) fn get(&self, id: &str) -> Result<T> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| T::not_found(id))
    }

    /// First record satisfying `predicate`.
    pub(crate) fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.records.lock().values().find(|r| predicate(r)).cloned()
    }

    pub(crate) fn list(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.records
            .lock()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Remove every record `predicate` selects, returning them.
    pub(crate) fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let mut records = self.records.lock();
        let ids: Vec<String> = records
            .values()
            .filter(|r| predicate(r))
            .map(|r| r.id().to_string())
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = records.remove(&id) {
                self.delete_through(&id);
                removed.push(record);
            }
        }
        removed
    }

    /// Records satisfying `select`, dropping from the collection those that
    /// fail `keep`. Selection and removal happen under one lock.
    pub(crate) fn list_pruning(
        &self,
        select: impl Fn(&T) -> bool,
        keep: impl Fn(&T) -> bool,
    ) -> Vec<T> {
        let mut records = self.records.lock();
        let mut kept = Vec::new();
        let mut stale = Vec::new();
        for record in records.values().filter(|r| select(r)) {
            if keep(record) {
                kept.push(record.clone());
            } else {
                stale.push(record.id().to_string());
            }
        }
        for id in stale {
            tracing::debug!(kind = T::KIND, id = %id, "Dropping stale record");
            records.remove(&id);
            self.delete_through(&id);
        }
        kept
    }

    /// Apply `f` to the record with `id` and persist the result.
    pub(crate) fn modify<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut records = self.records.lock();
        let record = records.get_mut(id).ok_or_else(|| T::not_found(id))?;
        let out = f(record);
        self.put_through(record);
        Ok(out)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.records.lock().len()
    }
}
