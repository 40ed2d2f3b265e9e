//! Disk-backed publisher and subscription store.
//!
//! One JSON snapshot file per record kind lives under the store path. Every
//! mutation rewrites the snapshot atomically (write to a temp file in the
//! same directory, then rename), so a reader that opens the store after a
//! crash sees the last committed snapshot. There is no transaction log.
//!
//! The snapshot is persisted *before* the in-memory map is updated: a
//! persistence failure therefore leaves the in-memory state unchanged and
//! surfaces as a [`StoreError`] to the caller (the REST layer maps it to a
//! 5xx).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

use crate::pubsub::{PubSub, PubSubError};

/// Which kind of record a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Event publishers.
    Publisher,
    /// Event subscriptions.
    Subscription,
}

impl StoreKind {
    /// Snapshot file name under the store path.
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Publisher => "publishers.json",
            Self::Subscription => "subscriptions.json",
        }
    }
}

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the snapshot file failed.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be encoded or decoded.
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The record failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] PubSubError),

    /// No record exists under the given id.
    #[error("no record with id {0}")]
    NotFound(String),
}

/// A disk-backed map from record id to [`PubSub`].
///
/// The store is multi-reader, single-writer: all operations take the inner
/// mutex, and the only writer in the daemon is the REST handler task.
#[derive(Debug)]
pub struct PubSubStore {
    kind: StoreKind,
    path: PathBuf,
    records: Mutex<HashMap<String, PubSub>>,
}

impl PubSubStore {
    /// Opens the store rooted at `store_path`, loading the last committed
    /// snapshot. A missing snapshot file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the snapshot exists but cannot be read
    /// or decoded.
    pub fn open(store_path: impl AsRef<Path>, kind: StoreKind) -> Result<Self, StoreError> {
        let path = store_path.as_ref().join(kind.file_name());
        let records = match fs::read(&path) {
            Ok(bytes) => {
                let list: Vec<PubSub> = serde_json::from_slice(&bytes)?;
                list.into_iter()
                    .filter_map(|r| r.id.clone().map(|id| (id, r)))
                    .collect()
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self {
            kind,
            path,
            records: Mutex::new(records),
        })
    }

    /// Returns the kind of records this store holds.
    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Creates a record, assigning an id on first persistence.
    ///
    /// Idempotent by `(Resource, EndPointURI)`: when a matching record
    /// already exists it is returned unchanged and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the record is invalid or the snapshot
    /// cannot be persisted; in the latter case the in-memory state is left
    /// unchanged.
    pub fn create(&self, record: PubSub) -> Result<PubSub, StoreError> {
        record.validate()?;
        let mut records = self.records.lock().unwrap();

        if let Some(existing) = records
            .values()
            .find(|r| r.resource == record.resource && r.end_point_uri == record.end_point_uri)
        {
            return Ok(existing.clone());
        }

        let mut record = record;
        let id = Uuid::new_v4().to_string();
        record.id = Some(id.clone());

        let mut next = records.clone();
        next.insert(id, record.clone());
        Self::persist(&self.path, &next)?;
        *records = next;
        Ok(record)
    }

    /// Returns the record with the given id, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PubSub> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Returns all records. Order is unspecified.
    #[must_use]
    pub fn list(&self) -> Vec<PubSub> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Returns all records whose resource address matches `resource`.
    #[must_use]
    pub fn find_by_resource(&self, resource: &str) -> Vec<PubSub> {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.resource == resource)
            .cloned()
            .collect()
    }

    /// Deletes the record with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists, or a
    /// persistence error with the in-memory state unchanged.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut next = records.clone();
        next.remove(id);
        Self::persist(&self.path, &next)?;
        *records = next;
        Ok(())
    }

    /// Deletes all records.
    ///
    /// # Errors
    ///
    /// Returns a persistence error with the in-memory state unchanged.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        Self::persist(&self.path, &HashMap::new())?;
        records.clear();
        Ok(())
    }

    /// Writes the snapshot atomically: temp file in the same directory, then
    /// rename over the live file.
    fn persist(path: &Path, records: &HashMap<String, PubSub>) -> Result<(), StoreError> {
        let mut list: Vec<&PubSub> = records.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let body = serde_json::to_vec_pretty(&list)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
