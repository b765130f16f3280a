//! Side table for volumes whose identity the array does not retain.
//!
//! Records live in one hash container per cluster: each field is a record
//! UUID and each value is the JSON-encoded [`VolumeRecord`]. There are no
//! secondary indices, so name lookups scan every record.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::volume::{ArrayHandle, DatasetId};

mod memory;
mod redis_store;

pub use memory::MemoryHashStore;
pub use redis_store::{DEFAULT_REDIS_PORT, RedisHashStore};

/// Hash container used when none is configured.
pub const DEFAULT_CONTAINER: &str = "emc_flocker_hash";

/// Future returned by hash store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MetadataError>> + Send + 'a>>;

/// Errors raised by the metadata store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Raised when the store cannot be reached or rejects a command.
    #[error("metadata store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
    /// Raised when a record cannot be serialised.
    #[error("failed to encode record {id}: {message}")]
    Encode {
        /// Record identifier.
        id: Uuid,
        /// Serialiser message.
        message: String,
    },
    /// Raised when updating a record that does not exist.
    #[error("metadata record {id} not found")]
    NotFound {
        /// Record identifier.
        id: Uuid,
    },
}

/// Hash container primitives the metadata store is built on.
pub trait HashStore: Send + Sync {
    /// Returns every field and value of `container`.
    fn entries<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<(String, String)>>;

    /// Reads one field.
    fn get<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Writes one field, replacing any previous value.
    fn set<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Removes one field, returning whether it existed.
    fn remove<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, bool>;
}

impl<T: HashStore + ?Sized> HashStore for Box<T> {
    fn entries<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        (**self).entries(container)
    }

    fn get<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        (**self).get(container, field)
    }

    fn set<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()> {
        (**self).set(container, field, value)
    }

    fn remove<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, bool> {
        (**self).remove(container, field)
    }
}

/// Persisted description of one volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeRecord {
    /// Record identifier, assigned by [`MetadataStore::add`].
    pub id: Uuid,
    /// Array-side LUN name.
    pub name: String,
    /// Dataset stored on the volume.
    pub dataset_id: DatasetId,
    /// Size in whole GB, as reported to operators.
    pub size: u64,
    /// Provisioned size in bytes.
    pub actual_size: u64,
    /// Compute instance the volume is mapped to.
    pub attach_to: Option<String>,
    /// Placement in `<host>@<backend>#<pool>` form.
    pub host: String,
    /// Requested service profile, if any.
    #[serde(default)]
    pub profile: Option<String>,
    /// Vendor key bundle locating the LUN.
    pub provider_location: ArrayHandle,
}

/// Formats the placement string stored in [`VolumeRecord::host`].
#[must_use]
pub fn placement(host: &str, backend: &str, pool: &str) -> String {
    format!("{host}@{backend}#{pool}")
}

/// Typed access to the volume records of one container.
#[derive(Clone, Debug)]
pub struct MetadataStore<S> {
    store: S,
    container: String,
}

impl<S: HashStore> MetadataStore<S> {
    /// Wraps `store`, keeping records under `container`.
    #[must_use]
    pub fn new(store: S, container: impl Into<String>) -> Self {
        Self {
            store,
            container: container.into(),
        }
    }

    /// Name of the hash container.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Stores `record` under a freshly generated UUID and returns it. Any id
    /// already present on `record` is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when encoding or the write fails.
    pub async fn add(&self, mut record: VolumeRecord) -> Result<Uuid, MetadataError> {
        record.id = Uuid::new_v4();
        self.write(&record).await?;
        Ok(record.id)
    }

    /// Reads the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Unavailable`] when the store cannot be read.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<VolumeRecord>, MetadataError> {
        let field = id.to_string();
        let Some(raw) = self.store.get(&self.container, &field).await? else {
            return Ok(None);
        };
        Ok(decode(&field, &raw))
    }

    /// Finds the record whose `name` equals `name` by scanning every record.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Unavailable`] when the store cannot be read.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<VolumeRecord>, MetadataError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Returns every decodable record.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Unavailable`] when the store cannot be read.
    pub async fn get_all(&self) -> Result<Vec<VolumeRecord>, MetadataError> {
        let entries = self.store.entries(&self.container).await?;
        Ok(entries
            .iter()
            .filter_map(|(field, raw)| decode(field, raw))
            .collect())
    }

    /// Replaces the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NotFound`] when no record exists under `id`.
    pub async fn update(&self, id: Uuid, record: &VolumeRecord) -> Result<(), MetadataError> {
        let field = id.to_string();
        if self.store.get(&self.container, &field).await?.is_none() {
            return Err(MetadataError::NotFound { id });
        }
        let mut stored = record.clone();
        stored.id = id;
        self.write(&stored).await
    }

    /// Removes the record stored under `id`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Unavailable`] when the store rejects the
    /// command.
    pub async fn delete(&self, id: Uuid) -> Result<bool, MetadataError> {
        self.store.remove(&self.container, &id.to_string()).await
    }

    async fn write(&self, record: &VolumeRecord) -> Result<(), MetadataError> {
        let value = serde_json::to_string(record).map_err(|err| MetadataError::Encode {
            id: record.id,
            message: err.to_string(),
        })?;
        self.store
            .set(&self.container, &record.id.to_string(), &value)
            .await
    }
}

fn decode(field: &str, raw: &str) -> Option<VolumeRecord> {
    match serde_json::from_str::<VolumeRecord>(raw) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(field, error = %err, "skipping undecodable metadata record");
            None
        }
    }
}
