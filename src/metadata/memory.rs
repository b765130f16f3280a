//! In-process hash store for tests and single-node experiments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{HashStore, StoreFuture};

type Containers = BTreeMap<String, BTreeMap<String, String>>;

/// Hash store kept in memory; clones share the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryHashStore {
    containers: Arc<Mutex<Containers>>,
}

impl MemoryHashStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a raw value, bypassing record encoding.
    pub fn insert_raw(&self, container: &str, field: &str, value: &str) {
        self.lock()
            .entry(container.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
    }

    /// Number of fields stored in `container`.
    #[must_use]
    pub fn len(&self, container: &str) -> usize {
        self.lock().get(container).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> MutexGuard<'_, Containers> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl HashStore for MemoryHashStore {
    fn entries<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        let entries = self
            .lock()
            .get(container)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(async move { Ok(entries) })
    }

    fn get<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        let value = self
            .lock()
            .get(container)
            .and_then(|fields| fields.get(field).cloned());
        Box::pin(async move { Ok(value) })
    }

    fn set<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()> {
        self.insert_raw(container, field, value);
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, bool> {
        let removed = self
            .lock()
            .get_mut(container)
            .is_some_and(|fields| fields.remove(field).is_some());
        Box::pin(async move { Ok(removed) })
    }
}
