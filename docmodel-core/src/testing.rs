//! Fixtures for unit tests inside this crate.

use async_trait::async_trait;
use futures::executor::block_on;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::{
    backend::StoreBackend,
    connection::Connection,
    error::{ModelError, ModelResult},
    model::Model,
    schema::Schema,
    Record,
};

/// Minimal synchronous backend keeping collections in a map.
#[derive(Debug, Default)]
pub(crate) struct MemoryBackend {
    collections: Mutex<IndexMap<String, Vec<Record>>>,
    loads: Mutex<IndexMap<String, usize>>,
}

impl MemoryBackend {
    /// How many times `collection` has been loaded.
    pub(crate) fn loads(&self, collection: &str) -> usize {
        self.loads.lock().get(collection).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>> {
        *self.loads.lock().entry(collection.to_string()).or_default() += 1;

        Ok(self
            .collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()> {
        self.collections
            .lock()
            .insert(collection.to_string(), records);
        Ok(())
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        Ok(self.collections.lock().keys().cloned().collect())
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        self.collections
            .lock()
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| ModelError::CollectionNotFound(name.to_string()))
    }
}

/// An open connection over a fresh [`MemoryBackend`].
pub(crate) fn connection() -> Connection {
    let connection = Connection::new(MemoryBackend::default());
    block_on(connection.connect()).expect("in-memory connect cannot fail");
    connection
}

/// A model on its own open connection. The connection is dropped, so the model cannot
/// resolve siblings; use [`connection`] for population tests.
pub(crate) fn model(name: &str, schema: Schema) -> Model {
    connection().model(name, schema)
}
