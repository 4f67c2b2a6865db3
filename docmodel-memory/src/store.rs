//! In-memory storage implementation.
//!
//! Collections are ordered record sequences kept in a `HashMap` behind an async-aware
//! read-write lock. Loads hand out copies, so callers never alias stored records.

use async_trait::async_trait;
use mea::rwlock::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::trace;

use docmodel_core::{
    Record,
    backend::{StoreBackend, StoreBackendBuilder},
    error::{ModelError, ModelResult},
};

type StoreMap = HashMap<String, Vec<Record>>;

/// Thread-safe in-memory persistence backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, so clones share
/// the same collections. Loading a collection that was never stored creates it empty.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryStore;
/// use docmodel::backend::StoreBackend;
/// use bson::doc;
///
/// let store = InMemoryStore::new();
/// store.store("users", vec![doc! { "_id": "a", "name": "Alice" }]).await?;
/// assert_eq!(store.load("users").await?.len(), 1);
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> ordered records
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new store with no collections.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder, which can seed collections before use.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>> {
        if let Some(records) = self.store.read().await.get(collection) {
            return Ok(records.clone());
        }

        self.store
            .write()
            .await
            .entry(collection.to_string())
            .or_default();

        trace!(%collection, "created empty collection");
        Ok(Vec::new())
    }

    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()> {
        trace!(%collection, records = records.len(), "storing collection");

        self.store
            .write()
            .await
            .insert(collection.to_string(), records);

        Ok(())
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        let mut names = self
            .store
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();

        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        let mut store = self.store.write().await;

        if store.remove(name).is_none() {
            return Err(ModelError::CollectionNotFound(name.to_string()));
        }

        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryStore;
/// use docmodel::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder()
///     .collection("users", vec![doc! { "_id": "a", "name": "Alice" }])
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    collections: StoreMap,
}

impl InMemoryStoreBuilder {
    /// Seeds a collection with records, replacing earlier seeds of the same name.
    pub fn collection(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.collections.insert(name.into(), records);
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds the store. This always succeeds.
    async fn build(self) -> ModelResult<Self::Backend> {
        Ok(InMemoryStore {
            store: Arc::new(RwLock::new(self.collections)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docmodel_core::{connection::Connection, schema::Schema, schema_type::SchemaType};

    #[tokio::test]
    async fn missing_collections_load_empty_and_are_created() {
        let store = InMemoryStore::new();

        assert!(store.load("users").await.unwrap().is_empty());
        assert_eq!(store.list_collections().await.unwrap(), vec!["users"]);
    }

    #[tokio::test]
    async fn store_replaces_the_whole_collection() {
        let store = InMemoryStore::new();
        store
            .store("users", vec![doc! { "_id": "a" }, doc! { "_id": "b" }])
            .await
            .unwrap();
        store.store("users", vec![doc! { "_id": "c" }]).await.unwrap();

        assert_eq!(store.load("users").await.unwrap(), vec![doc! { "_id": "c" }]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = InMemoryStore::new();
        let clone = store.clone();
        clone.store("users", vec![doc! { "_id": "a" }]).await.unwrap();
        clone.shutdown().await.unwrap();

        assert_eq!(store.load("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_collection() {
        let store = InMemoryStore::new();
        store.store("users", vec![]).await.unwrap();

        store.drop_collection("users").await.unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
        assert!(matches!(
            store.drop_collection("users").await,
            Err(ModelError::CollectionNotFound(name)) if name == "users"
        ));
    }

    #[tokio::test]
    async fn builder_seeds_collections() {
        let store = InMemoryStore::builder()
            .collection("users", vec![doc! { "_id": "a", "name": "Alice" }])
            .collection("posts", vec![])
            .build()
            .await
            .unwrap();

        assert_eq!(store.list_collections().await.unwrap(), vec!["posts", "users"]);

        let connection = Connection::open(store).await.unwrap();
        let users = connection.model("User", Schema::new().add("name", SchemaType::string()));
        let alice = users.find_by_id("a").await.unwrap().unwrap();

        assert_eq!(alice.get("name"), Some("Alice".into()));
    }
}
