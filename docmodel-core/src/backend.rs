//! Persistence and identifier collaborators.
//!
//! The mapping engine never touches storage directly. Everything it reads and writes goes
//! through a [`StoreBackend`], which exposes whole-collection granularity only: a collection
//! is loaded as an ordered sequence of records and stored back the same way.
//!
//! # Traits
//!
//! - [`StoreBackend`]: The core trait for persistence backends
//! - [`DynStoreBackend`]: The object-safe form used by a [`Connection`](crate::connection::Connection)
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//! - [`IdGenerator`]: Source of fresh `_id` values
//!
//! # Examples
//!
//! ```ignore
//! use docmodel::backend::StoreBackend;
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//! backend.store("users", vec![doc! { "_id": "a", "name": "Alice" }]).await?;
//! let users = backend.load("users").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use std::{any::Any, fmt::Debug};
use uuid::Uuid;

use crate::{error::ModelResult, Record};

/// Abstract interface for collection persistence.
///
/// # Contract
///
/// - `load` and `store` are idempotent and whole-collection granular.
/// - A collection that was never stored reads as empty; implementations create it
///   on first access.
/// - Date values written with `store` come back from `load` as `Bson::DateTime`.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. They are not required to serialize
/// concurrent read-modify-write cycles; the connection does that per collection.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Loads every record of a collection, in stored order.
    ///
    /// # Returns
    ///
    /// Returns the records, or a [`ModelError::Persistence`](crate::error::ModelError::Persistence)
    /// when the underlying storage cannot be read.
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>>;

    /// Replaces the full contents of a collection.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection. Created automatically if it doesn't exist.
    /// * `records` - The complete, ordered collection contents
    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()>;

    /// Lists the names of all collections in the store.
    async fn list_collections(&self) -> ModelResult<Vec<String>>;

    /// Drops a collection and all its records.
    ///
    /// Returns [`ModelError::CollectionNotFound`](crate::error::ModelError::CollectionNotFound)
    /// if the collection does not exist.
    async fn drop_collection(&self, name: &str) -> ModelResult<()>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(self) -> ModelResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Object-safe counterpart of [`StoreBackend`], implemented for every backend.
#[async_trait]
pub trait DynStoreBackend: Send + Sync + Debug {
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>>;
    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()>;
    async fn list_collections(&self) -> ModelResult<Vec<String>>;
    async fn drop_collection(&self, name: &str) -> ModelResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<B: StoreBackend + Send + Sync + 'static> DynStoreBackend for B {
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>> {
        StoreBackend::load(self, collection).await
    }

    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()> {
        StoreBackend::store(self, collection, records).await
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        StoreBackend::list_collections(self).await
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        StoreBackend::drop_collection(self, name).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> ModelResult<Self::Backend>;
}

/// Produces globally-unique-enough opaque identifiers used as `_id`.
pub trait IdGenerator: Send + Sync + Debug {
    fn new_id(&self) -> String;
}

/// Default [`IdGenerator`] backed by random (v4) UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
