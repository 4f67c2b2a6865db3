//! Connections: the model registry, readiness state and write serialization.
//!
//! A [`Connection`] owns a persistence backend and every [`Model`] registered on it. Models
//! resolve each other by registered name through the connection, which is how population
//! finds the model a reference points at.
//!
//! # Example
//!
//! ```ignore
//! use docmodel::connection::Connection;
//! use docmodel::memory::InMemoryStore;
//!
//! let connection = Connection::open(InMemoryStore::new()).await?;
//! let users = connection.model("User", user_schema);
//! let posts = connection.model("Post", post_schema);
//!
//! assert_eq!(users.collection_name(), "users");
//! connection.disconnect().await?;
//! ```

use indexmap::IndexMap;
use mea::mutex::Mutex;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::{any::Any, collections::HashMap, fmt, sync::Arc};
use tracing::debug;

use crate::{
    backend::{DynStoreBackend, IdGenerator, StoreBackend, UuidGenerator},
    error::{ModelError, ModelResult},
    model::Model,
    schema::Schema,
};

/// Registered models by name.
pub(crate) type ModelRegistry = RwLock<IndexMap<String, Model>>;

/// Readiness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection-wide settings.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Source of `_id` values for new records.
    pub id_generator: Arc<dyn IdGenerator>,
    /// Hold a per-collection lock for each read-modify-write cycle. Without it, concurrent
    /// writers to one collection are last-writer-wins.
    pub serialize_writes: bool,
}

impl ConnectionOptions {
    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Arc::new(id_generator);
        self
    }

    pub fn serialize_writes(mut self, serialize_writes: bool) -> Self {
        self.serialize_writes = serialize_writes;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            id_generator: Arc::new(UuidGenerator),
            serialize_writes: true,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("id_generator", &self.id_generator)
            .field("serialize_writes", &self.serialize_writes)
            .finish()
    }
}

/// Per-model settings.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Collection name; defaults to the lowercased, pluralized model name.
    pub collection: Option<String>,
}

impl ModelOptions {
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// State models share with their connection.
pub(crate) struct ConnectionShared {
    pub(crate) backend: Arc<dyn DynStoreBackend>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
    serialize_writes: bool,
    state: RwLock<ConnectionState>,
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionShared {
    pub(crate) fn new(backend: Arc<dyn DynStoreBackend>, options: ConnectionOptions) -> Self {
        Self {
            backend,
            id_generator: options.id_generator,
            serialize_writes: options.serialize_writes,
            state: RwLock::new(ConnectionState::Disconnected),
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    pub(crate) fn ensure_open(&self) -> ModelResult<()> {
        match *self.state.read() {
            ConnectionState::Connected => Ok(()),
            state => Err(ModelError::Persistence(format!("connection is not open ({state:?})"))),
        }
    }

    /// The write lock of `collection`, or `None` when writes are not serialized.
    pub(crate) fn collection_lock(&self, collection: &str) -> Option<Arc<Mutex<()>>> {
        self.serialize_writes.then(|| {
            self.locks
                .lock()
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        })
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// A persistence backend plus the models registered on it.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    registry: Arc<ModelRegistry>,
}

impl Connection {
    /// Creates a disconnected connection over `backend` with default options.
    pub fn new<B: StoreBackend + 'static>(backend: B) -> Self {
        Self::with_options(backend, ConnectionOptions::default())
    }

    pub fn with_options<B: StoreBackend + 'static>(backend: B, options: ConnectionOptions) -> Self {
        Self {
            shared: Arc::new(ConnectionShared::new(Arc::new(backend), options)),
            registry: Arc::new(RwLock::new(IndexMap::new())),
        }
    }

    /// Creates a connection and connects it.
    pub async fn open<B: StoreBackend + 'static>(backend: B) -> ModelResult<Self> {
        Self::open_with(backend, ConnectionOptions::default()).await
    }

    pub async fn open_with<B: StoreBackend + 'static>(backend: B, options: ConnectionOptions) -> ModelResult<Self> {
        let connection = Self::with_options(backend, options);
        connection.connect().await?;
        Ok(connection)
    }

    /// Checks the backend is reachable and marks the connection open.
    ///
    /// # Errors
    ///
    /// Returns the backend's error, leaving the connection disconnected.
    pub async fn connect(&self) -> ModelResult<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);

        match self.shared.backend.list_collections().await {
            Ok(collections) => {
                debug!(collections = collections.len(), "connected");
                self.shared.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    /// Marks the connection closed once in-flight writes have finished. Registered models
    /// stay registered but fail until the connection is reopened.
    pub async fn disconnect(&self) -> ModelResult<()> {
        self.shared.set_state(ConnectionState::Disconnecting);

        let locks = self
            .shared
            .locks
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for lock in locks {
            drop(lock.lock().await);
        }

        self.shared.set_state(ConnectionState::Disconnected);
        debug!("disconnected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Registers `schema` under `name`, replacing any model of the same name.
    pub fn model(&self, name: &str, schema: impl Into<Arc<Schema>>) -> Model {
        self.model_with(name, schema, ModelOptions::default())
    }

    pub fn model_with(&self, name: &str, schema: impl Into<Arc<Schema>>, options: ModelOptions) -> Model {
        let collection = options
            .collection
            .unwrap_or_else(|| collection_name_for(name));

        let model = Model::new(
            name.to_string(),
            collection,
            schema.into(),
            self.shared.clone(),
            Arc::downgrade(&self.registry),
        );

        debug!(model = %name, collection = %model.collection_name(), "registered model");
        self.registry.write().insert(name.to_string(), model.clone());
        model
    }

    pub fn get_model(&self, name: &str) -> Option<Model> {
        self.registry.read().get(name).cloned()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// Unregisters a model. Its stored records are left alone.
    pub fn delete_model(&self, name: &str) -> Option<Model> {
        self.registry.write().shift_remove(name)
    }

    pub async fn collection_names(&self) -> ModelResult<Vec<String>> {
        self.shared.ensure_open()?;
        self.shared.backend.list_collections().await
    }

    pub async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        self.shared.ensure_open()?;

        let lock = self.shared.collection_lock(name);
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        self.shared.backend.drop_collection(name).await
    }

    /// The backend, if it is a `B`.
    pub fn backend<B: Any>(&self) -> Option<&B> {
        self.shared.backend.as_any().downcast_ref::<B>()
    }

    /// Sessions are not supported; always fails.
    pub fn start_session(&self) -> ModelResult<()> {
        Err(ModelError::unsupported("sessions and transactions"))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("backend", &self.shared.backend)
            .field("models", &self.model_names())
            .finish()
    }
}

/// `User` -> `users`, `Address` -> `address`.
pub fn collection_name_for(model: &str) -> String {
    let lower = model.to_lowercase();

    if lower.ends_with('s') {
        lower
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema_type::SchemaType, testing::MemoryBackend};
    use bson::doc;

    #[test]
    fn collection_names_are_lowercased_plurals() {
        assert_eq!(collection_name_for("User"), "users");
        assert_eq!(collection_name_for("BlogPost"), "blogposts");
        assert_eq!(collection_name_for("Address"), "address");
    }

    #[tokio::test]
    async fn state_machine() {
        let connection = Connection::new(MemoryBackend::default());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let users = connection.model("User", Schema::new().add("name", SchemaType::string()));
        assert!(matches!(users.create(doc! { "name": "a" }).await, Err(ModelError::Persistence(_))));

        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        users.create(doc! { "name": "a" }).await.unwrap();

        connection.disconnect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(users.count_documents(doc! {}).await.is_err());
    }

    #[tokio::test]
    async fn registry_lookup() {
        let connection = Connection::open(MemoryBackend::default()).await.unwrap();
        let users = connection.model("User", Schema::new());
        let posts = connection.model_with("Post", Schema::new(), ModelOptions::default().collection("articles"));

        assert_eq!(posts.collection_name(), "articles");
        assert_eq!(connection.model_names(), vec!["User", "Post"]);
        assert_eq!(users.sibling("Post").map(|m| m.collection_name().to_string()), Some("articles".to_string()));
        assert!(connection.get_model("Comment").is_none());

        connection.delete_model("Post");
        assert!(users.sibling("Post").is_none());
        assert!(connection.backend::<MemoryBackend>().is_some());
        assert!(matches!(connection.start_session(), Err(ModelError::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn drop_collection_removes_records() {
        let connection = Connection::open(MemoryBackend::default()).await.unwrap();
        let users = connection.model("User", Schema::new());
        users.create(doc! { "name": "a" }).await.unwrap();

        assert_eq!(connection.collection_names().await.unwrap(), vec!["users"]);
        connection.drop_collection("users").await.unwrap();
        assert!(connection.collection_names().await.unwrap().is_empty());
        assert!(connection.drop_collection("users").await.is_err());
    }
}
