//! One-JSON-file-per-collection storage.

use async_trait::async_trait;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, trace};

use docmodel_core::{
    Record,
    backend::{StoreBackend, StoreBackendBuilder},
    codec,
    error::{ModelError, ModelResult},
};

const DEFAULT_EXTENSION: &str = "json";

/// Persistence backend storing each collection as `<dir>/<collection>.json`.
///
/// The directory is created by the builder. Loading a collection whose file does not exist
/// creates the file with an empty array.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    extension: String,
    pretty: bool,
}

impl FileStore {
    /// Creates a builder rooted at `dir`.
    pub fn builder(dir: impl Into<PathBuf>) -> FileStoreBuilder {
        FileStoreBuilder::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file backing `collection`.
    pub fn collection_path(&self, collection: &str) -> ModelResult<PathBuf> {
        let valid = !collection.is_empty()
            && !collection.starts_with('.')
            && !collection.contains(['/', '\\']);

        if !valid {
            return Err(ModelError::Persistence(format!("invalid collection name `{collection}`")));
        }

        Ok(self.dir.join(format!("{collection}.{}", self.extension)))
    }

    async fn write_atomic(&self, path: &Path, contents: String) -> ModelResult<()> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&temp, contents)
            .await
            .map_err(|e| io_error("write", &temp, e))?;
        fs::rename(&temp, path)
            .await
            .map_err(|e| io_error("replace", path, e))
    }
}

#[async_trait]
impl StoreBackend for FileStore {
    async fn load(&self, collection: &str) -> ModelResult<Vec<Record>> {
        let path = self.collection_path(collection)?;

        match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => {
                let records = codec::records_from_json(&text)?;
                trace!(%collection, records = records.len(), "loaded collection");
                Ok(records)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%collection, path = %path.display(), "creating collection file");
                self.write_atomic(&path, "[]".to_string()).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn store(&self, collection: &str, records: Vec<Record>) -> ModelResult<()> {
        let path = self.collection_path(collection)?;
        let contents = codec::records_to_json(&records, self.pretty)?;

        trace!(%collection, records = records.len(), "storing collection");
        self.write_atomic(&path, contents).await
    }

    async fn list_collections(&self) -> ModelResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error("list", &self.dir, e))?;
        let mut names = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.dir, e))?
        {
            let path = entry.path();
            let matches_extension = path
                .extension()
                .is_some_and(|extension| extension == self.extension.as_str());

            if matches_extension
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && !stem.starts_with('.')
            {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> ModelResult<()> {
        let path = self.collection_path(name)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ModelError::CollectionNotFound(name.to_string())),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> ModelError {
    ModelError::Persistence(format!("failed to {action} {}: {error}", path.display()))
}

/// Builder for [`FileStore`].
///
/// ```ignore
/// let store = FileStore::builder("./data")
///     .pretty(true)
///     .extension("db.json")
///     .build()
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct FileStoreBuilder {
    dir: PathBuf,
    extension: String,
    pretty: bool,
}

impl FileStoreBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            pretty: false,
        }
    }

    /// Indent written JSON.
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// File extension of collection files, without the leading dot.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for FileStoreBuilder {
    type Backend = FileStore;

    /// Creates the directory if needed and returns the store.
    async fn build(self) -> ModelResult<Self::Backend> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create", &self.dir, e))?;

        Ok(FileStore {
            dir: self.dir,
            extension: self.extension,
            pretty: self.pretty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, DateTime, doc};
    use tempfile::{TempDir, tempdir};

    async fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::builder(temp_dir.path().join("data")).build().await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn loading_a_missing_collection_creates_an_empty_file() {
        let (store, _temp_dir) = create_test_store().await;

        assert!(store.load("users").await.unwrap().is_empty());

        let path = store.collection_path("users").unwrap();
        assert_eq!(fs::read_to_string(path).await.unwrap(), "[]");
        assert_eq!(store.list_collections().await.unwrap(), vec!["users"]);
    }

    #[tokio::test]
    async fn records_round_trip_with_dates() {
        let (store, _temp_dir) = create_test_store().await;
        let created = DateTime::from_millis(1_700_000_000_123);

        store
            .store(
                "users",
                vec![doc! { "_id": "a", "name": "Alice", "age": 30, "createdAt": created, "tags": ["x"] }],
            )
            .await
            .unwrap();

        let loaded = store.load("users").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].get("createdAt"), Some(&Bson::DateTime(created)));
        assert_eq!(loaded[0].get("age"), Some(&Bson::Int32(30)));
        assert_eq!(loaded[0].get_str("name").unwrap(), "Alice");

        let text = fs::read_to_string(store.collection_path("users").unwrap()).await.unwrap();
        assert!(text.contains("2023-11-14T22:13:20.123Z"));
    }

    #[tokio::test]
    async fn pretty_output_and_custom_extension() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::builder(temp_dir.path())
            .pretty(true)
            .extension(".db")
            .build()
            .await
            .unwrap();

        store.store("posts", vec![doc! { "_id": "p" }]).await.unwrap();

        let path = store.collection_path("posts").unwrap();
        assert!(path.ends_with("posts.db"));
        assert!(fs::read_to_string(path).await.unwrap().contains('\n'));
        assert_eq!(store.list_collections().await.unwrap(), vec!["posts"]);
    }

    #[tokio::test]
    async fn drop_and_invalid_names() {
        let (store, _temp_dir) = create_test_store().await;
        store.store("users", vec![]).await.unwrap();

        store.drop_collection("users").await.unwrap();
        assert!(matches!(store.drop_collection("users").await, Err(ModelError::CollectionNotFound(_))));
        assert!(matches!(store.load("../escape").await, Err(ModelError::Persistence(_))));
    }

    #[tokio::test]
    async fn corrupt_files_are_persistence_errors() {
        let (store, _temp_dir) = create_test_store().await;
        fs::write(store.collection_path("users").unwrap(), "{ invalid json }").await.unwrap();

        assert!(store.load("users").await.is_err());
    }
}
