//! Main docmodel crate: schema-typed documents over flat-file persistence.
//!
//! This crate is the primary entry point for users of the docmodel framework. It re-exports
//! the core types from the sub-crates and gives access to the bundled storage backends.
//!
//! # Features
//!
//! - **Schemas** - Typed fields with casting, defaults, validators, getters and setters
//! - **Documents** - Virtuals, instance methods, change tracking and middleware hooks
//! - **Queries** - Operator-based matching, stable multi-key sorting, projection and population
//! - **Aggregation** - `$match`, `$group`, `$sort`, `$skip`, `$limit`, `$unwind` pipelines
//! - **Backends** - In-memory and one-JSON-file-per-collection persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use bson::doc;
//! use docmodel::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> ModelResult<()> {
//!     let connection = Connection::open(InMemoryStore::new()).await?;
//!
//!     let users = connection.model(
//!         "User",
//!         Schema::new()
//!             .add("name", SchemaType::string().required())
//!             .add("age", SchemaType::number().default_value(0)),
//!     );
//!
//!     users.create(doc! { "name": "Alice", "age": 30 }).await?;
//!     users.create(doc! { "name": "Bob" }).await?;
//!
//!     let adults = users
//!         .find(doc! {})
//!         .where_field("age").gte(18)
//!         .end()
//!         .sort("-age")
//!         .exec()
//!         .await?;
//!
//!     println!("Adults: {:?}", adults);
//!
//!     connection.disconnect().await
//! }
//! ```
//!
//! # Population
//!
//! Fields declared with a reference resolve against the model registered under that name
//! on the same connection:
//!
//! ```ignore
//! let posts = connection.model(
//!     "Post",
//!     Schema::new()
//!         .add("title", SchemaType::string())
//!         .add("author", SchemaType::object_id().reference("User")),
//! );
//!
//! let post = posts
//!     .find(doc! { "title": "Hello" })
//!     .populate("author")
//!     .exec_one()
//!     .await?;
//! ```
//!
//! # Aggregation
//!
//! ```ignore
//! let by_age = users
//!     .aggregate(vec![])
//!     .group(doc! { "_id": "$age", "count": { "$sum": 1 } })
//!     .sort("-count")
//!     .exec()
//!     .await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - [`fs`] - One JSON file per collection (requires the `fs` feature, on by default)

pub mod prelude;

pub use docmodel_core::{
    Record, aggregate, backend, codec, connection, document, error, evaluator, filter, model, query, schema,
    schema_type,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmodel_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// Flat-file storage backend implementations.
///
/// This module is only available when the `fs` feature is enabled.
#[cfg(feature = "fs")]
pub mod fs {
    pub use docmodel_fs::{FileStore, FileStoreBuilder};
}
