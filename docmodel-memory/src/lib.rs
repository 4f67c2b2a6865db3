//! In-memory persistence backend for docmodel.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! Collections live in a map behind an async-aware read-write lock, which makes the store a
//! good fit for development, tests and short-lived data.
//!
//! # Quick Start
//!
//! ```ignore
//! use bson::doc;
//! use docmodel::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::open(InMemoryStore::new()).await?;
//!     let users = connection.model("User", Schema::new().add("name", SchemaType::string()));
//!
//!     users.create(doc! { "name": "Alice" }).await?;
//!     assert_eq!(users.count_documents(doc! {}).await?, 1);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
