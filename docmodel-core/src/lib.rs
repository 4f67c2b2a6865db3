//! A schema-typed document mapping and query engine over flat-file persistence.
//!
//! This crate is the core of the docmodel project and provides:
//!
//! - **Field types** ([`schema_type`]) - Casting, defaults, validators, getters and setters per field
//! - **Schemas** ([`schema`]) - Field definitions plus virtuals, methods, statics, hooks and indexes
//! - **Documents** ([`document`]) - Live, schema-bound records with change tracking and population
//! - **Models** ([`model`]) - Collection-level create, read, update and delete
//! - **Queries** ([`query`]) - Filtering, sorting, pagination, projection and population
//! - **Aggregation** ([`aggregate`]) - In-memory `$match`/`$group`/`$sort`/`$unwind` pipelines
//! - **Connections** ([`connection`]) - Model registry, readiness and per-collection write locks
//! - **Store backend abstraction** ([`backend`]) - Traits for persistence and identifier collaborators
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use docmodel_core::{connection::Connection, schema::Schema, schema_type::SchemaType};
//!
//! let schema = Schema::new()
//!     .add("name", SchemaType::string().required())
//!     .add("age", SchemaType::number().default_value(0));
//!
//! let connection = Connection::open(backend).await?;
//! let users = connection.model("User", schema);
//!
//! let alice = users.create(doc! { "name": "Alice" }).await?;
//! assert_eq!(alice.get("age"), Some(0.into()));
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_core;

pub mod aggregate;
pub mod backend;
pub mod codec;
pub mod connection;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod filter;
pub mod model;
pub mod query;
pub mod schema;
pub mod schema_type;

#[cfg(test)]
mod testing;

/// A stored record: an ordered map of field names to values.
pub type Record = bson::Document;
