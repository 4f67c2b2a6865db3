//! Convenient re-exports of commonly used types from docmodel.
//!
//! ```ignore
//! use docmodel::prelude::*;
//! ```
//!
//! This provides access to:
//! - Schemas, field types and virtual population
//! - Connections, models and documents
//! - Queries, aggregation pipelines and their options
//! - Store backends and builders
//! - Error types

pub use docmodel_core::{
    Record,
    aggregate::Aggregate,
    backend::{DynStoreBackend, IdGenerator, StoreBackend, StoreBackendBuilder, UuidGenerator},
    connection::{Connection, ConnectionOptions, ConnectionState, ModelOptions},
    document::{Document, Populated, ToObjectOptions},
    error::{ModelError, ModelResult},
    model::{DeleteResult, Model, UpdateOptions, UpdateResult},
    query::{LeanQuery, PopulateOptions, Projection, Query, QueryBuilder, SortDirection},
    schema::{HookAction, IndexSpec, PathType, Schema, SchemaOptions, VirtualPopulate},
    schema_type::{SchemaKind, SchemaType},
};
