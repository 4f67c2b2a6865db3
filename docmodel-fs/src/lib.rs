//! Flat-file persistence backend for docmodel.
//!
//! Every collection is one JSON file holding an array of records. Dates are written as
//! ISO-8601 strings and come back as dates. Writes go through a temporary file that is
//! renamed over the collection file, so a reader never sees a half-written collection.
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::{prelude::*, fs::FileStore};
//!
//! let store = FileStore::builder("./data").pretty(true).build().await?;
//! let connection = Connection::open(store).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_fs;

pub mod store;

pub use store::{FileStore, FileStoreBuilder};
