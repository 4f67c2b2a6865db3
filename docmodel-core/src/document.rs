//! Live, schema-bound views over stored records.
//!
//! A [`Document`] owns a copy of one record and knows the [`Model`] it came from, which gives
//! it access to the schema (virtuals, getters, setters, methods, hooks) and to persistence.
//! Writes through [`Document::set`] are cast and tracked so [`Document::get_changes`] can report
//! them; [`Document::save`] merges the snapshot back by `_id`.
//!
//! # Example
//!
//! ```ignore
//! let mut user = users.create(doc! { "name": "Alice" }).await?;
//! user.set("age", 31)?;
//! assert!(user.is_modified("age"));
//! user.save().await?;
//! ```

use bson::{Bson, de::deserialize_from_document, doc};
use indexmap::{IndexMap, IndexSet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, sync::Arc};

use crate::{
    codec,
    error::{ModelError, ModelResult},
    evaluator::{remove_path, resolve_path, set_path},
    model::{Model, UpdateResult, merge_snapshot},
    schema::{HookAction, PathType, Schema},
    Record,
};

/// The resolved value of a populated path.
#[derive(Debug, Clone)]
pub enum Populated {
    /// A single referenced document, or `None` for a single-valued virtual without a match.
    One(Option<Box<Document>>),
    /// Documents resolved from an array of references or a many-valued virtual.
    Many(Vec<Document>),
    /// The number of matches of a counting virtual.
    Count(u64),
}

impl Populated {
    /// The plain value this population expands to.
    pub fn to_bson(&self) -> Bson {
        match self {
            Populated::One(Some(doc)) => Bson::Document(doc.to_object()),
            Populated::One(None) => Bson::Null,
            Populated::Many(docs) => Bson::Array(docs.iter().map(|doc| Bson::Document(doc.to_object())).collect()),
            Populated::Count(count) => i64::try_from(*count)
                .map(Bson::Int64)
                .unwrap_or(Bson::Double(*count as f64)),
        }
    }

    /// The documents held by this population.
    pub fn documents(&self) -> Vec<&Document> {
        match self {
            Populated::One(Some(doc)) => vec![doc.as_ref()],
            Populated::Many(docs) => docs.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Options for [`Document::to_object_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ToObjectOptions {
    /// Pass schema paths through their getters.
    pub getters: bool,
    /// Include virtuals.
    pub virtuals: bool,
}

/// A record bound to its model.
#[derive(Clone)]
pub struct Document {
    doc: Record,
    model: Model,
    modified: IndexSet<String>,
    populated: IndexMap<String, Populated>,
    is_new: bool,
}

impl Document {
    pub(crate) fn new(doc: Record, model: Model, is_new: bool) -> Self {
        Self {
            doc,
            model,
            modified: IndexSet::new(),
            populated: IndexMap::new(),
            is_new,
        }
    }

    /// The `_id` of the underlying record, if it has one.
    pub fn id(&self) -> Option<&str> {
        self.doc.get_str("_id").ok()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.model.schema()
    }

    /// True for documents returned by a create that have not been saved since.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// The stored snapshot, without getters, virtuals or populated values.
    pub fn record(&self) -> &Record {
        &self.doc
    }

    pub fn into_record(self) -> Record {
        self.doc
    }

    /// Reads a path.
    ///
    /// Virtuals run their getter chain (or return their populated value), populated paths
    /// return the populated documents' plain snapshots, and declared paths pass through
    /// their getters. Dotted paths traverse nested records.
    pub fn get(&self, path: &str) -> Option<Bson> {
        if let Some(populated) = self.populated.get(path) {
            return Some(populated.to_bson());
        }

        if let Some(virtual_type) = self.schema().get_virtual(path) {
            return Some(virtual_type.apply_getters(Bson::Null, self));
        }

        let raw = resolve_path(&self.doc, path)?.clone();

        Some(match self.schema().path(path) {
            Some(field) => field.apply_getters(raw),
            None => raw,
        })
    }

    /// Reads a path from the stored snapshot, bypassing getters and populated values.
    pub fn get_raw(&self, path: &str) -> Option<&Bson> {
        resolve_path(&self.doc, path)
    }

    /// Writes a path.
    ///
    /// Virtuals run their setter chain, declared paths are cast and anything else is stored
    /// as given. The path is marked modified and any populated value for it is dropped.
    ///
    /// # Errors
    ///
    /// - [`ModelError::Cast`] if the value does not fit the declared kind.
    /// - [`ModelError::InvalidDocument`] when changing `_id` or writing a reserved name.
    pub fn set(&mut self, path: &str, value: impl Into<Bson>) -> ModelResult<()> {
        let value = value.into();

        if path == "_id" {
            return match self.doc.get("_id") {
                Some(existing) if *existing != value => {
                    Err(ModelError::InvalidDocument("_id is immutable".to_string()))
                }
                Some(_) => Ok(()),
                None => {
                    self.doc.insert("_id", value);
                    Ok(())
                }
            };
        }

        let schema = self.schema().clone();

        let value = match schema.path_type(path) {
            PathType::Virtual => {
                if let Some(virtual_type) = schema.get_virtual(path) {
                    virtual_type.apply_setters(value, self)?;
                }
                return Ok(());
            }
            PathType::Reserved => {
                return Err(ModelError::InvalidDocument(format!("`{path}` is a reserved name")));
            }
            PathType::Real | PathType::Adhoc => schema.cast_path(path, value)?,
        };

        set_path(&mut self.doc, path, value);
        self.populated.shift_remove(path);
        self.mark_modified(path);
        Ok(())
    }

    /// Removes a path from the snapshot and marks it modified.
    pub fn unset(&mut self, path: &str) -> ModelResult<()> {
        if path == "_id" {
            return Err(ModelError::InvalidDocument("_id is immutable".to_string()));
        }

        remove_path(&mut self.doc, path);
        self.populated.shift_remove(path);
        self.mark_modified(path);
        Ok(())
    }

    /// Invokes a schema instance method on this document.
    pub fn call(&mut self, method: &str, args: &[Bson]) -> ModelResult<Bson> {
        let function = self
            .schema()
            .get_method(method)
            .ok_or_else(|| ModelError::InvalidDocument(format!("no method named `{method}`")))?;

        function(self, args)
    }

    /// Validates and merges the snapshot into the stored record through the model.
    ///
    /// Fields the document never loaded (after a projection) are kept; paths removed with
    /// [`unset`](Self::unset) are removed. Validation sees the merged record. Runs the validate
    /// hooks around schema validation, then the save hooks around the write. The first hook
    /// failure aborts the save. Afterwards the document holds the full stored record.
    pub async fn save(&mut self) -> ModelResult<UpdateResult> {
        let schema = self.schema().clone();
        let modified = self.modified_paths();
        let mut record = self.doc.clone();

        schema.run_pre(HookAction::Validate, &mut record)?;

        let mut merged = match record.get("_id") {
            Some(id) => self
                .model
                .fetch(&doc! { "_id": id.clone() })
                .await?
                .into_iter()
                .next()
                .unwrap_or_default(),
            None => Record::new(),
        };
        merge_snapshot(&mut merged, &record, &modified);

        let errors = schema.validate(&merged).await;
        if !errors.is_empty() {
            return Err(ModelError::Validation(errors));
        }

        schema.run_post(HookAction::Validate, &record)?;
        schema.run_pre(HookAction::Save, &mut record)?;

        let (result, stored) = self.model.save_record(record, &modified).await?;
        self.doc = stored;

        schema.run_post(HookAction::Save, &self.doc)?;

        self.modified.clear();
        self.is_new = false;
        Ok(result)
    }

    /// A plain snapshot with populated paths expanded.
    pub fn to_object(&self) -> Record {
        self.to_object_with(ToObjectOptions::default())
    }

    pub fn to_object_with(&self, options: ToObjectOptions) -> Record {
        let schema = self.schema();
        let mut out = self.doc.clone();

        if options.getters {
            for (path, field) in schema.flattened() {
                if let Some(value) = resolve_path(&out, &path).cloned() {
                    set_path(&mut out, &path, field.apply_getters(value));
                }
            }
        }

        for (path, populated) in &self.populated {
            let is_virtual = schema.get_virtual(path).is_some();

            if !is_virtual || options.virtuals {
                set_path(&mut out, path, populated.to_bson());
            }
        }

        if options.virtuals {
            for name in schema.virtual_names() {
                if !self.populated.contains_key(&name)
                    && let Some(value) = self.get(&name)
                {
                    set_path(&mut out, &name, value);
                }
            }
        }

        out
    }

    /// The plain snapshot as JSON, with dates rendered as ISO-8601 strings.
    pub fn to_json(&self) -> Value {
        Value::Object(codec::record_to_json(&self.to_object()))
    }

    /// Deserializes the plain snapshot into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> ModelResult<T> {
        Ok(deserialize_from_document(self.to_object())?)
    }

    pub fn mark_modified(&mut self, path: &str) {
        self.modified.insert(path.to_string());
    }

    /// True if `path`, one of its parents or one of its children was modified.
    pub fn is_modified(&self, path: &str) -> bool {
        self.modified.iter().any(|modified| {
            modified == path
                || modified.starts_with(&format!("{path}."))
                || path.starts_with(&format!("{modified}."))
        })
    }

    pub fn modified_paths(&self) -> Vec<String> {
        self.modified.iter().cloned().collect()
    }

    /// Modified paths mapped to their current values (null once removed).
    pub fn get_changes(&self) -> Record {
        self.modified
            .iter()
            .map(|path| {
                let value = resolve_path(&self.doc, path)
                    .cloned()
                    .unwrap_or(Bson::Null);

                (path.clone(), value)
            })
            .collect()
    }

    /// The population recorded for `path`, if any.
    pub fn populated(&self, path: &str) -> Option<&Populated> {
        self.populated.get(path)
    }

    /// Fails with [`ModelError::NotPopulated`] naming the first path that is not populated.
    pub fn assert_populated(&self, paths: &[&str]) -> ModelResult<()> {
        match paths.iter().find(|path| !self.populated.contains_key(**path)) {
            Some(path) => Err(ModelError::NotPopulated(path.to_string())),
            None => Ok(()),
        }
    }

    /// Every document held by any populated path.
    pub fn populated_docs(&self) -> Vec<&Document> {
        self.populated
            .values()
            .flat_map(Populated::documents)
            .collect()
    }

    /// Forgets the population of `path`; reads fall back to the stored identifiers.
    pub fn depopulate(&mut self, path: &str) -> Option<Populated> {
        self.populated.shift_remove(path)
    }

    pub(crate) fn set_populated(&mut self, path: &str, populated: Populated) {
        self.populated.insert(path.to_string(), populated);
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("model", &self.model.name())
            .field("doc", &self.doc)
            .field("modified", &self.modified)
            .field("populated", &self.populated.keys().collect::<Vec<_>>())
            .field("is_new", &self.is_new)
            .finish()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name() && self.doc == other.doc
    }
}
