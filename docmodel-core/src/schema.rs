//! Schemas: field definitions plus everything attached to a model's documents.
//!
//! A [`Schema`] maps field paths to [`SchemaType`]s in declaration order and additionally
//! carries virtuals, instance methods, statics, pre/post hooks and advisory index
//! declarations. Field definitions are fixed once the schema is bound to a model; the
//! remaining registries sit behind locks so they can still be extended through a model's
//! shared schema, taking effect immediately.
//!
//! # Example
//!
//! ```ignore
//! use bson::{doc, Bson};
//! use docmodel::schema::{HookAction, Schema};
//! use docmodel::schema_type::SchemaType;
//!
//! let schema = Schema::new()
//!     .add("first", SchemaType::string().required())
//!     .add("last", SchemaType::string())
//!     .add("age", SchemaType::number().default_value(0));
//!
//! schema.virtual_path("full").get(|_, doc| {
//!     let part = |path| doc.get(path).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
//!     Bson::String(format!("{} {}", part("first"), part("last")))
//! });
//!
//! schema.pre(HookAction::Save, |record| {
//!     record.insert("touched", true);
//!     Ok(())
//! });
//! ```

use bson::Bson;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, future::Future, sync::Arc};
use tracing::warn;

use crate::{
    document::Document,
    error::ModelResult,
    evaluator::{resolve_path, set_path},
    model::Model,
    schema_type::{SchemaKind, SchemaType},
    Record,
};

/// Names a document already uses for its own API; they cannot be schema paths.
pub const RESERVED_PATHS: &[&str] = &[
    "collection", "errors", "get", "init", "isNew", "isModified", "markModified", "model",
    "populated", "save", "schema", "set", "toJSON", "toObject", "validate",
];

/// Instance method bound to documents: `(document, args) -> value`.
pub type Method = Arc<dyn Fn(&mut Document, &[Bson]) -> ModelResult<Bson> + Send + Sync>;

/// Static bound to the model: `(model, args) -> value`.
pub type StaticFn = Arc<dyn Fn(Model, Vec<Bson>) -> BoxFuture<'static, ModelResult<Bson>> + Send + Sync>;

/// Hook run before an action, free to modify the record it is given.
pub type PreHook = Arc<dyn Fn(&mut Record) -> ModelResult<()> + Send + Sync>;

/// Hook run after an action completed.
pub type PostHook = Arc<dyn Fn(&Record) -> ModelResult<()> + Send + Sync>;

pub type VirtualGetter = Arc<dyn Fn(Bson, &Document) -> Bson + Send + Sync>;
pub type VirtualSetter = Arc<dyn Fn(Bson, &mut Document) -> ModelResult<Bson> + Send + Sync>;

/// Actions hooks can attach to.
///
/// Pre hooks receive the record being validated or saved, the update document of an update,
/// or the conditions of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookAction {
    Validate,
    Save,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
}

/// How a name relates to a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// A declared field, or a system field.
    Real,
    Virtual,
    /// A name the document API already uses.
    Reserved,
    /// Anything else; stored as given.
    Adhoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    /// Maintain `createdAt` and `updatedAt`.
    pub timestamps: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self { timestamps: true }
    }
}

/// An index declaration. Purely advisory; nothing is built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub fields: Record,
    pub unique: bool,
}

/// Describes how a virtual resolves documents from another model.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualPopulate {
    /// Registered name of the model to read from.
    pub model: String,
    /// Path on this document holding the value to look up.
    pub local_field: String,
    /// Path on the foreign records compared against the local value.
    pub foreign_field: String,
    /// Resolve to the first match instead of all of them.
    pub just_one: bool,
    /// Additional conditions applied to the foreign records.
    pub filter: Option<Record>,
    /// Resolve to the number of matches.
    pub count: bool,
}

impl VirtualPopulate {
    pub fn new(
        model: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            just_one: false,
            filter: None,
            count: false,
        }
    }

    pub fn just_one(mut self) -> Self {
        self.just_one = true;
        self
    }

    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn filter(mut self, filter: Record) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A computed, non-persisted path.
pub struct VirtualType {
    name: String,
    getters: RwLock<Vec<VirtualGetter>>,
    setters: RwLock<Vec<VirtualSetter>>,
    populate: RwLock<Option<VirtualPopulate>>,
}

impl VirtualType {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            getters: RwLock::new(Vec::new()),
            setters: RwLock::new(Vec::new()),
            populate: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a getter. Getters run in order, each receiving the previous result.
    pub fn get<F>(&self, getter: F) -> &Self
    where
        F: Fn(Bson, &Document) -> Bson + Send + Sync + 'static,
    {
        self.getters.write().push(Arc::new(getter));
        self
    }

    /// Appends a setter. Setters run in order and may write through the document.
    pub fn set<F>(&self, setter: F) -> &Self
    where
        F: Fn(Bson, &mut Document) -> ModelResult<Bson> + Send + Sync + 'static,
    {
        self.setters.write().push(Arc::new(setter));
        self
    }

    pub fn populate(&self, options: VirtualPopulate) -> &Self {
        *self.populate.write() = Some(options);
        self
    }

    pub fn populate_options(&self) -> Option<VirtualPopulate> {
        self.populate.read().clone()
    }

    pub fn apply_getters(&self, value: Bson, doc: &Document) -> Bson {
        let getters = self.getters.read().clone();

        getters
            .iter()
            .fold(value, |value, getter| getter(value, doc))
    }

    pub fn apply_setters(&self, value: Bson, doc: &mut Document) -> ModelResult<Bson> {
        let setters = self.setters.read().clone();

        setters
            .iter()
            .try_fold(value, |value, setter| setter(value, doc))
    }

    fn duplicate(&self) -> Self {
        Self {
            name: self.name.clone(),
            getters: RwLock::new(self.getters.read().clone()),
            setters: RwLock::new(self.setters.read().clone()),
            populate: RwLock::new(self.populate.read().clone()),
        }
    }
}

impl fmt::Debug for VirtualType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualType")
            .field("name", &self.name)
            .field("getters", &self.getters.read().len())
            .field("setters", &self.setters.read().len())
            .field("populate", &*self.populate.read())
            .finish()
    }
}

#[derive(Clone, Default)]
struct Hooks {
    pre: Vec<PreHook>,
    post: Vec<PostHook>,
}

/// Field definitions and document behavior for one model.
pub struct Schema {
    fields: IndexMap<String, Arc<SchemaType>>,
    options: SchemaOptions,
    required: RwLock<Option<Vec<String>>>,
    virtuals: RwLock<IndexMap<String, Arc<VirtualType>>>,
    methods: RwLock<HashMap<String, Method>>,
    statics: RwLock<HashMap<String, StaticFn>>,
    hooks: RwLock<HashMap<HookAction, Hooks>>,
    indexes: RwLock<Vec<IndexSpec>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::with_options(SchemaOptions::default())
    }

    pub fn with_options(options: SchemaOptions) -> Self {
        Self {
            fields: IndexMap::new(),
            options,
            required: RwLock::new(None),
            virtuals: RwLock::new(IndexMap::new()),
            methods: RwLock::new(HashMap::new()),
            statics: RwLock::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            indexes: RwLock::new(Vec::new()),
        }
    }

    pub fn options(&self) -> SchemaOptions {
        self.options
    }

    /// Declares a field. Reserved names are rejected with a warning.
    pub fn add(mut self, path: impl Into<String>, field: impl Into<SchemaType>) -> Self {
        let path = path.into();

        if RESERVED_PATHS.contains(&path.as_str()) {
            warn!(%path, "ignoring reserved schema path");
            return self;
        }

        self.fields.insert(path, Arc::new(field.into()));
        *self.required.get_mut() = None;
        self
    }

    /// Declares `from` as a virtual that reads and writes `to`.
    pub fn alias(self, from: &str, to: &str) -> Self {
        let target = to.to_string();
        let source = to.to_string();

        self.virtual_path(from)
            .get(move |_, doc| doc.get(&target).unwrap_or(Bson::Null))
            .set(move |value, doc| {
                doc.set(&source, value.clone())?;
                Ok(value)
            });

        self
    }

    /// Declares an advisory index.
    pub fn index(&self, fields: Record, unique: bool) -> &Self {
        self.indexes.write().push(IndexSpec { fields, unique });
        self
    }

    /// Every declared index, including field-level `index`/`unique` flags.
    pub fn indexes(&self) -> Vec<IndexSpec> {
        let mut indexes = self
            .flattened()
            .into_iter()
            .filter(|(_, field)| field.is_indexed())
            .map(|(path, field)| {
                let mut fields = Record::new();
                fields.insert(path, 1);
                IndexSpec { fields, unique: field.is_unique() }
            })
            .collect::<Vec<_>>();

        indexes.extend(self.indexes.read().iter().cloned());
        indexes
    }

    /// Removes declared indexes over exactly these fields.
    pub fn remove_index(&self, fields: &Record) -> &Self {
        self.indexes
            .write()
            .retain(|index| &index.fields != fields);
        self
    }

    pub fn method<F>(&self, name: impl Into<String>, method: F) -> &Self
    where
        F: Fn(&mut Document, &[Bson]) -> ModelResult<Bson> + Send + Sync + 'static,
    {
        self.methods.write().insert(name.into(), Arc::new(method));
        self
    }

    pub fn static_fn<F, Fut>(&self, name: impl Into<String>, function: F) -> &Self
    where
        F: Fn(Model, Vec<Bson>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModelResult<Bson>> + Send + 'static,
    {
        let function: StaticFn = Arc::new(move |model, args| Box::pin(function(model, args)));
        self.statics.write().insert(name.into(), function);
        self
    }

    pub fn pre<F>(&self, action: HookAction, hook: F) -> &Self
    where
        F: Fn(&mut Record) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry(action)
            .or_default()
            .pre
            .push(Arc::new(hook));
        self
    }

    pub fn post<F>(&self, action: HookAction, hook: F) -> &Self
    where
        F: Fn(&Record) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry(action)
            .or_default()
            .post
            .push(Arc::new(hook));
        self
    }

    /// Returns the virtual called `name`, creating it if needed.
    pub fn virtual_path(&self, name: &str) -> Arc<VirtualType> {
        if let Some(existing) = self.virtuals.read().get(name) {
            return existing.clone();
        }

        self.virtuals
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(VirtualType::new(name)))
            .clone()
    }

    /// Looks up an existing virtual without creating it.
    pub fn get_virtual(&self, name: &str) -> Option<Arc<VirtualType>> {
        self.virtuals.read().get(name).cloned()
    }

    pub fn virtual_names(&self) -> Vec<String> {
        self.virtuals.read().keys().cloned().collect()
    }

    pub fn get_method(&self, name: &str) -> Option<Method> {
        self.methods.read().get(name).cloned()
    }

    pub fn get_static(&self, name: &str) -> Option<StaticFn> {
        self.statics.read().get(name).cloned()
    }

    /// The definition at `path`. Dotted paths descend into nested schemas.
    pub fn path(&self, path: &str) -> Option<Arc<SchemaType>> {
        if let Some(field) = self.fields.get(path) {
            return Some(field.clone());
        }

        let (head, rest) = path.split_once('.')?;

        self.fields
            .get(head)?
            .nested_schema()?
            .path(rest)
    }

    /// Top-level field paths in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn path_type(&self, path: &str) -> PathType {
        if path == "_id" || self.path(path).is_some() {
            PathType::Real
        } else if self.options.timestamps && matches!(path, "createdAt" | "updatedAt") {
            PathType::Real
        } else if self.virtuals.read().contains_key(path) {
            PathType::Virtual
        } else if RESERVED_PATHS.contains(&path) {
            PathType::Reserved
        } else {
            PathType::Adhoc
        }
    }

    /// Paths of required fields, nested ones dotted. Recomputed when `invalidate` is set.
    pub fn required_paths(&self, invalidate: bool) -> Vec<String> {
        if !invalidate && let Some(cached) = self.required.read().as_ref() {
            return cached.clone();
        }

        let required = self
            .flattened()
            .into_iter()
            .filter(|(_, field)| field.is_required())
            .map(|(path, _)| path)
            .collect::<Vec<_>>();

        *self.required.write() = Some(required.clone());
        required
    }

    /// Every definition with nested schemas flattened to dotted paths. A nested field appears
    /// before its children.
    pub fn flattened(&self) -> Vec<(String, Arc<SchemaType>)> {
        let mut out = Vec::with_capacity(self.fields.len());

        for (path, field) in &self.fields {
            out.push((path.clone(), field.clone()));

            if let Some(nested) = field.nested_schema() {
                out.extend(
                    nested
                        .flattened()
                        .into_iter()
                        .map(|(child, field)| (format!("{path}.{child}"), field)),
                );
            }
        }

        out
    }

    /// Validates every declared field of `record` independently.
    ///
    /// Values are expected to be cast already (see [`cast_record`](Self::cast_record)), so
    /// only the kind is checked and setters do not run again. Returns one message per failing
    /// field: `"<path> is required"` for missing required values, the cast error for values
    /// that do not fit their kind, otherwise the first failing validator's message.
    pub async fn validate(&self, record: &Record) -> Vec<String> {
        let mut errors = Vec::new();

        for (path, field) in self.flattened() {
            let value = resolve_path(record, &path)
                .filter(|value| !matches!(value, Bson::Null | Bson::Undefined));

            let Some(value) = value else {
                if field.is_required() {
                    errors.push(format!("{path} is required"));
                }
                continue;
            };

            match field.check_kind(&path, value.clone()) {
                Ok(cast) => {
                    if let Some(error) = field.do_validate(&path, &cast, record).await {
                        errors.push(error);
                    }
                }
                Err(error) => errors.push(error.to_string()),
            }
        }

        errors
    }

    /// Fills absent fields that declare a default, descending into nested schemas. Returns
    /// the filled paths.
    pub fn apply_defaults(&self, record: &mut Record) -> Vec<String> {
        let mut filled = Vec::new();

        for (path, field) in self.flattened() {
            if resolve_path(record, &path).is_some() || blocked_by_scalar(record, &path) {
                continue;
            }

            if let Some(default) = field.get_default() {
                set_path(record, &path, default);
                filled.push(path);
            }
        }

        filled
    }

    /// Casts every declared, present field in place. Values that fail to cast are left as
    /// they are for [`validate`](Self::validate) to report.
    pub fn cast_record(&self, record: &mut Record) {
        for (path, field) in self.flattened() {
            if matches!(field.kind(), SchemaKind::Nested(_)) {
                continue;
            }

            if let Some(value) = resolve_path(record, &path).cloned()
                && let Ok(cast) = field.cast(&path, value)
            {
                set_path(record, &path, cast);
            }
        }
    }

    /// Casts one value destined for `path`. Paths the schema does not declare pass through.
    pub fn cast_path(&self, path: &str, value: Bson) -> ModelResult<Bson> {
        match self.path(path) {
            Some(field) => field.cast(path, value),
            None => Ok(value),
        }
    }

    /// Runs the pre hooks of `action` in registration order, stopping at the first failure.
    pub fn run_pre(&self, action: HookAction, record: &mut Record) -> ModelResult<()> {
        let (pre, _) = self.hooks(action);

        pre.iter().try_for_each(|hook| hook(record))
    }

    /// Runs the post hooks of `action` in registration order, stopping at the first failure.
    pub fn run_post(&self, action: HookAction, record: &Record) -> ModelResult<()> {
        let (_, post) = self.hooks(action);

        post.iter().try_for_each(|hook| hook(record))
    }

    /// The pre and post hooks registered for `action`.
    pub fn hooks(&self, action: HookAction) -> (Vec<PreHook>, Vec<PostHook>) {
        self.hooks
            .read()
            .get(&action)
            .map(|hooks| (hooks.pre.clone(), hooks.post.clone()))
            .unwrap_or_default()
    }
}

/// True when some ancestor of `path` holds a non-record value.
fn blocked_by_scalar(record: &Record, path: &str) -> bool {
    path.match_indices('.').any(|(end, _)| {
        resolve_path(record, &path[..end]).is_some_and(|value| !matches!(value, Bson::Document(_)))
    })
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Schema {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            options: self.options,
            required: RwLock::new(self.required.read().clone()),
            virtuals: RwLock::new(
                self.virtuals
                    .read()
                    .iter()
                    .map(|(name, virtual_type)| (name.clone(), Arc::new(virtual_type.duplicate())))
                    .collect(),
            ),
            methods: RwLock::new(self.methods.read().clone()),
            statics: RwLock::new(self.statics.read().clone()),
            hooks: RwLock::new(self.hooks.read().clone()),
            indexes: RwLock::new(self.indexes.read().clone()),
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("options", &self.options)
            .field("virtuals", &self.virtuals.read().keys().collect::<Vec<_>>())
            .field("methods", &self.methods.read().keys().collect::<Vec<_>>())
            .field("statics", &self.statics.read().keys().collect::<Vec<_>>())
            .field("indexes", &*self.indexes.read())
            .finish()
    }
}

impl From<Schema> for SchemaType {
    fn from(schema: Schema) -> Self {
        SchemaType::nested(schema)
    }
}
