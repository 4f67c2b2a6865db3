//! Reads: filtering, sorting, pagination, projection and population.
//!
//! A [`Query`] is built from a model's `find` and executed once. Conditions can be given as
//! a condition record or built per path with [`Query::where_field`]:
//!
//! ```ignore
//! use bson::doc;
//!
//! let page = users
//!     .find(doc! { "active": true })
//!     .where_field("age").gte(18).lt(65)
//!     .where_field("name").regex("^a", Some("i"))
//!     .end()
//!     .sort("-age name")
//!     .skip(20)
//!     .limit(10)
//!     .select("name age")
//!     .populate("team")
//!     .exec()
//!     .await?;
//! ```
//!
//! # Execution
//!
//! [`Query::exec`] loads the collection, keeps matching records in stored order, sorts them
//! (stable, multi-key), applies skip then limit, applies the projection, wraps the records as
//! [`Document`]s and finally resolves population requests. Population never fails the query:
//! a missing model or record is logged and the path stays unpopulated.

use bson::Bson;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    document::{Document, Populated},
    error::{ModelError, ModelResult},
    evaluator::{RecordEvaluator, compare_values, remove_path, resolve_path, set_path, values_equal},
    filter::{is_operator_record, truthy},
    model::Model,
    schema::VirtualPopulate,
    Record,
};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (missing first, then null, numbers, strings, ...).
    Asc,
    /// Descending order.
    Desc,
}

impl SortDirection {
    /// Reads `1`/`-1` or `"asc"`/`"desc"` (and their long forms).
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Int32(1) | Bson::Int64(1) => Some(SortDirection::Asc),
            Bson::Int32(-1) | Bson::Int64(-1) => Some(SortDirection::Desc),
            Bson::Double(n) if *n == 1.0 => Some(SortDirection::Asc),
            Bson::Double(n) if *n == -1.0 => Some(SortDirection::Desc),
            Bson::String(text) => match text.to_lowercase().as_str() {
                "asc" | "ascending" => Some(SortDirection::Asc),
                "desc" | "descending" => Some(SortDirection::Desc),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Sort keys in priority order.
pub type SortSpec = IndexMap<String, SortDirection>;

/// Parses `"name -age"`: space separated paths, `-` for descending.
pub fn parse_sort(spec: &str) -> SortSpec {
    spec.split_whitespace()
        .map(|token| match token.strip_prefix('-') {
            Some(path) => (path.to_string(), SortDirection::Desc),
            None => (token.trim_start_matches('+').to_string(), SortDirection::Asc),
        })
        .collect()
}

/// Stable multi-key sort. The first key that differs decides; ties keep their order.
pub fn sort_records(records: &mut [Record], keys: &SortSpec) {
    if keys.is_empty() {
        return;
    }

    records.sort_by(|a, b| {
        keys.iter()
            .map(|(path, direction)| {
                let ordering = compare_values(resolve_path(a, path), resolve_path(b, path));
                match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Field selection applied to result records.
///
/// An inclusion projection keeps only the listed paths (plus `_id` unless excluded); an
/// exclusion projection removes the listed paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    fields: IndexMap<String, bool>,
}

impl Projection {
    /// Parses `"name age"`, `"-password"`; `+path` counts as inclusion.
    pub fn parse(spec: &str) -> Self {
        let fields = spec
            .split_whitespace()
            .map(|token| match token.strip_prefix('-') {
                Some(path) => (path.to_string(), false),
                None => (token.trim_start_matches('+').to_string(), true),
            })
            .collect();

        Self { fields }
    }

    /// Reads `{ path: 1 | 0 | true | false }`.
    pub fn from_record(record: &Record) -> Self {
        Self {
            fields: record
                .iter()
                .map(|(path, flag)| (path.clone(), truthy(flag)))
                .collect(),
        }
    }

    pub fn merge(&mut self, other: Projection) {
        self.fields.extend(other.fields);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn is_inclusion(&self) -> bool {
        self.fields
            .iter()
            .any(|(path, include)| *include && path != "_id")
    }

    pub fn apply(&self, record: Record) -> Record {
        if self.fields.is_empty() {
            return record;
        }

        if !self.is_inclusion() {
            let mut record = record;
            for path in self.fields.keys() {
                remove_path(&mut record, path);
            }
            return record;
        }

        self.include(&record)
    }

    /// The inclusion form: `_id` unless excluded, plus every included path.
    pub(crate) fn include(&self, record: &Record) -> Record {
        let mut out = Record::new();

        if self.fields.get("_id") != Some(&false)
            && let Some(id) = record.get("_id")
        {
            out.insert("_id", id.clone());
        }

        for (path, include) in &self.fields {
            if *include
                && path != "_id"
                && let Some(value) = resolve_path(record, path)
            {
                set_path(&mut out, path, value.clone());
            }
        }

        out
    }
}

/// One population request.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulateOptions {
    /// The reference path or populated virtual to resolve.
    pub path: String,
    /// Projection applied to the resolved records.
    pub select: Option<Projection>,
    /// Model to resolve against instead of the declared reference.
    pub model: Option<String>,
    /// Additional conditions the resolved records must satisfy.
    pub filter: Option<Record>,
}

impl PopulateOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            select: None,
            model: None,
            filter: None,
        }
    }

    pub fn select(mut self, spec: &str) -> Self {
        self.select = Some(Projection::parse(spec));
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn filter(mut self, filter: Record) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A read against one model.
#[derive(Debug, Clone)]
pub struct Query {
    model: Model,
    conditions: Record,
    projection: Option<Projection>,
    sort: SortSpec,
    skip: Option<usize>,
    limit: Option<usize>,
    populate: Vec<PopulateOptions>,
}

impl Query {
    pub fn new(model: Model, conditions: Record) -> Self {
        Self {
            model,
            conditions,
            projection: None,
            sort: SortSpec::new(),
            skip: None,
            limit: None,
            populate: Vec::new(),
        }
    }

    pub fn conditions(&self) -> &Record {
        &self.conditions
    }

    /// Merges more conditions; keys already present are replaced.
    pub fn filter(mut self, conditions: Record) -> Self {
        self.conditions.extend(conditions);
        self
    }

    /// Starts building conditions for `path`.
    pub fn where_field(self, path: impl Into<String>) -> QueryBuilder {
        QueryBuilder {
            query: self,
            path: path.into(),
        }
    }

    /// Selects fields with a space separated spec such as `"name -password"`.
    pub fn select(self, spec: &str) -> Self {
        self.with_projection(Projection::parse(spec))
    }

    pub fn select_fields(self, fields: &Record) -> Self {
        self.with_projection(Projection::from_record(fields))
    }

    fn with_projection(mut self, projection: Projection) -> Self {
        match &mut self.projection {
            Some(existing) => existing.merge(projection),
            None => self.projection = Some(projection),
        }
        self
    }

    /// Adds sort keys from `"name -age"`. Later calls merge into earlier ones.
    pub fn sort(mut self, spec: &str) -> Self {
        self.sort.extend(parse_sort(spec));
        self
    }

    /// Adds sort keys from `{ path: 1 | -1 | "asc" | "desc" }`.
    pub fn sort_by(mut self, spec: &Record) -> Self {
        for (path, value) in spec {
            match SortDirection::from_bson(value) {
                Some(direction) => {
                    self.sort.insert(path.clone(), direction);
                }
                None => warn!(%path, %value, "ignoring invalid sort direction"),
            }
        }
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn populate(self, path: impl Into<String>) -> Self {
        self.populate_with(PopulateOptions::new(path))
    }

    pub fn populate_with(mut self, options: PopulateOptions) -> Self {
        self.populate.push(options);
        self
    }

    /// Switches to plain-record results.
    pub fn lean(self) -> LeanQuery {
        LeanQuery { query: self }
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// Only persistence failures; population problems are logged instead.
    pub async fn exec(self) -> ModelResult<Vec<Document>> {
        let records = self.model.fetch(&self.conditions).await?;
        let matched = records.len();
        let records = self.arrange(records);

        let mut docs = records
            .into_iter()
            .map(|record| self.model.hydrate(record))
            .collect::<Vec<_>>();

        for options in &self.populate {
            populate_documents(&self.model, &mut docs, options).await;
        }

        debug!(
            model = %self.model.name(),
            matched,
            returned = docs.len(),
            populated = self.populate.len(),
            "executed query"
        );

        Ok(docs)
    }

    /// Runs the query and returns plain records with populated paths expanded.
    pub async fn exec_lean(self) -> ModelResult<Vec<Record>> {
        self.lean().exec().await
    }

    /// The first result, if any.
    pub async fn exec_one(self) -> ModelResult<Option<Document>> {
        Ok(self.limit(1).exec().await?.into_iter().next())
    }

    /// Number of matching records; sort, skip and limit are ignored.
    pub async fn count(self) -> ModelResult<u64> {
        Ok(self.model.fetch(&self.conditions).await?.len() as u64)
    }

    /// Sort, then skip, then limit, then projection.
    fn arrange(&self, mut records: Vec<Record>) -> Vec<Record> {
        sort_records(&mut records, &self.sort);

        records
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|record| match &self.projection {
                Some(projection) => projection.apply(record),
                None => record,
            })
            .collect()
    }
}

/// A query returning plain records.
#[derive(Debug, Clone)]
pub struct LeanQuery {
    query: Query,
}

impl LeanQuery {
    pub async fn exec(self) -> ModelResult<Vec<Record>> {
        Ok(self
            .query
            .exec()
            .await?
            .iter()
            .map(Document::to_object)
            .collect())
    }
}

/// Builds conditions for one path of a [`Query`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query: Query,
    path: String,
}

impl QueryBuilder {
    /// Requires exact equality.
    pub fn equals(mut self, value: impl Into<Bson>) -> Self {
        let value = value.into();

        match self.query.conditions.get_mut(&self.path) {
            Some(Bson::Document(operators)) if is_operator_record(operators) => {
                operators.insert("$eq", value);
            }
            _ => {
                self.query.conditions.insert(self.path.clone(), value);
            }
        }
        self
    }

    pub fn gt(self, value: impl Into<Bson>) -> Self {
        self.operator("$gt", value.into())
    }

    pub fn gte(self, value: impl Into<Bson>) -> Self {
        self.operator("$gte", value.into())
    }

    pub fn lt(self, value: impl Into<Bson>) -> Self {
        self.operator("$lt", value.into())
    }

    pub fn lte(self, value: impl Into<Bson>) -> Self {
        self.operator("$lte", value.into())
    }

    pub fn ne(self, value: impl Into<Bson>) -> Self {
        self.operator("$ne", value.into())
    }

    pub fn in_values<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.operator("$in", Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn nin<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.operator("$nin", Bson::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn exists(self, exists: bool) -> Self {
        self.operator("$exists", Bson::Boolean(exists))
    }

    /// Requires a string matching `pattern`, with optional flags (`i`, `m`, `s`, `x`).
    pub fn regex(self, pattern: &str, options: Option<&str>) -> Self {
        let builder = self.operator("$regex", Bson::String(pattern.to_string()));

        match options {
            Some(options) => builder.operator("$options", Bson::String(options.to_string())),
            None => builder,
        }
    }

    /// Moves on to another path.
    pub fn where_field(self, path: impl Into<String>) -> QueryBuilder {
        self.query.where_field(path)
    }

    /// Returns to the query.
    pub fn end(self) -> Query {
        self.query
    }

    pub async fn exec(self) -> ModelResult<Vec<Document>> {
        self.query.exec().await
    }

    fn operator(mut self, operator: &str, value: Bson) -> Self {
        let conditions = &mut self.query.conditions;

        let mut operators = match conditions.remove(&self.path) {
            Some(Bson::Document(existing)) if is_operator_record(&existing) => existing,
            Some(plain) => bson::doc! { "$eq": plain },
            None => Record::new(),
        };

        operators.insert(operator, value);
        conditions.insert(self.path.clone(), operators);
        self
    }
}

/// Resolves one population request across every result document, logging instead of
/// failing. The target collection is loaded once per request.
async fn populate_documents(model: &Model, docs: &mut [Document], options: &PopulateOptions) {
    if docs.is_empty() {
        return;
    }

    if let Err(error) = try_populate(model, docs, options).await {
        warn!(
            model = %model.name(),
            path = %options.path,
            %error,
            "leaving path unpopulated"
        );
    }
}

async fn try_populate(model: &Model, docs: &mut [Document], options: &PopulateOptions) -> ModelResult<()> {
    let schema = model.schema();

    if let Some(virtual_populate) = schema
        .get_virtual(&options.path)
        .and_then(|virtual_type| virtual_type.populate_options())
    {
        return populate_virtual(model, docs, options, virtual_populate).await;
    }

    let target_name = options
        .model
        .clone()
        .or_else(|| {
            schema
                .path(&options.path)
                .and_then(|field| field.reference_model().map(str::to_string))
        })
        .ok_or_else(|| ModelError::ReferenceResolution(format!("path `{}` declares no reference", options.path)))?;

    let target = resolve_model(model, &target_name)?;

    let ids = docs
        .iter()
        .filter_map(|doc| doc.get_raw(&options.path))
        .flat_map(|value| match value {
            Bson::Null => Vec::new(),
            Bson::Array(ids) => ids.clone(),
            id => vec![id.clone()],
        })
        .collect::<Vec<_>>();

    if ids.is_empty() {
        return Ok(());
    }

    let conditions = with_filter(field_condition("_id", Bson::Array(ids)), options);
    let found = target.fetch(&conditions).await?;
    let lookup = |id: &Bson| {
        found
            .iter()
            .find(|record| record.get("_id").is_some_and(|stored| values_equal(stored, id)))
            .map(|record| target.hydrate(project(record.clone(), options)))
    };

    for doc in docs.iter_mut() {
        match doc.get_raw(&options.path).cloned() {
            None | Some(Bson::Null) => {}
            Some(Bson::Array(ids)) => {
                // Keep the order of the stored references.
                let resolved = ids.iter().filter_map(lookup).collect::<Vec<_>>();

                if resolved.len() < ids.len() {
                    warn!(
                        model = %target_name,
                        path = %options.path,
                        missing = ids.len() - resolved.len(),
                        "some references did not resolve"
                    );
                }

                doc.set_populated(&options.path, Populated::Many(resolved));
            }
            Some(id) => match lookup(&id) {
                Some(resolved) => doc.set_populated(&options.path, Populated::One(Some(Box::new(resolved)))),
                None => warn!(
                    model = %target_name,
                    path = %options.path,
                    %id,
                    "reference did not resolve"
                ),
            },
        }
    }

    Ok(())
}

async fn populate_virtual(
    model: &Model,
    docs: &mut [Document],
    options: &PopulateOptions,
    virtual_populate: VirtualPopulate,
) -> ModelResult<()> {
    let target_name = options
        .model
        .clone()
        .unwrap_or_else(|| virtual_populate.model.clone());
    let target = resolve_model(model, &target_name)?;

    let locals = docs
        .iter()
        .map(|doc| match doc.get_raw(&virtual_populate.local_field) {
            None | Some(Bson::Null) => None,
            Some(local) => Some(local.clone()),
        })
        .collect::<Vec<_>>();

    let wanted = locals
        .iter()
        .flatten()
        .flat_map(|local| match local {
            Bson::Array(values) => values.clone(),
            value => vec![value.clone()],
        })
        .collect::<Vec<_>>();

    let found = if wanted.is_empty() {
        Vec::new()
    } else {
        let mut conditions = field_condition(&virtual_populate.foreign_field, Bson::Array(wanted));
        if let Some(filter) = &virtual_populate.filter {
            conditions.extend(filter.clone());
        }
        target.fetch(&with_filter(conditions, options)).await?
    };

    for (doc, local) in docs.iter_mut().zip(locals) {
        let matching = match local {
            Some(local) => {
                let conditions = field_condition(&virtual_populate.foreign_field, local);
                found
                    .iter()
                    .filter(|record| RecordEvaluator::matches(record, &conditions))
                    .cloned()
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };

        let populated = match (virtual_populate.count, virtual_populate.just_one) {
            (true, _) => Populated::Count(matching.len() as u64),
            (false, true) => Populated::One(
                matching
                    .into_iter()
                    .next()
                    .map(|record| Box::new(target.hydrate(project(record, options)))),
            ),
            (false, false) => Populated::Many(
                matching
                    .into_iter()
                    .map(|record| target.hydrate(project(record, options)))
                    .collect(),
            ),
        };

        doc.set_populated(&options.path, populated);
    }

    Ok(())
}

fn resolve_model(model: &Model, name: &str) -> ModelResult<Model> {
    model
        .sibling(name)
        .ok_or_else(|| ModelError::ReferenceResolution(format!("no model registered as `{name}`")))
}

/// `{ path: value }`, or `{ path: { $in: values } }` for arrays.
fn field_condition(path: &str, value: Bson) -> Record {
    let mut conditions = Record::new();

    match value {
        Bson::Array(values) => conditions.insert(path, bson::doc! { "$in": values }),
        value => conditions.insert(path, value),
    };

    conditions
}

fn with_filter(mut conditions: Record, options: &PopulateOptions) -> Record {
    if let Some(filter) = &options.filter {
        conditions.extend(filter.clone());
    }
    conditions
}

fn project(record: Record, options: &PopulateOptions) -> Record {
    match &options.select {
        Some(projection) => projection.apply(record),
        None => record,
    }
}
