//! Collection-level operations for one schema.
//!
//! A [`Model`] binds a [`Schema`] to a collection name on a connection. Writes are
//! read-whole-collection, mutate, write-whole-collection cycles; reads load the collection
//! and filter it in memory with the shared predicate. Models are cheap to clone.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//!
//! let users = connection.model("User", schema);
//!
//! let alice = users.create(doc! { "name": "Alice", "age": 30 }).await?;
//! let adults = users.find(doc! { "age": { "$gte": 18 } }).sort("-age").exec().await?;
//! users.update_one(doc! { "name": "Alice" }, doc! { "$inc": { "age": 1 } }).await?;
//! let removed = users.delete_many(doc! { "age": { "$lt": 18 } }).await?;
//! ```

use bson::{Bson, DateTime, doc, ser::serialize_to_document};
use futures::future::join_all;
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Weak},
};
use tracing::{debug, warn};

use crate::{
    aggregate::Aggregate,
    connection::{ConnectionShared, ModelRegistry},
    document::Document,
    error::{ModelError, ModelResult},
    evaluator::{RecordEvaluator, remove_path, resolve_path, set_path, values_equal},
    filter::is_operator_record,
    query::Query,
    schema::{HookAction, Schema},
    Record,
};

/// Outcome of an update or document save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_id: Option<Bson>,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Insert a record built from the equality conditions and the update when nothing matches.
    pub upsert: bool,
}

struct ModelInner {
    name: String,
    collection: String,
    schema: Arc<Schema>,
    shared: Arc<ConnectionShared>,
    registry: Weak<ModelRegistry>,
}

/// A schema bound to a collection.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    pub(crate) fn new(
        name: String,
        collection: String,
        schema: Arc<Schema>,
        shared: Arc<ConnectionShared>,
        registry: Weak<ModelRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                name,
                collection,
                schema,
                shared,
                registry,
            }),
        }
    }

    /// The name the model is registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn collection_name(&self) -> &str {
        &self.inner.collection
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Looks up another model registered on the same connection.
    pub fn sibling(&self, name: &str) -> Option<Model> {
        self.inner
            .registry
            .upgrade()?
            .read()
            .get(name)
            .cloned()
    }

    /// The shared predicate: does `record` satisfy `conditions`?
    ///
    /// Condition keys are field paths (dotted allowed) or `$and`, `$or`, `$nor`, all ANDed.
    /// A criterion is a plain value (exact equality, numbers compared numerically) or an
    /// operator record using `$eq $ne $gt $gte $lt $lte $in $nin $regex $options $exists $not`.
    /// Unknown operators never match.
    pub fn match_query(record: &Record, conditions: &Record) -> bool {
        RecordEvaluator::matches(record, conditions)
    }

    /// Wraps a record as a document of this model without persisting it.
    pub fn hydrate(&self, record: Record) -> Document {
        Document::new(record, self.clone(), false)
    }

    /// Validates and stores one record.
    ///
    /// Defaults are applied and declared paths cast first. Validate hooks run around schema
    /// validation and save hooks around the write; the record then gets a fresh `_id` and,
    /// with timestamps on, `createdAt`/`updatedAt`.
    ///
    /// # Errors
    ///
    /// - [`ModelError::Validation`] listing one message per failing field; nothing is stored.
    /// - Whatever a hook returns; the first failing hook aborts the create.
    /// - [`ModelError::Persistence`] from the backend.
    pub async fn create(&self, record: Record) -> ModelResult<Document> {
        let schema = self.schema();
        let mut record = record;

        schema.apply_defaults(&mut record);
        schema.cast_record(&mut record);

        schema.run_pre(HookAction::Validate, &mut record)?;

        let errors = schema.validate(&record).await;
        if !errors.is_empty() {
            return Err(ModelError::Validation(errors));
        }

        schema.run_post(HookAction::Validate, &record)?;
        schema.run_pre(HookAction::Save, &mut record)?;

        let record = self.stamp_new(record);
        let stored = record.clone();

        self.write_cycle(move |records| {
            records.push(stored);
            Ok(((), true))
        })
        .await?;

        debug!(model = %self.name(), id = ?record.get("_id"), "created record");

        schema.run_post(HookAction::Save, &record)?;
        Ok(Document::new(record, self.clone(), true))
    }

    /// Creates every record concurrently, each in its own write cycle.
    ///
    /// Returns the first error if any create failed; the others are still stored.
    pub async fn create_many(&self, records: Vec<Record>) -> ModelResult<Vec<Document>> {
        join_all(records.into_iter().map(|record| self.create(record)))
            .await
            .into_iter()
            .collect()
    }

    /// Serializes a value into a record and creates it.
    pub async fn create_from<T: Serialize>(&self, value: &T) -> ModelResult<Document> {
        self.create(serialize_to_document(value)?).await
    }

    pub fn find(&self, conditions: Record) -> Query {
        Query::new(self.clone(), conditions)
    }

    /// The first match in stored order.
    pub async fn find_one(&self, conditions: Record) -> ModelResult<Option<Document>> {
        self.find(conditions).exec_one().await
    }

    pub async fn find_by_id(&self, id: &str) -> ModelResult<Option<Document>> {
        self.find_one(doc! { "_id": id }).await
    }

    pub async fn count_documents(&self, conditions: Record) -> ModelResult<u64> {
        Ok(self.fetch(&conditions).await?.len() as u64)
    }

    /// Distinct values of `field` among matching records. Array values contribute their
    /// elements; records without the field contribute nothing.
    pub async fn distinct(&self, field: &str, conditions: Record) -> ModelResult<Vec<Bson>> {
        let mut values: Vec<Bson> = Vec::new();

        for record in self.fetch(&conditions).await? {
            let candidates = match resolve_path(&record, field) {
                Some(Bson::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };

            for candidate in candidates {
                if !values.iter().any(|seen| values_equal(seen, &candidate)) {
                    values.push(candidate);
                }
            }
        }

        Ok(values)
    }

    /// Updates the first matching record.
    ///
    /// An update without `$` keys is shallow-merged into the record. Otherwise `$set`,
    /// `$unset`, `$inc` and `$push` are applied and other operators are ignored. `_id` is
    /// never changed; `updatedAt` is refreshed when the record changed.
    pub async fn update_one(&self, conditions: Record, update: Record) -> ModelResult<UpdateResult> {
        self.update_one_with(conditions, update, UpdateOptions::default()).await
    }

    pub async fn update_one_with(
        &self,
        conditions: Record,
        update: Record,
        options: UpdateOptions,
    ) -> ModelResult<UpdateResult> {
        self.update(conditions, update, options, HookAction::UpdateOne).await
    }

    /// Updates every matching record.
    pub async fn update_many(&self, conditions: Record, update: Record) -> ModelResult<UpdateResult> {
        self.update(conditions, update, UpdateOptions::default(), HookAction::UpdateMany).await
    }

    async fn update(
        &self,
        conditions: Record,
        update: Record,
        options: UpdateOptions,
        action: HookAction,
    ) -> ModelResult<UpdateResult> {
        let schema = self.schema();
        let mut update = update;

        schema.run_pre(action, &mut update)?;

        // Built ahead of the cycle; a seed error only matters when nothing matches.
        let upsert_seed = if options.upsert {
            Some(self.upsert_seed(&conditions, &update).await)
        } else {
            None
        };

        let result = self
            .write_cycle(|records| {
                let mut result = UpdateResult::default();

                for record in records.iter_mut() {
                    if !Self::match_query(record, &conditions) {
                        continue;
                    }

                    result.matched_count += 1;
                    if self.apply_update(record, &update)? {
                        result.modified_count += 1;
                    }

                    if action == HookAction::UpdateOne {
                        break;
                    }
                }

                if result.matched_count == 0 && let Some(seed) = upsert_seed {
                    let seed = seed?;
                    result.upserted_count = 1;
                    result.upserted_id = seed.get("_id").cloned();
                    records.push(seed);
                }

                let changed = result.modified_count > 0 || result.upserted_count > 0;
                Ok((result, changed))
            })
            .await?;

        debug!(
            model = %self.name(),
            matched = result.matched_count,
            modified = result.modified_count,
            upserted = result.upserted_count,
            "updated records"
        );

        schema.run_post(action, &update)?;
        Ok(result)
    }

    /// Builds the record an upsert inserts: equality conditions, then the update, then
    /// defaults and validation like a create.
    async fn upsert_seed(&self, conditions: &Record, update: &Record) -> ModelResult<Record> {
        let schema = self.schema();

        let mut seed = conditions
            .iter()
            .filter(|(key, value)| {
                !key.starts_with('$') && !matches!(value, Bson::Document(criterion) if is_operator_record(criterion))
            })
            .fold(Record::new(), |mut seed, (key, value)| {
                set_path(&mut seed, key, value.clone());
                seed
            });

        seed.remove("_id");
        schema.cast_record(&mut seed);
        self.apply_update(&mut seed, update)?;

        // Update values are cast already; only the filled defaults still need it.
        for path in schema.apply_defaults(&mut seed) {
            if let Some(value) = resolve_path(&seed, &path).cloned()
                && let Ok(cast) = schema.cast_path(&path, value)
            {
                set_path(&mut seed, &path, cast);
            }
        }

        let errors = schema.validate(&seed).await;
        if !errors.is_empty() {
            return Err(ModelError::Validation(errors));
        }

        Ok(self.stamp_new(seed))
    }

    /// Applies an update document to one record. Returns whether the record changed.
    fn apply_update(&self, record: &mut Record, update: &Record) -> ModelResult<bool> {
        let schema = self.schema();
        let before = record.clone();
        let cast = |path: &str, value: &Bson| {
            schema
                .cast_path(path, value.clone())
                .map_err(|error| ModelError::Validation(vec![error.to_string()]))
        };

        for (key, argument) in update {
            if key == "_id" {
                continue;
            }

            if !key.starts_with('$') {
                record.insert(key.as_str(), cast(key, argument)?);
                continue;
            }

            let Bson::Document(fields) = argument else {
                warn!(operator = %key, "ignoring update operator without a field record");
                continue;
            };

            for (path, value) in fields {
                if path == "_id" {
                    continue;
                }

                match key.as_str() {
                    "$set" => set_path(record, path, cast(path, value)?),
                    "$unset" => {
                        remove_path(record, path);
                    }
                    "$inc" => {
                        let current = resolve_path(record, path).cloned().unwrap_or(Bson::Int32(0));
                        let sum = add_numbers(&current, value)
                            .ok_or_else(|| ModelError::Validation(vec![format!("Cannot apply $inc to {path}")]))?;
                        set_path(record, path, sum);
                    }
                    "$push" => {
                        let mut items = match resolve_path(record, path) {
                            None | Some(Bson::Null) => Vec::new(),
                            Some(Bson::Array(items)) => items.clone(),
                            Some(_) => {
                                return Err(ModelError::Validation(vec![format!("Cannot apply $push to non-array field {path}")]));
                            }
                        };
                        items.push(value.clone());
                        set_path(record, path, Bson::Array(items));
                    }
                    unknown => {
                        warn!(operator = %unknown, "ignoring unsupported update operator");
                        break;
                    }
                }
            }
        }

        let changed = *record != before;
        if changed && schema.options().timestamps {
            record.insert("updatedAt", DateTime::now());
        }

        Ok(changed)
    }

    /// Deletes the first matching record.
    pub async fn delete_one(&self, conditions: Record) -> ModelResult<DeleteResult> {
        self.delete(conditions, HookAction::DeleteOne).await
    }

    /// Deletes every matching record.
    pub async fn delete_many(&self, conditions: Record) -> ModelResult<DeleteResult> {
        self.delete(conditions, HookAction::DeleteMany).await
    }

    async fn delete(&self, conditions: Record, action: HookAction) -> ModelResult<DeleteResult> {
        let schema = self.schema();
        let mut conditions = conditions;

        schema.run_pre(action, &mut conditions)?;

        let deleted_count = self
            .write_cycle(|records| {
                let before = records.len();
                let mut deleted_one = false;

                records.retain(|record| {
                    let remove = !(action == HookAction::DeleteOne && deleted_one)
                        && Self::match_query(record, &conditions);
                    deleted_one |= remove;
                    !remove
                });

                let deleted = (before - records.len()) as u64;
                Ok((deleted, deleted > 0))
            })
            .await?;

        debug!(model = %self.name(), deleted = deleted_count, "deleted records");

        schema.run_post(action, &conditions)?;
        Ok(DeleteResult { deleted_count })
    }

    pub fn aggregate(&self, pipeline: Vec<Record>) -> Aggregate {
        Aggregate::new(self.clone(), pipeline)
    }

    /// Invokes a schema static with this model.
    pub async fn call_static(&self, name: &str, args: Vec<Bson>) -> ModelResult<Bson> {
        let function = self
            .schema()
            .get_static(name)
            .ok_or_else(|| ModelError::InvalidDocument(format!("no static named `{name}`")))?;

        function(self.clone(), args).await
    }

    /// Sessions are not supported; always fails.
    pub fn start_session(&self) -> ModelResult<()> {
        Err(ModelError::unsupported("sessions and transactions"))
    }

    /// Change streams are not supported; always fails.
    pub fn watch(&self) -> ModelResult<()> {
        Err(ModelError::unsupported("change streams"))
    }

    /// Loads the collection and keeps the records matching `conditions`, in stored order.
    pub(crate) async fn fetch(&self, conditions: &Record) -> ModelResult<Vec<Record>> {
        let records = self.load().await?;
        Ok(RecordEvaluator::filter_records(records, conditions))
    }

    pub(crate) async fn load(&self) -> ModelResult<Vec<Record>> {
        self.inner.shared.ensure_open()?;
        self.inner
            .shared
            .backend
            .load(self.collection_name())
            .await
    }

    /// Merges a document snapshot into the stored record with the same `_id`, or inserts it.
    /// Returns the result and the record as stored.
    ///
    /// Fields missing from the snapshot are kept, so saving a projected document does not
    /// drop what it never loaded. `modified` paths are written exactly: present ones replace
    /// the stored value, absent ones are removed.
    pub(crate) async fn save_record(&self, record: Record, modified: &[String]) -> ModelResult<(UpdateResult, Record)> {
        let timestamps = self.schema().options().timestamps;
        let record = match record.get("_id") {
            Some(_) => record,
            None => self.stamp_new(record),
        };
        let id = record.get("_id").cloned();

        self.write_cycle(move |records| {
            let mut result = UpdateResult::default();

            let saved = match records.iter_mut().find(|stored| stored.get("_id") == id.as_ref()) {
                Some(stored) => {
                    result.matched_count = 1;

                    let mut merged = stored.clone();
                    merge_snapshot(&mut merged, &record, modified);

                    if merged != *stored {
                        if timestamps {
                            merged.insert("updatedAt", DateTime::now());
                        }
                        *stored = merged.clone();
                        result.modified_count = 1;
                    }

                    merged
                }
                None => {
                    result.upserted_count = 1;
                    result.upserted_id = id;
                    records.push(record.clone());
                    record
                }
            };

            let changed = result.modified_count > 0 || result.upserted_count > 0;
            Ok(((result, saved), changed))
        })
        .await
    }

    /// Gives a record a fresh `_id` in first position and, with timestamps on, creation and
    /// update times.
    fn stamp_new(&self, record: Record) -> Record {
        let mut stamped = doc! { "_id": self.inner.shared.id_generator.new_id() };

        stamped.extend(record.into_iter().filter(|(key, _)| key != "_id"));

        if self.schema().options().timestamps {
            let now = DateTime::now();
            stamped.insert("createdAt", now);
            stamped.insert("updatedAt", now);
        }

        stamped
    }

    /// Runs one read-modify-write cycle over the collection. `mutate` returns its result and
    /// whether the collection must be written back. With write serialization on, the cycle
    /// holds the collection's lock throughout.
    async fn write_cycle<T, F>(&self, mutate: F) -> ModelResult<T>
    where
        F: FnOnce(&mut Vec<Record>) -> ModelResult<(T, bool)>,
    {
        let shared = &self.inner.shared;
        let collection = self.collection_name();
        let lock = shared.collection_lock(collection);
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut records = self.load().await?;
        let (result, changed) = mutate(&mut records)?;

        if changed {
            debug!(%collection, records = records.len(), "storing collection");
            shared.backend.store(collection, records).await?;
        }

        Ok(result)
    }
}

/// Merges `snapshot` into `stored`, descending into records present on both sides, then
/// writes each `modified` path exactly as the snapshot has it.
pub(crate) fn merge_snapshot(stored: &mut Record, snapshot: &Record, modified: &[String]) {
    deep_merge(stored, snapshot);

    for path in modified {
        match resolve_path(snapshot, path) {
            Some(value) => set_path(stored, path, value.clone()),
            None => {
                remove_path(stored, path);
            }
        }
    }
}

fn deep_merge(target: &mut Record, source: &Record) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Bson::Document(existing)), Bson::Document(incoming)) => deep_merge(existing, incoming),
            _ => {
                target.insert(key.as_str(), value.clone());
            }
        }
    }
}

/// Adds two numbers, keeping integers when both sides are integers and the sum fits in an
/// `i64`. Overflowing integer sums become doubles.
pub(crate) fn add_numbers(left: &Bson, right: &Bson) -> Option<Bson> {
    let int = |value: &Bson| match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    };

    if let (Some(a), Some(b)) = (int(left), int(right))
        && let Some(sum) = a.checked_add(b)
    {
        let both_small = matches!((left, right), (Bson::Int32(_), Bson::Int32(_)));

        return Some(match i32::try_from(sum) {
            Ok(small) if both_small => Bson::Int32(small),
            _ => Bson::Int64(sum),
        });
    }

    let float = |value: &Bson| match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    };

    Some(Bson::Double(float(left)? + float(right)?))
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("collection", &self.inner.collection)
            .field("schema", &self.inner.schema)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema_type::SchemaType, testing};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn people() -> Model {
        let schema = Schema::new()
            .add("name", SchemaType::string().required())
            .add("age", SchemaType::number().default_value(0))
            .add("tags", SchemaType::array())
            .add("born", SchemaType::date());

        testing::model("Person", schema)
    }

    #[tokio::test]
    async fn create_applies_defaults_ids_and_timestamps() {
        let people = people();
        let doc = people.create(doc! { "name": "a", "born": "2000-01-01" }).await.unwrap();
        let record = doc.record();

        assert!(doc.is_new());
        assert_eq!(record.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(record.get("age"), Some(&Bson::Int32(0)));
        assert!(matches!(record.get("born"), Some(Bson::DateTime(_))));
        assert!(matches!(record.get("createdAt"), Some(Bson::DateTime(_))));
        assert_eq!(record.get("createdAt"), record.get("updatedAt"));

        let found = people.find_by_id(doc.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(found.to_object(), doc.to_object());
        assert!(!found.is_new());
    }

    #[tokio::test]
    async fn create_rejects_invalid_records() {
        let people = people();
        let err = people.create(doc! { "age": "x" }).await.unwrap_err();

        assert_eq!(
            err.validation_errors().map(<[String]>::to_vec),
            Some(vec![
                "name is required".to_string(),
                "Cast to Number failed for value \"x\" at path \"age\"".to_string(),
            ])
        );
        assert_eq!(people.count_documents(doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_ignores_caller_ids() {
        let people = people();
        let doc = people.create(doc! { "_id": "mine", "name": "a" }).await.unwrap();

        assert_ne!(doc.id(), Some("mine"));
    }

    #[tokio::test]
    async fn update_without_operators_shallow_merges() {
        let people = people();
        people.create(doc! { "name": "a", "tags": ["x"] }).await.unwrap();

        let result = people
            .update_one(doc! { "name": "a" }, doc! { "age": 5, "nickname": "al", "_id": "nope" })
            .await
            .unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 1, ..Default::default() });

        let stored = people.find_one(doc! { "name": "a" }).await.unwrap().unwrap();
        assert_eq!(stored.get_raw("age"), Some(&Bson::Int32(5)));
        assert_eq!(stored.get_raw("nickname"), Some(&Bson::from("al")));
        assert_ne!(stored.id(), Some("nope"));

        // A literal `$set` key is an operator, not a field to merge.
        people
            .update_one(doc! { "name": "a" }, doc! { "$set": { "age": 6 }, "$rename": { "age": "years" } })
            .await
            .unwrap();
        let stored = people.find_one(doc! { "name": "a" }).await.unwrap().unwrap();
        assert_eq!(stored.get_raw("age"), Some(&Bson::Int32(6)));
        assert!(stored.get_raw("$set").is_none());
        assert!(stored.get_raw("years").is_none());
    }

    #[tokio::test]
    async fn update_operators() {
        let people = people();
        people.create(doc! { "name": "a", "age": 1, "tags": ["x"] }).await.unwrap();

        people
            .update_one(
                doc! { "name": "a" },
                doc! { "$inc": { "age": 2 }, "$push": { "tags": "y" }, "$unset": { "born": "" }, "$set": { "meta.by": "test" } },
            )
            .await
            .unwrap();

        let stored = people.find_one(doc! {}).await.unwrap().unwrap();
        assert_eq!(stored.get_raw("age"), Some(&Bson::Int32(3)));
        assert_eq!(stored.get_raw("tags"), Some(&Bson::Array(vec!["x".into(), "y".into()])));
        assert_eq!(stored.get_raw("meta.by"), Some(&Bson::from("test")));

        let err = people
            .update_one(doc! { "name": "a" }, doc! { "$set": { "age": "old" } })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Validation(_)));
    }

    #[tokio::test]
    async fn update_counts_and_upserts() {
        let people = people();
        people.create_many(vec![doc! { "name": "a" }, doc! { "name": "b" }]).await.unwrap();

        let none = people.update_one(doc! { "name": "zzz" }, doc! { "age": 1 }).await.unwrap();
        assert_eq!(none, UpdateResult::default());

        let many = people.update_many(doc! {}, doc! { "$set": { "age": 9 } }).await.unwrap();
        assert_eq!((many.matched_count, many.modified_count), (2, 2));

        let unchanged = people.update_many(doc! {}, doc! { "$set": { "age": 9 } }).await.unwrap();
        assert_eq!((unchanged.matched_count, unchanged.modified_count), (2, 0));

        let upserted = people
            .update_one_with(doc! { "name": "c" }, doc! { "$set": { "age": 3 } }, UpdateOptions { upsert: true })
            .await
            .unwrap();
        assert_eq!(upserted.upserted_count, 1);

        let id = upserted.upserted_id.unwrap();
        let created = people.find_one(doc! { "_id": id }).await.unwrap().unwrap();
        assert_eq!(created.get_raw("name"), Some(&Bson::from("c")));
        assert_eq!(created.get_raw("age"), Some(&Bson::Int32(3)));
    }

    #[tokio::test]
    async fn deletes_report_counts() {
        let people = people();
        people
            .create_many(vec![doc! { "name": "a" }, doc! { "name": "a" }, doc! { "name": "b" }])
            .await
            .unwrap();

        assert_eq!(people.delete_one(doc! { "name": "a" }).await.unwrap().deleted_count, 1);
        assert_eq!(people.delete_many(doc! { "name": { "$in": ["a", "b"] } }).await.unwrap().deleted_count, 2);
        assert_eq!(people.delete_many(doc! {}).await.unwrap().deleted_count, 0);
    }

    #[tokio::test]
    async fn distinct_flattens_arrays() {
        let people = people();
        people
            .create_many(vec![
                doc! { "name": "a", "tags": ["x", "y"] },
                doc! { "name": "b", "tags": ["y", "z"] },
                doc! { "name": "c" },
            ])
            .await
            .unwrap();

        let mut tags = people.distinct("tags", doc! {}).await.unwrap();
        tags.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        assert_eq!(tags, vec![Bson::from("x"), Bson::from("y"), Bson::from("z")]);
    }

    #[tokio::test]
    async fn hooks_wrap_writes() {
        let people = people();
        let saved = Arc::new(AtomicUsize::new(0));
        let counter = saved.clone();

        people.schema().pre(HookAction::Save, |record| {
            record.insert("slug", record.get_str("name").unwrap_or_default().to_uppercase());
            Ok(())
        });
        people.schema().post(HookAction::Save, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        people.schema().pre(HookAction::DeleteMany, |conditions| {
            conditions.insert("protected", doc! { "$ne": true });
            Ok(())
        });

        let doc = people.create(doc! { "name": "a" }).await.unwrap();
        people.create(doc! { "name": "b", "protected": true }).await.unwrap();
        assert_eq!(doc.get_raw("slug"), Some(&Bson::from("A")));
        assert_eq!(saved.load(Ordering::SeqCst), 2);

        assert_eq!(people.delete_many(doc! {}).await.unwrap().deleted_count, 1);
    }

    #[tokio::test]
    async fn failing_pre_save_hook_aborts_create() {
        let people = people();
        people
            .schema()
            .pre(HookAction::Save, |_| Err(ModelError::InvalidDocument("blocked".into())));

        assert!(people.create(doc! { "name": "a" }).await.is_err());
        assert_eq!(people.count_documents(doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn statics_receive_the_model() {
        let people = people();
        people.schema().static_fn("countAll", |model: Model, _| async move {
            Ok(Bson::Int64(model.count_documents(doc! {}).await? as i64))
        });
        people.create(doc! { "name": "a" }).await.unwrap();

        assert_eq!(people.call_static("countAll", vec![]).await.unwrap(), Bson::Int64(1));
        assert!(people.call_static("missing", vec![]).await.is_err());
    }

    #[test]
    fn sessions_and_watch_are_unsupported() {
        let people = people();

        assert!(matches!(people.start_session(), Err(ModelError::UnsupportedOperation(_))));
        assert!(matches!(people.watch(), Err(ModelError::UnsupportedOperation(_))));
    }

    #[test]
    fn adds_numbers_preserving_integers() {
        assert_eq!(add_numbers(&Bson::Int32(1), &Bson::Int32(2)), Some(Bson::Int32(3)));
        assert_eq!(add_numbers(&Bson::Int32(i32::MAX), &Bson::Int32(1)), Some(Bson::Int64(i32::MAX as i64 + 1)));
        assert_eq!(add_numbers(&Bson::Int64(1), &Bson::Double(0.5)), Some(Bson::Double(1.5)));
        assert_eq!(add_numbers(&Bson::from("a"), &Bson::Int32(1)), None);
        assert_eq!(
            add_numbers(&Bson::Int64(i64::MAX), &Bson::Int32(1)),
            Some(Bson::Double(i64::MAX as f64 + 1.0))
        );
    }

    #[tokio::test]
    async fn setters_run_once_before_validation() {
        let doubled = SchemaType::number()
            .set(|value| match value {
                Bson::Int32(n) => Bson::Int32(n * 2),
                other => other,
            })
            .max(10.0);
        let counters = testing::model("Counter", Schema::new().add("n", doubled));

        let mut created = counters.create(doc! { "n": 4 }).await.unwrap();
        assert_eq!(created.get_raw("n"), Some(&Bson::Int32(8)));
        assert!(matches!(counters.create(doc! { "n": 6 }).await, Err(ModelError::Validation(_))));

        created.set("n", 5).unwrap();
        assert_eq!(created.get_raw("n"), Some(&Bson::Int32(10)));
        created.save().await.unwrap();

        let id = created.id().unwrap().to_string();
        let stored = counters.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.get_raw("n"), Some(&Bson::Int32(10)));
    }

    #[test]
    fn merging_a_snapshot_keeps_unloaded_fields() {
        let mut stored = doc! { "_id": "a", "name": "x", "age": 5, "address": { "city": "Oslo", "zip": "0150" } };
        let snapshot = doc! { "_id": "a", "name": "y", "address": { "city": "Rome" } };

        merge_snapshot(&mut stored, &snapshot, &["name".to_string(), "age".to_string()]);

        assert_eq!(
            stored,
            doc! { "_id": "a", "name": "y", "address": { "city": "Rome", "zip": "0150" } }
        );
    }
}

