//! In-memory aggregation pipelines.
//!
//! An [`Aggregate`] is an ordered list of single-key stage records run against the whole
//! collection of its model. Stages run strictly in order; each turns the current record
//! sequence into the next one.
//!
//! | stage      | argument                                                        |
//! |------------|-----------------------------------------------------------------|
//! | `$match`   | condition record, same predicate as queries                     |
//! | `$group`   | `{ _id: null \| "$path" \| { .. }, field: { $acc: expr }, .. }` |
//! | `$sort`    | `{ path: 1 \| -1 }`                                             |
//! | `$skip`    | number                                                          |
//! | `$limit`   | number                                                          |
//! | `$unwind`  | `"$path"` or `{ path: "$path" }`                                |
//! | `$project` | `{ path: 1 \| 0, alias: "$path" }`                              |
//! | `$count`   | output field name                                               |
//!
//! Accumulators are `$sum $avg $min $max $push $first $last $addToSet`. Unknown stages and
//! accumulators are skipped with a warning.
//!
//! ```ignore
//! let by_city = users
//!     .aggregate(vec![])
//!     .matching(doc! { "active": true })
//!     .group(doc! { "_id": "$city", "count": { "$sum": 1 }, "age": { "$avg": "$age" } })
//!     .sort("-count")
//!     .exec()
//!     .await?;
//! ```

use bson::Bson;
use tracing::{debug, warn};

use crate::{
    error::ModelResult,
    evaluator::{RecordEvaluator, compare_values, resolve_path, set_path, values_equal},
    model::{Model, add_numbers},
    query::{Projection, SortDirection, SortSpec, parse_sort, sort_records},
    Record,
};

/// A pipeline bound to one model.
#[derive(Debug, Clone)]
pub struct Aggregate {
    model: Model,
    pipeline: Vec<Record>,
}

impl Aggregate {
    pub fn new(model: Model, pipeline: Vec<Record>) -> Self {
        Self { model, pipeline }
    }

    pub fn pipeline(&self) -> &[Record] {
        &self.pipeline
    }

    /// Appends a raw stage record.
    pub fn append(mut self, stage: Record) -> Self {
        self.pipeline.push(stage);
        self
    }

    pub fn matching(self, conditions: Record) -> Self {
        self.stage("$match", conditions)
    }

    pub fn group(self, spec: Record) -> Self {
        self.stage("$group", spec)
    }

    /// Adds a `$sort` stage from `"name -age"`.
    pub fn sort(self, spec: &str) -> Self {
        let keys = parse_sort(spec)
            .into_iter()
            .map(|(path, direction)| {
                let flag = match direction {
                    SortDirection::Asc => 1,
                    SortDirection::Desc => -1,
                };
                (path, Bson::Int32(flag))
            })
            .collect::<Record>();

        self.stage("$sort", keys)
    }

    pub fn skip(self, skip: u32) -> Self {
        self.stage("$skip", Bson::Int64(i64::from(skip)))
    }

    pub fn limit(self, limit: u32) -> Self {
        self.stage("$limit", Bson::Int64(i64::from(limit)))
    }

    /// Adds an `$unwind` stage; the leading `$` is optional.
    pub fn unwind(self, path: &str) -> Self {
        let path = if path.starts_with('$') {
            path.to_string()
        } else {
            format!("${path}")
        };

        self.stage("$unwind", path)
    }

    pub fn project(self, spec: Record) -> Self {
        self.stage("$project", spec)
    }

    /// Adds a `$count` stage writing the number of records to `field`.
    pub fn count(self, field: &str) -> Self {
        self.stage("$count", field)
    }

    /// Loads the collection and runs the pipeline over it.
    pub async fn exec(self) -> ModelResult<Vec<Record>> {
        let records = self.model.load().await?;
        let loaded = records.len();
        let output = run_pipeline(records, &self.pipeline);

        debug!(
            model = %self.model.name(),
            stages = self.pipeline.len(),
            loaded,
            returned = output.len(),
            "executed aggregate"
        );

        Ok(output)
    }

    fn stage(self, name: &str, argument: impl Into<Bson>) -> Self {
        let mut stage = Record::new();
        stage.insert(name, argument.into());
        self.append(stage)
    }
}

/// Runs `stages` over `records` in order.
pub fn run_pipeline(records: Vec<Record>, stages: &[Record]) -> Vec<Record> {
    stages.iter().fold(records, |records, stage| {
        let mut entries = stage.iter();

        let Some((name, argument)) = entries.next() else {
            warn!("skipping empty pipeline stage");
            return records;
        };

        if entries.next().is_some() {
            warn!(stage = %name, "pipeline stage has more than one key; using the first");
        }

        run_stage(records, name, argument)
    })
}

fn run_stage(records: Vec<Record>, name: &str, argument: &Bson) -> Vec<Record> {
    match (name, argument) {
        ("$match", Bson::Document(conditions)) => RecordEvaluator::filter_records(records, conditions),
        ("$group", Bson::Document(spec)) => group(records, spec),
        ("$sort", Bson::Document(spec)) => {
            let mut records = records;
            sort_records(&mut records, &sort_spec(spec));
            records
        }
        ("$skip", count) => match as_count(count) {
            Some(count) => records.into_iter().skip(count).collect(),
            None => invalid(records, name, argument),
        },
        ("$limit", count) => match as_count(count) {
            Some(count) => records.into_iter().take(count).collect(),
            None => invalid(records, name, argument),
        },
        ("$unwind", argument) => match unwind_path(argument) {
            Some(path) => unwind(records, path),
            None => invalid(records, name, argument),
        },
        ("$project", Bson::Document(spec)) => records
            .into_iter()
            .map(|record| project(record, spec))
            .collect(),
        ("$count", Bson::String(field)) => {
            let mut counted = Record::new();
            counted.insert(field.as_str(), Bson::Int64(records.len() as i64));
            vec![counted]
        }
        ("$match" | "$group" | "$sort" | "$project" | "$count", _) => invalid(records, name, argument),
        (unknown, _) => {
            warn!(stage = %unknown, "skipping unsupported pipeline stage");
            records
        }
    }
}

fn invalid(records: Vec<Record>, name: &str, argument: &Bson) -> Vec<Record> {
    warn!(stage = %name, %argument, "skipping pipeline stage with an invalid argument");
    records
}

fn sort_spec(spec: &Record) -> SortSpec {
    spec.iter()
        .filter_map(|(path, value)| {
            SortDirection::from_bson(value).map(|direction| (path.clone(), direction))
        })
        .collect()
}

fn as_count(value: &Bson) -> Option<usize> {
    let count = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(n) if n.fract() == 0.0 => *n as i64,
        _ => return None,
    };

    Some(usize::try_from(count).unwrap_or(0))
}

/// Evaluates an expression: `"$path"` reads the record, records evaluate field by field and
/// anything else is a literal.
fn evaluate(record: &Record, expression: &Bson) -> Bson {
    match expression {
        Bson::String(text) if text.starts_with('$') => resolve_path(record, &text[1..])
            .cloned()
            .unwrap_or(Bson::Null),
        Bson::Document(fields) => Bson::Document(
            fields
                .iter()
                .map(|(key, expression)| (key.clone(), evaluate(record, expression)))
                .collect(),
        ),
        literal => literal.clone(),
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Running state of one accumulator within one group.
#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Bson),
    Avg { sum: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    Push(Vec<Bson>),
    First(Option<Bson>),
    Last(Bson),
    AddToSet(Vec<Bson>),
}

impl Accumulator {
    fn seed(operator: &str) -> Option<Self> {
        Some(match operator {
            "$sum" => Accumulator::Sum(Bson::Int32(0)),
            "$avg" => Accumulator::Avg { sum: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$push" => Accumulator::Push(Vec::new()),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Bson::Null),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            _ => return None,
        })
    }

    fn update(&mut self, value: Bson) {
        let present = !matches!(value, Bson::Null | Bson::Undefined);

        match self {
            Accumulator::Sum(total) => {
                if let Some(sum) = add_numbers(total, &value) {
                    *total = sum;
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(n) = as_f64(&value) {
                    *sum += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if present && current.as_ref().is_none_or(|min| compare_values(Some(&value), Some(min)).is_lt()) {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if present && current.as_ref().is_none_or(|max| compare_values(Some(&value), Some(max)).is_gt()) {
                    *current = Some(value);
                }
            }
            Accumulator::Push(items) => items.push(value),
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Accumulator::Last(last) => *last = value,
            Accumulator::AddToSet(items) => {
                if !items.iter().any(|item| values_equal(item, &value)) {
                    items.push(value);
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { count: 0, .. } => Bson::Null,
            Accumulator::Avg { sum, count } => Bson::Double(sum / count as f64),
            Accumulator::Min(min) => min.unwrap_or(Bson::Double(f64::INFINITY)),
            Accumulator::Max(max) => max.unwrap_or(Bson::Double(f64::NEG_INFINITY)),
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Bson::Array(items),
            Accumulator::First(first) => first.unwrap_or(Bson::Null),
            Accumulator::Last(last) => last,
        }
    }
}

/// One output field of a `$group` stage.
struct AccumulatorSpec<'a> {
    field: &'a str,
    operator: &'a str,
    expression: &'a Bson,
}

fn accumulator_specs(spec: &Record) -> Vec<AccumulatorSpec<'_>> {
    spec.iter()
        .filter(|(field, _)| field.as_str() != "_id")
        .filter_map(|(field, definition)| {
            let entry = match definition {
                Bson::Document(definition) => definition.iter().next(),
                _ => None,
            };

            match entry {
                Some((operator, expression)) if Accumulator::seed(operator).is_some() => Some(AccumulatorSpec {
                    field,
                    operator,
                    expression,
                }),
                _ => {
                    warn!(%field, %definition, "skipping unsupported accumulator");
                    None
                }
            }
        })
        .collect()
}

fn group(records: Vec<Record>, spec: &Record) -> Vec<Record> {
    let key_expression = spec.get("_id").cloned().unwrap_or(Bson::Null);
    let specs = accumulator_specs(spec);

    // Groups in first-seen key order.
    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();

    for record in &records {
        let key = evaluate(record, &key_expression);

        let index = match groups.iter().position(|(existing, _)| values_equal(existing, &key)) {
            Some(index) => index,
            None => {
                let seeded = specs
                    .iter()
                    .filter_map(|spec| Accumulator::seed(spec.operator))
                    .collect();
                groups.push((key, seeded));
                groups.len() - 1
            }
        };

        for (accumulator, spec) in groups[index].1.iter_mut().zip(&specs) {
            accumulator.update(evaluate(record, spec.expression));
        }
    }

    groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Record::new();
            out.insert("_id", key);

            for (accumulator, spec) in accumulators.into_iter().zip(&specs) {
                out.insert(spec.field, accumulator.finish());
            }

            out
        })
        .collect()
}

fn unwind_path(argument: &Bson) -> Option<&str> {
    let path = match argument {
        Bson::String(path) => path.as_str(),
        Bson::Document(options) => options.get_str("path").ok()?,
        _ => return None,
    };

    path.strip_prefix('$')
}

fn unwind(records: Vec<Record>, path: &str) -> Vec<Record> {
    records
        .into_iter()
        .flat_map(|record| match resolve_path(&record, path) {
            Some(Bson::Array(items)) => items
                .clone()
                .into_iter()
                .map(|item| {
                    let mut copy = record.clone();
                    set_path(&mut copy, path, item);
                    copy
                })
                .collect::<Vec<_>>(),
            _ => vec![record],
        })
        .collect()
}

/// Inclusion, exclusion and `"$path"` renames. Renames imply inclusion.
fn project(record: Record, spec: &Record) -> Record {
    let (computed, flags): (Vec<_>, Vec<_>) = spec
        .iter()
        .partition(|(_, value)| matches!(value, Bson::String(text) if text.starts_with('$')) || matches!(value, Bson::Document(_)));

    let projection = Projection::from_record(
        &flags
            .into_iter()
            .map(|(path, flag)| (path.clone(), flag.clone()))
            .collect(),
    );

    if computed.is_empty() {
        return projection.apply(record);
    }

    let mut out = projection.include(&record);
    for (path, expression) in computed {
        set_path(&mut out, path, evaluate(&record, expression));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::Schema, testing};
    use bson::doc;

    fn sales() -> Vec<Record> {
        vec![
            doc! { "_id": "1", "item": "a", "qty": 2, "price": 10.0, "tags": ["x", "y"], "store": { "city": "Oslo" } },
            doc! { "_id": "2", "item": "b", "qty": 1, "price": 20.0, "tags": ["y"], "store": { "city": "Rome" } },
            doc! { "_id": "3", "item": "a", "qty": 5, "price": 10.0, "tags": [], "store": { "city": "Oslo" } },
            doc! { "_id": "4", "item": "c", "qty": 3, "price": 5.0, "tags": "z", "store": { "city": "Rome" } },
        ]
    }

    #[test]
    fn groups_everything_with_a_null_key() {
        let out = run_pipeline(
            sales(),
            &[doc! { "$group": {
                "_id": null,
                "count": { "$sum": 1 },
                "qty": { "$sum": "$qty" },
                "avg": { "$avg": "$price" },
                "min": { "$min": "$qty" },
                "max": { "$max": "$qty" },
                "items": { "$push": "$item" },
                "distinct": { "$addToSet": "$item" },
            } }],
        );

        assert_eq!(
            out,
            vec![doc! {
                "_id": null,
                "count": 4,
                "qty": 11,
                "avg": 11.25,
                "min": 1,
                "max": 5,
                "items": ["a", "b", "a", "c"],
                "distinct": ["a", "b", "c"],
            }]
        );
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let out = run_pipeline(
            sales(),
            &[doc! { "$group": {
                "_id": "$store.city",
                "first": { "$first": "$item" },
                "last": { "$last": "$item" },
                "missing": { "$avg": "$nope" },
            } }],
        );

        assert_eq!(
            out,
            vec![
                doc! { "_id": "Oslo", "first": "a", "last": "a", "missing": null },
                doc! { "_id": "Rome", "first": "b", "last": "c", "missing": null },
            ]
        );
    }

    #[test]
    fn group_counts_add_up_to_the_input() {
        let out = run_pipeline(
            sales(),
            &[doc! { "$group": { "_id": { "item": "$item", "city": "$store.city" }, "n": { "$sum": 1 } } }],
        );

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].get_document("_id").unwrap(), &doc! { "item": "a", "city": "Oslo" });
        assert_eq!(out.iter().map(|group| group.get_i32("n").unwrap()).sum::<i32>(), 4);
    }

    #[test]
    fn min_and_max_without_values_keep_their_seeds() {
        let out = run_pipeline(
            sales(),
            &[doc! { "$group": { "_id": null, "min": { "$min": "$nope" }, "max": { "$max": "$nope" } } }],
        );

        assert_eq!(out[0].get_f64("min").unwrap(), f64::INFINITY);
        assert_eq!(out[0].get_f64("max").unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn overflowing_integer_sums_switch_to_doubles() {
        let records = vec![doc! { "n": i64::MAX }, doc! { "n": 1 }, doc! { "n": 1 }];
        let out = run_pipeline(records, &[doc! { "$group": { "_id": null, "total": { "$sum": "$n" } } }]);

        assert_eq!(out[0].get_f64("total").unwrap(), i64::MAX as f64 + 2.0);
    }

    #[test]
    fn unwind_emits_one_record_per_element() {
        let out = run_pipeline(sales(), &[doc! { "$unwind": "$tags" }]);

        let ids = out.iter().map(|r| r.get_str("_id").unwrap()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "1", "2", "4"]);
        assert_eq!(out[1].get_str("tags").unwrap(), "y");
        assert_eq!(out[3].get_str("tags").unwrap(), "z");

        let nested = run_pipeline(vec![doc! { "a": { "b": [1, 2] } }], &[doc! { "$unwind": { "path": "$a.b" } }]);
        assert_eq!(nested, vec![doc! { "a": { "b": 1 } }, doc! { "a": { "b": 2 } }]);
    }

    #[test]
    fn sort_skip_limit_project_and_count() {
        let out = run_pipeline(
            sales(),
            &[
                doc! { "$match": { "qty": { "$gt": 1 } } },
                doc! { "$sort": { "item": 1, "qty": -1 } },
                doc! { "$skip": 1 },
                doc! { "$limit": 5 },
                doc! { "$project": { "_id": 0, "item": 1, "city": "$store.city" } },
            ],
        );

        assert_eq!(out, vec![doc! { "item": "a", "city": "Oslo" }, doc! { "item": "c", "city": "Rome" }]);

        let excluded = run_pipeline(sales(), &[doc! { "$limit": 1 }, doc! { "$project": { "tags": 0, "store": 0 } }]);
        assert_eq!(excluded, vec![doc! { "_id": "1", "item": "a", "qty": 2, "price": 10.0 }]);

        let counted = run_pipeline(sales(), &[doc! { "$match": { "item": "a" } }, doc! { "$count": "total" }]);
        assert_eq!(counted, vec![doc! { "total": 2_i64 }]);
    }

    #[test]
    fn unknown_stages_are_skipped() {
        let out = run_pipeline(sales(), &[doc! { "$lookup": { "from": "x" } }, doc! { "$limit": "two" }, doc! {}]);

        assert_eq!(out, sales());
    }

    #[tokio::test]
    async fn builder_runs_against_the_collection() {
        let model = testing::model("Sale", Schema::new());
        for record in sales() {
            model.create(record).await.unwrap();
        }

        let aggregate = model
            .aggregate(vec![])
            .matching(doc! { "qty": { "$gte": 2 } })
            .unwind("tags")
            .group(doc! { "_id": "$item", "qty": { "$sum": "$qty" } })
            .sort("-qty")
            .limit(1);

        assert_eq!(aggregate.pipeline().len(), 5);
        assert_eq!(aggregate.exec().await.unwrap(), vec![doc! { "_id": "a", "qty": 4 }]);

        let total = model.aggregate(vec![doc! { "$match": {} }]).count("n").exec().await.unwrap();
        assert_eq!(total, vec![doc! { "n": 4_i64 }]);
    }
}
