//! Record evaluation: the shared matching predicate, value comparison and dot-path traversal.
//!
//! Queries, aggregation `$match` stages and update filters all go through
//! [`RecordEvaluator`], so a condition record means the same thing everywhere.

use bson::{Bson, datetime::DateTime, oid::ObjectId};
use regex::RegexBuilder;
use std::{cmp::Ordering, collections::HashMap};
use tracing::warn;

use crate::{
    error::{ModelError, ModelResult},
    filter::{Expr, FieldOp, QueryVisitor},
    Record,
};

/// Type-erased, comparable representation of BSON values.
///
/// Numeric types are normalized to f64 so `1`, `1i64` and `1.0` compare equal.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (all integers and floats normalized to f64)
    Number(f64),
    /// DateTime value
    DateTime(DateTime),
    /// String value
    String(&'a str),
    /// Array of comparable values
    Array(Vec<Comparable<'a>>),
    /// Map/Object of comparable values
    Map(HashMap<&'a str, Comparable<'a>>),
    /// Object id, ordered by its bytes
    ObjectId(ObjectId),
    /// Any other BSON value; only equal to an identical value
    Other(&'a Bson),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null | Bson::Undefined => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(arr) => Comparable::Array(
                arr
                    .iter()
                    .map(Comparable::from)
                    .collect::<Vec<_>>()
            ),
            Bson::Document(doc) => Comparable::Map(
                doc
                    .iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect::<HashMap<_, _>>()
            ),
            Bson::ObjectId(id) => Comparable::ObjectId(*id),
            other => Comparable::Other(other),
        }
    }
}

impl<'a> Comparable<'a> {
    /// Canonical cross-type ordering rank.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 1,
            Comparable::Number(_) => 2,
            Comparable::String(_) => 3,
            Comparable::Map(_) => 4,
            Comparable::Array(_) => 5,
            Comparable::Bool(_) => 6,
            Comparable::DateTime(_) => 7,
            Comparable::ObjectId(_) => 8,
            Comparable::Other(_) => 9,
        }
    }

    /// Total order used for sorting: type rank first, then value.
    fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Comparable::Number(a), Comparable::Number(b)) => a.total_cmp(b),
            (Comparable::Array(a), Comparable::Array(b)) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| x.total_cmp(y))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            (Comparable::Map(_), Comparable::Map(_)) => Ordering::Equal,
            _ => self
                .partial_cmp(other)
                .unwrap_or_else(|| self.rank().cmp(&other.rank())),
        }
    }
}

impl<'a> PartialEq for Comparable<'a> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Other(a), Comparable::Other(b)) => a == b,
            _ => false,
        }
    }
}

impl<'a> PartialOrd for Comparable<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.bytes().partial_cmp(&b.bytes()),
            (Comparable::Other(a), Comparable::Other(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// Value equality with numeric normalization.
pub fn values_equal(left: &Bson, right: &Bson) -> bool {
    Comparable::from(left) == Comparable::from(right)
}

/// Sort comparator shared by queries and `$sort` stages.
///
/// Missing values order before everything, then null, numbers, strings, objects, arrays,
/// booleans, dates and object ids. Other BSON types order last.
pub fn compare_values(left: Option<&Bson>, right: Option<&Bson>) -> Ordering {
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => Comparable::from(a).total_cmp(&Comparable::from(b)),
    }
}

/// Resolves a dotted path (`a.b.0.c`) inside a record. Numeric segments index arrays.
pub fn resolve_path<'a>(record: &'a Record, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(doc) => doc.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Writes a value at a dotted path, creating intermediate records as needed.
pub fn set_path(record: &mut Record, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            record.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(record.get(head), Some(Bson::Document(_))) {
                record.insert(head, Record::new());
            }

            if let Some(Bson::Document(child)) = record.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

/// Removes the value at a dotted path, returning it.
pub fn remove_path(record: &mut Record, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => record.remove(path),
        Some((head, rest)) => match record.get_mut(head) {
            Some(Bson::Document(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

/// Evaluates filter expressions against a single record.
pub struct RecordEvaluator<'a> {
    record: &'a Record,
}

impl<'a> RecordEvaluator<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> ModelResult<bool> {
        self.visit_expr(expr)
    }

    /// The shared predicate: does `record` satisfy the condition record?
    pub fn matches(record: &Record, conditions: &Record) -> bool {
        if conditions.is_empty() {
            return true;
        }

        RecordEvaluator::new(record)
            .evaluate(&Expr::from_conditions(conditions))
            .unwrap_or(false)
    }

    /// Keeps the records matching `conditions`, preserving their order.
    pub fn filter_records(
        records: impl IntoIterator<Item = Record>,
        conditions: &Record,
    ) -> Vec<Record> {
        if conditions.is_empty() {
            return records.into_iter().collect();
        }

        let expr = Expr::from_conditions(conditions);

        records
            .into_iter()
            .filter(|record| {
                RecordEvaluator::new(record)
                    .evaluate(&expr)
                    .unwrap_or(false)
            })
            .collect()
    }
}

fn membership(stored: &Bson, candidates: &Bson) -> bool {
    let candidates = match candidates {
        Bson::Array(values) => values.as_slice(),
        single => std::slice::from_ref(single),
    };

    let contains = |item: &Bson| candidates.iter().any(|candidate| values_equal(item, candidate));

    match stored {
        Bson::Array(items) => items.iter().any(contains),
        scalar => contains(scalar),
    }
}

fn regex_matches(stored: &Bson, pattern: &Bson, options: Option<&str>) -> bool {
    let (Bson::String(text), Bson::String(pattern)) = (stored, pattern) else {
        return false;
    };

    let mut builder = RegexBuilder::new(pattern);
    for flag in options.unwrap_or_default().chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }

    match builder.build() {
        Ok(regex) => regex.is_match(text),
        Err(err) => {
            warn!(pattern = %pattern, error = %err, "Ignoring invalid $regex pattern");
            false
        }
    }
}

impl<'a> QueryVisitor for RecordEvaluator<'a> {
    type Output = bool;
    type Error = ModelError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Result<Self::Output, Self::Error> {
        Ok(resolve_path(self.record, field).is_some() == should_exist)
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        // Missing fields behave as null for equality and membership.
        let stored = resolve_path(self.record, field).unwrap_or(&Bson::Null);

        match op {
            FieldOp::Eq => Ok(values_equal(stored, value)),
            FieldOp::Ne => Ok(!values_equal(stored, value)),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
                if matches!(stored, Bson::Null) {
                    return Ok(false);
                }

                match Comparable::from(stored).partial_cmp(&Comparable::from(value)) {
                    Some(ordering) => Ok(match op {
                        FieldOp::Gt => ordering == Ordering::Greater,
                        FieldOp::Gte => ordering != Ordering::Less,
                        FieldOp::Lt => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    }),
                    None => Ok(false),
                }
            }
            FieldOp::In => Ok(membership(stored, value)),
            FieldOp::Nin => Ok(!membership(stored, value)),
            FieldOp::Regex(options) => Ok(regex_matches(stored, value, options.as_deref())),
            FieldOp::Unknown(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn record() -> Record {
        doc! {
            "name": "Alice",
            "age": 30,
            "tags": ["a", "b"],
            "address": { "city": "Oslo", "zip": 150 },
            "score": 4.5,
        }
    }

    #[test]
    fn exact_equality_normalizes_numbers() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "age": 30.0 }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "age": 30i64, "name": "Alice" }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "age": 31 }));
        assert!(RecordEvaluator::matches(&record(), &doc! {}));
    }

    #[test]
    fn comparison_operators() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "age": { "$gt": 29, "$lte": 30 } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "age": { "$lt": 30 } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "missing": { "$gte": 0 } }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "name": { "$gte": "A" } }));
    }

    #[test]
    fn in_treats_scalars_as_single_element_sets() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "name": { "$in": ["Bob", "Alice"] } }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "tags": { "$in": ["b", "z"] } }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "tags": { "$nin": ["z"] } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "age": { "$nin": [30, 40] } }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "missing": { "$nin": [1] } }));
    }

    #[test]
    fn regex_with_options() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "name": { "$regex": "^ali", "$options": "i" } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "name": { "$regex": "^ali" } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "age": { "$regex": "3" } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "name": { "$regex": "(" } }));
    }

    #[test]
    fn unknown_operators_never_match() {
        assert!(!RecordEvaluator::matches(&record(), &doc! { "age": { "$near": 30 } }));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "$where": "true" }));
    }

    #[test]
    fn dotted_paths_and_logical_operators() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "address.city": "Oslo" }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "tags.1": "b" }));
        assert!(RecordEvaluator::matches(
            &record(),
            &doc! { "$or": [{ "age": 1 }, { "address.zip": { "$gt": 100 } }] }
        ));
        assert!(!RecordEvaluator::matches(&record(), &doc! { "$nor": [{ "name": "Alice" }] }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "email": { "$exists": false } }));
    }

    #[test]
    fn composed_expressions() {
        let rec = record();
        let adult = Expr::field("age", FieldOp::Gte, Bson::Int32(18));
        let in_paris = Expr::field("address.city", FieldOp::Eq, Bson::from("Paris"));

        assert!(RecordEvaluator::new(&rec).evaluate(&adult.clone().or(in_paris.clone())).unwrap());
        assert!(!RecordEvaluator::new(&rec).evaluate(&adult.clone().and(in_paris.clone())).unwrap());
        assert!(RecordEvaluator::new(&rec).evaluate(&in_paris.not()).unwrap());
    }

    #[test]
    fn missing_fields_behave_as_null() {
        assert!(RecordEvaluator::matches(&record(), &doc! { "email": bson::Bson::Null }));
        assert!(RecordEvaluator::matches(&record(), &doc! { "email": { "$ne": "x" } }));
    }

    #[test]
    fn object_ids_compare_by_identity() {
        let id = ObjectId::new();
        let other = ObjectId::new();
        let rec = doc! { "ref": id, "code": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: vec![1, 2] } };

        assert!(RecordEvaluator::matches(&rec, &doc! { "ref": id }));
        assert!(!RecordEvaluator::matches(&rec, &doc! { "ref": other }));
        assert!(!RecordEvaluator::matches(&rec, &doc! { "ref": Bson::Null }));
        assert!(RecordEvaluator::matches(&rec, &doc! { "ref": { "$in": [other, id] } }));
        assert!(!RecordEvaluator::matches(&rec, &doc! { "code": Bson::Null }));
        assert_eq!(compare_values(Some(&Bson::ObjectId(id)), Some(&Bson::Null)), Ordering::Greater);
    }

    #[test]
    fn sort_comparator_orders_across_types() {
        let values = [Bson::from("b"), Bson::Int32(3), Bson::Null, Bson::Boolean(true), Bson::Double(1.5)];
        let mut sorted = values.iter().collect::<Vec<_>>();
        sorted.sort_by(|a, b| compare_values(Some(*a), Some(*b)));

        assert_eq!(
            sorted,
            vec![&Bson::Null, &Bson::Double(1.5), &Bson::Int32(3), &Bson::from("b"), &Bson::Boolean(true)]
        );
        assert_eq!(compare_values(None, Some(&Bson::Null)), Ordering::Less);
    }

    #[test]
    fn set_and_remove_nested_paths() {
        let mut rec = doc! { "a": 1 };
        set_path(&mut rec, "b.c.d", Bson::Int32(2));
        assert_eq!(resolve_path(&rec, "b.c.d"), Some(&Bson::Int32(2)));

        assert_eq!(remove_path(&mut rec, "b.c.d"), Some(Bson::Int32(2)));
        assert_eq!(resolve_path(&rec, "b.c.d"), None);
        assert_eq!(remove_path(&mut rec, "a"), Some(Bson::Int32(1)));
    }
}
