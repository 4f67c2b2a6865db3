//! Filter expressions parsed from condition records.
//!
//! Conditions are written the way they are stored: a record mapping field paths (or the
//! logical operators `$and`, `$or`, `$nor`) to either a plain value (exact equality) or an
//! operator record such as `{ "$gte": 18 }`. [`Expr::from_conditions`] turns that record into
//! an expression tree which a [`QueryVisitor`] then walks.
//!
//! ```ignore
//! use bson::doc;
//! use docmodel::filter::Expr;
//!
//! let expr = Expr::from_conditions(&doc! {
//!     "age": { "$gte": 18, "$lt": 65 },
//!     "$or": [{ "status": "active" }, { "role": "admin" }],
//! });
//! ```

use bson::Bson;

use crate::{error::ModelError, Record};

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Equal to (exact match).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Stored value (or any element of a stored array) is one of the values.
    In,
    /// Stored value (and every element of a stored array) is none of the values.
    Nin,
    /// String matches the pattern, with optional `$options` flags.
    Regex(Option<String>),
    /// An operator this engine does not understand. Always evaluates to `false`.
    Unknown(String),
}

/// A filter expression for querying records.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The (possibly dotted) field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: impl Into<String>, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field: field.into(), op, value }
    }

    /// Parses a condition record. Top-level keys are ANDed.
    pub fn from_conditions(conditions: &Record) -> Self {
        let mut exprs = Vec::with_capacity(conditions.len());

        for (key, criterion) in conditions {
            match key.as_str() {
                "$and" => exprs.push(Expr::And(sub_conditions(criterion))),
                "$or" => exprs.push(Expr::Or(sub_conditions(criterion))),
                "$nor" => exprs.push(Expr::Not(Box::new(Expr::Or(sub_conditions(criterion))))),
                operator if operator.starts_with('$') => {
                    exprs.push(Expr::field(operator, FieldOp::Unknown(operator.to_string()), criterion.clone()))
                }
                field => exprs.extend(field_exprs(field, criterion)),
            }
        }

        Expr::And(exprs)
    }

    /// Combines this expression with another using logical AND.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
}

/// Returns true when every key of the record is a `$` operator.
pub fn is_operator_record(record: &Record) -> bool {
    !record.is_empty() && record.keys().all(|key| key.starts_with('$'))
}

fn sub_conditions(criterion: &Bson) -> Vec<Expr> {
    match criterion {
        Bson::Array(items) => items
            .iter()
            .map(|item| match item {
                Bson::Document(conditions) => Expr::from_conditions(conditions),
                other => Expr::field("$and", FieldOp::Unknown("$and".to_string()), other.clone()),
            })
            .collect(),
        other => vec![Expr::field("$and", FieldOp::Unknown("$and".to_string()), other.clone())],
    }
}

fn field_exprs(field: &str, criterion: &Bson) -> Vec<Expr> {
    let operators = match criterion {
        Bson::Document(operators) if is_operator_record(operators) => operators,
        value => return vec![Expr::field(field, FieldOp::Eq, value.clone())],
    };

    let regex_options = operators
        .get("$options")
        .and_then(Bson::as_str)
        .map(str::to_string);

    operators
        .iter()
        .filter(|(op, _)| op.as_str() != "$options")
        .map(|(op, value)| match op.as_str() {
            "$eq" => Expr::field(field, FieldOp::Eq, value.clone()),
            "$ne" => Expr::field(field, FieldOp::Ne, value.clone()),
            "$gt" => Expr::field(field, FieldOp::Gt, value.clone()),
            "$gte" => Expr::field(field, FieldOp::Gte, value.clone()),
            "$lt" => Expr::field(field, FieldOp::Lt, value.clone()),
            "$lte" => Expr::field(field, FieldOp::Lte, value.clone()),
            "$in" => Expr::field(field, FieldOp::In, value.clone()),
            "$nin" => Expr::field(field, FieldOp::Nin, value.clone()),
            "$regex" => Expr::field(field, FieldOp::Regex(regex_options.clone()), value.clone()),
            "$exists" => Expr::Exists(field.to_string(), truthy(value)),
            "$not" => Expr::And(field_exprs(field, value)).not(),
            unknown => Expr::field(field, FieldOp::Unknown(unknown.to_string()), value.clone()),
        })
        .collect()
}

/// JavaScript-style truthiness, used for flags such as `$exists: 1`.
pub fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(flag) => *flag,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0 && !n.is_nan(),
        Bson::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Walks an [`Expr`] tree.
pub trait QueryVisitor {
    type Output;
    type Error: Into<ModelError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_exists(
        &mut self,
        field: &str,
        should_exist: bool,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}
