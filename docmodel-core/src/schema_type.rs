//! Per-field type descriptors.
//!
//! A [`SchemaType`] declares the kind of one field path together with everything the engine
//! needs to handle its values: casting, defaults, validators, getter/setter chains and
//! reference metadata used for population.
//!
//! ```ignore
//! use docmodel::schema_type::SchemaType;
//!
//! let age = SchemaType::number().required().default_value(0).min(0.0);
//! let email = SchemaType::string().lowercase().trim().matches(r"^[^@]+@[^@]+$");
//! let author = SchemaType::object_id().reference("User");
//! ```

use bson::{Bson, DateTime};
use futures::future::BoxFuture;
use regex::Regex;
use std::{fmt, future::Future, sync::Arc};
use tracing::warn;

use crate::{
    codec,
    error::{ModelError, ModelResult},
    evaluator::{compare_values, values_equal},
    schema::Schema,
    Record,
};

/// A transformation applied to a value on write (`set`) or read (`get`).
pub type Transform = Arc<dyn Fn(Bson) -> Bson + Send + Sync>;

/// A zero-argument default producer, invoked once per defaulted record.
pub type DefaultProducer = Arc<dyn Fn() -> Bson + Send + Sync>;

type SyncCheck = Arc<dyn Fn(&Bson, &Record) -> bool + Send + Sync>;
type AsyncCheck = Arc<dyn Fn(Bson, Record) -> BoxFuture<'static, bool> + Send + Sync>;

/// The semantic type of a field.
#[derive(Clone)]
pub enum SchemaKind {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    /// A reference identifier, stored as a string.
    ObjectId,
    /// Any value; never fails to cast.
    Mixed,
    /// A nested sub-schema whose paths are addressed with dots.
    Nested(Schema),
}

impl SchemaKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaKind::String => "String",
            SchemaKind::Number => "Number",
            SchemaKind::Boolean => "Boolean",
            SchemaKind::Date => "Date",
            SchemaKind::Array => "Array",
            SchemaKind::Object => "Object",
            SchemaKind::ObjectId => "ObjectId",
            SchemaKind::Mixed => "Mixed",
            SchemaKind::Nested(_) => "Embedded",
        }
    }
}

impl fmt::Debug for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field default: a static value cloned per use or a producer invoked per use.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Bson),
    Producer(DefaultProducer),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultValue::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

#[derive(Clone)]
enum Check {
    Sync(SyncCheck),
    Async(AsyncCheck),
}

/// A predicate over a field value carrying the message reported when it fails.
///
/// Messages may contain `{PATH}` and `{VALUE}` placeholders.
#[derive(Clone)]
pub struct Validator {
    check: Check,
    message: String,
    is_required: bool,
}

impl Validator {
    /// Creates a synchronous validator.
    pub fn new<F>(check: F, message: impl Into<String>) -> Self
    where
        F: Fn(&Bson, &Record) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Check::Sync(Arc::new(check)),
            message: message.into(),
            is_required: false,
        }
    }

    /// Creates an asynchronous validator. The value and enclosing record are passed owned.
    pub fn new_async<F, Fut>(check: F, message: impl Into<String>) -> Self
    where
        F: Fn(Bson, Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            check: Check::Async(Arc::new(move |value, context| Box::pin(check(value, context)))),
            message: message.into(),
            is_required: false,
        }
    }

    fn required() -> Self {
        Self {
            check: Check::Sync(Arc::new(|value, _| !matches!(value, Bson::Null | Bson::Undefined))),
            message: "{PATH} is required".to_string(),
            is_required: true,
        }
    }

    /// True for the built-in required validator.
    pub fn is_required(&self) -> bool {
        self.is_required
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    async fn passes(&self, value: &Bson, context: &Record) -> bool {
        match &self.check {
            Check::Sync(check) => check(value, context),
            Check::Async(check) => check(value.clone(), context.clone()).await,
        }
    }

    fn render(&self, path: &str, value: &Bson) -> String {
        self.message
            .replace("{PATH}", path)
            .replace("{VALUE}", &value.to_string())
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("message", &self.message)
            .field("is_required", &self.is_required)
            .finish()
    }
}

/// Type descriptor for one field path.
#[derive(Clone)]
pub struct SchemaType {
    kind: SchemaKind,
    required: bool,
    default: Option<DefaultValue>,
    reference: Option<String>,
    getters: Vec<Transform>,
    setters: Vec<Transform>,
    validators: Vec<Validator>,
    index: bool,
    unique: bool,
}

impl SchemaType {
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            reference: None,
            getters: Vec::new(),
            setters: Vec::new(),
            validators: Vec::new(),
            index: false,
            unique: false,
        }
    }

    pub fn string() -> Self {
        Self::new(SchemaKind::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaKind::Boolean)
    }

    pub fn date() -> Self {
        Self::new(SchemaKind::Date)
    }

    pub fn array() -> Self {
        Self::new(SchemaKind::Array)
    }

    pub fn object() -> Self {
        Self::new(SchemaKind::Object)
    }

    pub fn object_id() -> Self {
        Self::new(SchemaKind::ObjectId)
    }

    pub fn mixed() -> Self {
        Self::new(SchemaKind::Mixed)
    }

    pub fn nested(schema: Schema) -> Self {
        Self::new(SchemaKind::Nested(schema))
    }

    /// Marks the field as required. The required check always runs before other validators.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    pub fn default_fn<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Bson + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Producer(Arc::new(producer)));
        self
    }

    /// Declares the name of the model this field's identifiers refer to.
    pub fn reference(mut self, model: impl Into<String>) -> Self {
        self.reference = Some(model.into());
        self
    }

    /// Appends a getter, applied when the value is read through a document.
    pub fn get<F>(mut self, getter: F) -> Self
    where
        F: Fn(Bson) -> Bson + Send + Sync + 'static,
    {
        self.getters.push(Arc::new(getter));
        self
    }

    /// Appends a setter, applied in declaration order before the kind check in [`cast`](Self::cast).
    pub fn set<F>(mut self, setter: F) -> Self
    where
        F: Fn(Bson) -> Bson + Send + Sync + 'static,
    {
        self.setters.push(Arc::new(setter));
        self
    }

    pub fn validate<F>(self, check: F, message: impl Into<String>) -> Self
    where
        F: Fn(&Bson, &Record) -> bool + Send + Sync + 'static,
    {
        self.validator(Validator::new(check, message))
    }

    pub fn validate_async<F, Fut>(self, check: F, message: impl Into<String>) -> Self
    where
        F: Fn(Bson, Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.validator(Validator::new_async(check, message))
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn min(self, min: f64) -> Self {
        self.validate(
            move |value, _| compare_values(Some(value), Some(&Bson::Double(min))).is_ge() || is_nullish(value),
            format!("Path `{{PATH}}` ({{VALUE}}) is less than minimum allowed value ({min})."),
        )
    }

    pub fn max(self, max: f64) -> Self {
        self.validate(
            move |value, _| is_nullish(value) || compare_values(Some(value), Some(&Bson::Double(max))).is_le(),
            format!("Path `{{PATH}}` ({{VALUE}}) is more than maximum allowed value ({max})."),
        )
    }

    pub fn enum_values<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let allowed = values.into_iter().map(Into::into).collect::<Vec<_>>();

        self.validate(
            move |value, _| is_nullish(value) || allowed.iter().any(|candidate| values_equal(candidate, value)),
            "`{VALUE}` is not a valid enum value for path `{PATH}`.",
        )
    }

    /// Requires string values to match the pattern. An invalid pattern rejects every value.
    pub fn matches(self, pattern: &str) -> Self {
        let regex = Regex::new(pattern)
            .inspect_err(|error| warn!(%pattern, %error, "invalid match pattern"))
            .ok();

        self.validate(
            move |value, _| match value {
                Bson::String(text) => regex.as_ref().is_some_and(|regex| regex.is_match(text)),
                other => is_nullish(other),
            },
            "Path `{PATH}` is invalid ({VALUE}).",
        )
    }

    pub fn min_length(self, min: usize) -> Self {
        self.validate(
            move |value, _| value_len(value).is_none_or(|len| len >= min),
            format!("Path `{{PATH}}` ({{VALUE}}) is shorter than the minimum allowed length ({min})."),
        )
    }

    pub fn max_length(self, max: usize) -> Self {
        self.validate(
            move |value, _| value_len(value).is_none_or(|len| len <= max),
            format!("Path `{{PATH}}` ({{VALUE}}) is longer than the maximum allowed length ({max})."),
        )
    }

    pub fn lowercase(self) -> Self {
        self.set(|value| map_string(value, |text| text.to_lowercase()))
    }

    pub fn uppercase(self) -> Self {
        self.set(|value| map_string(value, |text| text.to_uppercase()))
    }

    pub fn trim(self) -> Self {
        self.set(|value| map_string(value, |text| text.trim().to_string()))
    }

    /// Advisory only; nothing is built.
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// Advisory only; uniqueness is not enforced.
    pub fn unique(mut self) -> Self {
        self.index = true;
        self.unique = true;
        self
    }

    pub fn kind(&self) -> &SchemaKind {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn reference_model(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn is_indexed(&self) -> bool {
        self.index
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// The nested schema, if this is an embedded type.
    pub fn nested_schema(&self) -> Option<&Schema> {
        match &self.kind {
            SchemaKind::Nested(schema) => Some(schema),
            _ => None,
        }
    }

    /// Evaluates the default: a static value is cloned, a producer is invoked.
    pub fn get_default(&self) -> Option<Bson> {
        self.default.as_ref().map(|default| match default {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Producer(producer) => producer(),
        })
    }

    /// Runs the getter chain over a stored value.
    pub fn apply_getters(&self, value: Bson) -> Bson {
        self.getters
            .iter()
            .fold(value, |value, getter| getter(value))
    }

    /// Applies the setter chain, then requires the result to satisfy the kind.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Cast`] naming `path` when the value does not fit the kind.
    pub fn cast(&self, path: &str, raw: Bson) -> ModelResult<Bson> {
        self.check_kind(path, self.apply_setters(raw))
    }

    /// Runs the setter chain over an incoming value.
    pub fn apply_setters(&self, raw: Bson) -> Bson {
        self.setters
            .iter()
            .fold(raw, |value, setter| setter(value))
    }

    /// Requires `value` to satisfy the kind, coercing where the kind allows. Setters do not
    /// run, so checking an already cast value is a no-op.
    ///
    /// Null always passes. Dates accept RFC 3339 / `YYYY-MM-DD` strings and epoch
    /// milliseconds; identifiers accept BSON object ids, rendered as hex strings.
    pub fn check_kind(&self, path: &str, value: Bson) -> ModelResult<Bson> {
        if is_nullish(&value) {
            return Ok(Bson::Null);
        }

        let fail = |value: &Bson| ModelError::cast(path, self.kind.name(), value);

        match (&self.kind, value) {
            (SchemaKind::Mixed, value) => Ok(value),
            (SchemaKind::String, value @ Bson::String(_)) => Ok(value),
            (SchemaKind::Number, value @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))) => Ok(value),
            (SchemaKind::Boolean, value @ Bson::Boolean(_)) => Ok(value),
            (SchemaKind::Date, value @ Bson::DateTime(_)) => Ok(value),
            (SchemaKind::Date, Bson::String(text)) => codec::parse_date(&text)
                .map(Bson::DateTime)
                .ok_or_else(|| fail(&Bson::String(text))),
            (SchemaKind::Date, Bson::Int32(millis)) => Ok(Bson::DateTime(DateTime::from_millis(millis.into()))),
            (SchemaKind::Date, Bson::Int64(millis)) => Ok(Bson::DateTime(DateTime::from_millis(millis))),
            (SchemaKind::Array, value @ Bson::Array(_)) => Ok(value),
            (SchemaKind::Object | SchemaKind::Nested(_), value @ Bson::Document(_)) => Ok(value),
            (SchemaKind::ObjectId, value @ Bson::String(_)) => Ok(value),
            (SchemaKind::ObjectId, Bson::ObjectId(id)) => Ok(Bson::String(id.to_hex())),
            (_, value) => Err(fail(&value)),
        }
    }

    /// Runs every validator against `value` with `context` as the enclosing record.
    ///
    /// The required check runs first when the field is required. Every validator runs; the
    /// message of the first one that fails is returned, so a field reports at most one error.
    pub async fn do_validate(&self, path: &str, value: &Bson, context: &Record) -> Option<String> {
        let required = self.required.then(Validator::required);
        let mut failure = None;

        for validator in required.iter().chain(self.validators.iter()) {
            // Optional fields skip custom validators when unset.
            if !self.required && !validator.is_required && is_nullish(value) {
                continue;
            }

            if !validator.passes(value, context).await && failure.is_none() {
                failure = Some(validator.render(path, value));
            }
        }

        failure
    }
}

impl fmt::Debug for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaType")
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("reference", &self.reference)
            .field("validators", &self.validators)
            .field("index", &self.index)
            .field("unique", &self.unique)
            .finish_non_exhaustive()
    }
}

impl From<SchemaKind> for SchemaType {
    fn from(kind: SchemaKind) -> Self {
        SchemaType::new(kind)
    }
}

fn is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

fn value_len(value: &Bson) -> Option<usize> {
    match value {
        Bson::String(text) => Some(text.chars().count()),
        Bson::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn map_string(value: Bson, f: impl Fn(&str) -> String) -> Bson {
    match value {
        Bson::String(text) => Bson::String(f(&text)),
        other => other,
    }
}
