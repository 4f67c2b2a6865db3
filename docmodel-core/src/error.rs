//! Error types and result types for mapping, query and persistence operations.
//!
//! Use [`ModelResult<T>`] as the return type for fallible operations.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thiserror::Error;

/// Represents all possible errors raised by schemas, models, queries and backends.
///
/// Validation and cast errors abort the single write they belong to and never touch
/// already-stored records. Reference resolution errors are recovered inside population
/// and only logged. Unsupported operations are always fatal.
#[derive(Error, Debug)]
pub enum ModelError {
    /// One or more fields failed validation during a create, update or save.
    /// Each entry is the single representative message of one field.
    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
    /// A single field's raw value could not be coerced to its declared kind.
    #[error("Cast to {kind} failed for value {value} at path \"{path}\"")]
    Cast {
        /// The field path being cast.
        path: String,
        /// The declared kind of the field.
        kind: String,
        /// The offending value, rendered for display.
        value: String,
    },
    /// A population target model or record could not be found.
    #[error("Reference resolution failed: {0}")]
    ReferenceResolution(String),
    /// Sessions, transactions and change streams are not supported.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// The persistence collaborator failed to read or write a collection.
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// Serialization/deserialization error when converting between record formats.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The document is structurally invalid for the requested operation.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A path that was expected to be populated is not.
    #[error("Expected path \"{0}\" to be populated")]
    NotPopulated(String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
}

/// A specialized `Result` type for mapping operations.
pub type ModelResult<T> = Result<T, ModelError>;

impl From<BsonError> for ModelError {
    fn from(err: BsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for ModelError {
    fn from(err: SerdeJsonError) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

impl From<IoError> for ModelError {
    fn from(err: IoError) -> Self {
        ModelError::Persistence(err.to_string())
    }
}

impl ModelError {
    /// Creates a [`ModelError::Cast`] from its parts.
    pub fn cast(path: impl Into<String>, kind: impl Into<String>, value: impl ToString) -> Self {
        ModelError::Cast {
            path: path.into(),
            kind: kind.into(),
            value: value.to_string(),
        }
    }

    /// Creates an [`ModelError::UnsupportedOperation`] for the named feature.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        ModelError::UnsupportedOperation(feature.into())
    }

    /// Returns the per-field messages if this is a validation error.
    pub fn validation_errors(&self) -> Option<&[String]> {
        match self {
            ModelError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_joins_field_errors() {
        let err = ModelError::Validation(vec![
            "name is required".to_string(),
            "age is required".to_string(),
        ]);

        assert_eq!(err.to_string(), "Validation failed: name is required, age is required");
        assert_eq!(err.validation_errors().map(|e| e.len()), Some(2));
    }

    #[test]
    fn cast_message_names_kind_and_path() {
        let err = ModelError::cast("age", "Number", "\"abc\"");

        assert_eq!(err.to_string(), "Cast to Number failed for value \"abc\" at path \"age\"");
        assert!(err.validation_errors().is_none());
    }
}
