// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// The schema document itself is malformed.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema must be a list of field definitions")]
    NotAList,

    #[error("field {field}: {reason}")]
    Field { field: String, reason: String },

    #[error("failed to parse schema: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaError {
    pub(crate) fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SchemaError::Field {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A validator was registered for a field the schema does not declare.
#[derive(Error, Debug)]
#[error("cannot set validator on unknown field {0}")]
pub struct ValidatorError(pub String);

/// A value could not be coerced to its declared type.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CoercionError(pub String);

impl CoercionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A decoded record does not conform to the schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("input is not a JSON object")]
    NotAnObject,

    #[error("missing required fields: {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("unknown field in input: {0}")]
    UnknownField(String),

    #[error("invalid value for field {field}: {source}")]
    InvalidValue {
        field: String,
        #[source]
        source: CoercionError,
    },
}

/// A raw input line could not be turned into a record.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
