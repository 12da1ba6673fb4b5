// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::error::SchemaError;

const MAX_DESCRIPTION_LEN: usize = 16_384;

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,128}$").unwrap());

/// Index of a field in the schema arena.
pub type FieldId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record,
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => Ok(FieldType::String),
            "INTEGER" => Ok(FieldType::Integer),
            "FLOAT" => Ok(FieldType::Float),
            "BOOLEAN" => Ok(FieldType::Boolean),
            "TIMESTAMP" => Ok(FieldType::Timestamp),
            "RECORD" => Ok(FieldType::Record),
            _ => Err(format!("invalid type {}", s)),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Record => "RECORD",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldMode {
    #[default]
    Nullable,
    Repeated,
    Required,
}

impl FromStr for FieldMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NULLABLE" => Ok(FieldMode::Nullable),
            "REPEATED" => Ok(FieldMode::Repeated),
            "REQUIRED" => Ok(FieldMode::Required),
            _ => Err(format!("invalid mode {}", s)),
        }
    }
}

/// A node of the field tree.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    /// Dotted path from the root, e.g. `src.host`.
    pub path: String,
    pub field_type: FieldType,
    pub mode: FieldMode,
    pub description: Option<String>,
    pub children: Vec<FieldId>,
}

/// Structural checks for a single field definition. Children are not visited.
pub(crate) fn parse_field(parent: &str, value: &Value) -> Result<FieldSpec, SchemaError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SchemaError::field(display_parent(parent), "field must be an object"))?;

    let name = required_str(obj, "name", parent)?;
    let path = if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    };

    if !FIELD_NAME.is_match(name) {
        return Err(SchemaError::field(&path, "invalid field name"));
    }

    let field_type = required_str(obj, "type", &path)?
        .parse::<FieldType>()
        .map_err(|e| SchemaError::field(&path, e))?;

    let mode = match obj.get("mode") {
        None | Some(Value::Null) => FieldMode::default(),
        Some(Value::String(m)) => m.parse().map_err(|e| SchemaError::field(&path, e))?,
        Some(_) => return Err(SchemaError::field(&path, "mode must be a string")),
    };

    let description = match obj.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(d)) if d.chars().count() < MAX_DESCRIPTION_LEN => Some(d.clone()),
        Some(Value::String(_)) => {
            return Err(SchemaError::field(&path, "description too long"));
        }
        Some(_) => return Err(SchemaError::field(&path, "description must be a string")),
    };

    if field_type == FieldType::Record {
        match obj.get("fields") {
            Some(Value::Array(_)) => {}
            Some(_) => return Err(SchemaError::field(&path, "fields must be a list")),
            None => return Err(SchemaError::field(&path, "RECORD type requires fields")),
        }
    }

    Ok(FieldSpec {
        name: name.to_string(),
        path,
        field_type,
        mode,
        description,
        children: Vec::new(),
    })
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
    path: &str,
) -> Result<&'a str, SchemaError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(SchemaError::field(
            display_parent(path),
            format!("{} must be a string", key),
        )),
        None => Err(SchemaError::field(
            display_parent(path),
            format!("missing {}", key),
        )),
    }
}

fn display_parent(path: &str) -> &str {
    if path.is_empty() { "<root>" } else { path }
}
