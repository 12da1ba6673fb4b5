// SPDX-License-Identifier: Apache-2.0

//! Declarative record schema.
//!
//! A schema is loaded once from a BigQuery style JSON field list into an immutable
//! arena of [`FieldSpec`] nodes, alongside a flattened index keyed by dotted path
//! (`src.host`). Each field carries a [`Validator`]; the built-in type coercions are
//! installed by default and individual fields can be overridden before any records are
//! decoded.
//!
//! Decoding a line runs, in order: JSON parsing with the optional [`LoadHook`] applied to
//! every object, validation and coercion against the schema, the [`Postprocessor`]
//! chain, and finally the SHA-1 fingerprint of the raw line is attached.

mod coerce;
mod error;
mod field;
pub mod hooks;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono_tz::Tz;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

pub use coerce::{DefaultCoercion, Validator};
pub use error::{CoercionError, DecodeError, SchemaError, ValidationError, ValidatorError};
pub use field::{FieldId, FieldMode, FieldSpec, FieldType};
pub use hooks::{LoadHook, Postprocessor};

/// Top-level keys that are accepted without being declared in the schema.
pub const IGNORED_FIELDS: &[&str] = &["table"];

const ROOT: &str = "";

/// A validated record together with the fingerprint of the line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: Map<String, Value>,
    /// Hex SHA-1 of the raw input line.
    pub fingerprint: String,
}

pub struct Schema {
    fields: Vec<FieldSpec>,
    roots: Vec<FieldId>,
    index: HashMap<String, FieldId>,
    required: HashMap<String, BTreeSet<String>>,
    repeated: HashMap<String, BTreeSet<String>>,
    validators: Vec<Arc<dyn Validator>>,
    load_hook: Option<Box<dyn LoadHook>>,
    postprocessors: Vec<Box<dyn Postprocessor>>,
    document: Value,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.index.len())
            .field("load_hook", &self.load_hook.is_some())
            .field("postprocessors", &self.postprocessors.len())
            .finish()
    }
}

impl Schema {
    /// Build a schema from a list of field definitions. Naive timestamps are read in
    /// `default_tz`.
    pub fn load(document: Value, default_tz: Tz) -> Result<Self, SchemaError> {
        let top = document.as_array().ok_or(SchemaError::NotAList)?;

        let mut schema = Schema {
            fields: Vec::new(),
            roots: Vec::new(),
            index: HashMap::new(),
            required: HashMap::new(),
            repeated: HashMap::new(),
            validators: Vec::new(),
            load_hook: None,
            postprocessors: Vec::new(),
            document: Value::Null,
        };

        for field in top {
            let id = schema.add_field(ROOT, field, default_tz)?;
            schema.roots.push(id);
        }

        schema.document = document;
        Ok(schema)
    }

    /// Parse a schema from its JSON text.
    pub fn from_json(text: &str, default_tz: Tz) -> Result<Self, SchemaError> {
        let document: Value = serde_json::from_str(text)?;
        Self::load(document, default_tz)
    }

    fn add_field(&mut self, parent: &str, value: &Value, tz: Tz) -> Result<FieldId, SchemaError> {
        let spec = field::parse_field(parent, value)?;
        if self.index.contains_key(&spec.path) {
            return Err(SchemaError::field(&spec.path, "duplicate field"));
        }

        let id = self.fields.len();
        let path = spec.path.clone();
        let name = spec.name.clone();

        match spec.mode {
            FieldMode::Required => {
                self.required
                    .entry(parent.to_string())
                    .or_default()
                    .insert(name);
            }
            FieldMode::Repeated => {
                self.repeated
                    .entry(parent.to_string())
                    .or_default()
                    .insert(name);
            }
            FieldMode::Nullable => {}
        }

        self.validators
            .push(Arc::new(DefaultCoercion::new(spec.field_type, tz)));
        self.index.insert(path.clone(), id);
        self.fields.push(spec);

        if let Some(Value::Array(children)) = value.get("fields") {
            if self.fields[id].field_type == FieldType::Record {
                for child in children {
                    let child_id = self.add_field(&path, child, tz)?;
                    self.fields[id].children.push(child_id);
                }
            }
        }

        Ok(id)
    }

    /// The field list as loaded, used when creating tables.
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.index.get(path).map(|id| &self.fields[*id])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn top_level_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.roots.iter().map(|id| &self.fields[*id])
    }

    /// Names of the required children of `parent` (`""` for top level).
    pub fn required_fields(&self, parent: &str) -> Option<&BTreeSet<String>> {
        self.required.get(parent)
    }

    /// Names of the repeated children of `parent` (`""` for top level).
    pub fn repeated_fields(&self, parent: &str) -> Option<&BTreeSet<String>> {
        self.repeated.get(parent)
    }

    /// Replace the validator of the field at `path`.
    pub fn set_field_validator(
        &mut self,
        path: &str,
        validator: impl Validator + 'static,
    ) -> Result<(), ValidatorError> {
        let id = *self
            .index
            .get(path)
            .ok_or_else(|| ValidatorError(path.to_string()))?;
        self.validators[id] = Arc::new(validator);
        Ok(())
    }

    pub fn set_load_hook(&mut self, hook: impl LoadHook + 'static) {
        self.load_hook = Some(Box::new(hook));
    }

    pub fn register_postprocessor(&mut self, postprocessor: impl Postprocessor + 'static) {
        self.postprocessors.push(Box::new(postprocessor));
    }

    pub fn clear_postprocessors(&mut self) {
        self.postprocessors.clear();
    }

    /// Decode one raw input line into a validated record.
    pub fn decode(&self, raw: &str) -> Result<Record, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        let value = match &self.load_hook {
            Some(hook) => hooks::apply_load_hook(hook.as_ref(), value),
            None => value,
        };

        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject.into());
        };

        self.validate(&mut fields)?;

        for postprocessor in &self.postprocessors {
            fields = postprocessor.process(fields);
        }

        Ok(Record {
            fields,
            fingerprint: fingerprint(raw),
        })
    }

    /// Validate and coerce `record` in place, stopping at the first failure.
    pub fn validate(&self, record: &mut Map<String, Value>) -> Result<(), ValidationError> {
        self.check_required(ROOT, record)?;

        let mut stack: Vec<Visit> = record
            .keys()
            .rev()
            .filter(|k| !IGNORED_FIELDS.contains(&k.as_str()))
            .map(|k| Visit::field(vec![Step::Key(k.clone())], k.clone()))
            .collect();

        while let Some(visit) = stack.pop() {
            let id = *self
                .index
                .get(&visit.dotted)
                .ok_or_else(|| ValidationError::UnknownField(visit.dotted.clone()))?;
            let spec = &self.fields[id];

            let Some(value) = take(record, &visit.steps) else {
                continue;
            };

            if value.is_null() {
                put(record, &visit.steps, value);
                if spec.mode == FieldMode::Required && !visit.element {
                    return Err(ValidationError::MissingRequired(vec![visit.dotted]));
                }
                continue;
            }

            match value {
                Value::Array(items) if spec.mode == FieldMode::Repeated && !visit.element => {
                    if spec.field_type == FieldType::Record {
                        let len = items.len();
                        put(record, &visit.steps, Value::Array(items));
                        for i in (0..len).rev() {
                            let mut steps = visit.steps.clone();
                            steps.push(Step::Index(i));
                            stack.push(Visit::element(steps, visit.dotted.clone()));
                        }
                    } else {
                        let validator = &self.validators[id];
                        let mut coerced = Vec::with_capacity(items.len());
                        for item in items {
                            let item = validator
                                .validate(record, item)
                                .map_err(|e| invalid(&visit.dotted, e))?;
                            coerced.push(item);
                        }
                        put(record, &visit.steps, Value::Array(coerced));
                    }
                }
                Value::Object(obj) if spec.field_type == FieldType::Record => {
                    self.check_required(&visit.dotted, &obj)?;
                    let keys: Vec<String> = obj.keys().cloned().collect();
                    put(record, &visit.steps, Value::Object(obj));
                    for key in keys.into_iter().rev() {
                        let mut steps = visit.steps.clone();
                        steps.push(Step::Key(key.clone()));
                        stack.push(Visit::field(steps, format!("{}.{}", visit.dotted, key)));
                    }
                }
                other if spec.field_type == FieldType::Record => {
                    // A repeated record given a single value is passed through as is.
                    if spec.mode == FieldMode::Repeated && !visit.element {
                        put(record, &visit.steps, other);
                        continue;
                    }
                    return Err(invalid(
                        &visit.dotted,
                        CoercionError::new(format!("expected a record, got {}", other)),
                    ));
                }
                other => {
                    if spec.mode == FieldMode::Repeated && !visit.element {
                        put(record, &visit.steps, other);
                        continue;
                    }
                    let coerced = self.validators[id]
                        .validate(record, other)
                        .map_err(|e| invalid(&visit.dotted, e))?;
                    put(record, &visit.steps, coerced);
                }
            }
        }

        Ok(())
    }

    fn check_required(
        &self,
        parent: &str,
        obj: &Map<String, Value>,
    ) -> Result<(), ValidationError> {
        let Some(required) = self.required.get(parent) else {
            return Ok(());
        };

        let missing: Vec<String> = required
            .iter()
            .filter(|name| obj.get(name.as_str()).is_none_or(Value::is_null))
            .map(|name| {
                if parent.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", parent, name)
                }
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingRequired(missing))
        }
    }
}

/// Hex SHA-1 of the raw line, used as the insert idempotency key.
pub fn fingerprint(raw: &str) -> String {
    hex::encode(Sha1::digest(raw.as_bytes()))
}

fn invalid(field: &str, source: CoercionError) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        source,
    }
}

#[derive(Debug, Clone)]
enum Step {
    Key(String),
    Index(usize),
}

struct Visit {
    steps: Vec<Step>,
    dotted: String,
    /// An element of a repeated record rather than the field itself.
    element: bool,
}

impl Visit {
    fn field(steps: Vec<Step>, dotted: String) -> Self {
        Self {
            steps,
            dotted,
            element: false,
        }
    }

    fn element(steps: Vec<Step>, dotted: String) -> Self {
        Self {
            steps,
            dotted,
            element: true,
        }
    }
}

fn slot<'a>(root: &'a mut Map<String, Value>, steps: &[Step]) -> Option<&'a mut Value> {
    let (first, rest) = steps.split_first()?;
    let Step::Key(key) = first else {
        return None;
    };

    let mut current = root.get_mut(key)?;
    for step in rest {
        current = match (step, current) {
            (Step::Key(k), Value::Object(map)) => map.get_mut(k)?,
            (Step::Index(i), Value::Array(items)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Move the value at `steps` out of `root`, leaving null in its place.
fn take(root: &mut Map<String, Value>, steps: &[Step]) -> Option<Value> {
    slot(root, steps).map(std::mem::take)
}

fn put(root: &mut Map<String, Value>, steps: &[Step], value: Value) {
    if let Some(target) = slot(root, steps) {
        *target = value;
    } else if let [Step::Key(key)] = steps {
        root.insert(key.clone(), value);
    }
}
