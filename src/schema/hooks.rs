// SPDX-License-Identifier: Apache-2.0

//! Pre- and post-validation transforms, plus the validators for the common syslog
//! style fields.

use serde_json::{Map, Value};

use super::coerce::{Validator, to_integer};
use super::error::CoercionError;

/// Transform applied to every decoded JSON object, innermost objects first, before
/// the record is validated.
pub trait LoadHook: Send + Sync {
    fn apply(&self, object: Map<String, Value>) -> Map<String, Value>;
}

impl<F> LoadHook for F
where
    F: Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync,
{
    fn apply(&self, object: Map<String, Value>) -> Map<String, Value> {
        self(object)
    }
}

/// Transform applied to a record after it validated successfully.
pub trait Postprocessor: Send + Sync {
    fn process(&self, record: Map<String, Value>) -> Map<String, Value>;
}

impl<F> Postprocessor for F
where
    F: Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync,
{
    fn process(&self, record: Map<String, Value>) -> Map<String, Value> {
        self(record)
    }
}

/// Walk `value` bottom-up, handing every object to `hook`.
pub(crate) fn apply_load_hook(hook: &dyn LoadHook, value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map = map
                .into_iter()
                .map(|(k, v)| (k, apply_load_hook(hook, v)))
                .collect();
            Value::Object(hook.apply(map))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| apply_load_hook(hook, v))
                .collect(),
        ),
        other => other,
    }
}

/// Expands composite keys such as `src.host` or `src!host` into nested objects, and
/// maps the `-` placeholder some loggers write for a missing `pid` to `0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpandCompositeKeys;

impl LoadHook for ExpandCompositeKeys {
    fn apply(&self, object: Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(object.len());
        let mut composite = Vec::new();

        for (key, value) in object {
            let value = if key == "pid" && value.as_str() == Some("-") {
                Value::from(0)
            } else {
                value
            };

            if key.contains(['.', '!']) {
                composite.push((key, value));
            } else {
                out.insert(key, value);
            }
        }

        for (key, value) in composite {
            let parts: Vec<&str> = key.split(['.', '!']).collect();
            if !insert_nested(&mut out, &parts, value.clone()) {
                // A plain value already sits where a record is needed; keep the key as is
                // and let validation reject it.
                out.insert(key, value);
            }
        }

        out
    }
}

fn insert_nested(target: &mut Map<String, Value>, parts: &[&str], value: Value) -> bool {
    match parts {
        [] => false,
        [last] => {
            target.insert(last.to_string(), value);
            true
        }
        [first, rest @ ..] => {
            let entry = target
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry {
                Value::Object(child) => insert_nested(child, rest, value),
                _ => false,
            }
        }
    }
}

/// Qualifies bare host names with a default domain.
#[derive(Debug, Clone)]
pub struct DefaultDomain {
    domain: String,
}

impl DefaultDomain {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

impl Validator for DefaultDomain {
    fn validate(
        &self,
        _root: &mut Map<String, Value>,
        value: Value,
    ) -> Result<Value, CoercionError> {
        match value {
            Value::String(host) if !host.contains('.') => {
                Ok(Value::String(format!("{}.{}", host, self.domain)))
            }
            Value::String(_) => Ok(value),
            other => Err(CoercionError::new(format!(
                "expected a host name, got {}",
                other
            ))),
        }
    }
}

/// Normalizes `pid` fields. Syslog style `name[123]` values are split so the pid becomes
/// `123` and `pname` on the root record becomes `name`; a missing pid becomes `0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SplitPid;

impl Validator for SplitPid {
    fn validate(
        &self,
        root: &mut Map<String, Value>,
        value: Value,
    ) -> Result<Value, CoercionError> {
        match value {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) if s.contains('[') => {
                let (pname, rest) = s.rsplit_once('[').unwrap_or(("", s.as_str()));
                let pid = rest.trim_end_matches(']');
                let pid = pid
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| CoercionError::new(format!("{:?} is not a pid", s)))?;
                root.insert("pname".to_string(), Value::String(pname.to_string()));
                Ok(Value::from(pid))
            }
            other => to_integer(other),
        }
    }
}
