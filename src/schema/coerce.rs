// SPDX-License-Identifier: Apache-2.0

//! Per-field validators and the built-in type coercions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde_json::{Map, Number, Value};

use super::error::CoercionError;
use super::field::FieldType;

/// Coerces a single field value.
///
/// `root` is the top-level record being validated, minus the value under validation.
/// Validators may add derived fields to it.
pub trait Validator: Send + Sync {
    fn validate(&self, root: &mut Map<String, Value>, value: Value)
    -> Result<Value, CoercionError>;
}

impl<F> Validator for F
where
    F: Fn(&mut Map<String, Value>, Value) -> Result<Value, CoercionError> + Send + Sync,
{
    fn validate(
        &self,
        root: &mut Map<String, Value>,
        value: Value,
    ) -> Result<Value, CoercionError> {
        self(root, value)
    }
}

/// The coercion installed for every field unless overridden.
pub struct DefaultCoercion {
    field_type: FieldType,
    tz: Tz,
}

impl DefaultCoercion {
    pub fn new(field_type: FieldType, tz: Tz) -> Self {
        Self { field_type, tz }
    }
}

impl Validator for DefaultCoercion {
    fn validate(
        &self,
        _root: &mut Map<String, Value>,
        value: Value,
    ) -> Result<Value, CoercionError> {
        match self.field_type {
            FieldType::String | FieldType::Record => Ok(value),
            FieldType::Integer => to_integer(value),
            FieldType::Float => to_float(value),
            FieldType::Boolean => to_boolean(value),
            FieldType::Timestamp => to_timestamp(value, self.tz),
        }
    }
}

pub fn to_integer(value: Value) -> Result<Value, CoercionError> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => {
                Ok(Value::from(f.trunc() as i64))
            }
            _ => Err(CoercionError::new(format!("{} is not an integer", n))),
        },
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| CoercionError::new(format!("{:?} is not an integer", s))),
        Value::Bool(b) => Ok(Value::from(b as i64)),
        other => Err(CoercionError::new(format!(
            "expected an integer, got {}",
            kind(&other)
        ))),
    }
}

pub fn to_float(value: Value) -> Result<Value, CoercionError> {
    let f = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => {
            return Err(CoercionError::new(format!(
                "expected a float, got {}",
                kind(other)
            )));
        }
    };

    f.and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| CoercionError::new(format!("{} is not a float", value)))
}

pub fn to_boolean(value: Value) -> Result<Value, CoercionError> {
    match &value {
        Value::Bool(_) => Ok(value),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(CoercionError::new(format!("{} is not a boolean", n))),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(CoercionError::new(format!("{:?} is not a boolean", s))),
        },
        other => Err(CoercionError::new(format!(
            "expected a boolean, got {}",
            kind(other)
        ))),
    }
}

/// Epoch numbers are kept as they are. Strings are parsed either as epoch seconds or
/// as a date/time, producing fractional epoch seconds. Date/times without an offset
/// are read in `tz`.
pub fn to_timestamp(value: Value, tz: Tz) -> Result<Value, CoercionError> {
    match value {
        Value::Number(_) => Ok(value),
        Value::String(s) => {
            let secs = parse_timestamp(&s, tz)
                .ok_or_else(|| CoercionError::new(format!("unrecognized timestamp {:?}", s)))?;
            Number::from_f64(secs)
                .map(Value::Number)
                .ok_or_else(|| CoercionError::new(format!("unrecognized timestamp {:?}", s)))
        }
        other => Err(CoercionError::new(format!(
            "expected a timestamp, got {}",
            kind(&other)
        ))),
    }
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%d/%b/%Y:%H:%M:%S %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%b/%Y:%H:%M:%S",
];

pub(crate) fn parse_timestamp(input: &str, tz: Tz) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<f64>() {
        return secs.is_finite().then_some(secs);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(epoch_seconds(&dt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(epoch_seconds(&dt));
    }

    let zulu = s
        .strip_suffix('Z')
        .or_else(|| s.strip_suffix(" UTC"))
        .map(|rest| format!("{}+0000", rest));
    let with_offset = zulu.as_deref().unwrap_or(s);
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(with_offset, fmt) {
            return Some(epoch_seconds(&dt));
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| epoch_seconds(&dt))
}

fn epoch_seconds<T: TimeZone>(dt: &DateTime<T>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}
