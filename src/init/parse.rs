// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

// Support deser into a string from multiple value types. This allows a string
// environment variable to have a value that is a number or bool
pub(crate) fn deser_into_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(num) => Ok(num.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::String(s) => Ok(s),
        _ => Err(serde::de::Error::custom(
            "unexpected value for string parameter",
        )),
    }
}

pub(crate) fn deser_into_string_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deser_into_string(deserializer).map(Some)?)
}

/// Durations are written as humantime strings (`30s`, `1m 30s`) or as plain
/// numbers of seconds.
pub(crate) fn deser_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(num) => match num.as_f64() {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            _ => Err(serde::de::Error::custom(format!(
                "invalid duration: {}",
                num
            ))),
        },
        serde_json::Value::String(s) => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => humantime::parse_duration(s)
                    .map_err(|e| serde::de::Error::custom(format!("invalid duration {:?}: {}", s, e))),
            }
        }
        _ => Err(serde::de::Error::custom(
            "unexpected value for duration parameter",
        )),
    }
}

/// A list of paths, either as a sequence or as one comma-separated string. Env
/// variables can only supply the latter.
pub(crate) fn deser_path_list<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()),
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => Ok(PathBuf::from(s)),
                other => Err(serde::de::Error::custom(format!(
                    "unexpected list entry: {}",
                    other
                ))),
            })
            .collect(),
        _ => Err(serde::de::Error::custom(
            "unexpected value for list parameter",
        )),
    }
}
