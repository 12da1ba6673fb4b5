// SPDX-License-Identifier: Apache-2.0

//! Errors raised while constructing a pipeline. Anything in here is fatal and is
//! reported before a pipeline starts watching files.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::{SchemaError, ValidatorError};
use crate::state::StateError;
use crate::tailer::watcher::WatcherError;

/// A pipeline configuration value that cannot be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown time zone: {0}")]
    TimeZone(String),

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error("schema: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Validator(#[from] ValidatorError),

    #[error("watcher: {0}")]
    Watcher(#[from] WatcherError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("transport setup: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
