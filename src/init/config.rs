// SPDX-License-Identifier: Apache-2.0

//! Per-pipeline configuration.
//!
//! The configuration file is TOML. Each top-level table names a pipeline; a `[default]`
//! table supplies values shared by all of them. Any value can be overridden through
//! `LOGSNARF_PIPELINE_<NAME>_<KEY>` environment variables.
//!
//! ```toml
//! [default]
//! project_id = "my-project"
//! dataset = "logs"
//!
//! [syslog]
//! directories = ["/var/log/remote"]
//! pattern = '.*\.json'
//! default_domain = "example.com"
//! ```

use crate::error::ConfigError;
use crate::init::parse;
use crate::tailer::watcher::WatchMode;
use crate::transport::auth::Credentials;
use crate::transport::bigquery::DEFAULT_ENDPOINT;
use crate::uploader::{DEFAULT_TABLE_NAME_FORMAT, TableNameFormat, UploaderConfig};
use chrono_tz::Tz;
use figment::providers::{Env, Format, Toml};
use figment::{Figment, value::Value};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tower::BoxError;

pub const APP_NAME: &str = "logsnarf";
pub const CONFIG_FILE_NAME: &str = "logsnarf.toml";
pub const DEFAULT_PATTERN: &str = r".*\.log";
const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directories to watch
    #[serde(deserialize_with = "parse::deser_path_list")]
    pub directories: Vec<PathBuf>,

    /// File name pattern, matched against full paths. Empty accepts every file.
    pub pattern: String,

    pub recursive: bool,

    pub batch_size: usize,

    pub max_buffer: usize,

    pub max_outstanding: usize,

    pub max_row_attempts: u32,

    #[serde(deserialize_with = "parse::deser_duration")]
    pub flush_interval: Duration,

    pub table_name_format: String,

    /// Zone for timestamps without an offset and for table name dates
    pub default_tz: String,

    /// Appended to bare host names
    #[serde(deserialize_with = "parse::deser_into_string_opt")]
    pub default_domain: Option<String>,

    #[serde(deserialize_with = "parse::deser_into_string_opt")]
    pub project_id: Option<String>,

    #[serde(deserialize_with = "parse::deser_into_string_opt")]
    pub dataset: Option<String>,

    #[serde(deserialize_with = "parse::deser_into_string_opt")]
    pub access_token: Option<String>,

    /// File holding an OAuth access token, re-read for every request
    pub access_token_file: Option<PathBuf>,

    /// JSON service account key; tokens are minted and refreshed from it
    pub service_account_file: Option<PathBuf>,

    pub endpoint: String,

    /// PEM CA certificate for private endpoints
    pub ca_file: Option<String>,

    #[serde(deserialize_with = "parse::deser_duration")]
    pub request_timeout: Duration,

    pub schema_file: Option<PathBuf>,

    pub state_file: Option<PathBuf>,

    pub failed_lines_file: Option<PathBuf>,

    pub watch_mode: WatchMode,

    #[serde(deserialize_with = "parse::deser_duration")]
    pub poll_interval: Duration,

    /// How long the final flush waits for uploads already in flight
    #[serde(deserialize_with = "parse::deser_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let uploader = UploaderConfig::default();
        Self {
            directories: Vec::new(),
            pattern: DEFAULT_PATTERN.to_string(),
            recursive: true,
            batch_size: uploader.batch_size,
            max_buffer: uploader.max_buffer,
            max_outstanding: uploader.max_outstanding,
            max_row_attempts: uploader.max_row_attempts,
            flush_interval: Duration::from_secs(30),
            table_name_format: DEFAULT_TABLE_NAME_FORMAT.to_string(),
            default_tz: "UTC".to_string(),
            default_domain: None,
            project_id: None,
            dataset: None,
            access_token: None,
            access_token_file: None,
            service_account_file: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            ca_file: None,
            request_timeout: Duration::from_secs(30),
            schema_file: None,
            state_file: None,
            failed_lines_file: None,
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Check the values that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directories.is_empty() {
            return Err(ConfigError::Missing("directories"));
        }
        if self.project_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Missing("project_id"));
        }
        if self.dataset.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Missing("dataset"));
        }
        let token_options = [
            self.access_token.is_some(),
            self.access_token_file.is_some(),
            self.service_account_file.is_some(),
        ];
        if token_options.into_iter().filter(|set| *set).count() > 1 {
            return Err(ConfigError::invalid(
                "access_token",
                "only one of access_token, access_token_file and service_account_file may be set",
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid("flush_interval", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn default_tz(&self) -> Result<Tz, ConfigError> {
        self.default_tz
            .parse()
            .map_err(|_| ConfigError::TimeZone(self.default_tz.clone()))
    }

    pub fn pattern(&self) -> Result<Option<Regex>, ConfigError> {
        if self.pattern.is_empty() {
            return Ok(None);
        }
        Ok(Some(Regex::new(&self.pattern)?))
    }

    pub fn uploader_config(&self) -> Result<UploaderConfig, ConfigError> {
        let config = UploaderConfig {
            batch_size: self.batch_size,
            max_buffer: self.max_buffer,
            max_outstanding: self.max_outstanding,
            max_row_attempts: self.max_row_attempts,
            table_name_format: self.table_name_format.parse::<TableNameFormat>()?,
            default_tz: self.default_tz()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Relative service account key paths are resolved against the config directory.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        if let Some(token) = &self.access_token {
            return Ok(Credentials::Token(token.clone()));
        }
        if let Some(file) = &self.access_token_file {
            return Ok(Credentials::TokenFile(file.clone()));
        }
        match &self.service_account_file {
            Some(file) => Ok(Credentials::ServiceAccount(resolve(
                file.clone(),
                dirs::config_dir(),
                "service_account_file",
            )?)),
            None => Ok(Credentials::None),
        }
    }

    /// Schema location; relative paths are resolved against the config directory.
    pub fn schema_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let file = self
            .schema_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_schema.json", name)));
        resolve(file, dirs::config_dir(), "schema_file")
    }

    /// State file location; relative paths are resolved against the data directory.
    pub fn state_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let file = self
            .state_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_state.json", name)));
        resolve(file, dirs::data_dir(), "state_file")
    }

    pub fn failed_lines_path(&self) -> Result<PathBuf, ConfigError> {
        let file = self
            .failed_lines_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("failed_loglines"));
        resolve(file, dirs::data_dir(), "failed_lines_file")
    }
}

fn resolve(
    file: PathBuf,
    base: Option<PathBuf>,
    field: &'static str,
) -> Result<PathBuf, ConfigError> {
    if file.is_absolute() {
        return Ok(file);
    }
    match base {
        Some(base) => Ok(base.join(APP_NAME).join(file)),
        None => Err(ConfigError::invalid(
            field,
            "relative path given but no home directory is known",
        )),
    }
}

/// `<config_dir>/logsnarf/logsnarf.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE_NAME))
}

fn env_prefix(name: &str) -> String {
    format!(
        "LOGSNARF_PIPELINE_{}_",
        name.to_uppercase().replace(['-', '.'], "_")
    )
}

/// Loads pipeline sections from an optional TOML file merged with the environment.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    file: Option<PathBuf>,
}

impl ConfigSource {
    /// An explicitly requested file must exist.
    pub fn new(file: Option<PathBuf>) -> Result<Self, BoxError> {
        match file {
            Some(file) if !file.exists() => {
                Err(format!("config file {} does not exist", file.display()).into())
            }
            Some(file) => Ok(Self { file: Some(file) }),
            None => Ok(Self {
                file: default_config_path().filter(|p| p.exists()),
            }),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Names of the pipelines defined in the file, sorted.
    pub fn pipeline_names(&self) -> Result<Vec<String>, BoxError> {
        let Some(file) = &self.file else {
            return Ok(Vec::new());
        };
        let sections: BTreeMap<String, Value> = Figment::from(Toml::file(file))
            .extract()
            .map_err(|e| format!("failed to parse {}: {}", file.display(), e))?;

        Ok(sections
            .into_iter()
            .filter(|(name, value)| name != DEFAULT_PROFILE && value.as_dict().is_some())
            .map(|(name, _)| name)
            .collect())
    }

    pub fn pipeline(&self, name: &str) -> Result<PipelineConfig, BoxError> {
        let mut figment = Figment::new();
        if let Some(file) = &self.file {
            figment = figment.merge(Toml::file(file).nested());
        }
        let figment = figment
            .merge(Env::prefixed(&env_prefix(name)).global())
            .select(name);

        let config: PipelineConfig = figment
            .extract()
            .map_err(|e| format!("failed to parse configuration for pipeline {}: {}", name, e))?;
        config
            .validate()
            .map_err(|e| format!("pipeline {}: {}", name, e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct EnvManager {
        original_vars: HashMap<String, Option<String>>,
    }

    impl EnvManager {
        fn new() -> Self {
            Self {
                original_vars: HashMap::new(),
            }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            if !self.original_vars.contains_key(key) {
                self.original_vars
                    .insert(key.to_string(), env::var(key).ok());
            }
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvManager {
        fn drop(&mut self) {
            for (key, original_value) in &self.original_vars {
                match original_value {
                    Some(value) => unsafe { env::set_var(key, value) },
                    None => unsafe { env::remove_var(key) },
                }
            }
        }
    }

    fn config_file(text: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    const TWO_PIPELINES: &str = r#"
[default]
project_id = "proj"
dataset = "logs"
batch_size = 100

[syslog]
directories = ["/var/log/remote"]
pattern = '.*\.json'
flush_interval = "1m"
default_domain = "example.com"

[apache]
directories = "/var/log/apache2, /var/log/nginx"
batch_size = 50
recursive = false
watch_mode = "poll"
"#;

    #[test]
    fn test_pipeline_names() {
        let file = config_file(TWO_PIPELINES);
        let source = ConfigSource::new(Some(file.path().to_path_buf())).unwrap();

        let mut names = source.pipeline_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["apache", "syslog"]);
    }

    #[test]
    fn test_sections_inherit_defaults() {
        let file = config_file(TWO_PIPELINES);
        let source = ConfigSource::new(Some(file.path().to_path_buf())).unwrap();

        let syslog = source.pipeline("syslog").unwrap();
        assert_eq!(syslog.project_id.as_deref(), Some("proj"));
        assert_eq!(syslog.batch_size, 100);
        assert_eq!(syslog.flush_interval, Duration::from_secs(60));
        assert_eq!(syslog.pattern, r".*\.json");
        assert!(syslog.recursive);
        assert_eq!(syslog.max_buffer, 1000);
        assert_eq!(syslog.default_domain.as_deref(), Some("example.com"));

        let apache = source.pipeline("apache").unwrap();
        assert_eq!(apache.batch_size, 50);
        assert!(!apache.recursive);
        assert_eq!(apache.watch_mode, WatchMode::Poll);
        assert_eq!(
            apache.directories,
            vec![PathBuf::from("/var/log/apache2"), PathBuf::from("/var/log/nginx")]
        );
        assert_eq!(apache.pattern, DEFAULT_PATTERN);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = config_file(TWO_PIPELINES);
        let source = ConfigSource::new(Some(file.path().to_path_buf())).unwrap();

        let mut env_manager = EnvManager::new();
        env_manager.set_var("LOGSNARF_PIPELINE_SYSLOG_BATCH_SIZE", "7");
        env_manager.set_var("LOGSNARF_PIPELINE_SYSLOG_DATASET", "other");

        let syslog = source.pipeline("syslog").unwrap();
        assert_eq!(syslog.batch_size, 7);
        assert_eq!(syslog.dataset.as_deref(), Some("other"));
    }

    #[test]
    fn test_env_only_pipeline() {
        let source = ConfigSource { file: None };

        let mut env_manager = EnvManager::new();
        env_manager.set_var("LOGSNARF_PIPELINE_ENV_ONLY_DIRECTORIES", "/tmp/a,/tmp/b");
        env_manager.set_var("LOGSNARF_PIPELINE_ENV_ONLY_PROJECT_ID", "12345");
        env_manager.set_var("LOGSNARF_PIPELINE_ENV_ONLY_DATASET", "ds");
        env_manager.set_var("LOGSNARF_PIPELINE_ENV_ONLY_REQUEST_TIMEOUT", "5s");

        let config = source.pipeline("env-only").unwrap();
        assert_eq!(config.directories.len(), 2);
        assert_eq!(config.project_id.as_deref(), Some("12345"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_values_are_reported() {
        let file = config_file("[bare]\ndirectories = [\"/tmp\"]\n");
        let source = ConfigSource::new(Some(file.path().to_path_buf())).unwrap();

        let err = source.pipeline("bare").unwrap_err();
        assert!(err.to_string().contains("project_id"), "{}", err);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ConfigSource::new(Some(PathBuf::from("/nonexistent/logsnarf.toml"))).is_err());
    }

    #[test]
    fn test_derived_values() {
        let config = PipelineConfig {
            directories: vec![PathBuf::from("/tmp")],
            project_id: Some("p".into()),
            dataset: Some("d".into()),
            default_tz: "Europe/Berlin".into(),
            table_name_format: "t_{YEAR}".into(),
            state_file: Some(PathBuf::from("/var/lib/logsnarf/state.json")),
            access_token_file: Some(PathBuf::from("/run/token")),
            ..Default::default()
        };
        config.validate().unwrap();

        assert_eq!(config.default_tz().unwrap(), Tz::Europe__Berlin);
        assert!(config.pattern().unwrap().unwrap().is_match("/x/a.log"));
        assert_eq!(config.uploader_config().unwrap().table_name_format.as_str(), "t_{YEAR}");
        assert_eq!(
            config.credentials().unwrap(),
            Credentials::TokenFile(PathBuf::from("/run/token"))
        );

        let service_account = PipelineConfig {
            access_token_file: None,
            service_account_file: Some(PathBuf::from("/etc/logsnarf/key.json")),
            ..config.clone()
        };
        service_account.validate().unwrap();
        assert_eq!(
            service_account.credentials().unwrap(),
            Credentials::ServiceAccount(PathBuf::from("/etc/logsnarf/key.json"))
        );
        assert_eq!(
            config.state_path("web").unwrap(),
            PathBuf::from("/var/lib/logsnarf/state.json")
        );

        if let Some(dir) = dirs::config_dir() {
            assert_eq!(
                config.schema_path("web").unwrap(),
                dir.join("logsnarf").join("web_schema.json")
            );
        }
    }

    #[test]
    fn test_invalid_values() {
        let base = PipelineConfig {
            directories: vec![PathBuf::from("/tmp")],
            project_id: Some("p".into()),
            dataset: Some("d".into()),
            ..Default::default()
        };

        let bad_tz = PipelineConfig {
            default_tz: "Mars/Olympus".into(),
            ..base.clone()
        };
        assert!(matches!(bad_tz.default_tz(), Err(ConfigError::TimeZone(_))));

        let bad_pattern = PipelineConfig {
            pattern: "(".into(),
            ..base.clone()
        };
        assert!(matches!(bad_pattern.pattern(), Err(ConfigError::Pattern(_))));

        let no_pattern = PipelineConfig {
            pattern: String::new(),
            ..base.clone()
        };
        assert!(no_pattern.pattern().unwrap().is_none());

        let big_batch = PipelineConfig {
            batch_size: 501,
            ..base.clone()
        };
        assert!(big_batch.uploader_config().is_err());

        let both_tokens = PipelineConfig {
            access_token: Some("t".into()),
            access_token_file: Some(PathBuf::from("/t")),
            ..base.clone()
        };
        assert!(both_tokens.validate().is_err());

        let token_and_key = PipelineConfig {
            access_token_file: Some(PathBuf::from("/t")),
            service_account_file: Some(PathBuf::from("/k.json")),
            ..base
        };
        assert!(token_and_key.validate().is_err());
    }
}
