// SPDX-License-Identifier: Apache-2.0

//! One tailer feeding one uploader, driven by a single task.
//!
//! The pipeline task owns every piece of mutable state (read progress, the row buffer
//! and the table cache). Upload tasks only report back through the results channel, so
//! nothing here is shared or locked.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tokio::select;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bounded_channel::{BoundedReceiver, bounded};
use crate::error::{ConfigError, Error};
use crate::init::config::PipelineConfig;
use crate::schema::Schema;
use crate::schema::hooks::{DefaultDomain, ExpandCompositeKeys, SplitPid};
use crate::state::StateStore;
use crate::tailer::watcher::create_watcher;
use crate::tailer::{Producer, Tailer};
use crate::transport::auth::TokenSource;
use crate::transport::bigquery::BigQueryService;
use crate::transport::http_client::HttpClient;
use crate::transport::{InsertOutcome, TableService, Transport, tls};
use crate::uploader::{DeadLetter, Uploader, UploaderConfig};

const RESULTS_QUEUE_SIZE: usize = 1_000;
const CLOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

const HOST_FIELDS: &[&str] = &["host", "src.host", "dst.host"];

/// Timers driving a running pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Load the schema file and install the record fix-ups used for syslog style input:
/// dotted keys expand into nested records, bare host names get `default_domain`, and
/// `pid` fields are normalized. Only fields the schema declares are touched.
pub fn load_schema(
    path: &Path,
    config: &PipelineConfig,
) -> Result<Schema, Error> {
    let text = fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut schema = Schema::from_json(&text, config.default_tz()?)?;

    schema.set_load_hook(ExpandCompositeKeys);
    if let Some(domain) = &config.default_domain {
        let declared: Vec<&str> = HOST_FIELDS
            .iter()
            .copied()
            .filter(|f| schema.contains(f))
            .collect();
        for field in declared {
            schema.set_field_validator(field, DefaultDomain::new(domain.clone()))?;
        }
    }
    if schema.contains("pid") {
        schema.set_field_validator("pid", SplitPid)?;
    }
    Ok(schema)
}

fn build_service(config: &PipelineConfig) -> Result<BigQueryService, Error> {
    let mut tls_config = tls::Config::builder();
    if let Some(ca_file) = &config.ca_file {
        tls_config = tls_config.with_ca_file(ca_file);
    }
    let tls_config = tls_config
        .build()
        .map_err(|e| Error::Transport(e.to_string()))?;
    let client = HttpClient::build(tls_config, config.request_timeout)
        .map_err(|e| Error::Transport(e.to_string()))?;

    let project = config
        .project_id
        .clone()
        .ok_or(ConfigError::Missing("project_id"))?;
    let dataset = config
        .dataset
        .clone()
        .ok_or(ConfigError::Missing("dataset"))?;

    let tokens = TokenSource::new(config.credentials()?, &client)
        .map_err(|e| ConfigError::invalid("service_account_file", e.to_string()))?;

    BigQueryService::new(client, &config.endpoint, project, dataset, tokens)
        .map_err(|e| ConfigError::invalid("endpoint", e.to_string()).into())
}

pub struct Pipeline<S> {
    name: String,
    tailer: Tailer,
    uploader: Uploader<S>,
    results: BoundedReceiver<InsertOutcome>,
    timing: Timing,
}

impl Pipeline<BigQueryService> {
    /// Construct every component of a pipeline. Any failure here is fatal: the schema,
    /// state file and watch directories must all be usable before tailing begins.
    pub fn build(name: &str, config: &PipelineConfig) -> Result<Self, Error> {
        config.validate()?;

        let schema_path = config.schema_path(name)?;
        let schema = load_schema(&schema_path, config)?;

        let service = build_service(config)?;
        let transport = Transport::new(service, schema.document().clone());

        let state_path = config.state_path(name)?;
        if let Some(parent) = state_path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let state = StateStore::open(&state_path)?;

        let watcher = create_watcher(config.watch_mode, config.poll_interval)?;
        let mut tailer = Tailer::new(state, watcher);
        let pattern = config.pattern()?;
        for dir in &config.directories {
            tailer.watch(dir, pattern.clone(), config.recursive)?;
        }

        let dead_letter = DeadLetter::new(config.failed_lines_path()?);
        let timing = Timing {
            flush_interval: config.flush_interval,
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        };

        info!(
            pipeline = name,
            schema = ?schema_path,
            state = ?state_path,
            failed_lines = ?dead_letter.path(),
            "Pipeline configured"
        );
        Pipeline::new(
            name,
            schema,
            transport,
            tailer,
            config.uploader_config()?,
            dead_letter,
            timing,
        )
    }
}

impl<S: TableService> Pipeline<S> {
    pub fn new(
        name: &str,
        schema: Schema,
        transport: Transport<S>,
        tailer: Tailer,
        config: UploaderConfig,
        dead_letter: DeadLetter,
        timing: Timing,
    ) -> Result<Self, Error> {
        let (results_tx, results) = bounded(RESULTS_QUEUE_SIZE);
        let uploader = Uploader::new(schema, transport, config, dead_letter, results_tx)?;

        Ok(Self {
            name: name.to_string(),
            tailer,
            uploader,
            results,
            timing,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tail and upload until `cancel` fires, then flush everything buffered and wait
    /// (bounded by the shutdown timeout) for uploads in flight.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), tower::BoxError> {
        let Pipeline {
            name,
            mut tailer,
            mut uploader,
            mut results,
            timing,
        } = self;

        tailer.start();
        uploader.start(&mut tailer).await;
        tailer.clean_state();
        tailer.scan_backlog(&mut uploader);
        info!(pipeline = %name, "Pipeline running");

        let mut poll = interval(timing.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = interval_at(
            Instant::now() + timing.flush_interval,
            timing.flush_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clock = interval_at(
            Instant::now() + CLOCK_REFRESH_INTERVAL,
            CLOCK_REFRESH_INTERVAL,
        );

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(pipeline = %name, "Pipeline received shutdown signal");
                    break;
                },

                Some(outcome) = results.next() => {
                    uploader.on_upload_result(outcome, &mut tailer);
                },

                _ = poll.tick() => {
                    if !tailer.is_paused() {
                        tailer.drain_events(&mut uploader);
                    }
                },

                _ = flush.tick() => {
                    uploader.upload(&mut tailer);
                },

                _ = clock.tick() => {
                    uploader.refresh_clock();
                },
            }
        }

        info!(
            pipeline = %name,
            buffered = uploader.buffered(),
            outstanding = uploader.outstanding(),
            "Flushing pipeline"
        );
        uploader
            .drain(&mut results, timing.shutdown_timeout, &mut tailer)
            .await;
        info!(pipeline = %name, "Pipeline stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const SCHEMA: &str = r#"[
        {"name": "host", "type": "STRING"},
        {"name": "pid", "type": "INTEGER"},
        {"name": "pname", "type": "STRING"},
        {"name": "src", "type": "RECORD", "fields": [
            {"name": "host", "type": "STRING"},
            {"name": "port", "type": "INTEGER"}
        ]}
    ]"#;

    fn config(domain: Option<&str>) -> PipelineConfig {
        PipelineConfig {
            default_domain: domain.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_schema_installs_fixups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.json");
        fs::write(&path, SCHEMA).unwrap();

        let schema = load_schema(&path, &config(Some("example.com"))).unwrap();
        let record = schema
            .decode(r#"{"host": "web1", "pid": "sshd[42]", "src.host": "db", "src.port": "22"}"#)
            .unwrap();

        assert_eq!(
            json!(record.fields),
            json!({
                "host": "web1.example.com",
                "pid": 42,
                "pname": "sshd",
                "src": {"host": "db.example.com", "port": 22}
            })
        );
    }

    #[test]
    fn test_load_schema_without_domain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schema.json");
        fs::write(&path, SCHEMA).unwrap();

        let schema = load_schema(&path, &config(None)).unwrap();
        let record = schema.decode(r#"{"host": "web1"}"#).unwrap();
        assert_eq!(record.fields.get("host"), Some(&json!("web1")));
    }

    #[test]
    fn test_load_schema_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_schema(&dir.path().join("nope.json"), &config(None)).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_build_rejects_incomplete_config() {
        let err = Pipeline::build("web", &PipelineConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::Missing("directories"))));
    }
}
