// SPDX-License-Identifier: Apache-2.0

//! Batching uploader.
//!
//! Turns lines from the tailer into validated rows, buffers them in arrival order and
//! ships them to the transport in per-table batches. Two independent limits push back
//! on the tailer: the number of buffered rows (`max_buffer`) and the number of
//! asynchronous uploads in flight (`max_outstanding`).
//!
//! Outcomes of asynchronous uploads come back through a channel and are applied with
//! [`Uploader::on_upload_result`] on the pipeline loop. Rows the table store rejects
//! for transient reasons are retried; rows it rejects as invalid, and batches that
//! fail outright, are written to the [`DeadLetter`] file.

mod dead_letter;
mod table_name;

pub use dead_letter::DeadLetter;
pub use table_name::{DEFAULT_TABLE_NAME_FORMAT, TableNameFormat};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::error::ConfigError;
use crate::schema::{Record, Schema};
use crate::tailer::{LineConsumer, Producer};
use crate::transport::{InsertAllResponse, InsertOutcome, InsertRow, TableService, Transport};

/// Largest batch the table store accepts in one insert call.
pub const MAX_BATCH_SIZE: usize = 500;

/// Row error reasons worth retrying.
const RETRYABLE_REASONS: &[&str] = &["backendError", "timeout", "stopped"];

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub batch_size: usize,
    pub max_buffer: usize,
    pub max_outstanding: usize,
    /// Insert attempts a row gets before it is written to the dead-letter file.
    pub max_row_attempts: u32,
    pub table_name_format: TableNameFormat,
    pub default_tz: Tz,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            max_buffer: 1000,
            max_outstanding: 30,
            max_row_attempts: 5,
            table_name_format: TableNameFormat::default(),
            default_tz: Tz::UTC,
        }
    }
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "batch_size",
                format!("must be between 1 and {}", MAX_BATCH_SIZE),
            ));
        }
        if self.max_buffer == 0 {
            return Err(ConfigError::invalid("max_buffer", "must be at least 1"));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::invalid("max_outstanding", "must be at least 1"));
        }
        if self.max_row_attempts == 0 {
            return Err(ConfigError::invalid("max_row_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

/// A validated row waiting to be uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRow {
    pub table: String,
    pub insert_id: String,
    pub fields: Map<String, Value>,
    /// Insert attempts already made for this row.
    pub attempts: u32,
}

impl From<BufferedRow> for InsertRow {
    fn from(row: BufferedRow) -> Self {
        InsertRow {
            insert_id: row.insert_id,
            json: row.fields,
        }
    }
}

struct Outstanding {
    started: Instant,
    attempts: u32,
}

fn new_upload_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn to_datetime(epoch_seconds: f64, tz: Tz) -> Option<DateTime<Tz>> {
    if !epoch_seconds.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis((epoch_seconds * 1000.0) as i64)
        .map(|t| t.with_timezone(&tz))
}

/// Split a partially failed batch into rows to retry and rows to drop.
///
/// A row is retried only when every error reported for it has a retryable reason.
/// Rows without errors were stored and appear in neither list. Error indexes outside
/// the batch are logged and ignored.
fn partition(
    upload_id: &str,
    rows: Vec<InsertRow>,
    resp: &InsertAllResponse,
) -> (Vec<InsertRow>, Vec<InsertRow>) {
    let mut verdicts: BTreeMap<usize, bool> = BTreeMap::new();

    for insert_error in &resp.insert_errors {
        let index = insert_error.index;
        if index >= rows.len() {
            error!(
                upload_id,
                index,
                rows = rows.len(),
                errors = ?insert_error.errors,
                "Insert error index out of data range"
            );
            continue;
        }

        let retryable = !insert_error.errors.is_empty()
            && insert_error
                .errors
                .iter()
                .all(|e| RETRYABLE_REASONS.contains(&e.reason.as_str()));
        if retryable {
            warn!(upload_id, index, errors = ?insert_error.errors, "Row insert failed, retrying");
        } else {
            error!(
                upload_id,
                index,
                errors = ?insert_error.errors,
                row = ?rows[index].json,
                "Fatal insert error, dropping row"
            );
        }

        let verdict = verdicts.entry(index).or_insert(true);
        *verdict &= retryable;
    }

    let mut retry = Vec::new();
    let mut dropped = Vec::new();
    for (index, row) in rows.into_iter().enumerate() {
        match verdicts.get(&index) {
            Some(true) => retry.push(row),
            Some(false) => dropped.push(row),
            None => {}
        }
    }
    (retry, dropped)
}

pub struct Uploader<S> {
    schema: Schema,
    transport: Transport<S>,
    config: UploaderConfig,
    dead_letter: DeadLetter,
    results: BoundedSender<InsertOutcome>,
    carry: Vec<u8>,
    rows: VecDeque<BufferedRow>,
    outstanding: HashMap<String, Outstanding>,
    now: DateTime<Tz>,
    shutting_down: bool,
}

impl<S: TableService> Uploader<S> {
    /// Outcomes of asynchronous uploads are sent on `results`; the receiving end must be
    /// fed back through [`Uploader::on_upload_result`].
    pub fn new(
        schema: Schema,
        transport: Transport<S>,
        config: UploaderConfig,
        dead_letter: DeadLetter,
        results: BoundedSender<InsertOutcome>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = Utc::now().with_timezone(&config.default_tz);

        Ok(Self {
            schema,
            transport,
            config,
            dead_letter,
            results,
            carry: Vec::new(),
            rows: VecDeque::new(),
            outstanding: HashMap::new(),
            now,
            shutting_down: false,
        })
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn buffered(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> impl Iterator<Item = &BufferedRow> {
        self.rows.iter()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Refresh the cached wall-clock time used to route records without a `time` field.
    pub fn refresh_clock(&mut self) {
        self.now = Utc::now().with_timezone(&self.config.default_tz);
        debug!(now = %self.now, "Refreshed clock");
    }

    /// Load the list of existing tables and let the producer start.
    pub async fn start(&mut self, producer: &mut dyn Producer) {
        self.refresh_clock();
        match self.transport.update_table_list().await {
            Ok(tables) => debug!(tables, "Loaded table list"),
            Err(e) => warn!(error = %e, "Unable to list tables, they will be created on demand"),
        }

        info!(
            batch_size = self.config.batch_size,
            max_buffer = self.config.max_buffer,
            max_outstanding = self.config.max_outstanding,
            table_name_format = self.config.table_name_format.as_str(),
            "Uploader started"
        );
        producer.resume_producing(self);
    }

    fn table_for(&self, fields: &Map<String, Value>) -> String {
        let time = fields
            .get("time")
            .and_then(Value::as_f64)
            .and_then(|secs| to_datetime(secs, self.config.default_tz));

        match time {
            Some(t) => self.config.table_name_format.render(&t),
            None => self.config.table_name_format.render(&self.now),
        }
    }

    /// Buffer a decoded record, uploading a batch once enough rows are waiting and
    /// pausing `producer` once the buffer is full.
    pub fn add_record(&mut self, record: Record, producer: &mut dyn Producer) {
        let Record {
            mut fields,
            fingerprint,
        } = record;

        let table = match fields.remove("table") {
            Some(Value::String(table)) if !table.is_empty() => table,
            _ => self.table_for(&fields),
        };

        self.rows.push_back(BufferedRow {
            table,
            insert_id: fingerprint,
            fields,
            attempts: 0,
        });

        if self.rows.len() >= self.config.batch_size {
            self.upload(producer);
        }
        if self.rows.len() >= self.config.max_buffer && !producer.is_paused() {
            info!(buffered = self.rows.len(), "Buffer full, pausing producer");
            producer.pause_producing();
        }
    }

    /// Take up to one batch off the front of the buffer, grouped by table in order of
    /// first appearance.
    fn take_batch(&mut self) -> Vec<(String, Vec<BufferedRow>)> {
        let n = self.rows.len().min(self.config.batch_size);
        let mut batches: Vec<(String, Vec<BufferedRow>)> = Vec::new();

        for row in self.rows.drain(..n) {
            match batches.iter_mut().find(|(table, _)| *table == row.table) {
                Some((_, rows)) => rows.push(row),
                None => batches.push((row.table.clone(), vec![row])),
            }
        }
        batches
    }

    fn maybe_resume(&mut self, producer: &mut dyn Producer) {
        if !self.shutting_down
            && producer.is_paused()
            && self.rows.len() < self.config.max_buffer
            && self.outstanding.len() < self.config.max_outstanding
        {
            debug!(
                buffered = self.rows.len(),
                outstanding = self.outstanding.len(),
                "Resuming producer"
            );
            producer.resume_producing(self);
        }
    }

    /// Send one batch per table asynchronously. Does nothing once shutdown has begun;
    /// the flush path takes over then.
    pub fn upload(&mut self, producer: &mut dyn Producer) {
        if self.shutting_down {
            debug!("Upload called during shutdown");
            return;
        }
        if self.rows.is_empty() {
            return;
        }

        let batches = self.take_batch();
        self.maybe_resume(producer);

        for (table, rows) in batches {
            let upload_id = new_upload_id();
            let attempts = rows.iter().map(|r| r.attempts).max().unwrap_or(0);
            let rows: Vec<InsertRow> = rows.into_iter().map(InsertRow::from).collect();

            debug!(upload_id = %upload_id, table = %table, rows = rows.len(), "Uploading batch");
            self.outstanding.insert(
                upload_id.clone(),
                Outstanding {
                    started: Instant::now(),
                    attempts,
                },
            );
            self.transport
                .insert_batch(table, rows, upload_id, self.results.clone());
        }

        if self.outstanding.len() > self.config.max_outstanding && !producer.is_paused() {
            warn!(
                outstanding = self.outstanding.len(),
                "Too many uploads in flight, pausing producer"
            );
            producer.pause_producing();
        }
    }

    fn requeue(&mut self, table: &str, rows: Vec<InsertRow>, attempts: u32) {
        self.rows.extend(rows.into_iter().map(|row| BufferedRow {
            table: table.to_string(),
            insert_id: row.insert_id,
            fields: row.json,
            attempts,
        }));
    }

    fn complete(&mut self, upload_id: &str, producer: &mut dyn Producer) {
        match self.outstanding.remove(upload_id) {
            Some(entry) => info!(
                upload_id,
                elapsed = ?entry.started.elapsed(),
                "Upload complete"
            ),
            None => info!(upload_id, "Upload complete"),
        }
        self.maybe_resume(producer);
    }

    /// Apply the outcome of an asynchronous upload.
    pub fn on_upload_result(&mut self, outcome: InsertOutcome, producer: &mut dyn Producer) {
        let InsertOutcome {
            upload_id,
            table,
            rows,
            result,
            tables,
        } = outcome;
        self.transport.mark_known(tables);

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    upload_id = %upload_id,
                    table = %table,
                    rows = rows.len(),
                    error = %e,
                    "Removing failed upload from queue"
                );
                self.dead_letter.write(&upload_id, &rows);
                self.complete(&upload_id, producer);
                return;
            }
        };

        let (retry, dropped) = partition(&upload_id, rows, &resp);
        self.dead_letter.write(&upload_id, &dropped);
        if retry.is_empty() {
            self.complete(&upload_id, producer);
            return;
        }

        let attempts = self
            .outstanding
            .get(&upload_id)
            .map_or(0, |entry| entry.attempts)
            + 1;
        if attempts >= self.config.max_row_attempts {
            error!(
                upload_id = %upload_id,
                table = %table,
                rows = retry.len(),
                attempts,
                "Rows still failing, giving up"
            );
            self.dead_letter.write(&upload_id, &retry);
            self.complete(&upload_id, producer);
            return;
        }

        if self.shutting_down {
            warn!(
                upload_id = %upload_id,
                rows = retry.len(),
                "Adding rows back into the queue for the final flush"
            );
            self.outstanding.remove(&upload_id);
            self.requeue(&table, retry, attempts);
            return;
        }

        info!(upload_id = %upload_id, table = %table, rows = retry.len(), "Retrying rows from upload");
        self.outstanding
            .entry(upload_id.clone())
            .or_insert_with(|| Outstanding {
                started: Instant::now(),
                attempts: 0,
            })
            .attempts = attempts;
        self.transport
            .insert_batch(table, retry, upload_id, self.results.clone());
    }

    fn on_flush_result(&mut self, outcome: InsertOutcome, attempts: u32) {
        let InsertOutcome {
            upload_id,
            table,
            rows,
            result,
            ..
        } = outcome;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    upload_id = %upload_id,
                    table = %table,
                    rows = rows.len(),
                    error = %e,
                    "Flush upload failed"
                );
                self.dead_letter.write(&upload_id, &rows);
                return;
            }
        };

        let (retry, dropped) = partition(&upload_id, rows, &resp);
        self.dead_letter.write(&upload_id, &dropped);
        if retry.is_empty() {
            info!(upload_id = %upload_id, "Upload complete");
            return;
        }

        let attempts = attempts + 1;
        if attempts >= self.config.max_row_attempts {
            error!(
                upload_id = %upload_id,
                table = %table,
                rows = retry.len(),
                attempts,
                "Rows still failing, giving up"
            );
            self.dead_letter.write(&upload_id, &retry);
            return;
        }

        warn!(
            upload_id = %upload_id,
            rows = retry.len(),
            "Adding rows back into the queue, they will get a new upload id"
        );
        self.requeue(&table, retry, attempts);
    }

    /// Upload one batch synchronously, ignoring the in-flight cap.
    pub async fn upload_flush(&mut self) {
        for (table, rows) in self.take_batch() {
            let upload_id = new_upload_id();
            let attempts = rows.iter().map(|r| r.attempts).max().unwrap_or(0);
            let rows: Vec<InsertRow> = rows.into_iter().map(InsertRow::from).collect();

            debug!(upload_id = %upload_id, table = %table, rows = rows.len(), "Uploading batch synchronously");
            let outcome = self
                .transport
                .insert_batch_sync(table, rows, upload_id)
                .await;
            self.on_flush_result(outcome, attempts);
        }
    }

    /// Pause the producer and upload everything buffered. After this, [`Uploader::upload`]
    /// does nothing.
    pub async fn flush(&mut self, producer: &mut dyn Producer) {
        producer.pause_producing();
        self.shutting_down = true;

        if !self.rows.is_empty() {
            info!(rows = self.rows.len(), "Flushing buffer");
        }
        while !self.rows.is_empty() {
            self.upload_flush().await;
        }
    }

    /// Final shutdown: flush the buffer, then wait up to `timeout` for asynchronous
    /// uploads still in flight, flushing any rows they hand back.
    pub async fn drain(
        &mut self,
        results: &mut BoundedReceiver<InsertOutcome>,
        timeout: Duration,
        producer: &mut dyn Producer,
    ) {
        self.flush(producer).await;

        let deadline = Instant::now() + timeout;
        while !self.outstanding.is_empty() {
            match tokio::time::timeout_at(deadline, results.next()).await {
                Ok(Some(outcome)) => {
                    self.on_upload_result(outcome, producer);
                    self.flush(producer).await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = self.outstanding.len(),
                        "Timed out waiting for uploads in flight"
                    );
                    break;
                }
            }
        }
    }
}

impl<S: TableService> LineConsumer for Uploader<S> {
    /// Accepts arbitrary chunks; a trailing fragment without a newline is kept until
    /// the rest of its line arrives.
    fn write(&mut self, data: &[u8], producer: &mut dyn Producer) {
        self.carry.extend_from_slice(data);
        let Some(end) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let complete: Vec<u8> = self.carry.drain(..=end).collect();

        for line in complete.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match self.schema.decode(line) {
                Ok(record) => self.add_record(record, producer),
                Err(e) => error!(error = %e, line, "Unable to decode line"),
            }
        }
    }
}
