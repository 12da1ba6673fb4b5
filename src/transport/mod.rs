// SPDX-License-Identifier: Apache-2.0

//! Delivery of row batches to the remote table store.
//!
//! [`Transport`] lives on the pipeline loop and owns the [`TableCache`]. Insert calls run
//! as spawned tasks that only talk to the [`TableService`]; whatever they learn about
//! existing tables travels back in the [`InsertOutcome`] and is merged into the cache
//! on the loop.

pub mod auth;
pub mod bigquery;
mod error;
pub mod http_client;
mod retry;
mod service;
pub mod tls;

pub use error::{ServiceError, TransportError};
pub use retry::{RETRY_DELAY, Retry, RetryPolicy, SYNC_ATTEMPTS, classify};
pub use service::{InsertAllResponse, InsertError, InsertRow, RowError, TableService};

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::task::JoinHandle;
use tower::retry::Retry as RetryService;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;

/// Attempts made by the asynchronous insert path: the call plus one delayed retry.
pub const ASYNC_ATTEMPTS: u32 = 2;

/// Tables known to exist remotely. May be stale; a racing create is harmless.
#[derive(Debug, Default)]
pub struct TableCache {
    known: HashSet<String>,
}

impl TableCache {
    pub fn contains(&self, table: &str) -> bool {
        self.known.contains(table)
    }

    pub fn extend(&mut self, tables: impl IntoIterator<Item = String>) {
        self.known.extend(tables);
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// The result of one insert call and its retries.
#[derive(Debug)]
pub struct InsertOutcome {
    pub upload_id: String,
    pub table: String,
    pub rows: Vec<InsertRow>,
    pub result: Result<InsertAllResponse, ServiceError>,
    /// Tables observed to exist while making the call.
    pub tables: Vec<String>,
}

/// Refresh the table list and create `table` if it is missing.
///
/// Returns every table known to exist afterwards.
async fn ensure_table<S: TableService>(
    service: &S,
    fields: &Value,
    table: &str,
) -> Result<Vec<String>, TransportError> {
    let mut tables = service.list_tables().await?;
    if tables.iter().any(|t| t == table) {
        return Ok(tables);
    }

    info!(table, "Creating table");
    service.create_table(table, fields).await?;
    tables.push(table.to_string());
    Ok(tables)
}

/// Progress of one insert, shared by every attempt.
#[derive(Debug, Default)]
struct Progress {
    attempts: AtomicU32,
    table_known: AtomicBool,
    observed: Mutex<Vec<String>>,
}

impl Progress {
    fn observe(&self, tables: Vec<String>) {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tables);
    }

    fn take_observed(&self) -> Vec<String> {
        std::mem::take(&mut *self.observed.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// One insert as seen by the retry layer. Clones share rows and progress.
#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub upload_id: String,
    pub table: String,
    rows: Arc<Vec<InsertRow>>,
    progress: Arc<Progress>,
}

impl InsertRequest {
    pub fn new(table: String, rows: Vec<InsertRow>, upload_id: String) -> Self {
        Self {
            upload_id,
            table,
            rows: Arc::new(rows),
            progress: Arc::new(Progress::default()),
        }
    }

    fn into_rows(self) -> Vec<InsertRow> {
        Arc::try_unwrap(self.rows).unwrap_or_else(|rows| rows.as_ref().clone())
    }
}

/// Makes a single insert attempt, creating the table first if it is not known yet.
#[derive(Clone)]
pub struct InsertService<S> {
    service: S,
    fields: Arc<Value>,
}

impl<S: TableService> Service<InsertRequest> for InsertService<S> {
    type Response = InsertAllResponse;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: InsertRequest) -> Self::Future {
        let service = self.service.clone();
        let fields = self.fields.clone();
        Box::pin(async move {
            let progress = &req.progress;
            progress.attempts.fetch_add(1, Ordering::Relaxed);
            if !progress.table_known.load(Ordering::Relaxed) {
                progress.observe(ensure_table(&service, &fields, &req.table).await?);
                progress.table_known.store(true, Ordering::Relaxed);
            }
            service.insert_all(&req.table, &req.rows).await
        })
    }
}

/// An insert call detached from the pipeline loop so it can run on a worker task.
pub struct InsertCall<S> {
    service: InsertService<S>,
    request: InsertRequest,
}

impl<S: TableService> InsertCall<S> {
    /// Make the call, retrying transient failures until `max_attempts` calls were made.
    pub async fn run(self, max_attempts: u32) -> InsertOutcome {
        let InsertCall { service, request } = self;
        let result = RetryService::new(RetryPolicy::new(max_attempts), service)
            .oneshot(request.clone())
            .await;

        let attempts = request.progress.attempts.load(Ordering::Relaxed);
        let result = result.map_err(|e| {
            if classify(&e).retryable {
                error!(upload_id = %request.upload_id, table = %request.table, attempts, error = %e, "Insert retries exhausted");
                ServiceError::Exhausted { attempts, last: e }
            } else {
                error!(upload_id = %request.upload_id, table = %request.table, error = %e, "Insert failed");
                ServiceError::Permanent(e)
            }
        });

        let tables = request.progress.take_observed();
        InsertOutcome {
            upload_id: request.upload_id.clone(),
            table: request.table.clone(),
            rows: request.into_rows(),
            result,
            tables,
        }
    }
}

pub struct Transport<S> {
    service: S,
    fields: Arc<Value>,
    cache: TableCache,
}

impl<S: TableService> Transport<S> {
    /// `fields` is the field list used when a table has to be created.
    pub fn new(service: S, fields: Value) -> Self {
        Self {
            service,
            fields: Arc::new(fields),
            cache: TableCache::default(),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    pub fn is_known(&self, table: &str) -> bool {
        self.cache.contains(table)
    }

    pub fn mark_known(&mut self, tables: impl IntoIterator<Item = String>) {
        self.cache.extend(tables);
    }

    pub async fn update_table_list(&mut self) -> Result<usize, TransportError> {
        let tables = self.service.list_tables().await?;
        self.cache.extend(tables);
        debug!(tables = self.cache.len(), "Updated table list");
        Ok(self.cache.len())
    }

    /// Make sure `table` exists, creating it if needed. An existing table counts as
    /// success; any other failure is returned.
    pub async fn ensure_table(&mut self, table: &str) -> Result<(), TransportError> {
        if self.cache.contains(table) {
            return Ok(());
        }
        let tables = ensure_table(&self.service, &self.fields, table).await?;
        self.cache.extend(tables);
        Ok(())
    }

    pub fn insert_call(&self, table: String, rows: Vec<InsertRow>, upload_id: String) -> InsertCall<S> {
        let request = InsertRequest::new(table, rows, upload_id);
        request
            .progress
            .table_known
            .store(self.cache.contains(&request.table), Ordering::Relaxed);
        InsertCall {
            service: InsertService {
                service: self.service.clone(),
                fields: self.fields.clone(),
            },
            request,
        }
    }

    /// Start an insert on a worker task. The outcome is delivered on `results`.
    ///
    /// A transient failure is retried once after the classified delay.
    pub fn insert_batch(
        &self,
        table: String,
        rows: Vec<InsertRow>,
        upload_id: String,
        results: BoundedSender<InsertOutcome>,
    ) -> JoinHandle<()> {
        let call = self.insert_call(table, rows, upload_id);
        tokio::spawn(async move {
            let outcome = call.run(ASYNC_ATTEMPTS).await;
            if results.send(outcome).await.is_err() {
                warn!("Upload result receiver closed, dropping outcome");
            }
        })
    }

    /// Run an insert to completion, retrying transient failures up to
    /// [`SYNC_ATTEMPTS`] times. Used when flushing.
    ///
    /// The call runs on a worker task so retry delays never stall other pipelines.
    pub async fn insert_batch_sync(
        &mut self,
        table: String,
        rows: Vec<InsertRow>,
        upload_id: String,
    ) -> InsertOutcome {
        let call = self.insert_call(table.clone(), rows.clone(), upload_id.clone());
        let outcome = match tokio::spawn(call.run(SYNC_ATTEMPTS)).await {
            Ok(outcome) => outcome,
            Err(e) => InsertOutcome {
                upload_id,
                table,
                rows,
                result: Err(ServiceError::Permanent(TransportError::Request(format!(
                    "insert task failed: {}",
                    e
                )))),
                tables: Vec::new(),
            },
        };
        self.cache.extend(outcome.tables.iter().cloned());
        outcome
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::bounded_channel::bounded;
    use serde_json::{Map, json};

    fn rows(n: usize) -> Vec<InsertRow> {
        (0..n)
            .map(|i| InsertRow {
                insert_id: format!("id{}", i),
                json: Map::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ensure_table_creates_once() {
        let svc = MockService::with_tables(&["existing"]);
        let mut transport = Transport::new(svc.clone(), json!([]));

        transport.ensure_table("existing").await.unwrap();
        assert!(svc.created().is_empty());

        transport.ensure_table("fresh").await.unwrap();
        transport.ensure_table("fresh").await.unwrap();
        assert_eq!(svc.created(), vec!["fresh"]);
        assert!(transport.is_known("fresh"));
    }

    #[tokio::test]
    async fn test_ensure_table_propagates_failure() {
        let svc = MockService::default();
        svc.state.lock().unwrap().create_error = Some(http_error(400));
        let mut transport = Transport::new(svc, json!([]));

        let err = transport.ensure_table("t").await.unwrap_err();
        assert_eq!(err.status().map(|s| s.as_u16()), Some(400));
        assert!(!transport.is_known("t"));
    }

    #[tokio::test]
    async fn test_sync_insert_creates_missing_table() {
        let svc = MockService::default();
        let mut transport = Transport::new(svc.clone(), json!([]));

        let outcome = transport
            .insert_batch_sync("t1".into(), rows(2), "u1".into())
            .await;
        assert!(outcome.result.unwrap().is_complete());
        assert_eq!(svc.created(), vec!["t1"]);
        assert!(transport.is_known("t1"));

        transport
            .insert_batch_sync("t1".into(), rows(1), "u2".into())
            .await
            .result
            .unwrap();
        assert_eq!(svc.state.lock().unwrap().list_calls, 1);
        assert_eq!(svc.inserts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_insert_exhausts_attempts() {
        let svc = MockService::with_tables(&["t1"]);
        for _ in 0..SYNC_ATTEMPTS {
            svc.push_insert(Err(http_error(503)));
        }
        let mut transport = Transport::new(svc.clone(), json!([]));

        let outcome = transport
            .insert_batch_sync("t1".into(), rows(3), "u1".into())
            .await;
        match outcome.result {
            Err(ServiceError::Exhausted { attempts, .. }) => assert_eq!(attempts, SYNC_ATTEMPTS),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(svc.inserts().len(), SYNC_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_table_setup_once_done() {
        let svc = MockService::default();
        svc.push_insert(Err(http_error(503)));
        let mut transport = Transport::new(svc.clone(), json!([]));

        let outcome = transport
            .insert_batch_sync("t1".into(), rows(2), "u1".into())
            .await;
        assert!(outcome.result.unwrap().is_complete());
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.tables, vec!["t1"]);
        assert_eq!(svc.state.lock().unwrap().list_calls, 1);
        assert_eq!(svc.created(), vec!["t1"]);
        assert_eq!(svc.inserts().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_insert_permanent_failure_is_not_retried() {
        let svc = MockService::with_tables(&["t1"]);
        svc.push_insert(Err(http_error(400)));
        let mut transport = Transport::new(svc.clone(), json!([]));

        let outcome = transport
            .insert_batch_sync("t1".into(), rows(1), "u1".into())
            .await;
        assert!(matches!(outcome.result, Err(ServiceError::Permanent(_))));
        assert_eq!(svc.inserts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_insert_retries_once() {
        let svc = MockService::with_tables(&["t1"]);
        svc.push_insert(Err(http_error(503)));
        svc.push_insert(Err(http_error(503)));
        svc.push_insert(Err(http_error(503)));
        let mut transport = Transport::new(svc.clone(), json!([]));
        transport.update_table_list().await.unwrap();

        let (tx, mut rx) = bounded(4);
        transport.insert_batch("t1".into(), rows(2), "u1".into(), tx);
        let outcome = rx.next().await.unwrap();

        assert_eq!(outcome.upload_id, "u1");
        assert!(matches!(
            outcome.result,
            Err(ServiceError::Exhausted { attempts: ASYNC_ATTEMPTS, .. })
        ));
        assert_eq!(svc.inserts().len(), 2);
    }

    #[tokio::test]
    async fn test_async_insert_reports_observed_tables() {
        let svc = MockService::with_tables(&["other"]);
        let transport = Transport::new(svc.clone(), json!([]));

        let (tx, mut rx) = bounded(4);
        transport.insert_batch("t1".into(), rows(1), "u1".into(), tx);
        let outcome = rx.next().await.unwrap();

        assert!(outcome.result.is_ok());
        assert!(outcome.tables.contains(&"t1".to_string()));
        assert!(outcome.tables.contains(&"other".to_string()));
        assert!(!transport.is_known("t1"));
    }
}
