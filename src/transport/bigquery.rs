// SPDX-License-Identifier: Apache-2.0

//! [`TableService`] backed by the BigQuery v2 REST API.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::auth::TokenSource;
use super::error::TransportError;
use super::http_client::HttpClient;
use super::service::{InsertAllResponse, InsertRow, TableService};

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Clone)]
pub struct BigQueryService {
    inner: Arc<Inner>,
}

struct Inner {
    client: HttpClient,
    endpoint: Url,
    project: String,
    dataset: String,
    tokens: TokenSource,
}

#[derive(Deserialize)]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct TableListEntry {
    #[serde(rename = "tableReference")]
    table_reference: TableReference,
}

#[derive(Deserialize)]
struct TableReference {
    #[serde(rename = "tableId")]
    table_id: String,
}

#[derive(Serialize)]
struct InsertAllRequest<'a> {
    kind: &'static str,
    rows: &'a [InsertRow],
}

impl BigQueryService {
    pub fn new(
        client: HttpClient,
        endpoint: &str,
        project: impl Into<String>,
        dataset: impl Into<String>,
        tokens: TokenSource,
    ) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint,
                project: project.into(),
                dataset: dataset.into(),
                tokens,
            }),
        })
    }

    fn tables_url(&self, rest: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.inner.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Request("endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend([
                "projects",
                self.inner.project.as_str(),
                "datasets",
                self.inner.dataset.as_str(),
                "tables",
            ])
            .extend(rest);
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
    ) -> Result<Bytes, TransportError> {
        let token = self.inner.tokens.token().await?;
        self.inner
            .client
            .request(method, url.as_str(), token.as_deref(), body)
            .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Request(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body).map_err(|e| TransportError::Decode(e.to_string()))
}

impl TableService for BigQueryService {
    async fn list_tables(&self) -> Result<Vec<String>, TransportError> {
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.tables_url(&[])?;
            url.query_pairs_mut().append_pair("maxResults", "1000");
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let body = self.call(Method::GET, url, None).await?;
            let page: TableList = decode(&body)?;
            tables.extend(
                page.tables
                    .into_iter()
                    .map(|t| t.table_reference.table_id),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(tables = tables.len(), "Listed tables");
        Ok(tables)
    }

    async fn create_table(&self, table: &str, fields: &Value) -> Result<(), TransportError> {
        let body = json!({
            "tableReference": {
                "projectId": self.inner.project,
                "datasetId": self.inner.dataset,
                "tableId": table,
            },
            "schema": { "fields": fields },
        });

        let url = self.tables_url(&[])?;
        match self.call(Method::POST, url, Some(encode(&body)?)).await {
            Ok(_) => Ok(()),
            Err(TransportError::Http { status, .. }) if status == StatusCode::CONFLICT => {
                debug!(table, "Table already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_all(
        &self,
        table: &str,
        rows: &[InsertRow],
    ) -> Result<InsertAllResponse, TransportError> {
        let request = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            rows,
        };
        let url = self.tables_url(&[table, "insertAll"])?;
        let body = self.call(Method::POST, url, Some(encode(&request)?)).await?;
        decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::auth::Credentials;
    use crate::transport::tls;
    use httpmock::prelude::*;
    use serde_json::Map;
    use std::time::Duration;

    fn service(server: &MockServer, credentials: Credentials) -> BigQueryService {
        crate::crypto::init_crypto_provider().unwrap();
        let client = HttpClient::build(tls::Config::default(), Duration::from_secs(5)).unwrap();
        let tokens = TokenSource::new(credentials, &client).unwrap();
        BigQueryService::new(
            client,
            &server.url("/bigquery/v2"),
            "proj",
            "logs",
            tokens,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_tables_follows_pages() {
        let server = MockServer::start();
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/bigquery/v2/projects/proj/datasets/logs/tables")
                .query_param("pageToken", "p2");
            then.status(200).json_body(json!({
                "tables": [{"tableReference": {"tableId": "logs_20240102"}}]
            }));
        });
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/bigquery/v2/projects/proj/datasets/logs/tables")
                .header("authorization", "Bearer secret");
            then.status(200).json_body(json!({
                "tables": [{"tableReference": {"tableId": "logs_20240101"}}],
                "nextPageToken": "p2"
            }));
        });

        let tables = service(&server, Credentials::Token("secret".into()))
            .list_tables()
            .await
            .unwrap();
        first.assert();
        second.assert();
        assert_eq!(tables, vec!["logs_20240101", "logs_20240102"]);
    }

    #[tokio::test]
    async fn test_create_table_conflict_is_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bigquery/v2/projects/proj/datasets/logs/tables")
                .json_body_partial(r#"{"tableReference": {"tableId": "logs_20240101"}}"#);
            then.status(409).body("Already Exists");
        });

        let fields = json!([{"name": "a", "type": "STRING"}]);
        service(&server, Credentials::None)
            .create_table("logs_20240101", &fields)
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_create_table_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bigquery/v2/projects/proj/datasets/logs/tables");
            then.status(400).body("bad schema");
        });

        let err = service(&server, Credentials::None)
            .create_table("t", &json!([]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_insert_all() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bigquery/v2/projects/proj/datasets/logs/tables/t1/insertAll")
                .json_body_partial(r#"{"rows": [{"insertId": "id1", "json": {"a": "x"}}]}"#);
            then.status(200).json_body(json!({
                "insertErrors": [{"index": 0, "errors": [{"reason": "invalid"}]}]
            }));
        });

        let mut json = Map::new();
        json.insert("a".into(), Value::from("x"));
        let rows = vec![InsertRow {
            insert_id: "id1".into(),
            json,
        }];
        let resp = service(&server, Credentials::None)
            .insert_all("t1", &rows)
            .await
            .unwrap();
        mock.assert();
        assert_eq!(resp.insert_errors[0].errors[0].reason, "invalid");
    }

    #[tokio::test]
    async fn test_token_file_is_read_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "first\n").unwrap();

        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.header("authorization", "Bearer first");
            then.status(200).json_body(json!({}));
        });
        let bq = service(&server, Credentials::TokenFile(token_file.clone()));
        bq.list_tables().await.unwrap();
        first.assert();

        std::fs::write(&token_file, "second").unwrap();
        let second = server.mock(|when, then| {
            when.header("authorization", "Bearer second");
            then.status(200).json_body(json!({}));
        });
        bq.list_tables().await.unwrap();
        second.assert();
    }

    #[tokio::test]
    async fn test_service_account_token_sent_as_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start();
        let exchange = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .json_body(json!({"access_token": "ya29.sa", "expires_in": 3599}));
        });
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/bigquery/v2/projects/proj/datasets/logs/tables")
                .header("authorization", "Bearer ya29.sa");
            then.status(200).json_body(json!({}));
        });

        let key = crate::transport::auth::tests::write_key(&dir, &server.url("/token"));
        let bq = service(&server, Credentials::ServiceAccount(key));
        bq.list_tables().await.unwrap();
        bq.list_tables().await.unwrap();
        exchange.assert_hits(1);
        list.assert_hits(2);
    }
}
