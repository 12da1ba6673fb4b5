// SPDX-License-Identifier: Apache-2.0

//! The boundary to the remote table store.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::TransportError;

/// One row of an insert call. `insert_id` is the store's deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRow {
    #[serde(rename = "insertId")]
    pub insert_id: String,
    pub json: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RowError {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InsertError {
    pub index: usize,
    #[serde(default)]
    pub errors: Vec<RowError>,
}

/// Result of an insert call the store accepted. Rows named in `insert_errors` were
/// rejected individually; all other rows were stored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InsertAllResponse {
    #[serde(rename = "insertErrors", default)]
    pub insert_errors: Vec<InsertError>,
}

impl InsertAllResponse {
    pub fn is_complete(&self) -> bool {
        self.insert_errors.is_empty()
    }
}

/// Operations the transport needs from the remote store.
///
/// Implementations are cloned into spawned tasks, so they should be cheap to clone.
pub trait TableService: Clone + Send + Sync + 'static {
    fn list_tables(&self) -> impl Future<Output = Result<Vec<String>, TransportError>> + Send;

    /// Create `table` with the given field list. Creating a table that already exists
    /// is not an error.
    fn create_table(
        &self,
        table: &str,
        fields: &Value,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn insert_all(
        &self,
        table: &str,
        rows: &[InsertRow],
    ) -> impl Future<Output = Result<InsertAllResponse, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_partial_failure() {
        let body = r#"{
            "kind": "bigquery#tableDataInsertAllResponse",
            "insertErrors": [
                {"index": 1, "errors": [{"reason": "invalid", "message": "no such field"}]},
                {"index": 3, "errors": [{"reason": "backendError"}, {"reason": "stopped"}]}
            ]
        }"#;
        let resp: InsertAllResponse = serde_json::from_str(body).unwrap();
        assert!(!resp.is_complete());
        assert_eq!(resp.insert_errors[0].index, 1);
        assert_eq!(resp.insert_errors[0].errors[0].reason, "invalid");
        assert_eq!(resp.insert_errors[1].errors.len(), 2);
    }

    #[test]
    fn test_decode_success() {
        let resp: InsertAllResponse =
            serde_json::from_str(r#"{"kind": "bigquery#tableDataInsertAllResponse"}"#).unwrap();
        assert!(resp.is_complete());
    }

    #[test]
    fn test_row_encoding() {
        let mut json = Map::new();
        json.insert("a".into(), Value::from(1));
        let row = InsertRow {
            insert_id: "abc".into(),
            json,
        };
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"insertId":"abc","json":{"a":1}}"#
        );
    }
}
