// SPDX-License-Identifier: Apache-2.0

use http::StatusCode;
use thiserror::Error;

/// A single failed call to the remote table store.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("unable to connect: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("failed to send request: {0}")]
    Request(String),
}

impl TransportError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Terminal outcome of an insert that will not be retried by the transport.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("permanent failure: {0}")]
    Permanent(#[source] TransportError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },
}
