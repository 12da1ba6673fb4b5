// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tower::retry::Policy;
use tracing::warn;

use super::InsertRequest;
use super::error::TransportError;

/// Delay before retrying a call that failed with a retryable HTTP status.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Attempts made by the synchronous insert path before giving up.
pub const SYNC_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub retryable: bool,
    pub delay: Duration,
}

impl Retry {
    const NEVER: Retry = Retry {
        retryable: false,
        delay: Duration::ZERO,
    };
}

/// Decide whether a failed call may be retried, and after how long.
///
/// Shared by the synchronous and asynchronous insert paths.
pub fn classify(err: &TransportError) -> Retry {
    match err {
        TransportError::Http { status, .. } => match status.as_u16() {
            403 | 500 | 503 | 504 => Retry {
                retryable: true,
                delay: RETRY_DELAY,
            },
            _ => Retry::NEVER,
        },
        TransportError::Connect(_) | TransportError::Tls(_) | TransportError::Timeout => Retry {
            retryable: true,
            delay: Duration::ZERO,
        },
        TransportError::Decode(_) | TransportError::Request(_) => Retry::NEVER,
    }
}

/// Retries classified-transient failures until `max_attempts` calls were made, sleeping
/// for the classified delay in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 1,
        }
    }
}

impl<Res> Policy<InsertRequest, Res, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn retry(
        &mut self,
        req: &mut InsertRequest,
        result: &mut Result<Res, TransportError>,
    ) -> Option<Self::Future> {
        let err = result.as_ref().err()?;
        let retry = classify(err);
        if !retry.retryable || self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;

        warn!(
            upload_id = %req.upload_id,
            table = %req.table,
            attempt = self.attempts,
            delay = ?retry.delay,
            error = %err,
            "Insert failed, will retry after delay"
        );
        Some(Box::pin(tokio::time::sleep(retry.delay)))
    }

    fn clone_request(&mut self, req: &InsertRequest) -> Option<InsertRequest> {
        Some(req.clone())
    }
}
