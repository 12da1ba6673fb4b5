// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::BoxError;

use super::error::TransportError;
use super::tls::Config;

pub(crate) fn build_hyper_client(
    tls_config: Config,
) -> Result<HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>, BoxError> {
    let client_config = tls_config.into_client_config()?;

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(client_config)
        .https_or_http()
        .enable_http1()
        .build();

    let client = HyperClient::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(32)
        .timer(TokioTimer::new())
        .build::<_, Full<Bytes>>(https);

    Ok(client)
}

/// A JSON-over-HTTPS client with a per-request timeout.
#[derive(Clone)]
pub struct HttpClient {
    inner: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    pub fn build(tls_config: Config, timeout: Duration) -> Result<Self, BoxError> {
        let inner = build_hyper_client(tls_config)?;
        Ok(Self { inner, timeout })
    }

    /// Send a request and return the response body of a 2xx response. Any other status
    /// is returned as [`TransportError::Http`] carrying the body text.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Bytes>,
    ) -> Result<Bytes, TransportError> {
        let body = body.map(|b| (b, "application/json"));
        self.send(method, uri, bearer, body).await
    }

    /// POST an `application/x-www-form-urlencoded` body without authorization.
    pub async fn post_form(&self, uri: &str, form: Bytes) -> Result<Bytes, TransportError> {
        let body = Some((form, "application/x-www-form-urlencoded"));
        self.send(Method::POST, uri, None, body).await
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<(Bytes, &'static str)>,
    ) -> Result<Bytes, TransportError> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Request(e.to_string()))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        let req = match body {
            Some((body, content_type)) => builder
                .header(CONTENT_TYPE, content_type)
                .body(Full::new(body)),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| TransportError::Request(e.to_string()))?;

        match tokio::time::timeout(self.timeout, self.perform_request(req)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn perform_request(&self, req: Request<Full<Bytes>>) -> Result<Bytes, TransportError> {
        let resp = self.inner.request(req).await.map_err(|e| {
            if is_tls_error(&e) {
                TransportError::Tls(e.to_string())
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let (head, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Decode(format!("failed reading response: {}", e)))?
            .to_bytes();

        if !head.status.is_success() {
            return Err(TransportError::Http {
                status: head.status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(body)
    }
}

fn is_tls_error(err: &(dyn StdError + 'static)) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if e.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}
