// SPDX-License-Identifier: Apache-2.0

//! OAuth access tokens for the BigQuery API.
//!
//! Tokens come from configuration, from a file kept fresh by something else, or are
//! minted from a service account key: a JWT signed with the account's private key is
//! exchanged at the key's token endpoint and the result cached until shortly before
//! it expires.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::error::TransportError;
use super::http_client::HttpClient;

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Where access tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Token(String),
    /// Read on every request, so an external refresher can rotate the token.
    TokenFile(PathBuf),
    /// JSON service account key.
    ServiceAccount(PathBuf),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("unable to read service account key {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid service account key {path}: {reason}")]
    Key { path: PathBuf, reason: String },
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

pub struct ServiceAccount {
    client: HttpClient,
    email: String,
    token_uri: String,
    key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccount {
    pub fn load(path: &Path, client: HttpClient) -> Result<Self, AuthError> {
        let text = std::fs::read_to_string(path).map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let invalid = |reason: String| AuthError::Key {
            path: path.to_path_buf(),
            reason,
        };

        let key: ServiceAccountKey =
            serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            client,
            email: key.client_email,
            token_uri: key.token_uri,
            key: signing_key,
            cached: Mutex::new(None),
        })
    }

    /// Current access token, minting a new one when the cached token is close to
    /// expiry. Concurrent callers wait for a single exchange.
    pub async fn token(&self) -> Result<String, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref().filter(|c| Instant::now() < c.refresh_at) {
            return Ok(c.token.clone());
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn exchange(&self) -> Result<CachedToken, TransportError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TransportError::Request(e.to_string()))?
            .as_secs();
        let claims = Claims {
            iss: &self.email,
            scope: BIGQUERY_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME.as_secs(),
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| TransportError::Request(format!("failed to sign token request: {}", e)))?;

        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", GRANT_TYPE)
            .append_pair("assertion", &assertion)
            .finish();
        let body = self
            .client
            .post_form(&self.token_uri, Bytes::from(form))
            .await?;
        let resp: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))?;

        debug!(account = %self.email, expires_in = resp.expires_in, "Obtained access token");
        let lifetime = Duration::from_secs(resp.expires_in).saturating_sub(REFRESH_MARGIN);
        Ok(CachedToken {
            token: resp.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }
}

/// Resolved [`Credentials`], ready to hand out bearer tokens.
pub enum TokenSource {
    None,
    Static(String),
    File(PathBuf),
    ServiceAccount(ServiceAccount),
}

impl TokenSource {
    /// Service account keys are read and parsed here, so a bad key fails at startup.
    pub fn new(credentials: Credentials, client: &HttpClient) -> Result<Self, AuthError> {
        Ok(match credentials {
            Credentials::None => TokenSource::None,
            Credentials::Token(token) => TokenSource::Static(token),
            Credentials::TokenFile(path) => TokenSource::File(path),
            Credentials::ServiceAccount(path) => {
                TokenSource::ServiceAccount(ServiceAccount::load(&path, client.clone())?)
            }
        })
    }

    pub async fn token(&self) -> Result<Option<String>, TransportError> {
        match self {
            TokenSource::None => Ok(None),
            TokenSource::Static(t) => Ok(Some(t.clone())),
            TokenSource::File(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    TransportError::Request(format!(
                        "unable to read token file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(token.trim().to_string()))
            }
            TokenSource::ServiceAccount(account) => account.token().await.map(Some),
        }
    }
}
