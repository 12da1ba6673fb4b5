// SPDX-License-Identifier: Apache-2.0

use hyper_rustls::ConfigBuilderExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, pem::PemObject};
use tower::BoxError;
use tracing::warn;

/// TLS settings for the connection to the table store.
#[derive(Default, Clone)]
pub struct Config {
    /// Trust anchor for private endpoints. Native roots are used when absent.
    ca_certificate: Option<CertificateDer<'static>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        Default::default()
    }

    pub fn into_client_config(self) -> Result<ClientConfig, BoxError> {
        let builder = match self.ca_certificate {
            None => match ClientConfig::builder().with_native_roots() {
                Ok(builder) => builder,
                Err(e) => {
                    // Plain http endpoints still work; https fails at the handshake.
                    warn!(error = %e, "No native root certificates available");
                    ClientConfig::builder().with_root_certificates(RootCertStore::empty())
                }
            },
            Some(cert) => {
                let mut root_store = RootCertStore::empty();
                root_store.add(cert)?;
                ClientConfig::builder().with_root_certificates(root_store)
            }
        };

        Ok(builder.with_no_client_auth())
    }
}

#[derive(Clone, Default)]
pub struct ConfigBuilder {
    ca_file: Option<String>,
}

impl ConfigBuilder {
    pub fn with_ca_file(mut self, ca_file: impl Into<String>) -> Self {
        self.ca_file = Some(ca_file.into());
        self
    }

    pub fn build(self) -> Result<Config, BoxError> {
        let ca_certificate = match self.ca_file {
            None => None,
            Some(file) => Some(
                CertificateDer::from_pem_file(&file)
                    .map_err(|e| format!("unable to load CA certificate {}: {}", file, e))?,
            ),
        };

        Ok(Config { ca_certificate })
    }
}
