// SPDX-License-Identifier: Apache-2.0

use rustls::crypto::CryptoProvider;
use tower::BoxError;

/// Install the aws-lc-rs provider as the process default for rustls, unless a
/// provider is already installed. Must run before the first TLS client is built.
pub fn init_crypto_provider() -> Result<(), BoxError> {
    if CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    match rustls::crypto::aws_lc_rs::default_provider().install_default() {
        Ok(()) => Ok(()),
        // Another thread won the race; a provider is installed either way.
        Err(_) if CryptoProvider::get_default().is_some() => Ok(()),
        Err(e) => Err(format!("failed to initialize crypto library: {:?}", e).into()),
    }
}
