//! TLS server configuration (server authentication only).
//!
//! Users authenticate above TLS with nonce signatures and session tokens,
//! so no client certificate is requested.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;

use super::cert::TlsIdentity;

/// TLS server configuration wrapper.
pub struct TlsServerConfig {
    pub config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    pub fn into_rustls_config(self) -> Arc<ServerConfig> {
        self.config
    }

    /// Server-auth-only config presenting `identity`.
    pub fn new_server_only(identity: &TlsIdentity) -> Result<Self, TlsConfigError> {
        let cert = CertificateDer::from(identity.cert_der.clone());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.clone()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsConfigError::Config(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| TlsConfigError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("failed to build config: {0}")]
    Config(String),
}
