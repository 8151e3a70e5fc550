//! Self-signed server certificate from the daemon's Ed25519 identity.
//!
//! Clients pin the public key, not the certificate, so the certificate is
//! regenerated on every start.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::net::IpAddr;
use warden_auth::identity::{KeyError, PrivateKey};
use warden_auth::Fingerprint;

use crate::config::DEFAULT_CERT_VALIDITY_DAYS;

/// Parameters for certificate generation.
#[derive(Debug, Clone)]
pub struct CertParams {
    pub common_name: String,
    pub validity_days: u32,
    /// IP SANs; clients require one matching the address they dialed.
    pub san_ips: Vec<IpAddr>,
}

impl CertParams {
    /// Certificate for a daemon reachable at `advertise_ip`.
    pub fn for_address(advertise_ip: IpAddr, validity_days: u32) -> Self {
        let mut san_ips = vec![advertise_ip];
        let loopback: IpAddr = std::net::Ipv4Addr::LOCALHOST.into();
        if advertise_ip != loopback {
            san_ips.push(loopback);
        }
        Self {
            common_name: "warden-daemon".to_string(),
            validity_days,
            san_ips,
        }
    }
}

impl Default for CertParams {
    fn default() -> Self {
        Self::for_address(
            std::net::Ipv4Addr::LOCALHOST.into(),
            DEFAULT_CERT_VALIDITY_DAYS,
        )
    }
}

/// TLS identity bundle (certificate + private key in DER format).
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_der: Vec<u8>,
    /// PKCS#8 private key.
    pub key_der: Vec<u8>,
    pub fingerprint: Fingerprint,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

/// Generate a self-signed Ed25519 certificate valid from now for
/// `params.validity_days`.
pub fn build_self_signed(
    private_key: &PrivateKey,
    params: &CertParams,
) -> Result<TlsIdentity, CertError> {
    let pkcs8_der = private_key.to_pkcs8_der()?;
    let key_pair =
        KeyPair::try_from(&pkcs8_der[..]).map_err(|e| CertError::KeyPair(e.to_string()))?;

    let mut cert_params = CertificateParams::default();
    cert_params.distinguished_name = DistinguishedName::new();
    cert_params
        .distinguished_name
        .push(DnType::CommonName, &params.common_name);

    cert_params.not_before = time::OffsetDateTime::now_utc();
    cert_params.not_after =
        cert_params.not_before + time::Duration::days(i64::from(params.validity_days));

    for ip in &params.san_ips {
        cert_params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(TlsIdentity {
        cert_der: cert.der().to_vec(),
        key_der: pkcs8_der.to_vec(),
        fingerprint: Fingerprint::from_public_key(&private_key.public_key()),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("failed to encode private key: {0}")]
    Key(#[from] KeyError),
    #[error("failed to create key pair: {0}")]
    KeyPair(String),
    #[error("failed to generate certificate: {0}")]
    Generation(String),
}
