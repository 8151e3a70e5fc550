//! X.509 leaf certificate parsing for pin verification.
//!
//! # Security
//!
//! - Input is limited to 16KB before any ASN.1 parsing
//! - The subject key is exposed as a tagged [`CertificateKey`], so callers
//!   match on the algorithm instead of trusting raw key bytes

use std::net::IpAddr;

use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::identity::{KeyError, PublicKey, Signature};

/// Maximum certificate size (16KB is generous for a single cert)
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Object identifier of Ed25519 (RFC 8410), used for both the signature
/// algorithm and the subject public key algorithm.
pub const ED25519_OID: &str = "1.3.101.112";

/// Errors that can occur during certificate parsing.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate too large: {0} bytes (max {MAX_CERT_SIZE})")]
    TooLarge(usize),

    #[error("failed to parse X.509 certificate: {0}")]
    ParseError(String),

    #[error("invalid Ed25519 material in certificate: {0}")]
    InvalidKey(#[from] KeyError),
}

/// Subject public key of a certificate, by algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateKey {
    Ed25519(PublicKey),
    /// Any other algorithm, carried by OID for diagnostics only.
    Unsupported { algorithm: String },
}

/// The parts of a leaf certificate the pin verifier needs.
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    /// DER bytes of the `tbsCertificate`, i.e. what the signature covers.
    pub tbs: Vec<u8>,
    /// OID of the outer signature algorithm.
    pub signature_algorithm: String,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
    pub key: CertificateKey,
    /// Unix seconds.
    pub not_before: i64,
    /// Unix seconds.
    pub not_after: i64,
    /// IP addresses listed in the subject alternative name extension.
    pub ip_sans: Vec<IpAddr>,
}

impl PeerCertificate {
    /// Parse a DER-encoded leaf certificate.
    ///
    /// # Errors
    ///
    /// Returns `CertError::TooLarge` if the certificate exceeds 16KB,
    /// `CertError::ParseError` if it is malformed, and
    /// `CertError::InvalidKey` if it declares an Ed25519 key that does not decode.
    pub fn parse(der: &[u8]) -> Result<Self, CertError> {
        if der.len() > MAX_CERT_SIZE {
            return Err(CertError::TooLarge(der.len()));
        }

        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertError::ParseError(format!("{e:?}")))?;

        let spki = cert.public_key();
        let key_algorithm = spki.algorithm.algorithm.to_id_string();
        let key = if key_algorithm == ED25519_OID {
            CertificateKey::Ed25519(PublicKey::from_bytes(&spki.subject_public_key.data)?)
        } else {
            CertificateKey::Unsupported {
                algorithm: key_algorithm,
            }
        };

        let ip_sans = cert
            .subject_alternative_name()
            .map_err(|e| CertError::ParseError(format!("{e:?}")))?
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::IPAddress(raw) => ip_from_san(raw),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            tbs: cert.tbs_certificate.as_ref().to_vec(),
            signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
            signature: cert.signature_value.data.to_vec(),
            key,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            ip_sans,
        })
    }

    /// Whether both the signature and the subject key are Ed25519.
    #[must_use]
    pub fn is_ed25519(&self) -> bool {
        self.signature_algorithm == ED25519_OID && matches!(self.key, CertificateKey::Ed25519(_))
    }

    /// Check the certificate signature against an arbitrary key.
    ///
    /// The key is supplied by the caller rather than read from the
    /// certificate; that is what makes this a pin check.
    #[must_use]
    pub fn signature_verifies_with(&self, key: &PublicKey) -> bool {
        match Signature::from_bytes(&self.signature) {
            Ok(signature) => key.verify(&self.tbs, &signature),
            Err(_) => false,
        }
    }
}

fn ip_from_san(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}
