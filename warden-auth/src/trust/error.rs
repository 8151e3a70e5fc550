use std::net::IpAddr;

use crate::cert::CertError;
use crate::error::ErrorKind;
use crate::store::StoreError;

/// Which side of the validity window the current time fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityViolation {
    TooEarly { not_before: i64 },
    TooLate { not_after: i64 },
}

/// Reasons a presented server certificate is rejected.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrustError {
    #[error("no pin for server {server_id}")]
    UnknownServer { server_id: String },

    #[error("malformed certificate: {0}")]
    MalformedCertificate(#[from] CertError),

    #[error("unsupported certificate key format: {algorithm}")]
    UnsupportedKeyFormat { algorithm: String },

    #[error("certificate does not name {address} (IP SANs: {presented:?})")]
    HostnameMismatch {
        address: String,
        presented: Vec<IpAddr>,
    },

    #[error("certificate not valid at {now}: {violation:?}")]
    CertificateExpired {
        now: i64,
        violation: ValidityViolation,
    },

    #[error("certificate for {server_id} is not signed by the pinned key")]
    SignatureMismatch { server_id: String },

    #[error("key rotation for {server_id} declined")]
    UserDeniedRotation { server_id: String },

    #[error("certificate for {server_id} failed verification against the rotated pin")]
    ReverificationFailed { server_id: String },

    #[error("trust store error: {0}")]
    Store(#[from] StoreError),
}

impl TrustError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownServer { .. } => ErrorKind::NotFound,
            Self::MalformedCertificate(_) | Self::UnsupportedKeyFormat { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::HostnameMismatch { .. }
            | Self::CertificateExpired { .. }
            | Self::SignatureMismatch { .. }
            | Self::ReverificationFailed { .. } => ErrorKind::Unauthenticated,
            Self::UserDeniedRotation { .. } => ErrorKind::TrustDenied,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}
