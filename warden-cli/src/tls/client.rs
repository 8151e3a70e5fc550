//! rustls verifier that accepts a server only through its pin.
//!
//! The WebPKI chain and the requested server name are ignored; the leaf is
//! checked by [`TofuVerifier`] against the pinned key and address. The
//! handshake signature is still verified with the ring provider so the
//! peer has to hold the certificate's key.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use warden_auth::trust::{TofuVerifier, TrustError, ValidityViolation, Verified};

pub struct PinnedServerVerifier {
    server_id: String,
    tofu: TofuVerifier,
    provider: Arc<CryptoProvider>,
    verified: Mutex<Option<Verified>>,
    rejection: Mutex<Option<TrustError>>,
}

impl PinnedServerVerifier {
    /// Verify connections to `server_id` with `tofu`.
    pub fn new(server_id: impl Into<String>, tofu: TofuVerifier) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            tofu,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            verified: Mutex::new(None),
            rejection: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> Arc<CryptoProvider> {
        self.provider.clone()
    }

    /// Result of the last successful verification.
    pub fn take_verified(&self) -> Option<Verified> {
        self.verified
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Why the last verification failed. rustls only carries a coarse error.
    pub fn take_rejection(&self) -> Option<TrustError> {
        self.rejection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl std::fmt::Debug for PinnedServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedServerVerifier")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

fn to_rustls_error(err: &TrustError) -> rustls::Error {
    let cert_error = match err {
        TrustError::UnknownServer { .. } => CertificateError::UnknownIssuer,
        TrustError::MalformedCertificate(_) => CertificateError::BadEncoding,
        TrustError::HostnameMismatch { .. } => CertificateError::NotValidForName,
        TrustError::CertificateExpired {
            violation: ValidityViolation::TooEarly { .. },
            ..
        } => CertificateError::NotValidYet,
        TrustError::CertificateExpired {
            violation: ValidityViolation::TooLate { .. },
            ..
        } => CertificateError::Expired,
        TrustError::SignatureMismatch { .. } | TrustError::ReverificationFailed { .. } => {
            CertificateError::BadSignature
        }
        TrustError::UnsupportedKeyFormat { .. } | TrustError::UserDeniedRotation { .. } => {
            CertificateError::ApplicationVerificationFailure
        }
        other => return rustls::Error::General(other.to_string()),
    };
    rustls::Error::InvalidCertificate(cert_error)
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);
        match self.tofu.verify(&self.server_id, end_entity.as_ref(), now) {
            Ok(verified) => {
                *self.verified.lock().unwrap_or_else(|e| e.into_inner()) = Some(verified);
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => {
                let rustls_err = to_rustls_error(&err);
                *self.rejection.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
                Err(rustls_err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client config that trusts only what `verifier` accepts.
pub fn build_pinned_config(verifier: Arc<PinnedServerVerifier>) -> Result<ClientConfig, rustls::Error> {
    let config = ClientConfig::builder_with_provider(verifier.provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TomlTrustStore;
    use rcgen::{CertificateParams, KeyPair, SanType};
    use warden_auth::identity::PrivateKey;
    use warden_auth::trust::{RotationCandidate, ServerIdentity, TrustStore};

    fn leaf(key: &PrivateKey, ip: &str) -> CertificateDer<'static> {
        let pkcs8 = key.to_pkcs8_der().unwrap();
        let key_pair = KeyPair::try_from(&pkcs8[..]).unwrap();
        let mut params = CertificateParams::default();
        params
            .subject_alt_names
            .push(SanType::IpAddress(ip.parse().unwrap()));
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(1);
        CertificateDer::from(params.self_signed(&key_pair).unwrap().der().to_vec())
    }

    fn check(verifier: &PinnedServerVerifier, cert: &CertificateDer<'_>) -> Result<ServerCertVerified, rustls::Error> {
        verifier.verify_server_cert(
            cert,
            &[],
            &ServerName::try_from("10.0.0.1").unwrap(),
            &[],
            UnixTime::now(),
        )
    }

    fn pinned_store(dir: &tempfile::TempDir, key: &PrivateKey) -> Arc<TomlTrustStore> {
        let store = Arc::new(TomlTrustStore::new(dir.path().join("trust.toml")));
        store
            .set(&ServerIdentity::new("home", "10.0.0.1:4433", key.public_key()))
            .unwrap();
        store
    }

    #[test]
    fn test_accepts_pinned_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = PrivateKey::generate();
        let store = pinned_store(&dir, &key);
        let verifier = PinnedServerVerifier::new("home", TofuVerifier::new(store));

        assert!(check(&verifier, &leaf(&key, "10.0.0.1")).is_ok());
        assert!(!verifier.take_verified().unwrap().rotated);
    }

    #[test]
    fn test_rejects_changed_key_and_keeps_reason() {
        let dir = tempfile::tempdir().unwrap();
        let key = PrivateKey::generate();
        let store = pinned_store(&dir, &key);
        let verifier = PinnedServerVerifier::new("home", TofuVerifier::new(store.clone()));

        let err = check(&verifier, &leaf(&PrivateKey::generate(), "10.0.0.1")).unwrap_err();

        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::BadSignature)
        );
        assert!(matches!(
            verifier.take_rejection(),
            Some(TrustError::SignatureMismatch { .. })
        ));
        assert_eq!(store.get("home").unwrap().public_key, key.public_key());
    }

    #[test]
    fn test_wrong_address_is_name_error() {
        let dir = tempfile::tempdir().unwrap();
        let key = PrivateKey::generate();
        let verifier = PinnedServerVerifier::new("home", TofuVerifier::new(pinned_store(&dir, &key)));

        let err = check(&verifier, &leaf(&key, "10.0.0.2")).unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::NotValidForName)
        );
    }

    #[test]
    fn test_approved_rotation_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let old = PrivateKey::generate();
        let new = PrivateKey::generate();
        let store = pinned_store(&dir, &old);
        let approve = |_: &RotationCandidate| true;
        let tofu = TofuVerifier::new(store.clone()).with_prompt(Arc::new(approve));
        let verifier = PinnedServerVerifier::new("home", tofu);

        assert!(check(&verifier, &leaf(&new, "10.0.0.1")).is_ok());
        assert!(verifier.take_verified().unwrap().rotated);

        let reread = TomlTrustStore::new(dir.path().join("trust.toml"));
        assert_eq!(reread.get("home").unwrap().public_key, new.public_key());
    }

    #[test]
    fn test_unknown_server() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TomlTrustStore::new(dir.path().join("trust.toml")));
        let verifier = PinnedServerVerifier::new("home", TofuVerifier::new(store));

        let err = check(&verifier, &leaf(&PrivateKey::generate(), "10.0.0.1")).unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        );
    }
}
