//! Pin verification for server certificates.
//!
//! The certificate's self-signature is checked with the *pinned* key, never
//! with the key the certificate carries. A mismatch is treated as a possible
//! key rotation: an optional [`RotationPrompt`] decides, an approved key is
//! persisted, and the certificate must then pass the ordinary check against
//! the new pin. That second pass is the only retry.

use std::sync::Arc;

use crate::cert::{CertificateKey, PeerCertificate};
use crate::identity::{Fingerprint, PublicKey};
use crate::store::StoreError;

use super::error::{TrustError, ValidityViolation};
use super::pin::{ServerIdentity, TrustStore};

/// Passes allowed after the first one. A single approved rotation, then
/// the verdict is final.
const MAX_REVERIFICATIONS: usize = 1;

/// Details shown to whoever approves a key change.
#[derive(Debug, Clone)]
pub struct RotationCandidate {
    pub server_id: String,
    pub address: String,
    pub pinned: PublicKey,
    pub presented: PublicKey,
    pub not_before: i64,
    pub not_after: i64,
}

impl RotationCandidate {
    #[must_use]
    pub fn pinned_fingerprint(&self) -> Fingerprint {
        self.pinned.fingerprint()
    }

    #[must_use]
    pub fn presented_fingerprint(&self) -> Fingerprint {
        self.presented.fingerprint()
    }
}

/// Interactive decision on a key rotation.
///
/// Called synchronously while the handshake waits. There is no timeout
/// here; embedders that prompt a human must bound the wait themselves.
pub trait RotationPrompt: Send + Sync {
    fn confirm(&self, candidate: &RotationCandidate) -> bool;
}

impl<F> RotationPrompt for F
where
    F: Fn(&RotationCandidate) -> bool + Send + Sync,
{
    fn confirm(&self, candidate: &RotationCandidate) -> bool {
        self(candidate)
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct Verified {
    /// The pin the certificate was accepted against.
    pub server: ServerIdentity,
    /// Whether the pin was rotated during this call.
    pub rotated: bool,
}

/// Trust-on-first-use verifier over a [`TrustStore`].
///
/// The verifier never creates pins; an unpinned server is rejected.
///
/// Once an approved rotation has been written it stays written, even if the
/// re-verification that follows fails or the caller abandons the handshake.
#[derive(Clone)]
pub struct TofuVerifier {
    store: Arc<dyn TrustStore>,
    prompt: Option<Arc<dyn RotationPrompt>>,
    span: tracing::Span,
}

impl std::fmt::Debug for TofuVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TofuVerifier")
            .field("prompt", &self.prompt.is_some())
            .finish_non_exhaustive()
    }
}

impl TofuVerifier {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self {
            store,
            prompt: None,
            span: tracing::debug_span!("pin_verifier"),
        }
    }

    /// Enable interactive rotation. Without a prompt every key mismatch is final.
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn RotationPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Log verification events inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Decide whether `leaf_der`, presented by the connection to `server_id`,
    /// is acceptable at Unix time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`TrustError`]. After an approved
    /// rotation any failure is reported as `ReverificationFailed`.
    pub fn verify(
        &self,
        server_id: &str,
        leaf_der: &[u8],
        now: i64,
    ) -> Result<Verified, TrustError> {
        let _entered = self.span.enter();

        let mut pin = self.lookup(server_id)?;
        let cert = PeerCertificate::parse(leaf_der)?;
        let presented = match (&cert.key, cert.is_ed25519()) {
            (CertificateKey::Ed25519(key), true) => key.clone(),
            (CertificateKey::Unsupported { algorithm }, _) => {
                return Err(TrustError::UnsupportedKeyFormat {
                    algorithm: algorithm.clone(),
                })
            }
            (CertificateKey::Ed25519(_), false) => {
                return Err(TrustError::UnsupportedKeyFormat {
                    algorithm: cert.signature_algorithm.clone(),
                })
            }
        };

        let mut rotated = false;
        for pass in 0..=MAX_REVERIFICATIONS {
            match check_against_pin(&pin, &cert, now) {
                Ok(()) => {
                    tracing::debug!(server_id, rotated, "certificate matches pin");
                    return Ok(Verified { server: pin, rotated });
                }
                Err(err) if rotated => {
                    tracing::warn!(server_id, error = %err, "rotated pin failed re-verification");
                    return Err(TrustError::ReverificationFailed {
                        server_id: server_id.to_string(),
                    });
                }
                Err(TrustError::SignatureMismatch { .. }) if pass < MAX_REVERIFICATIONS => {}
                Err(err) => return Err(err),
            }

            tracing::warn!(
                server_id,
                pinned = %pin.public_key.fingerprint(),
                presented = %presented.fingerprint(),
                "server presented a key that does not match the pin"
            );

            let Some(prompt) = &self.prompt else {
                return Err(TrustError::SignatureMismatch {
                    server_id: server_id.to_string(),
                });
            };

            let candidate = RotationCandidate {
                server_id: server_id.to_string(),
                address: pin.address.clone(),
                pinned: pin.public_key.clone(),
                presented: presented.clone(),
                not_before: cert.not_before,
                not_after: cert.not_after,
            };
            if !prompt.confirm(&candidate) {
                tracing::info!(server_id, "key rotation declined");
                return Err(TrustError::UserDeniedRotation {
                    server_id: server_id.to_string(),
                });
            }

            self.store.set(&pin.with_public_key(presented.clone()))?;
            tracing::info!(
                server_id,
                fingerprint = %presented.fingerprint(),
                "pin rotated, re-verifying"
            );
            rotated = true;
            pin = self.lookup(server_id).map_err(|err| {
                tracing::warn!(server_id, error = %err, "rotated pin could not be re-read");
                TrustError::ReverificationFailed {
                    server_id: server_id.to_string(),
                }
            })?;
        }

        Err(TrustError::ReverificationFailed {
            server_id: server_id.to_string(),
        })
    }

    fn lookup(&self, server_id: &str) -> Result<ServerIdentity, TrustError> {
        match self.store.get(server_id) {
            Ok(pin) => Ok(pin),
            Err(StoreError::NotFound { .. }) => Err(TrustError::UnknownServer {
                server_id: server_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Address binding, validity window, then the signature under the pinned key.
fn check_against_pin(
    pin: &ServerIdentity,
    cert: &PeerCertificate,
    now: i64,
) -> Result<(), TrustError> {
    match pin.ip() {
        Some(ip) if cert.ip_sans.contains(&ip) => {}
        _ => {
            return Err(TrustError::HostnameMismatch {
                address: pin.address.clone(),
                presented: cert.ip_sans.clone(),
            })
        }
    }

    if now < cert.not_before {
        return Err(TrustError::CertificateExpired {
            now,
            violation: ValidityViolation::TooEarly {
                not_before: cert.not_before,
            },
        });
    }
    if now > cert.not_after {
        return Err(TrustError::CertificateExpired {
            now,
            violation: ValidityViolation::TooLate {
                not_after: cert.not_after,
            },
        });
    }

    if cert.signature_verifies_with(&pin.public_key) {
        Ok(())
    } else {
        Err(TrustError::SignatureMismatch {
            server_id: pin.id.clone(),
        })
    }
}
