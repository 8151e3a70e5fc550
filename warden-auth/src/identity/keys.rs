//! Ed25519 key material for server and user identities.
//!
//! - Private keys are zeroized on drop and never implement `Debug`
//! - Public keys render as their fingerprint when debugged
//! - Fingerprints compare in constant time
//! - PKCS#8 DER exports are wrapped in [`SecretBytes`]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Errors that can occur while decoding key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The provided bytes have an invalid length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The provided bytes do not represent a valid key.
    #[error("invalid key format")]
    InvalidFormat,

    /// Hex input could not be decoded.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The fingerprint string has an invalid format.
    #[error("invalid fingerprint format")]
    InvalidFingerprint,
}

/// Secret bytes that are wiped when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Borrow the secret bytes.
    ///
    /// # Security
    ///
    /// Copying out of the returned slice defeats automatic zeroization.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A private Ed25519 signing key.
///
/// `SigningKey` is `ZeroizeOnDrop`, so nothing lingers after the key is dropped.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new random private key from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Export as PKCS#8 DER, the format rcgen and rustls consume.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` if the encoder rejects the key.
    pub fn to_pkcs8_der(&self) -> Result<SecretBytes, KeyError> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        let document = self.0.to_pkcs8_der().map_err(|_| KeyError::InvalidFormat)?;
        Ok(SecretBytes(document.as_bytes().to_vec()))
    }

    /// Load a private key from PKCS#8 DER bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFormat` if the bytes are not valid PKCS#8.
    pub fn from_pkcs8_der(bytes: &[u8]) -> Result<Self, KeyError> {
        use ed25519_dalek::pkcs8::DecodePrivateKey;
        let key =
            ed25519_dalek::SigningKey::from_pkcs8_der(bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }
}

/// A public Ed25519 verification key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Load a public key from its 32-byte encoding.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 32 bytes,
    /// or `KeyError::InvalidFormat` if the bytes are not a curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }

    /// Parse the lowercase hex form used by the client trust store.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidHex` for non-hex input, otherwise the errors
    /// of [`PublicKey::from_bytes`].
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Verify a signature over a message.
    ///
    /// Uses `verify_strict`, which rejects small-order keys and
    /// non-canonical signatures.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(self)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", Fingerprint::from_public_key(self))
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Load a signature from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; SIGNATURE_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: SIGNATURE_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_bytes();
        write!(
            f,
            "Signature({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

/// SHA-256 fingerprint of a public key, `SHA256:{url_safe_base64_no_pad}`.
///
/// Used for display and out-of-band comparison of pins. Equality is
/// constant-time; hashing is not, since fingerprints are public.
#[derive(Clone, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const PREFIX: &'static str = "SHA256:";

    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Sha256::digest(public_key.to_bytes());
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(hash)))
    }

    /// Parse a fingerprint string.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFingerprint` unless the input is the prefix
    /// followed by the base64 encoding of exactly 32 bytes.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let encoded = s
            .strip_prefix(Self::PREFIX)
            .ok_or(KeyError::InvalidFingerprint)?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| KeyError::InvalidFingerprint)?;
        if decoded.len() != 32 {
            return Err(KeyError::InvalidFingerprint);
        }
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}
