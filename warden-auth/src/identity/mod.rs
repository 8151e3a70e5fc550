//! Ed25519 identity types shared by server pins and user registrations.
//!
//! - [`PrivateKey`] - Signing key, zeroized on drop, no `Debug`
//! - [`PublicKey`] - Verification key (`verify_strict`)
//! - [`Signature`] - Ed25519 signature
//! - [`Fingerprint`] - `SHA256:{base64}` display form of a public key
//!
//! # Example
//!
//! ```
//! use warden_auth::identity::PrivateKey;
//!
//! let key = PrivateKey::generate();
//! let nonce = [7u8; 32];
//! let signature = key.sign(&nonce);
//! assert!(key.public_key().verify(&nonce, &signature));
//! ```

mod keys;

pub use keys::{
    Fingerprint, KeyError, PrivateKey, PublicKey, SecretBytes, Signature, PUBLIC_KEY_LEN,
    SIGNATURE_LEN,
};
