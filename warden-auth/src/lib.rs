//! Trust establishment and user authentication for Warden.
//!
//! This crate performs no IO of its own:
//! - No filesystem operations
//! - No network calls
//! - No database access
//!
//! Collaborators are injected through traits:
//! - [`trust::TrustStore`] - Pinned server identities (client side)
//! - [`trust::RotationPrompt`] - Interactive approval of a server key change
//! - [`lifecycle::IdentityStore`] - Transactional user/invite/nonce/session storage
//! - [`crypto::RandomSource`] - Randomness for tokens, nonces and ids
//!
//! Log events go through `tracing`, inside a span each component receives at
//! construction.
//!
//! # Example
//!
//! ```ignore
//! use warden_auth::trust::{ServerIdentity, TofuVerifier};
//!
//! let verifier = TofuVerifier::new(store).with_prompt(prompt);
//! let verified = verifier.verify("home", &leaf_der, now)?;
//! ```

pub mod cert;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod store;
pub mod trust;

pub use cert::{CertError, CertificateKey, PeerCertificate};
pub use crypto::{constant_time_eq, OsRandom, RandomError, RandomSource, SecretToken};
pub use error::ErrorKind;
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, Signature};
pub use lifecycle::{AuthError, UserService};
pub use store::StoreError;
pub use trust::{ServerIdentity, TofuVerifier, TrustError, TrustStore};
