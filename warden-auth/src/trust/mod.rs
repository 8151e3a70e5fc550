//! Client-side server pinning (trust on first use, explicit rotation).

mod error;
mod pin;
mod verifier;

pub use error::{TrustError, ValidityViolation};
pub use pin::{ServerIdentity, TrustStore};
pub use verifier::{RotationCandidate, RotationPrompt, TofuVerifier, Verified};
