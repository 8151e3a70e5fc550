//! Stateless helpers shared by the verifier and the lifecycle service:
//! constant-time comparison, an injectable random source, and the 32-byte
//! secret type used for invite tokens, login nonces and session tokens.

use rand::RngCore;
use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of every token, nonce and session secret.
pub const SECRET_LEN: usize = 32;

/// The random source could not produce bytes.
#[derive(Debug, thiserror::Error)]
#[error("random source failure: {0}")]
pub struct RandomError(pub String);

/// Supplier of cryptographically secure random bytes.
///
/// Injected into the lifecycle service so tests can substitute a
/// deterministic sequence.
pub trait RandomSource: Send + Sync {
    /// Fill `buf` entirely with random bytes.
    fn fill(&self, buf: &mut [u8]) -> Result<(), RandomError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<(), RandomError> {
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|e| RandomError(e.to_string()))
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Every byte pair is visited regardless of where the inputs diverge. Only
/// the lengths, which are public for fixed-size secrets, may end the
/// comparison early.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    compare_visiting(a, b, |_| {})
}

fn compare_visiting(a: &[u8], b: &[u8], mut visit: impl FnMut(usize)) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut equal = Choice::from(1u8);
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        visit(i);
        equal &= x.ct_eq(y);
    }
    equal.into()
}

/// A 32-byte secret: invite token, login nonce, or session token.
///
/// Wiped on drop. `Debug` never prints the bytes, and equality checks go
/// through [`SecretToken::matches`], which is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken([u8; SECRET_LEN]);

impl SecretToken {
    /// Draw a fresh secret from `random`.
    ///
    /// # Errors
    ///
    /// Propagates the random source failure.
    pub fn generate(random: &dyn RandomSource) -> Result<Self, RandomError> {
        let mut bytes = [0u8; SECRET_LEN];
        random.fill(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Wrap bytes read back from storage or the wire.
    ///
    /// Returns `None` unless exactly 32 bytes are supplied.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; SECRET_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Constant-time comparison against a presented value.
    #[must_use]
    pub fn matches(&self, presented: &[u8]) -> bool {
        constant_time_eq(&self.0, presented)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form produced by [`SecretToken::to_hex`].
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_slice(&bytes)
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(..)")
    }
}
