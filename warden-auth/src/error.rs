//! Coarse error taxonomy shared by the verifier and the lifecycle service.

/// Category of a failure, suitable for mapping onto an external status code.
///
/// Detailed variants stay available to operators through the concrete error
/// types; only the kind should cross an untrusted boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Entity absent or already consumed.
    NotFound,
    /// Caller-supplied value violates a precondition.
    InvalidArgument,
    /// Signature or token mismatch, expired credential, wrong user.
    Unauthenticated,
    /// The user declined a key rotation.
    TrustDenied,
    /// Storage, transaction, or random source failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::Unauthenticated => "unauthenticated",
            Self::TrustDenied => "trust denied",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
