//! Lifecycle error types.

use crate::crypto::RandomError;
use crate::error::ErrorKind;
use crate::store::StoreError;

/// Errors returned by [`super::UserService`] operations.
///
/// Variants are descriptive for operators. Anything crossing an untrusted
/// boundary should be reduced to [`AuthError::kind`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Entity absent, or a single-use record already consumed.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("token mismatch")]
    TokenMismatch,

    #[error("invite not yet valid")]
    InviteNotYetValid,

    #[error("invite expired")]
    InviteExpired,

    #[error("user not registered")]
    UserNotRegistered,

    #[error("login challenge expired")]
    ChallengeExpired,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("session belongs to another user")]
    UserMismatch,

    #[error("session expired")]
    SessionExpired,

    #[error(transparent)]
    Random(#[from] RandomError),

    #[error(transparent)]
    Storage(StoreError),
}

impl AuthError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::TokenMismatch
            | Self::InviteNotYetValid
            | Self::InviteExpired
            | Self::UserNotRegistered
            | Self::ChallengeExpired
            | Self::SignatureMismatch
            | Self::UserMismatch
            | Self::SessionExpired => ErrorKind::Unauthenticated,
            Self::Random(_) | Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Stable identifier of the variant, for callers that must tell a
    /// stale challenge from an expired invite or a bad signature.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::TokenMismatch => "token_mismatch",
            Self::InviteNotYetValid => "invite_not_yet_valid",
            Self::InviteExpired => "invite_expired",
            Self::UserNotRegistered => "user_not_registered",
            Self::ChallengeExpired => "challenge_expired",
            Self::SignatureMismatch => "signature_mismatch",
            Self::UserMismatch => "user_mismatch",
            Self::SessionExpired => "session_expired",
            Self::Random(_) | Self::Storage(_) => "internal",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity } => Self::NotFound { entity },
            StoreError::Conflict { entity } => Self::AlreadyExists { entity },
            other => Self::Storage(other),
        }
    }
}
