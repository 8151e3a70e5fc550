//! Entities owned by the lifecycle service.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::crypto::SecretToken;
use crate::identity::{Fingerprint, PublicKey};

use super::error::AuthError;

/// Default invite lifetime when no `not_after` is given.
pub const INVITE_VALIDITY_SECS: i64 = 24 * 60 * 60;

/// A login nonce older than this is rejected.
pub const NONCE_TTL_SECS: i64 = 60;

/// A session older than this is rejected.
pub const SESSION_TTL_SECS: i64 = 12 * 60 * 60;

/// Registration state of a user.
///
/// `Active` is never produced by this crate; it exists so records written by
/// other tooling round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserState {
    Pending,
    Registered,
    Active,
}

impl UserState {
    /// Stable numeric code used by storage backends.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Registered => 1,
            Self::Active => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Registered),
            2 => Some(Self::Active),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Registered => "registered",
            Self::Active => "active",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: Option<String>,
    /// Absent while `Pending`.
    pub public_key: Option<PublicKey>,
    pub state: UserState,
}

impl User {
    #[must_use]
    pub fn pending(id: Uuid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            public_key: None,
            state: UserState::Pending,
        }
    }

    /// Snapshot of this user after a successful registration.
    ///
    /// An `Active` user stays `Active`; nothing moves back toward `Pending`.
    #[must_use]
    pub fn registered(&self, public_key: PublicKey) -> Self {
        let state = match self.state {
            UserState::Active => UserState::Active,
            UserState::Pending | UserState::Registered => UserState::Registered,
        };
        Self {
            id: self.id,
            name: self.name.clone(),
            public_key: Some(public_key),
            state,
        }
    }

    /// The key to challenge at login.
    ///
    /// # Errors
    ///
    /// `UserNotRegistered` while the user is `Pending` or has no key.
    pub fn login_key(&self) -> Result<&PublicKey, AuthError> {
        match (&self.state, &self.public_key) {
            (UserState::Pending, _) | (_, None) => Err(AuthError::UserNotRegistered),
            (_, Some(key)) => Ok(key),
        }
    }
}

/// Requested invite window; `None` or the Unix epoch selects the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InviteWindow {
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl InviteWindow {
    /// Resolve defaults against `now`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the resolved `not_after` precedes `not_before`.
    pub fn resolve(self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), AuthError> {
        let is_set = |t: &DateTime<Utc>| t.timestamp() != 0 || t.timestamp_subsec_nanos() != 0;
        let not_before = self.not_before.filter(is_set).unwrap_or(now);
        let not_after = self
            .not_after
            .filter(is_set)
            .unwrap_or(now + Duration::seconds(INVITE_VALIDITY_SECS));
        if not_after < not_before {
            return Err(AuthError::InvalidArgument(format!(
                "invite window ends ({not_after}) before it starts ({not_before})"
            )));
        }
        Ok((not_before, not_after))
    }
}

/// Single-use registration ticket. At most one per user.
#[derive(Debug, Clone)]
pub struct Invite {
    pub user_id: Uuid,
    pub token: SecretToken,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Invite {
    /// # Errors
    ///
    /// `InviteNotYetValid` before `not_before`, `InviteExpired` after `not_after`.
    pub fn check_window(&self, now: DateTime<Utc>) -> Result<(), AuthError> {
        if now < self.not_before {
            return Err(AuthError::InviteNotYetValid);
        }
        if now > self.not_after {
            return Err(AuthError::InviteExpired);
        }
        Ok(())
    }
}

/// Outstanding login challenge. At most one per user.
#[derive(Debug, Clone)]
pub struct LoginNonce {
    pub user_id: Uuid,
    pub nonce: SecretToken,
    pub created_at: DateTime<Utc>,
}

impl LoginNonce {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::seconds(NONCE_TTL_SECS)
    }
}

/// Credential issued by a successful login. Both `id` and `token` must match.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: SecretToken,
    pub created_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::seconds(SESSION_TTL_SECS)
    }

    /// What the client presents back on authenticated calls.
    #[must_use]
    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            id: self.id,
            user_id: self.user_id,
            token: self.token.as_bytes().to_vec(),
        }
    }
}

/// Session identity as presented by a caller.
#[derive(Clone)]
pub struct SessionCredentials {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: Vec<u8>,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// The server's own address and key, as a new user should pin them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicIdentity {
    pub address: String,
    pub public_key: PublicKey,
}

impl ServerPublicIdentity {
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }
}

/// Everything an invited user needs, for an out-of-band channel.
#[derive(Debug, Clone)]
pub struct InviteManifest {
    pub server: ServerPublicIdentity,
    pub invite: Invite,
}
