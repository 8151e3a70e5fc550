//! User identity lifecycle: invite, register, challenge, login, session.
//!
//! ```text
//! create_user ──▶ Pending ──create_invite──▶ (invite) ──register_user──▶ Registered
//!                                                                          │
//!            create_login_nonce ──▶ (nonce) ──login_user──▶ Session ◀──────┘
//! ```
//!
//! Multi-entity writes run inside one [`IdentityStore::transaction`]. The
//! `*_in` helpers take the transaction's repositories, so one helper calling
//! another stays in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::crypto::{OsRandom, RandomSource, SecretToken};
use crate::identity::{PublicKey, Signature};
use crate::store::StoreError;

use super::clock::{Clock, SystemClock};
use super::error::AuthError;
use super::model::{
    Invite, InviteManifest, InviteWindow, LoginNonce, ServerPublicIdentity, Session,
    SessionCredentials, User,
};
use super::repo::{IdentityRepos, IdentityStore};

/// Upper bound on `list_users` page size.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Server-side identity lifecycle over an [`IdentityStore`].
///
/// Holds no state of its own; every call re-reads the store.
pub struct UserService<S> {
    store: S,
    server: ServerPublicIdentity,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    span: tracing::Span,
}

impl<S: IdentityStore> UserService<S> {
    /// `server` is what invite manifests tell new users to pin.
    pub fn new(store: S, server: ServerPublicIdentity) -> Self {
        Self {
            store,
            server,
            random: Arc::new(OsRandom),
            clock: Arc::new(SystemClock),
            span: tracing::info_span!("user_service"),
        }
    }

    #[must_use]
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn server_identity(&self) -> &ServerPublicIdentity {
        &self.server
    }

    fn new_id(&self) -> Result<Uuid, AuthError> {
        let mut bytes = [0u8; 16];
        self.random.fill(&mut bytes)?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Create a `Pending` user with no key.
    #[tracing::instrument(name = "create_user", parent = &self.span, skip_all)]
    pub async fn create_user(&self, name: Option<String>) -> Result<User, AuthError> {
        if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(AuthError::InvalidArgument("user name is empty".into()));
        }
        let user = User::pending(self.new_id()?, name);
        let record = user.clone();
        self.store
            .transaction(move |repos| Box::pin(insert_user_in(repos, record)))
            .await?;
        tracing::info!(user_id = %user.id, "user created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        self.store
            .transaction(move |repos| Box::pin(get_user_in(repos, user_id)))
            .await
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<User, AuthError> {
        let name = name.to_string();
        self.store
            .transaction(move |repos| Box::pin(get_user_by_name_in(repos, name)))
            .await
    }

    /// One page of users ordered by id, starting after `after`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero `limit`. Larger limits are capped at
    /// [`MAX_PAGE_SIZE`].
    pub async fn list_users(&self, after: Option<Uuid>, limit: u32) -> Result<Vec<User>, AuthError> {
        if limit == 0 {
            return Err(AuthError::InvalidArgument("page limit must be positive".into()));
        }
        let limit = limit.min(MAX_PAGE_SIZE);
        self.store
            .transaction(move |repos| Box::pin(list_users_in(repos, after, limit)))
            .await
    }

    /// Issue an invite, replacing any earlier one for the same user.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown user, `InvalidArgument` for a reversed window.
    #[tracing::instrument(name = "create_invite", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn create_invite(&self, user_id: Uuid, window: InviteWindow) -> Result<Invite, AuthError> {
        let now = self.clock.now();
        let random = self.random.clone();
        let invite = self
            .store
            .transaction(move |repos| Box::pin(issue_invite_in(repos, user_id, window, now, random)))
            .await?;
        tracing::info!(not_before = %invite.not_before, not_after = %invite.not_after, "invite issued");
        Ok(invite)
    }

    /// Bundle the live invite with this server's public identity.
    pub async fn export_invite_manifest(&self, user_id: Uuid) -> Result<InviteManifest, AuthError> {
        let invite = self
            .store
            .transaction(move |repos| Box::pin(get_invite_in(repos, user_id)))
            .await?;
        Ok(InviteManifest {
            server: self.server.clone(),
            invite,
        })
    }

    #[tracing::instrument(name = "revoke_invite", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn revoke_invite(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.store
            .transaction(move |repos| Box::pin(revoke_invite_in(repos, user_id)))
            .await?;
        tracing::info!("invite revoked");
        Ok(())
    }

    /// Redeem an invite: bind `public_key` to the user and consume the invite.
    ///
    /// The state change, key assignment and invite deletion commit together;
    /// on any failure the user stays as it was and the invite survives.
    ///
    /// # Errors
    ///
    /// `NotFound` (user or invite), `TokenMismatch`, `InviteNotYetValid`,
    /// `InviteExpired`, or a storage failure.
    #[tracing::instrument(name = "register_user", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn register_user(
        &self,
        user_id: Uuid,
        token: &[u8],
        public_key: PublicKey,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        let presented = token.to_vec();
        let fingerprint = public_key.fingerprint();
        let result = self
            .store
            .transaction(move |repos| Box::pin(register_in(repos, user_id, presented, public_key, now)))
            .await;
        match &result {
            Ok(()) => tracing::info!(%fingerprint, "user registered"),
            Err(err) => tracing::warn!(error = %err, "registration rejected"),
        }
        result
    }

    /// Issue a fresh login challenge, replacing any outstanding one.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown user, `UserNotRegistered` while `Pending`.
    #[tracing::instrument(name = "create_login_nonce", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn create_login_nonce(&self, user_id: Uuid) -> Result<SecretToken, AuthError> {
        let nonce = LoginNonce {
            user_id,
            nonce: SecretToken::generate(self.random.as_ref())?,
            created_at: self.clock.now(),
        };
        let challenge = nonce.nonce.clone();
        self.store
            .transaction(move |repos| Box::pin(issue_nonce_in(repos, nonce)))
            .await?;
        tracing::debug!("login challenge issued");
        Ok(challenge)
    }

    /// Complete a login by signing the outstanding challenge.
    ///
    /// The challenge is consumed in its own committed transaction before the
    /// signature is checked, so a failed attempt cannot be replayed.
    ///
    /// # Errors
    ///
    /// `NotFound` (user, or no outstanding challenge), `UserNotRegistered`,
    /// `ChallengeExpired`, `SignatureMismatch`.
    #[tracing::instrument(name = "login_user", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn login_user(&self, user_id: Uuid, signature: &Signature) -> Result<Session, AuthError> {
        let (key, challenge) = self
            .store
            .transaction(move |repos| Box::pin(take_challenge_in(repos, user_id)))
            .await?;

        let now = self.clock.now();
        if challenge.is_expired(now) {
            tracing::warn!(created_at = %challenge.created_at, "login challenge expired");
            return Err(AuthError::ChallengeExpired);
        }
        if !key.verify(challenge.nonce.as_bytes(), signature) {
            tracing::warn!("login signature rejected");
            return Err(AuthError::SignatureMismatch);
        }

        let session = Session {
            id: self.new_id()?,
            user_id,
            token: SecretToken::generate(self.random.as_ref())?,
            created_at: now,
        };
        let record = session.clone();
        self.store
            .transaction(move |repos| Box::pin(save_session_in(repos, record)))
            .await?;
        tracing::info!(session_id = %session.id, "session issued");
        Ok(session)
    }

    /// Check presented session credentials. Read-only.
    ///
    /// # Errors
    ///
    /// `NotFound`, `UserMismatch`, `TokenMismatch`, `SessionExpired`.
    pub async fn verify_session(&self, credentials: &SessionCredentials) -> Result<(), AuthError> {
        let now = self.clock.now();
        let credentials = credentials.clone();
        self.store
            .transaction(move |repos| Box::pin(check_session_in(repos, credentials, now)))
            .await
            .map(|_| ())
    }

    /// Verify the session, then delete it.
    #[tracing::instrument(name = "logout_user", parent = &self.span, skip_all, fields(session_id = %credentials.id))]
    pub async fn logout_user(&self, credentials: &SessionCredentials) -> Result<(), AuthError> {
        let now = self.clock.now();
        let credentials = credentials.clone();
        self.store
            .transaction(move |repos| Box::pin(logout_in(repos, credentials, now)))
            .await?;
        tracing::info!("session closed");
        Ok(())
    }

    /// Delete a user with its invite, login challenge and sessions.
    ///
    /// All deletions commit together or not at all.
    #[tracing::instrument(name = "delete_user", parent = &self.span, skip_all, fields(user_id = %user_id))]
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), AuthError> {
        let sessions = self
            .store
            .transaction(move |repos| Box::pin(delete_user_in(repos, user_id)))
            .await?;
        tracing::info!(sessions, "user deleted");
        Ok(())
    }
}

async fn insert_user_in(repos: &mut dyn IdentityRepos, user: User) -> Result<(), AuthError> {
    Ok(repos.insert_user(&user).await?)
}

async fn get_user_in(repos: &mut dyn IdentityRepos, user_id: Uuid) -> Result<User, AuthError> {
    Ok(repos.get_user(user_id).await?)
}

async fn get_user_by_name_in(repos: &mut dyn IdentityRepos, name: String) -> Result<User, AuthError> {
    Ok(repos.get_user_by_name(&name).await?)
}

async fn list_users_in(
    repos: &mut dyn IdentityRepos,
    after: Option<Uuid>,
    limit: u32,
) -> Result<Vec<User>, AuthError> {
    Ok(repos.list_users(after, limit).await?)
}

async fn issue_invite_in(
    repos: &mut dyn IdentityRepos,
    user_id: Uuid,
    window: InviteWindow,
    now: DateTime<Utc>,
    random: Arc<dyn RandomSource>,
) -> Result<Invite, AuthError> {
    repos.get_user(user_id).await?;
    let (not_before, not_after) = window.resolve(now)?;
    let invite = Invite {
        user_id,
        token: SecretToken::generate(random.as_ref())?,
        not_before,
        not_after,
    };
    repos.save_invite(&invite).await?;
    Ok(invite)
}

async fn get_invite_in(repos: &mut dyn IdentityRepos, user_id: Uuid) -> Result<Invite, AuthError> {
    Ok(repos.get_invite(user_id).await?)
}

async fn revoke_invite_in(repos: &mut dyn IdentityRepos, user_id: Uuid) -> Result<(), AuthError> {
    Ok(repos.delete_invite(user_id).await?)
}

async fn register_in(
    repos: &mut dyn IdentityRepos,
    user_id: Uuid,
    presented: Vec<u8>,
    public_key: PublicKey,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let user = repos.get_user(user_id).await?;
    let invite = repos.get_invite(user_id).await?;
    if !invite.token.matches(&presented) {
        return Err(AuthError::TokenMismatch);
    }
    invite.check_window(now)?;

    repos.update_user(&user.registered(public_key)).await?;
    repos.delete_invite(user_id).await?;
    Ok(())
}

async fn issue_nonce_in(repos: &mut dyn IdentityRepos, nonce: LoginNonce) -> Result<(), AuthError> {
    let user = repos.get_user(nonce.user_id).await?;
    user.login_key()?;
    repos.save_nonce(&nonce).await?;
    Ok(())
}

async fn take_challenge_in(
    repos: &mut dyn IdentityRepos,
    user_id: Uuid,
) -> Result<(PublicKey, LoginNonce), AuthError> {
    let user = repos.get_user(user_id).await?;
    let key = user.login_key()?.clone();
    let nonce = repos.consume_nonce(user_id).await?;
    Ok((key, nonce))
}

async fn save_session_in(repos: &mut dyn IdentityRepos, session: Session) -> Result<(), AuthError> {
    Ok(repos.save_session(&session).await?)
}

async fn check_session_in(
    repos: &mut dyn IdentityRepos,
    credentials: SessionCredentials,
    now: DateTime<Utc>,
) -> Result<Session, AuthError> {
    let session = repos.get_session(credentials.id).await?;
    if session.user_id != credentials.user_id {
        return Err(AuthError::UserMismatch);
    }
    if !session.token.matches(&credentials.token) {
        return Err(AuthError::TokenMismatch);
    }
    if session.is_expired(now) {
        return Err(AuthError::SessionExpired);
    }
    Ok(session)
}

async fn logout_in(
    repos: &mut dyn IdentityRepos,
    credentials: SessionCredentials,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let session = check_session_in(repos, credentials, now).await?;
    repos.delete_session(session.id).await?;
    Ok(())
}

async fn delete_user_in(repos: &mut dyn IdentityRepos, user_id: Uuid) -> Result<u64, AuthError> {
    repos.get_user(user_id).await?;
    ignore_missing(repos.delete_invite(user_id).await)?;
    ignore_missing(repos.delete_nonce(user_id).await)?;
    let sessions = repos.delete_sessions_for_user(user_id).await?;
    repos.delete_user(user_id).await?;
    Ok(sessions)
}

fn ignore_missing(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
