//! Repository and transaction seams implemented by storage backends.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::StoreError;

use super::error::AuthError;
use super::model::{Invite, LoginNonce, Session, User};

/// Boxed future returned by transaction bodies.
pub type RepoFuture<'r, T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send + 'r>>;

/// Entity access inside one transaction.
///
/// Every lookup or delete of an absent record returns
/// `StoreError::NotFound`, never an empty success.
#[async_trait]
pub trait IdentityRepos: Send {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError>;

    async fn get_user_by_name(&mut self, name: &str) -> Result<User, StoreError>;

    /// Users ordered by id, strictly after `after`, at most `limit`.
    async fn list_users(&mut self, after: Option<Uuid>, limit: u32)
        -> Result<Vec<User>, StoreError>;

    /// `StoreError::Conflict` if the id or name is taken.
    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;

    /// Replace the stored record with this snapshot.
    async fn update_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn delete_user(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Insert or overwrite the invite keyed by `invite.user_id`.
    async fn save_invite(&mut self, invite: &Invite) -> Result<(), StoreError>;

    async fn get_invite(&mut self, user_id: Uuid) -> Result<Invite, StoreError>;

    async fn delete_invite(&mut self, user_id: Uuid) -> Result<(), StoreError>;

    /// Insert or overwrite the nonce keyed by `nonce.user_id`.
    async fn save_nonce(&mut self, nonce: &LoginNonce) -> Result<(), StoreError>;

    /// Read and delete the user's nonce as one step.
    ///
    /// # Atomicity
    ///
    /// Of two concurrent consumers of the same nonce exactly one receives
    /// it; the other observes `NotFound`, never a stale copy.
    async fn consume_nonce(&mut self, user_id: Uuid) -> Result<LoginNonce, StoreError>;

    async fn delete_nonce(&mut self, user_id: Uuid) -> Result<(), StoreError>;

    async fn save_session(&mut self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError>;

    async fn delete_session(&mut self, id: Uuid) -> Result<(), StoreError>;

    /// Returns the number of sessions removed (zero is not an error).
    async fn delete_sessions_for_user(&mut self, user_id: Uuid) -> Result<u64, StoreError>;
}

/// Transaction runner over [`IdentityRepos`].
///
/// `work` receives the repositories of a single transaction. If it returns
/// `Ok` the transaction commits; on `Err` nothing it wrote is kept.
///
/// Composition happens by passing the borrowed repositories down: a helper
/// taking `&mut dyn IdentityRepos` called from inside `work` joins the
/// enclosing transaction instead of opening a nested one.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn transaction<T, F>(&self, work: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: for<'r> FnOnce(&'r mut dyn IdentityRepos) -> RepoFuture<'r, T> + Send + 'static;
}
