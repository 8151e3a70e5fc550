//! In-memory [`IdentityStore`] for unit tests.
//!
//! A transaction holds the store lock for its whole duration and works on a
//! copy of the state, which replaces the committed state only on `Ok`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::{RandomError, RandomSource};
use crate::store::StoreError;

use super::error::AuthError;
use super::model::{Invite, LoginNonce, Session, User};
use super::repo::{IdentityRepos, IdentityStore, RepoFuture};

#[derive(Clone, Default)]
struct State {
    users: BTreeMap<Uuid, User>,
    invites: HashMap<Uuid, Invite>,
    nonces: HashMap<Uuid, LoginNonce>,
    sessions: HashMap<Uuid, Session>,
}

#[derive(Default)]
pub(crate) struct MemoryIdentityStore {
    state: Mutex<State>,
    fail_invite_deletes: AtomicBool,
}

impl MemoryIdentityStore {
    /// Make every invite deletion fail with a backend error.
    pub(crate) fn fail_invite_deletes(&self, fail: bool) {
        self.fail_invite_deletes.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.users.is_empty()
            && state.invites.is_empty()
            && state.nonces.is_empty()
            && state.sessions.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn transaction<T, F>(&self, work: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: for<'r> FnOnce(&'r mut dyn IdentityRepos) -> RepoFuture<'r, T> + Send + 'static,
    {
        let mut committed = self.state.lock().await;
        let mut draft = committed.clone();
        let result = {
            let mut repos = MemoryRepos {
                state: &mut draft,
                fail_invite_deletes: self.fail_invite_deletes.load(Ordering::SeqCst),
            };
            work(&mut repos).await
        };
        if result.is_ok() {
            *committed = draft;
        }
        result
    }
}

struct MemoryRepos<'a> {
    state: &'a mut State,
    fail_invite_deletes: bool,
}

fn found<T>(value: Option<T>, entity: &'static str) -> Result<T, StoreError> {
    value.ok_or(StoreError::NotFound { entity })
}

#[async_trait]
impl IdentityRepos for MemoryRepos<'_> {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError> {
        found(self.state.users.get(&id).cloned(), "user")
    }

    async fn get_user_by_name(&mut self, name: &str) -> Result<User, StoreError> {
        let user = self
            .state
            .users
            .values()
            .find(|u| u.name.as_deref() == Some(name))
            .cloned();
        found(user, "user")
    }

    async fn list_users(
        &mut self,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<User>, StoreError> {
        Ok(self
            .state
            .users
            .values()
            .filter(|u| after.map_or(true, |a| u.id > a))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        let name_taken = user.name.is_some()
            && self.state.users.values().any(|u| u.name == user.name);
        if name_taken || self.state.users.contains_key(&user.id) {
            return Err(StoreError::Conflict { entity: "user" });
        }
        self.state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        let slot = found(self.state.users.get_mut(&user.id), "user")?;
        *slot = user.clone();
        Ok(())
    }

    async fn delete_user(&mut self, id: Uuid) -> Result<(), StoreError> {
        found(self.state.users.remove(&id), "user").map(|_| ())
    }

    async fn save_invite(&mut self, invite: &Invite) -> Result<(), StoreError> {
        self.state.invites.insert(invite.user_id, invite.clone());
        Ok(())
    }

    async fn get_invite(&mut self, user_id: Uuid) -> Result<Invite, StoreError> {
        found(self.state.invites.get(&user_id).cloned(), "invite")
    }

    async fn delete_invite(&mut self, user_id: Uuid) -> Result<(), StoreError> {
        if self.fail_invite_deletes {
            return Err(StoreError::backend(std::io::Error::other("injected failure")));
        }
        found(self.state.invites.remove(&user_id), "invite").map(|_| ())
    }

    async fn save_nonce(&mut self, nonce: &LoginNonce) -> Result<(), StoreError> {
        self.state.nonces.insert(nonce.user_id, nonce.clone());
        Ok(())
    }

    async fn consume_nonce(&mut self, user_id: Uuid) -> Result<LoginNonce, StoreError> {
        found(self.state.nonces.remove(&user_id), "login nonce")
    }

    async fn delete_nonce(&mut self, user_id: Uuid) -> Result<(), StoreError> {
        found(self.state.nonces.remove(&user_id), "login nonce").map(|_| ())
    }

    async fn save_session(&mut self, session: &Session) -> Result<(), StoreError> {
        self.state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        found(self.state.sessions.get(&id).cloned(), "session")
    }

    async fn delete_session(&mut self, id: Uuid) -> Result<(), StoreError> {
        found(self.state.sessions.remove(&id), "session").map(|_| ())
    }

    async fn delete_sessions_for_user(&mut self, user_id: Uuid) -> Result<u64, StoreError> {
        let before = self.state.sessions.len();
        self.state.sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - self.state.sessions.len()) as u64)
    }
}

/// Deterministic random source: a fixed fill with a big-endian counter in
/// the trailing bytes, so every draw is distinct and reproducible.
#[derive(Default)]
pub(crate) struct SequenceRandom {
    counter: AtomicU64,
}

impl RandomSource for SequenceRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<(), RandomError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        buf.fill(0xA5);
        let counter = n.to_be_bytes();
        let tail = buf.len().min(counter.len());
        let start = buf.len() - tail;
        buf[start..].copy_from_slice(&counter[counter.len() - tail..]);
        Ok(())
    }
}
