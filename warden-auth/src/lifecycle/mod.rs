//! Server-side user identity lifecycle.
//!
//! Users move `Pending → Registered` by redeeming an invite with a public
//! key, then log in by signing a single-use nonce and receive a session.
//! Storage is reached only through [`IdentityStore`] / [`IdentityRepos`].

mod clock;
mod error;
mod manifest;
#[cfg(test)]
mod memory;
mod model;
mod repo;
mod service;
mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AuthError;
pub use manifest::{ManifestDocument, ManifestServer, MANIFEST_VERSION};
pub use model::{
    Invite, InviteManifest, InviteWindow, LoginNonce, ServerPublicIdentity, Session,
    SessionCredentials, User, UserState, INVITE_VALIDITY_SECS, NONCE_TTL_SECS, SESSION_TTL_SECS,
};
pub use repo::{IdentityRepos, IdentityStore, RepoFuture};
pub use service::{UserService, MAX_PAGE_SIZE};
pub use wire::{Request, Response, MAX_MESSAGE_LEN, PROTOCOL_VERSION};
