//! Shared fixtures for daemon integration tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;
use warden_auth::identity::PrivateKey;
use warden_auth::lifecycle::{
    InviteWindow, ManualClock, ServerPublicIdentity, Session, User, UserService,
};
use warden_daemon::SqliteIdentityStore;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
}

/// A user service over a fresh in-memory database with a manual clock.
pub struct TestDaemon {
    pub server_key: PrivateKey,
    pub clock: Arc<ManualClock>,
    pub service: Arc<UserService<SqliteIdentityStore>>,
}

impl TestDaemon {
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        let store = SqliteIdentityStore::new(pool).await.expect("schema");

        let server_key = PrivateKey::generate();
        let clock = Arc::new(ManualClock::new(start()));
        let server = ServerPublicIdentity {
            address: "127.0.0.1:4433".to_string(),
            public_key: server_key.public_key(),
        };
        let service = Arc::new(UserService::new(store, server).with_clock(clock.clone()));

        Self {
            server_key,
            clock,
            service,
        }
    }
}

/// An invited user holding its own key.
pub struct TestClient {
    pub user_id: Uuid,
    pub private_key: PrivateKey,
}

impl TestClient {
    /// Create, invite and register a user.
    pub async fn registered(daemon: &TestDaemon, name: &str) -> Self {
        let user: User = daemon
            .service
            .create_user(Some(name.to_string()))
            .await
            .expect("create user");
        let invite = daemon
            .service
            .create_invite(user.id, InviteWindow::default())
            .await
            .expect("create invite");

        let private_key = PrivateKey::generate();
        daemon
            .service
            .register_user(user.id, invite.token.as_bytes(), private_key.public_key())
            .await
            .expect("register");

        Self {
            user_id: user.id,
            private_key,
        }
    }

    pub async fn login(&self, daemon: &TestDaemon) -> Session {
        let nonce = daemon
            .service
            .create_login_nonce(self.user_id)
            .await
            .expect("nonce");
        let signature = self.private_key.sign(nonce.as_bytes());
        daemon
            .service
            .login_user(self.user_id, &signature)
            .await
            .expect("login")
    }
}
