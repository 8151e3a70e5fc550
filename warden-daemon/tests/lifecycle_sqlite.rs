//! Identity lifecycle against the SQLite store.

mod common;

use chrono::Duration;
use common::{TestClient, TestDaemon};
use warden_auth::identity::PrivateKey;
use warden_auth::lifecycle::{AuthError, InviteWindow, ManifestDocument, UserState};

#[tokio::test]
async fn test_invite_is_single_use() {
    let daemon = TestDaemon::new().await;
    let user = daemon.service.create_user(Some("ada".into())).await.unwrap();
    let invite = daemon
        .service
        .create_invite(user.id, InviteWindow::default())
        .await
        .unwrap();
    assert_eq!(invite.not_after - invite.not_before, Duration::hours(24));

    let key = PrivateKey::generate();
    daemon
        .service
        .register_user(user.id, invite.token.as_bytes(), key.public_key())
        .await
        .unwrap();

    let stored = daemon.service.get_user(user.id).await.unwrap();
    assert_eq!(stored.state, UserState::Registered);
    assert_eq!(stored.public_key, Some(key.public_key()));

    let err = daemon
        .service
        .register_user(user.id, invite.token.as_bytes(), key.public_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotFound { entity: "invite" }));
}

#[tokio::test]
async fn test_wrong_token_leaves_invite_in_place() {
    let daemon = TestDaemon::new().await;
    let user = daemon.service.create_user(None).await.unwrap();
    let invite = daemon
        .service
        .create_invite(user.id, InviteWindow::default())
        .await
        .unwrap();

    let err = daemon
        .service
        .register_user(user.id, &[0u8; 32], PrivateKey::generate().public_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenMismatch));

    let manifest = daemon.service.export_invite_manifest(user.id).await.unwrap();
    assert!(manifest.invite.token.matches(invite.token.as_bytes()));
    assert_eq!(
        daemon.service.get_user(user.id).await.unwrap().state,
        UserState::Pending
    );
}

#[tokio::test]
async fn test_invite_window_boundaries() {
    let daemon = TestDaemon::new().await;
    let user = daemon.service.create_user(None).await.unwrap();
    let now = common::start();
    let window = InviteWindow {
        not_before: Some(now + Duration::hours(1)),
        not_after: Some(now + Duration::hours(2)),
    };
    let invite = daemon.service.create_invite(user.id, window).await.unwrap();
    let key = PrivateKey::generate().public_key();

    let err = daemon
        .service
        .register_user(user.id, invite.token.as_bytes(), key.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InviteNotYetValid));

    daemon.clock.set(now + Duration::hours(2) + Duration::seconds(1));
    let err = daemon
        .service
        .register_user(user.id, invite.token.as_bytes(), key.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InviteExpired));

    daemon.clock.set(now + Duration::hours(1));
    daemon
        .service
        .register_user(user.id, invite.token.as_bytes(), key)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_manifest_document_carries_server_identity() {
    let daemon = TestDaemon::new().await;
    let user = daemon.service.create_user(None).await.unwrap();
    let invite = daemon
        .service
        .create_invite(user.id, InviteWindow::default())
        .await
        .unwrap();

    let manifest = daemon.service.export_invite_manifest(user.id).await.unwrap();
    let json = serde_json::to_string(&ManifestDocument::from(&manifest)).unwrap();
    let document: ManifestDocument = serde_json::from_str(&json).unwrap();

    assert_eq!(document.user_id, user.id);
    assert_eq!(document.server.address, "127.0.0.1:4433");
    assert_eq!(
        document.server_public_key().unwrap(),
        daemon.server_key.public_key()
    );
    assert!(document.token().unwrap().matches(invite.token.as_bytes()));
}

#[tokio::test]
async fn test_concurrent_logins_single_winner() {
    let daemon = TestDaemon::new().await;
    let client = TestClient::registered(&daemon, "ada").await;

    let nonce = daemon
        .service
        .create_login_nonce(client.user_id)
        .await
        .unwrap();
    let signature = client.private_key.sign(nonce.as_bytes());

    let (first, second) = tokio::join!(
        daemon.service.login_user(client.user_id, &signature),
        daemon.service.login_user(client.user_id, &signature),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AuthError::NotFound { entity: "login nonce" }))));
}

#[tokio::test]
async fn test_challenge_expiry_boundary() {
    let daemon = TestDaemon::new().await;
    let client = TestClient::registered(&daemon, "ada").await;

    let nonce = daemon
        .service
        .create_login_nonce(client.user_id)
        .await
        .unwrap();
    daemon.clock.advance(Duration::seconds(61));

    let err = daemon
        .service
        .login_user(client.user_id, &client.private_key.sign(nonce.as_bytes()))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::ChallengeExpired));

    // The expired challenge was still consumed.
    let err = daemon
        .service
        .login_user(client.user_id, &client.private_key.sign(nonce.as_bytes()))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotFound { .. }));
}

#[tokio::test]
async fn test_session_lifetime_and_logout() {
    let daemon = TestDaemon::new().await;
    let client = TestClient::registered(&daemon, "ada").await;
    let session = client.login(&daemon).await;
    let credentials = session.credentials();

    daemon.clock.advance(Duration::hours(12));
    daemon.service.verify_session(&credentials).await.unwrap();

    daemon.clock.advance(Duration::seconds(1));
    let err = daemon.service.verify_session(&credentials).await.unwrap_err();
    assert!(matches!(err, AuthError::SessionExpired));

    daemon.clock.set(common::start());
    daemon.service.logout_user(&credentials).await.unwrap();
    let err = daemon.service.verify_session(&credentials).await.unwrap_err();
    assert!(matches!(err, AuthError::NotFound { entity: "session" }));
}

#[tokio::test]
async fn test_delete_user_cascades() {
    let daemon = TestDaemon::new().await;
    let client = TestClient::registered(&daemon, "ada").await;
    let first = client.login(&daemon).await.credentials();
    let second = client.login(&daemon).await.credentials();
    daemon
        .service
        .create_login_nonce(client.user_id)
        .await
        .unwrap();
    daemon
        .service
        .create_invite(client.user_id, InviteWindow::default())
        .await
        .unwrap();

    daemon.service.delete_user(client.user_id).await.unwrap();

    assert!(matches!(
        daemon.service.get_user(client.user_id).await,
        Err(AuthError::NotFound { entity: "user" })
    ));
    assert!(matches!(
        daemon.service.export_invite_manifest(client.user_id).await,
        Err(AuthError::NotFound { entity: "invite" })
    ));
    for credentials in [first, second] {
        assert!(matches!(
            daemon.service.verify_session(&credentials).await,
            Err(AuthError::NotFound { entity: "session" })
        ));
    }

    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_sessions")
        .fetch_one(daemon.service.store().pool())
        .await
        .unwrap();
    let nonces: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM login_nonces")
        .fetch_one(daemon.service.store().pool())
        .await
        .unwrap();
    assert_eq!((sessions, nonces), (0, 0));
}

#[tokio::test]
async fn test_list_users_pages_by_id() {
    let daemon = TestDaemon::new().await;
    for name in ["a", "b", "c", "d", "e"] {
        daemon.service.create_user(Some(name.into())).await.unwrap();
    }

    let first = daemon.service.list_users(None, 3).await.unwrap();
    let rest = daemon
        .service
        .list_users(first.last().map(|u| u.id), 3)
        .await
        .unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(rest.len(), 2);
    let ids: Vec<_> = first.iter().chain(&rest).map(|u| u.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let by_name = daemon.service.get_user_by_name("c").await.unwrap();
    assert!(ids.contains(&by_name.id));
}

#[tokio::test]
async fn test_database_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.db");

    let user_id = {
        let store = warden_daemon::SqliteIdentityStore::open(&path).await.unwrap();
        let service = warden_auth::UserService::new(
            store,
            warden_auth::lifecycle::ServerPublicIdentity {
                address: "127.0.0.1:4433".into(),
                public_key: PrivateKey::generate().public_key(),
            },
        );
        let id = service.create_user(Some("ada".into())).await.unwrap().id;
        service.store().pool().close().await;
        id
    };

    let store = warden_daemon::SqliteIdentityStore::open(&path).await.unwrap();
    let service = warden_auth::UserService::new(
        store,
        warden_auth::lifecycle::ServerPublicIdentity {
            address: "127.0.0.1:4433".into(),
            public_key: PrivateKey::generate().public_key(),
        },
    );
    let user = service.get_user(user_id).await.unwrap();
    assert_eq!(user.name.as_deref(), Some("ada"));
}
