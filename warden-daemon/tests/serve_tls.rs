//! The listener presents a certificate clients can pin and serves the
//! user lifecycle over the pinned connection.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use warden_auth::identity::PrivateKey;
use warden_auth::trust::{ServerIdentity, TofuVerifier, TrustError, TrustStore};
use warden_auth::lifecycle::{
    AuthError, InviteWindow, Request, Response, SessionCredentials, PROTOCOL_VERSION,
};
use warden_auth::StoreError;
use warden_daemon::server::TlsServer;
use warden_daemon::tls::{build_self_signed, CertParams};
use warden_daemon::AuthHandler;

use common::TestDaemon;

/// Accepts any certificate and keeps the leaf for inspection.
#[derive(Debug)]
struct CaptureLeaf {
    leaf: Mutex<Option<Vec<u8>>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CaptureLeaf {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.leaf.lock().unwrap() = Some(end_entity.to_vec());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Default)]
struct MapTrustStore {
    pins: Mutex<HashMap<String, ServerIdentity>>,
}

impl TrustStore for MapTrustStore {
    fn get(&self, server_id: &str) -> Result<ServerIdentity, StoreError> {
        self.pins
            .lock()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or(StoreError::not_found("server"))
    }

    fn set(&self, identity: &ServerIdentity) -> Result<(), StoreError> {
        self.pins
            .lock()
            .unwrap()
            .insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    fn delete(&self, server_id: &str) -> Result<(), StoreError> {
        self.pins
            .lock()
            .unwrap()
            .remove(server_id)
            .map(|_| ())
            .ok_or(StoreError::not_found("server"))
    }
}

type Client = BufReader<TlsStream<TcpStream>>;

struct Running {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.handle.await.unwrap();
    }
}

async fn serve(daemon: &TestDaemon) -> Running {
    serve_with_handshake_timeout(daemon, warden_daemon::server::TLS_HANDSHAKE_TIMEOUT).await
}

async fn serve_with_handshake_timeout(daemon: &TestDaemon, timeout: Duration) -> Running {
    let identity = build_self_signed(&daemon.server_key, &CertParams::default()).unwrap();
    let handler = AuthHandler::new(daemon.service.clone());
    let server = TlsServer::bind("127.0.0.1:0".parse().unwrap(), &identity, handler)
        .await
        .unwrap()
        .with_handshake_timeout(timeout);
    let addr = server.local_addr().unwrap();

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(server.run(shutdown_rx));
    Running {
        addr,
        shutdown,
        handle,
    }
}

/// Connect without checking the certificate. Returns the leaf, the open
/// stream and the version line.
async fn dial(addr: SocketAddr) -> (Vec<u8>, Client, String) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let capture = Arc::new(CaptureLeaf {
        leaf: Mutex::new(None),
        provider: provider.clone(),
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(capture.clone())
        .with_no_client_auth();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::from(addr.ip()), tcp)
        .await
        .unwrap();

    let mut client = BufReader::new(tls);
    let mut greeting = String::new();
    client.read_line(&mut greeting).await.unwrap();

    let leaf = capture.leaf.lock().unwrap().take().unwrap();
    (leaf, client, greeting.trim_end().to_string())
}

async fn send_line(client: &mut Client, line: &str) -> Response {
    client.get_mut().write_all(line.as_bytes()).await.unwrap();
    client.get_mut().write_all(b"\n").await.unwrap();
    client.get_mut().flush().await.unwrap();

    let mut reply = String::new();
    client.read_line(&mut reply).await.unwrap();
    serde_json::from_str(&reply).unwrap()
}

async fn call(client: &mut Client, request: &Request) -> Response {
    send_line(client, &serde_json::to_string(request).unwrap()).await
}

fn error_code(response: Response) -> String {
    match response {
        Response::Error { code, .. } => code,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_serve_presents_pinnable_certificate() {
    let daemon = TestDaemon::new().await;
    let running = serve(&daemon).await;
    let addr = running.addr;

    let (leaf, client, greeting) = dial(addr).await;
    assert_eq!(greeting, PROTOCOL_VERSION);
    drop(client);

    let store = Arc::new(MapTrustStore::default());
    store
        .set(&ServerIdentity::new("home", addr.to_string(), daemon.server_key.public_key()))
        .unwrap();
    let verifier = TofuVerifier::new(store.clone());

    let now = chrono::Utc::now().timestamp();
    let verified = verifier.verify("home", &leaf, now).unwrap();
    assert!(!verified.rotated);

    // Pinned to some other key, the same certificate is refused.
    store
        .set(&ServerIdentity::new(
            "home",
            addr.to_string(),
            PrivateKey::generate().public_key(),
        ))
        .unwrap();
    assert!(matches!(
        verifier.verify("home", &leaf, now),
        Err(TrustError::SignatureMismatch { .. })
    ));

    running.stop().await;
}

#[tokio::test]
async fn test_register_login_logout_over_tls() {
    let daemon = TestDaemon::new().await;
    let running = serve(&daemon).await;

    let user = daemon.service.create_user(Some("ada".into())).await.unwrap();
    let invite = daemon
        .service
        .create_invite(user.id, InviteWindow::default())
        .await
        .unwrap();
    let key = PrivateKey::generate();

    let (_, mut client, _) = dial(running.addr).await;
    let registered = call(
        &mut client,
        &Request::Register {
            user_id: user.id,
            token: invite.token.to_hex(),
            public_key: key.public_key().to_hex(),
        },
    )
    .await;
    assert_eq!(registered, Response::Registered);

    let Response::Challenge { nonce } =
        call(&mut client, &Request::InitiateLogin { user_id: user.id }).await
    else {
        panic!("expected a challenge");
    };
    let signature = key.sign(&hex::decode(nonce).unwrap());
    let Response::Session {
        session_id,
        user_id,
        token,
        ..
    } = call(
        &mut client,
        &Request::CompleteLogin {
            user_id: user.id,
            signature: hex::encode(signature.to_bytes()),
        },
    )
    .await
    else {
        panic!("expected a session");
    };
    assert_eq!(user_id, user.id);

    let credentials = SessionCredentials {
        id: session_id,
        user_id,
        token: hex::decode(&token).unwrap(),
    };
    daemon.service.verify_session(&credentials).await.unwrap();

    let logout = Request::Logout {
        session_id,
        user_id,
        token,
    };
    assert_eq!(call(&mut client, &logout).await, Response::LoggedOut);
    assert!(matches!(
        daemon.service.verify_session(&credentials).await,
        Err(AuthError::NotFound { entity: "session" })
    ));

    running.stop().await;
}

#[tokio::test]
async fn test_replayed_login_is_refused_over_tls() {
    let daemon = TestDaemon::new().await;
    let running = serve(&daemon).await;
    let client_key = common::TestClient::registered(&daemon, "grace").await;

    let (_, mut client, _) = dial(running.addr).await;
    let Response::Challenge { nonce } = call(
        &mut client,
        &Request::InitiateLogin {
            user_id: client_key.user_id,
        },
    )
    .await
    else {
        panic!("expected a challenge");
    };
    let complete = Request::CompleteLogin {
        user_id: client_key.user_id,
        signature: hex::encode(
            client_key
                .private_key
                .sign(&hex::decode(nonce).unwrap())
                .to_bytes(),
        ),
    };

    assert!(matches!(call(&mut client, &complete).await, Response::Session { .. }));
    assert_eq!(error_code(call(&mut client, &complete).await), "not_found");

    running.stop().await;
}

#[tokio::test]
async fn test_malformed_request_keeps_connection_open() {
    let daemon = TestDaemon::new().await;
    let running = serve(&daemon).await;

    let (_, mut client, _) = dial(running.addr).await;
    assert_eq!(error_code(send_line(&mut client, "not json").await), "malformed_request");
    assert_eq!(
        error_code(send_line(&mut client, r#"{"op":"drop_tables"}"#).await),
        "malformed_request"
    );

    let response = call(
        &mut client,
        &Request::InitiateLogin {
            user_id: uuid::Uuid::new_v4(),
        },
    )
    .await;
    assert_eq!(error_code(response), "not_found");

    running.stop().await;
}

#[tokio::test]
async fn test_stalled_handshake_is_dropped() {
    let daemon = TestDaemon::new().await;
    let running = serve_with_handshake_timeout(&daemon, Duration::from_millis(100)).await;

    // Connect but never send a ClientHello.
    let mut tcp = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), tcp.read(&mut buf))
        .await
        .expect("server should close the stalled connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    running.stop().await;
}
