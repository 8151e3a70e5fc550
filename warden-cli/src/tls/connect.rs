//! Dial a pinned server and exchange requests with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use warden_auth::lifecycle::{Request, Response, MAX_MESSAGE_LEN};
use warden_auth::trust::{ServerIdentity, Verified};

use super::client::{build_pinned_config, PinnedServerVerifier};

/// Port assumed when a pin records a bare IP.
pub const DEFAULT_PORT: u16 = 4433;

/// An open, verified connection.
pub struct Connection {
    pub verified: Verified,
    /// Protocol version line sent by the server.
    pub version: String,
    stream: BufReader<TlsStream<TcpStream>>,
    timeout: Duration,
}

impl Connection {
    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        if line.len() > MAX_MESSAGE_LEN {
            bail!("request too long");
        }

        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await.context("Failed to send request")?;
        stream.flush().await.context("Failed to send request")?;

        let reply = tokio::time::timeout(self.timeout, read_line(&mut self.stream))
            .await
            .map_err(|_| anyhow!("no response to {} request", request.op()))??;
        serde_json::from_str(&reply).context("Malformed response from server")
    }

    pub async fn close(mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

async fn read_line(stream: &mut BufReader<TlsStream<TcpStream>>) -> Result<String> {
    let mut line = String::new();
    let read = stream.read_line(&mut line).await.context("Failed to read from server")?;
    if read == 0 {
        bail!("server closed the connection");
    }
    Ok(line)
}

/// Socket address for a pin. Pins carry literal IPs; host names are refused.
pub fn dial_addr(pin: &ServerIdentity) -> Result<SocketAddr> {
    let address = pin.address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = pin
        .ip()
        .ok_or_else(|| anyhow!("pin {} has no literal IP address: {}", pin.id, pin.address))?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}

/// Connect to `pin`, verifying the server through `verifier`. `timeout`
/// bounds the TCP connect, the handshake and each response separately.
///
/// Confirming a rotated key can outlast the server's handshake timeout.
/// When the connection fails after a rotation was accepted, the new pin is
/// already stored and the dial is repeated once.
pub async fn connect(
    pin: &ServerIdentity,
    verifier: Arc<PinnedServerVerifier>,
    timeout: Duration,
) -> Result<Connection> {
    match dial(pin, &verifier, timeout).await {
        Ok(connection) => Ok(connection),
        Err(err) => match verifier.take_verified() {
            Some(verified) if verified.rotated => {
                tracing::warn!(
                    server_id = %pin.id,
                    error = %err,
                    "connection lost while the new key was confirmed; reconnecting"
                );
                let mut connection = dial(pin, &verifier, timeout).await?;
                connection.verified.rotated = true;
                Ok(connection)
            }
            _ => Err(err),
        },
    }
}

async fn dial(
    pin: &ServerIdentity,
    verifier: &Arc<PinnedServerVerifier>,
    timeout: Duration,
) -> Result<Connection> {
    let addr = dial_addr(pin)?;
    let config = build_pinned_config(verifier.clone()).context("Failed to build TLS config")?;
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("timed out connecting to {addr}"))?
        .with_context(|| format!("Failed to connect to {addr}"))?;
    tracing::debug!(server_id = %pin.id, %addr, "tcp connected");

    let handshake = tokio::time::timeout(timeout, connector.connect(ServerName::from(addr.ip()), tcp))
        .await
        .map_err(|_| anyhow!("TLS handshake with {addr} timed out"))?;
    let tls = match handshake {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(rejection) = verifier.take_rejection() {
                return Err(anyhow::Error::new(rejection)
                    .context(format!("server {} rejected", pin.id)));
            }
            return Err(e).with_context(|| format!("TLS handshake with {addr} failed"));
        }
    };

    // The verification result stays with the verifier until the server has
    // answered, so a failure here still shows whether a rotation happened.
    let mut stream = BufReader::new(tls);
    let version = tokio::time::timeout(timeout, read_line(&mut stream))
        .await
        .map_err(|_| anyhow!("no greeting from {addr}"))?
        .context("Failed to read greeting")?;

    let Some(verified) = verifier.take_verified() else {
        bail!("handshake completed without a verification result");
    };

    Ok(Connection {
        verified,
        version: version.trim_end().to_string(),
        stream,
        timeout,
    })
}
