//! TLS listener presenting the daemon's pinned identity.
//!
//! Each accepted connection completes a handshake (bounded by
//! [`TLS_HANDSHAKE_TIMEOUT`]) and receives the protocol version line. After
//! that the client sends one JSON [`Request`] per line and reads one JSON
//! [`Response`] line back, until it closes the stream or goes idle.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use warden_auth::lifecycle::{IdentityStore, Request, Response, MAX_MESSAGE_LEN, PROTOCOL_VERSION};

use crate::handler::AuthHandler;
use crate::tls::{TlsConfigError, TlsIdentity, TlsServerConfig};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection with no request for this long is closed.
pub const REQUEST_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsConfigError),
}

pub struct TlsServer<S> {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: AuthHandler<S>,
    handshake_timeout: Duration,
}

impl<S: IdentityStore + 'static> TlsServer<S> {
    pub async fn bind(
        addr: SocketAddr,
        identity: &TlsIdentity,
        handler: AuthHandler<S>,
    ) -> Result<Self, ServerError> {
        let config = TlsServerConfig::new_server_only(identity)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        tracing::info!(addr = %addr, fingerprint = %identity.fingerprint, "listener bound");

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(config.into_rustls_config()),
            handler,
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((tcp_stream, peer_addr)) => {
                            let acceptor = self.acceptor.clone();
                            let handler = self.handler.clone();
                            let handshake_timeout = self.handshake_timeout;
                            tokio::spawn(async move {
                                handle_connection(acceptor, handler, handshake_timeout, tcp_stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection<S: IdentityStore>(
    acceptor: TlsAcceptor,
    handler: AuthHandler<S>,
    handshake_timeout: Duration,
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let mut tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp_stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            // Clients that reject our key abort the handshake; this is where it shows.
            tracing::warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer_addr, "TLS handshake timed out");
            return;
        }
    };
    tracing::debug!(peer = %peer_addr, "TLS handshake successful");

    if let Err(e) = write_line(&mut tls_stream, PROTOCOL_VERSION).await {
        tracing::debug!(peer = %peer_addr, error = %e, "failed to write greeting");
        return;
    }

    let mut stream = BufReader::new(tls_stream);
    loop {
        let message = match tokio::time::timeout(REQUEST_IDLE_TIMEOUT, read_message(&mut stream)).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer_addr, error = %e, "read failed");
                break;
            }
            Err(_) => {
                tracing::debug!(peer = %peer_addr, "connection idle, closing");
                break;
            }
        };

        let (response, keep_open) = match message {
            Message::Line(line) => match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    tracing::debug!(peer = %peer_addr, op = request.op(), "request");
                    (handler.handle(request).await, true)
                }
                Err(e) => (Response::malformed(e.to_string()), true),
            },
            Message::TooLong => (Response::malformed("request too long"), false),
        };

        if let Err(e) = write_response(stream.get_mut(), &response).await {
            tracing::debug!(peer = %peer_addr, error = %e, "failed to write response");
            return;
        }
        if !keep_open {
            break;
        }
    }
    let _ = stream.get_mut().shutdown().await;
}

enum Message {
    Line(String),
    TooLong,
}

/// Read one newline-terminated message of at most [`MAX_MESSAGE_LEN`]
/// bytes. `None` at end of stream.
async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Message>> {
    let mut line = String::new();
    let read = (&mut *reader)
        .take(MAX_MESSAGE_LEN as u64)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if read == MAX_MESSAGE_LEN && !line.ends_with('\n') {
        return Ok(Some(Message::TooLong));
    }
    Ok(Some(Message::Line(line)))
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> std::io::Result<()> {
    let line = serde_json::to_string(response).map_err(std::io::Error::other)?;
    write_line(writer, &line).await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Resolve on SIGINT or SIGTERM, then broadcast shutdown.
pub async fn shutdown_on_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_message_bounds_length() {
        let mut input = format!("{}\n", "x".repeat(10)).into_bytes();
        input.extend(vec![b'y'; MAX_MESSAGE_LEN + 10]);
        let mut reader = BufReader::new(&input[..]);

        match read_message(&mut reader).await.unwrap() {
            Some(Message::Line(line)) => assert_eq!(line, format!("{}\n", "x".repeat(10))),
            _ => panic!("expected a line"),
        }
        assert!(matches!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::TooLong)
        ));
    }

    #[tokio::test]
    async fn test_read_message_end_of_stream() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }
}
