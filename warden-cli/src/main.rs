//! Warden CLI - pin servers, register with them and log in

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use warden_auth::identity::PublicKey;
use warden_auth::lifecycle::{ManifestDocument, Request, Response};
use warden_auth::trust::{ServerIdentity, TofuVerifier, TrustStore};
use warden_auth::Fingerprint;

mod account;
mod prompt;
mod tls;
mod trust;
mod utils;

use account::{Account, AccountStore, SavedSession};
use prompt::TerminalPrompt;
use tls::{Connection, PinnedServerVerifier};
use trust::TomlTrustStore;
use utils::format_timestamp_secs;

/// Warden - trust-on-first-use server pinning
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Pin file (default: trust.toml in the user config directory)
    #[arg(long, env = "WARDEN_TRUST_STORE", global = true)]
    trust_store: Option<PathBuf>,

    /// Directory holding the user key and accounts (default: identity/ in
    /// the user data directory)
    #[arg(long, env = "WARDEN_ACCOUNT_DIR", global = true)]
    account_dir: Option<PathBuf>,

    /// Seconds allowed for connecting, the handshake and the rotation prompt
    #[arg(long, default_value_t = 30, global = true)]
    timeout: u64,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage pinned servers
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Connect to a pinned server and print its protocol version
    Connect {
        /// Server id
        server: String,
    },

    /// Redeem an invite manifest, pinning its server if needed
    Register {
        /// Local name for the server
        server: String,
        /// Manifest JSON file ("-" for stdin)
        manifest: PathBuf,
    },

    /// Log in to a server and save the session
    Login {
        /// Server id
        server: String,
    },

    /// End the saved session on a server
    Logout {
        /// Server id
        server: String,
    },
}

#[derive(Subcommand)]
enum PinAction {
    /// Pin a server key obtained out-of-band
    Add {
        /// Local name for the server
        id: String,
        /// Literal IP address, optionally with port
        address: String,
        /// Hex-encoded Ed25519 public key
        public_key: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Pin the server named in an invite manifest
    Import {
        /// Local name for the server
        id: String,
        /// Manifest JSON file ("-" for stdin)
        manifest: PathBuf,
        #[arg(long)]
        label: Option<String>,
    },
    /// Forget a server
    Remove { id: String },
    /// List pinned servers
    List,
}

#[derive(Serialize)]
struct PinView {
    id: String,
    address: String,
    fingerprint: String,
    pinned_at: i64,
    label: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let path = match cli.trust_store {
        Some(path) => path,
        None => TomlTrustStore::default_path()?,
    };
    let store = Arc::new(TomlTrustStore::new(path));
    let accounts = match cli.account_dir {
        Some(dir) => AccountStore::new(dir),
        None => AccountStore::new(AccountStore::default_dir()?),
    };
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Pin { action } => cmd_pin(&store, action, cli.json),
        Commands::Connect { server } => cmd_connect(store, &server, timeout, cli.json).await,
        Commands::Register { server, manifest } => {
            cmd_register(store, &accounts, &server, &manifest, timeout).await
        }
        Commands::Login { server } => cmd_login(store, &accounts, &server, timeout).await,
        Commands::Logout { server } => cmd_logout(store, &accounts, &server, timeout).await,
    }
}

fn cmd_pin(store: &TomlTrustStore, action: PinAction, json: bool) -> Result<()> {
    match action {
        PinAction::Add {
            id,
            address,
            public_key,
            label,
        } => {
            let public_key =
                PublicKey::from_hex(public_key.trim()).context("Invalid public key")?;
            let server = ServerIdentity::new(id, address, public_key);
            check_literal_ip(&server)?;
            store.pin(&server, label)?;
            println!("Pinned {} ({})", server.id, server.public_key.fingerprint());
        }
        PinAction::Import {
            id,
            manifest,
            label,
        } => {
            let document = read_manifest(&manifest)?;
            let server = manifest_server(id, &document)?;
            store.pin(&server, label)?;
            print_manifest_pin(&server);
        }
        PinAction::Remove { id } => {
            store
                .delete(&id)
                .with_context(|| format!("Failed to remove pin {id}"))?;
            println!("Removed {id}");
        }
        PinAction::List => {
            let entries = store.list()?;
            let views: Vec<PinView> = entries
                .into_iter()
                .map(|entry| PinView {
                    fingerprint: entry.server.public_key.fingerprint().to_string(),
                    id: entry.server.id,
                    address: entry.server.address,
                    pinned_at: entry.pinned_at,
                    label: entry.label,
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                println!("No pinned servers.");
            } else {
                for view in &views {
                    println!(
                        "{:<16} {:<24} {}  {}{}",
                        view.id,
                        view.address,
                        view.fingerprint,
                        format_timestamp_secs(view.pinned_at),
                        view.label
                            .as_deref()
                            .map(|l| format!("  ({l})"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

/// Dial a pinned server, asking before accepting a changed key.
async fn open_connection(
    store: Arc<TomlTrustStore>,
    server_id: &str,
    timeout: Duration,
) -> Result<Connection> {
    let pin = store
        .get(server_id)
        .with_context(|| format!("No pin for {server_id}; add one with `warden pin add`"))?;

    let span = tracing::info_span!("verify", server_id = %server_id);
    let tofu = TofuVerifier::new(store)
        .with_prompt(Arc::new(TerminalPrompt::new(timeout)))
        .with_span(span);
    let verifier = PinnedServerVerifier::new(server_id, tofu);

    let connection = tls::connect(&pin, verifier, timeout).await?;
    if connection.verified.rotated {
        println!(
            "Pinned key for {} replaced with {}",
            connection.verified.server.id,
            connection.verified.server.public_key.fingerprint()
        );
    }
    Ok(connection)
}

async fn cmd_connect(
    store: Arc<TomlTrustStore>,
    server_id: &str,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let connection = open_connection(store, server_id, timeout).await?;
    let verified = &connection.verified;

    if json {
        let output = serde_json::json!({
            "server": verified.server.id,
            "address": verified.server.address,
            "fingerprint": verified.server.public_key.fingerprint().to_string(),
            "rotated": verified.rotated,
            "version": connection.version,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Connected to {} ({})", verified.server.id, verified.server.address);
        println!("Protocol version: {}", connection.version);
    }
    connection.close().await;
    Ok(())
}

async fn cmd_register(
    store: Arc<TomlTrustStore>,
    accounts: &AccountStore,
    server_id: &str,
    manifest: &Path,
    timeout: Duration,
) -> Result<()> {
    let document = read_manifest(manifest)?;
    let token = document
        .token()
        .context("Manifest carries an invalid invite token")?;
    let server = manifest_server(server_id.to_string(), &document)?;

    match store.get(server_id) {
        Ok(pinned) if pinned.public_key != server.public_key => bail!(
            "{server_id} is pinned to a different key; replace it with `warden pin import` first"
        ),
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            store.pin(&server, None)?;
            print_manifest_pin(&server);
        }
        Err(e) => return Err(e.into()),
    }

    let key = accounts.load_or_generate_key()?;
    let mut connection = open_connection(store, server_id, timeout).await?;
    let response = connection
        .call(&Request::Register {
            user_id: document.user_id,
            token: token.to_hex(),
            public_key: key.public_key().to_hex(),
        })
        .await?;
    connection.close().await;
    expect(response, "register", |r| matches!(r, Response::Registered))?;

    accounts.save(
        server_id,
        &Account {
            user_id: document.user_id,
            session: None,
        },
    )?;
    println!("Registered as {} on {}", document.user_id, server_id);
    println!("Key fingerprint: {}", key.public_key().fingerprint());
    Ok(())
}

async fn cmd_login(
    store: Arc<TomlTrustStore>,
    accounts: &AccountStore,
    server_id: &str,
    timeout: Duration,
) -> Result<()> {
    let mut account = accounts
        .get(server_id)?
        .with_context(|| format!("No account on {server_id}; run `warden register` first"))?;
    let key = accounts.load_or_generate_key()?;

    let mut connection = open_connection(store, server_id, timeout).await?;
    let nonce = match connection
        .call(&Request::InitiateLogin {
            user_id: account.user_id,
        })
        .await?
    {
        Response::Challenge { nonce } => hex::decode(nonce).context("Malformed login challenge")?,
        other => return Err(refusal(other, "login")),
    };

    let response = connection
        .call(&Request::CompleteLogin {
            user_id: account.user_id,
            signature: hex::encode(key.sign(&nonce).to_bytes()),
        })
        .await?;
    connection.close().await;

    let session = match response {
        Response::Session {
            session_id,
            token,
            created_at,
            ..
        } => SavedSession {
            id: session_id,
            token,
            created_at,
        },
        other => return Err(refusal(other, "login")),
    };
    println!("Logged in to {} (session {})", server_id, session.id);
    account.session = Some(session);
    accounts.save(server_id, &account)?;
    Ok(())
}

async fn cmd_logout(
    store: Arc<TomlTrustStore>,
    accounts: &AccountStore,
    server_id: &str,
    timeout: Duration,
) -> Result<()> {
    let mut account = accounts
        .get(server_id)?
        .with_context(|| format!("No account on {server_id}"))?;
    let Some(credentials) = account.credentials()? else {
        bail!("Not logged in to {server_id}");
    };

    let mut connection = open_connection(store, server_id, timeout).await?;
    let response = connection
        .call(&Request::Logout {
            session_id: credentials.id,
            user_id: credentials.user_id,
            token: hex::encode(&credentials.token),
        })
        .await?;
    connection.close().await;

    match response {
        Response::LoggedOut => {}
        // Gone or expired on the server: the saved copy is useless too.
        Response::Error { ref code, .. } if code == "not_found" || code == "session_expired" => {}
        other => return Err(refusal(other, "logout")),
    }

    account.session = None;
    accounts.save(server_id, &account)?;
    println!("Logged out of {server_id}");
    Ok(())
}

/// Accept `response` if `ok` holds, otherwise turn it into an error.
fn expect(response: Response, op: &str, ok: impl Fn(&Response) -> bool) -> Result<()> {
    if ok(&response) {
        Ok(())
    } else {
        Err(refusal(response, op))
    }
}

fn refusal(response: Response, op: &str) -> anyhow::Error {
    match response {
        Response::Error { code, message } => anyhow::anyhow!("{op} refused: {message} [{code}]"),
        other => anyhow::anyhow!("unexpected reply to {op}: {other:?}"),
    }
}

/// Server identity named by a manifest, with its fingerprint checked.
fn manifest_server(id: String, document: &ManifestDocument) -> Result<ServerIdentity> {
    let public_key = document
        .server_public_key()
        .context("Manifest carries an invalid server key")?;
    let claimed = Fingerprint::parse(&document.server.fingerprint)
        .context("Manifest carries an invalid fingerprint")?;
    if claimed != public_key.fingerprint() {
        bail!("Manifest fingerprint does not match its server key");
    }
    let server = ServerIdentity::new(id, document.server.address.clone(), public_key);
    check_literal_ip(&server)?;
    Ok(server)
}

fn print_manifest_pin(server: &ServerIdentity) {
    println!("Pinned {} at {}", server.id, server.address);
    println!("Fingerprint: {}", server.public_key.fingerprint());
    println!();
    println!("Confirm this fingerprint with the server operator.");
}

fn check_literal_ip(server: &ServerIdentity) -> Result<()> {
    if server.ip().is_none() {
        bail!(
            "Address {} is not a literal IP; pins bind to the address dialed",
            server.address
        );
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<ManifestDocument> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .context("Failed to read manifest from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&content).context("Failed to parse invite manifest")
}
