//! Warden daemon: TLS listener for registration and login, plus user
//! identity administration.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use warden_auth::identity::PrivateKey;
use warden_auth::lifecycle::{InviteWindow, ManifestDocument, ServerPublicIdentity, User, UserService};

use warden_daemon::server::{shutdown_on_signal, TlsServer};
use warden_daemon::tls::{build_self_signed, CertParams};
use warden_daemon::{keys, AuthHandler, DaemonConfig, SqliteIdentityStore};

/// Warden daemon - pinned TLS identity and user lifecycle
#[derive(Parser)]
#[command(name = "warden-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve registration and login over TLS (default if no command given)
    Serve {
        /// Listen address (overrides WARDEN_LISTEN_ADDR)
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Address clients dial (overrides WARDEN_ADVERTISE_ADDR)
        #[arg(long)]
        advertise: Option<SocketAddr>,
    },

    /// Print the server address and key fingerprint clients should pin
    Identity,

    /// User management
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Invite management
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a pending user
    Create {
        /// Unique display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Show one user by id or name
    Show { user: String },
    /// List users in id order
    List {
        /// Start after this user id
        #[arg(long)]
        after: Option<Uuid>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Delete a user with its invite, login nonce and sessions
    Delete { user: String },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Issue (or replace) the invite for a user
    Create {
        user: String,
        /// Start of the window, RFC 3339 (default: now)
        #[arg(long)]
        not_before: Option<DateTime<Utc>>,
        /// Window length, e.g. "30m", "24h", "7d" (default: 24h)
        #[arg(long)]
        valid_for: Option<String>,
    },
    /// Print the invite manifest as JSON
    Export { user: String },
    /// Withdraw an unredeemed invite
    Revoke { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::from_env()?;

    match cli.command {
        Some(Commands::Serve { listen, advertise }) => {
            if let Some(listen) = listen {
                if config.advertise_addr == config.listen_addr {
                    config.advertise_addr = listen;
                }
                config.listen_addr = listen;
            }
            if let Some(advertise) = advertise {
                config.advertise_addr = advertise;
            }
            cmd_serve(config).await
        }
        None => cmd_serve(config).await,
        Some(Commands::Identity) => cmd_identity(&config),
        Some(Commands::User { action }) => cmd_user(&config, action).await,
        Some(Commands::Invite { action }) => cmd_invite(&config, action).await,
    }
}

fn public_identity(config: &DaemonConfig, key: &PrivateKey) -> ServerPublicIdentity {
    ServerPublicIdentity {
        address: config.advertise_addr.to_string(),
        public_key: key.public_key(),
    }
}

async fn open_service(config: &DaemonConfig) -> Result<UserService<SqliteIdentityStore>> {
    let key = keys::load_or_generate(&config.key_path())?;
    open_service_with_key(config, &key).await
}

async fn open_service_with_key(
    config: &DaemonConfig,
    key: &PrivateKey,
) -> Result<UserService<SqliteIdentityStore>> {
    let store = SqliteIdentityStore::open(config.db_path())
        .await
        .with_context(|| format!("opening {}", config.db_path().display()))?;
    Ok(UserService::new(store, public_identity(config, key)))
}

/// Accept a user id or, failing that, a user name.
async fn resolve_user(service: &UserService<SqliteIdentityStore>, user: &str) -> Result<User> {
    let found = match Uuid::parse_str(user) {
        Ok(id) => service.get_user(id).await?,
        Err(_) => service.get_user_by_name(user).await?,
    };
    Ok(found)
}

async fn cmd_serve(config: DaemonConfig) -> Result<()> {
    let key = keys::load_or_generate(&config.key_path())?;
    let params = CertParams::for_address(config.advertise_addr.ip(), config.cert_validity_days);
    let identity = build_self_signed(&key, &params)?;

    let service = open_service_with_key(&config, &key).await?;
    let handler = AuthHandler::new(Arc::new(service));
    let server = TlsServer::bind(config.listen_addr, &identity, handler).await?;
    tracing::info!(
        listen = %server.local_addr()?,
        advertise = %config.advertise_addr,
        fingerprint = %identity.fingerprint,
        "Warden daemon starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let signal_task = tokio::spawn(shutdown_on_signal(shutdown_tx));

    server.run(shutdown_rx).await;
    signal_task.abort();

    tracing::info!("Daemon shutdown complete");
    Ok(())
}

fn cmd_identity(config: &DaemonConfig) -> Result<()> {
    let key = keys::load_or_generate(&config.key_path())?;
    let identity = public_identity(config, &key);

    println!("Address:     {}", identity.address);
    println!("Public key:  {}", identity.public_key.to_hex());
    println!("Fingerprint: {}", identity.fingerprint());
    Ok(())
}

async fn cmd_user(config: &DaemonConfig, action: UserAction) -> Result<()> {
    let service = open_service(config).await?;

    match action {
        UserAction::Create { name } => {
            let user = service.create_user(name).await?;
            println!("{}", user.id);
        }
        UserAction::Show { user } => {
            let user = resolve_user(&service, &user).await?;
            print_user(&user);
        }
        UserAction::List { after, limit } => {
            let users = service.list_users(after, limit).await?;
            if users.is_empty() {
                println!("No users.");
            }
            for user in &users {
                println!(
                    "{}  {:<10}  {}",
                    user.id,
                    user.state,
                    user.name.as_deref().unwrap_or("-")
                );
            }
        }
        UserAction::Delete { user } => {
            let user = resolve_user(&service, &user).await?;
            service.delete_user(user.id).await?;
            println!("Deleted {}", user.id);
        }
    }
    Ok(())
}

fn print_user(user: &User) {
    println!("ID:          {}", user.id);
    println!("Name:        {}", user.name.as_deref().unwrap_or("-"));
    println!("State:       {}", user.state);
    match &user.public_key {
        Some(key) => println!("Fingerprint: {}", key.fingerprint()),
        None => println!("Fingerprint: -"),
    }
}

async fn cmd_invite(config: &DaemonConfig, action: InviteAction) -> Result<()> {
    let service = open_service(config).await?;

    match action {
        InviteAction::Create {
            user,
            not_before,
            valid_for,
        } => {
            let user = resolve_user(&service, &user).await?;
            let not_after = match valid_for {
                Some(valid_for) => {
                    let start = not_before.unwrap_or_else(Utc::now);
                    Some(window_end(start, &valid_for)?)
                }
                None => None,
            };
            let invite = service
                .create_invite(user.id, InviteWindow { not_before, not_after })
                .await?;

            println!("Invite issued for {}", invite.user_id);
            println!("Valid:   {} .. {}", invite.not_before, invite.not_after);
            println!();
            println!("Export the manifest with `warden-daemon invite export {}`", invite.user_id);
        }
        InviteAction::Export { user } => {
            let user = resolve_user(&service, &user).await?;
            let manifest = service.export_invite_manifest(user.id).await?;
            let document = ManifestDocument::from(&manifest);
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        InviteAction::Revoke { user } => {
            let user = resolve_user(&service, &user).await?;
            service.revoke_invite(user.id).await?;
            println!("Invite for {} revoked", user.id);
        }
    }
    Ok(())
}

fn window_end(start: DateTime<Utc>, valid_for: &str) -> Result<DateTime<Utc>> {
    start
        .checked_add_signed(parse_duration(valid_for)?)
        .with_context(|| format!("invite window ends out of range: {valid_for}"))
}

/// Parse a duration string like "30m", "24h" or "7d". Bare numbers are seconds.
fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    let (num_str, unit) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3600),
        Some((i, 'd')) => (&s[..i], 86_400),
        Some(_) => (s, 1),
        None => bail!("empty duration"),
    };

    let num: i64 = num_str
        .parse()
        .with_context(|| format!("Invalid duration: {}", s))?;
    if num <= 0 {
        bail!("duration must be positive: {}", s);
    }
    num.checked_mul(unit)
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(parse_duration("30m").unwrap(), chrono::Duration::minutes(30));
        assert_eq!(parse_duration("24h").unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_duration(" 7d ").unwrap(), chrono::Duration::days(7));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0h").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_out_of_range() {
        assert!(parse_duration("9999999999999999d").is_err());
        assert!(parse_duration("9223372036854775807m").is_err());
        assert!(parse_duration("106751991167300d").is_err());
    }

    #[test]
    fn test_window_end_overflow_is_an_error() {
        let start: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(
            window_end(start, "2d").unwrap(),
            "2030-01-03T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        // In range for a duration, past the last representable date.
        assert!(window_end(start, "100000000000d").is_err());
    }
}
