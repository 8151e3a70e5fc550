//! Daemon configuration from the environment (`.env` is loaded by `main`).
//!
//! | Variable                    | Default                            |
//! |-----------------------------|------------------------------------|
//! | `WARDEN_DATA_DIR`           | `$XDG_DATA_HOME/warden` (or `./warden`) |
//! | `WARDEN_LISTEN_ADDR`        | `127.0.0.1:4433`                   |
//! | `WARDEN_ADVERTISE_ADDR`     | the listen address                 |
//! | `WARDEN_CERT_VALIDITY_DAYS` | `90`                               |

use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4433";
pub const DEFAULT_CERT_VALIDITY_DAYS: u32 = 90;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    /// Address clients dial; goes into the certificate IP SAN and invite manifests.
    pub advertise_addr: SocketAddr,
    pub cert_validity_days: u32,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("WARDEN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let listen_addr: SocketAddr = parse_var(
            "WARDEN_LISTEN_ADDR",
            lookup("WARDEN_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        )?;
        let advertise_addr = match lookup("WARDEN_ADVERTISE_ADDR") {
            Some(value) => parse_var("WARDEN_ADVERTISE_ADDR", value)?,
            None => listen_addr,
        };
        let cert_validity_days = match lookup("WARDEN_CERT_VALIDITY_DAYS") {
            Some(value) => parse_var("WARDEN_CERT_VALIDITY_DAYS", value)?,
            None => DEFAULT_CERT_VALIDITY_DAYS,
        };

        Ok(Self {
            data_dir,
            listen_addr,
            advertise_addr,
            cert_validity_days,
        })
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("server_key.der")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("identity.db")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
}

fn parse_var<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}
