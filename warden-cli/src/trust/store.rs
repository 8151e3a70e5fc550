//! File-backed server pins.
//!
//! ```toml
//! [servers.home]
//! address = "192.168.1.20:4433"
//! public_key = "3b6a27bc..."
//! pinned_at = 1767268800
//! label = "NAS"
//! ```
//!
//! The file is re-read on every call, so edits from another process (or
//! `warden pin remove` mid-session) are seen by the next handshake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use warden_auth::identity::PublicKey;
use warden_auth::trust::{ServerIdentity, TrustStore};
use warden_auth::StoreError;

const ENTITY: &str = "server";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PinRecord {
    address: String,
    /// Hex-encoded Ed25519 public key.
    public_key: String,
    /// Unix seconds of the last time this key was pinned.
    pinned_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    #[serde(default)]
    servers: BTreeMap<String, PinRecord>,
}

/// A pin as listed to the user.
#[derive(Debug, Clone)]
pub struct PinEntry {
    pub server: ServerIdentity,
    pub pinned_at: i64,
    pub label: Option<String>,
}

pub struct TomlTrustStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl TomlTrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `trust.toml` in the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "warden", "warden")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("trust.toml"))
    }

    /// All pins, ordered by server id.
    pub fn list(&self) -> Result<Vec<PinEntry>, StoreError> {
        self.read()?
            .servers
            .into_iter()
            .map(|(id, record)| {
                let server = decode(&id, &record)?;
                Ok(PinEntry {
                    server,
                    pinned_at: record.pinned_at,
                    label: record.label,
                })
            })
            .collect()
    }

    /// Pin `server`, replacing any existing pin for its id. A `None` label
    /// keeps the previous one.
    pub fn pin(&self, server: &ServerIdentity, label: Option<String>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read()?;
        let label = label.or_else(|| {
            file.servers
                .get(&server.id)
                .and_then(|existing| existing.label.clone())
        });
        file.servers.insert(
            server.id.clone(),
            PinRecord {
                address: server.address.clone(),
                public_key: server.public_key.to_hex(),
                pinned_at: chrono::Utc::now().timestamp(),
                label,
            },
        );
        self.write(&file)
    }

    fn read(&self) -> Result<PinFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str(&content).map_err(|e| StoreError::Corrupt {
                entity: ENTITY,
                reason: format!("{}: {}", self.path.display(), e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PinFile::default()),
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    fn write(&self, file: &PinFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let content = toml::to_string_pretty(file).map_err(StoreError::backend)?;

        // Replace atomically so a concurrent reader never sees a partial file.
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(StoreError::backend)?;
        std::fs::rename(&tmp, &self.path).map_err(StoreError::backend)?;
        Ok(())
    }
}

fn decode(id: &str, record: &PinRecord) -> Result<ServerIdentity, StoreError> {
    let public_key = PublicKey::from_hex(&record.public_key).map_err(|e| StoreError::Corrupt {
        entity: ENTITY,
        reason: format!("{id}: {e}"),
    })?;
    Ok(ServerIdentity::new(id, record.address.clone(), public_key))
}

impl TrustStore for TomlTrustStore {
    fn get(&self, server_id: &str) -> Result<ServerIdentity, StoreError> {
        let file = self.read()?;
        let record = file
            .servers
            .get(server_id)
            .ok_or(StoreError::not_found(ENTITY))?;
        decode(server_id, record)
    }

    fn set(&self, identity: &ServerIdentity) -> Result<(), StoreError> {
        self.pin(identity, None)
    }

    fn delete(&self, server_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read()?;
        if file.servers.remove(server_id).is_none() {
            return Err(StoreError::not_found(ENTITY));
        }
        self.write(&file)
    }
}
