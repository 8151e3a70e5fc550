//! The user's own key and the account held on each server.
//!
//! ```toml
//! [accounts.home]
//! user_id = "6f1c..."
//!
//! [accounts.home.session]
//! id = "0b9e..."
//! token = "5d41..."
//! created_at = "2030-01-01T12:00:00Z"
//! ```
//!
//! One key (`key.der`, PKCS#8) is shared by every account. Both files are
//! written with mode 0600 on unix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_auth::identity::PrivateKey;
use warden_auth::lifecycle::SessionCredentials;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub id: Uuid,
    /// Hex-encoded session token.
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SavedSession>,
}

impl Account {
    /// Credentials of the saved session, if any.
    pub fn credentials(&self) -> Result<Option<SessionCredentials>> {
        let Some(session) = &self.session else {
            return Ok(None);
        };
        let token = hex::decode(&session.token).context("Saved session token is not hex")?;
        Ok(Some(SessionCredentials {
            id: session.id,
            user_id: self.user_id,
            token,
        }))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountFile {
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
}

pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `identity/` in the platform data directory.
    pub fn default_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "warden", "warden")
            .context("Could not determine data directory")?;
        Ok(dirs.data_dir().join("identity"))
    }

    /// Load the user key, generating it on first use.
    pub fn load_or_generate_key(&self) -> Result<PrivateKey> {
        let path = self.dir.join("key.der");
        if path.exists() {
            let der = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return PrivateKey::from_pkcs8_der(&der)
                .with_context(|| format!("Failed to parse {}", path.display()));
        }

        let key = PrivateKey::generate();
        let der = key.to_pkcs8_der().context("Failed to encode private key")?;
        write_private(&path, der.as_bytes())?;
        tracing::info!(path = %path.display(), fingerprint = %key.public_key().fingerprint(), "generated user key");
        Ok(key)
    }

    pub fn get(&self, server_id: &str) -> Result<Option<Account>> {
        Ok(self.read()?.accounts.remove(server_id))
    }

    pub fn save(&self, server_id: &str, account: &Account) -> Result<()> {
        let mut file = self.read()?;
        file.accounts.insert(server_id.to_string(), account.clone());
        self.write(&file)
    }

    fn path(&self) -> PathBuf {
        self.dir.join("accounts.toml")
    }

    fn read(&self) -> Result<AccountFile> {
        let path = self.path();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AccountFile::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write(&self, file: &AccountFile) -> Result<()> {
        let content = toml::to_string_pretty(file).context("Failed to encode accounts")?;
        write_private(&self.path(), content.as_bytes())
    }
}

/// Write through a temporary file, readable by the owner only.
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict {}", tmp.display()))?;
    }

    std::fs::rename(&tmp, path).with_context(|| format!("Failed to write {}", path.display()))
}
