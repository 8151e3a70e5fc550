//! The daemon's long-lived Ed25519 identity key.

use std::path::Path;

use warden_auth::identity::{KeyError, PrivateKey};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, thiserror::Error)]
pub enum ServerKeyError {
    #[error("server key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server key file {path} is not a PKCS#8 Ed25519 key: {source}")]
    Key {
        path: String,
        #[source]
        source: KeyError,
    },
}

/// Load the PKCS#8 key at `path`, generating and writing one (mode 0600)
/// if the file does not exist yet.
pub fn load_or_generate(path: &Path) -> Result<PrivateKey, ServerKeyError> {
    let shown = path.display().to_string();
    let io_err = |source| ServerKeyError::Io {
        path: shown.clone(),
        source,
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(io_err)?;
        return PrivateKey::from_pkcs8_der(&bytes).map_err(|source| ServerKeyError::Key {
            path: shown.clone(),
            source,
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let key = PrivateKey::generate();
    let der = key.to_pkcs8_der().map_err(|source| ServerKeyError::Key {
        path: shown.clone(),
        source,
    })?;
    std::fs::write(path, der.as_bytes()).map_err(io_err)?;

    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;

    tracing::info!(
        path = %shown,
        fingerprint = %key.public_key().fingerprint(),
        "generated server key"
    );
    Ok(key)
}
