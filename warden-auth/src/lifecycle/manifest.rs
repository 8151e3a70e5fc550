//! Portable encoding of an [`InviteManifest`].
//!
//! Binary fields are hex so the document survives copy/paste and QR codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SecretToken;
use crate::identity::{KeyError, PublicKey};

use super::model::InviteManifest;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestServer {
    pub address: String,
    pub public_key: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: u32,
    pub server: ManifestServer,
    pub user_id: Uuid,
    pub token: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl ManifestDocument {
    /// Decode the server key the invited user should pin.
    ///
    /// # Errors
    ///
    /// Propagates hex or key decoding failures.
    pub fn server_public_key(&self) -> Result<PublicKey, KeyError> {
        PublicKey::from_hex(&self.server.public_key)
    }

    /// The invite token, if well formed.
    #[must_use]
    pub fn token(&self) -> Option<SecretToken> {
        SecretToken::from_hex(&self.token)
    }
}

impl From<&InviteManifest> for ManifestDocument {
    fn from(manifest: &InviteManifest) -> Self {
        Self {
            version: MANIFEST_VERSION,
            server: ManifestServer {
                address: manifest.server.address.clone(),
                public_key: manifest.server.public_key.to_hex(),
                fingerprint: manifest.server.fingerprint().to_string(),
            },
            user_id: manifest.invite.user_id,
            token: manifest.invite.token.to_hex(),
            not_before: manifest.invite.not_before,
            not_after: manifest.invite.not_after,
        }
    }
}
