//! Pinned server identities and the store that persists them.

use std::net::{IpAddr, SocketAddr};

use crate::identity::PublicKey;
use crate::store::StoreError;

/// A server the client has pinned: its dialed address and expected key.
///
/// Records are immutable snapshots; a rotation produces a new record via
/// [`ServerIdentity::with_public_key`] which is then written back whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub id: String,
    pub address: String,
    pub public_key: PublicKey,
}

impl ServerIdentity {
    pub fn new(id: impl Into<String>, address: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            public_key,
        }
    }

    /// Same server, same address, new key.
    #[must_use]
    pub fn with_public_key(&self, public_key: PublicKey) -> Self {
        Self {
            id: self.id.clone(),
            address: self.address.clone(),
            public_key,
        }
    }

    /// The literal IP of the pinned address.
    ///
    /// Accepts `ip:port`, `[v6]:port` and a bare IP. Host names yield `None`:
    /// a pin binds to the network identity actually dialed, never to a
    /// resolvable name.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        let address = self.address.trim();
        address
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .or_else(|_| address.parse::<IpAddr>())
            .ok()
    }
}

/// Persistence for server pins (client side).
///
/// Implementations must not cache between calls; the verifier re-reads the
/// pin on every pass so concurrent edits are visible immediately.
pub trait TrustStore: Send + Sync {
    /// Look up a pin. Absent pins are `StoreError::NotFound`.
    fn get(&self, server_id: &str) -> Result<ServerIdentity, StoreError>;

    /// Insert or replace the pin for `identity.id`.
    fn set(&self, identity: &ServerIdentity) -> Result<(), StoreError>;

    /// Remove a pin. Absent pins are `StoreError::NotFound`.
    fn delete(&self, server_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateKey;

    fn identity(address: &str) -> ServerIdentity {
        ServerIdentity::new("home", address, PrivateKey::generate().public_key())
    }

    #[test]
    fn test_ip_forms() {
        assert_eq!(identity("10.1.2.3:4433").ip(), Some("10.1.2.3".parse().unwrap()));
        assert_eq!(identity("[::1]:4433").ip(), Some("::1".parse().unwrap()));
        assert_eq!(identity("192.168.0.9").ip(), Some("192.168.0.9".parse().unwrap()));
        assert_eq!(identity("example.com:4433").ip(), None);
    }

    #[test]
    fn test_with_public_key_keeps_address() {
        let original = identity("10.1.2.3:4433");
        let rotated_key = PrivateKey::generate().public_key();
        let rotated = original.with_public_key(rotated_key.clone());

        assert_eq!(rotated.id, original.id);
        assert_eq!(rotated.address, original.address);
        assert_eq!(rotated.public_key, rotated_key);
        assert_ne!(original.public_key, rotated_key);
    }
}
