//! Error type shared by every storage seam (trust store and identity
//! repositories).

/// Failure reported by a storage implementation.
///
/// `NotFound` must be kept separate from backend failures: callers branch
/// on it (unknown server, consumed invite, missing nonce).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} already exists")]
    Conflict { entity: &'static str },

    #[error("corrupt {entity} record: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    /// Wrap any backend error (sqlx, io, toml).
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
