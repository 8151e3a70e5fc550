//! Messages exchanged with the daemon after the TLS handshake.
//!
//! The daemon writes a version line, then answers one JSON [`Request`] per
//! line with one JSON [`Response`] line. Byte fields are hex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::AuthError;
use super::model::Session;

/// Version line the daemon sends first.
pub const PROTOCOL_VERSION: &str = "0";

/// Longest accepted message line, newline included.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Register {
        user_id: Uuid,
        token: String,
        public_key: String,
    },
    InitiateLogin {
        user_id: Uuid,
    },
    CompleteLogin {
        user_id: Uuid,
        signature: String,
    },
    Logout {
        session_id: Uuid,
        user_id: Uuid,
        token: String,
    },
}

impl Request {
    /// Operation name for logs.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::InitiateLogin { .. } => "initiate_login",
            Self::CompleteLogin { .. } => "complete_login",
            Self::Logout { .. } => "logout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Registered,
    Challenge {
        nonce: String,
    },
    Session {
        session_id: Uuid,
        user_id: Uuid,
        token: String,
        created_at: DateTime<Utc>,
    },
    LoggedOut,
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    #[must_use]
    pub fn session(session: &Session) -> Self {
        Self::Session {
            session_id: session.id,
            user_id: session.user_id,
            token: session.token.to_hex(),
            created_at: session.created_at,
        }
    }

    /// Error reply for `err`. Internal failures are not described.
    #[must_use]
    pub fn error(err: &AuthError) -> Self {
        let message = match err {
            AuthError::Random(_) | AuthError::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        Self::Error {
            code: err.code().to_string(),
            message,
        }
    }

    /// Error reply for a request that could not be decoded.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Error {
            code: "malformed_request".to_string(),
            message: message.into(),
        }
    }
}
