//! Maps wire requests onto [`UserService`] operations.

use std::sync::Arc;

use uuid::Uuid;
use warden_auth::identity::{PublicKey, Signature};
use warden_auth::lifecycle::{
    AuthError, IdentityStore, Request, Response, SessionCredentials, UserService,
};

/// Serves the lifecycle operations a remote user may call.
pub struct AuthHandler<S> {
    service: Arc<UserService<S>>,
}

impl<S> Clone for AuthHandler<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S: IdentityStore> AuthHandler<S> {
    pub fn new(service: Arc<UserService<S>>) -> Self {
        Self { service }
    }

    /// Answer one request. Failures become [`Response::Error`].
    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(op, code = err.code(), "request rejected");
                Response::error(&err)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, AuthError> {
        match request {
            Request::Register {
                user_id,
                token,
                public_key,
            } => {
                let token = decode_hex("token", &token)?;
                let public_key = PublicKey::from_hex(&public_key)
                    .map_err(|e| AuthError::InvalidArgument(format!("public key: {e}")))?;
                self.service.register_user(user_id, &token, public_key).await?;
                Ok(Response::Registered)
            }
            Request::InitiateLogin { user_id } => {
                let nonce = self.service.create_login_nonce(user_id).await?;
                Ok(Response::Challenge {
                    nonce: nonce.to_hex(),
                })
            }
            Request::CompleteLogin { user_id, signature } => {
                let signature = Signature::from_bytes(&decode_hex("signature", &signature)?)
                    .map_err(|e| AuthError::InvalidArgument(format!("signature: {e}")))?;
                let session = self.service.login_user(user_id, &signature).await?;
                Ok(Response::session(&session))
            }
            Request::Logout {
                session_id,
                user_id,
                token,
            } => {
                let credentials = credentials(session_id, user_id, &token)?;
                self.service.logout_user(&credentials).await?;
                Ok(Response::LoggedOut)
            }
        }
    }
}

fn credentials(id: Uuid, user_id: Uuid, token: &str) -> Result<SessionCredentials, AuthError> {
    Ok(SessionCredentials {
        id,
        user_id,
        token: decode_hex("session token", token)?,
    })
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, AuthError> {
    hex::decode(value.trim()).map_err(|_| AuthError::InvalidArgument(format!("{field} is not hex")))
}
