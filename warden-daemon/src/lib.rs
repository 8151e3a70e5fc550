//! Warden daemon: SQLite identity storage, server key management and the
//! TLS listener serving the user lifecycle.

pub mod config;
pub mod handler;
pub mod keys;
pub mod server;
pub mod store;
pub mod tls;

pub use config::DaemonConfig;
pub use handler::AuthHandler;
pub use store::SqliteIdentityStore;
