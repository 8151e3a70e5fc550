//! TLS configuration for the daemon.

mod cert;
mod server;

pub use cert::{build_self_signed, CertError, CertParams, TlsIdentity};
pub use server::{TlsConfigError, TlsServerConfig};
