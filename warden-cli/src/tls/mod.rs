//! TLS client side: pinned verification, dialing and requests.

mod client;
mod connect;

pub use client::PinnedServerVerifier;
pub use connect::{connect, Connection};
