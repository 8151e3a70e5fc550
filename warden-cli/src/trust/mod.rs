//! Local pin storage.

mod store;

pub use store::{PinEntry, TomlTrustStore};
