//! Shared types for the xpwatch daemon: configuration, remote API payloads,
//! and the watched-subject store with its on-disk persistence.

pub mod character;
pub mod config;
pub mod store;

pub use character::CharacterInfo;
pub use config::WatchConfig;
pub use store::{Subject, SubjectStore};

/// Crate version, stamped into logs and the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
