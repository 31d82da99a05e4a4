//! xpwatch daemon library - exposes modules for testing.

pub mod commands;
pub mod fetch;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod tracker;

use std::sync::Arc;
use tokio::sync::RwLock;
use xpwatch_common::SubjectStore;

/// Thread-safe shared store handle.
pub type SharedStore = Arc<RwLock<SubjectStore>>;
