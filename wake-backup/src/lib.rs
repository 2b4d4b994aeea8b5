//! wake-backup library
//!
//! Wakes a sleeping backup server, mirrors a local directory to it with
//! rsync and keeps a bounded history of changed files.

pub mod config;
pub mod connectivity;
pub mod executor;
pub mod lifecycle;
pub mod notify;
pub mod preflight;
pub mod prune;
pub mod shutdown;
pub mod snapshot;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, RawSettings};
pub use lifecycle::{Controller, RunOutcome};
pub use utils::errors::BackupError;
pub use utils::Result;
