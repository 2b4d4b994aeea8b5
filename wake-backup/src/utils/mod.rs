//! Utility modules for wake-backup.

pub mod errors;
pub mod logger;
pub mod retry;

pub use errors::{BackupError, Result};
pub use retry::RetryPolicy;
