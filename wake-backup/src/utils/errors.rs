//! Error types for a backup run.
//!
//! Each stage of the lifecycle has its own error enum; they all fold into
//! [`BackupError`], which also decides the process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Bad or missing input. Always raised before the remote host is touched.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("source directory {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("source {0} is not a readable, listable directory")]
    SourceUnreadable(PathBuf),

    #[error("destination '{spec}': {reason}")]
    Destination { spec: String, reason: String },

    #[error("exclude file {0} is not readable")]
    ExcludeFile(PathBuf),

    #[error("invalid MAC address '{0}' (expected XX:XX:XX:XX:XX:XX)")]
    MacAddress(String),

    #[error("cannot send wake-on-lan packets: {0}")]
    WakeUnavailable(String),

    #[error("required program '{0}' was not found in PATH")]
    MissingProgram(String),

    #[error("log file {path}: {reason}")]
    LogFile { path: PathBuf, reason: String },

    #[error("snapshot name: {0}")]
    SnapshotName(String),

    #[error("settings file {path}: {reason}")]
    SettingsFile { path: PathBuf, reason: String },

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// The destination host could not be reached or authenticated against.
#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("local network stack is not working (loopback does not answer)")]
    LocalNetwork,

    #[error("host name {host} could not be resolved")]
    Resolve { host: String },

    #[error("{host} does not answer ping and no wake-on-lan address is configured")]
    NoResponse { host: String },

    #[error("{host} still does not answer ping after {attempts} wake attempt(s)")]
    Unreachable { host: String, attempts: u32 },

    #[error("ssh port {port} on {host} is not accepting connections")]
    PortClosed { host: String, port: u16 },

    #[error("ssh authentication as {user}@{host} failed: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },
}

/// A shell script could not be rendered or the shell could not be started.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("script '{script}': {reason}")]
    Render { script: String, reason: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("sleep lock could not be acquired: {0}")]
    LockAcquire(String),

    #[error("sleep lock {token} reads '{status}' instead of 'active'")]
    LockNotActive { token: String, status: String },

    #[error("{0}")]
    NotADirectory(String),

    #[error("could not create backup directories: {0}")]
    Layout(String),

    #[error("could not rotate rsync log files: {0}")]
    LogRotation(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to start rsync: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("rsync exited with status {code}{}", stderr_suffix(.stderr))]
    Failed { code: i32, stderr: String },

    #[error("progress file {path}: {source}")]
    ProgressFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let tail = stderr.trim();
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail.lines().last().unwrap_or_default())
    }
}

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("could not list old backups (status {status}): {output}")]
    Listing { status: i32, output: String },

    #[error("could not delete old backup '{label}' (status {status}): {output}")]
    Remove {
        label: String,
        status: i32,
        output: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Delivery failure of a desktop notification. Never fatal.
#[derive(Error, Debug)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Top-level error of a backup run.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("backup server not reachable: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("preparing the backup failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("backup transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("data is safe, but pruning old backups failed: {0}")]
    Prune(#[from] PruneError),

    #[error("data is safe, but releasing the sleep lock failed: {0}")]
    LockRelease(String),

    #[error("interrupted by {0}")]
    Interrupted(String),
}

impl BackupError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Validation(_) => 1,
            BackupError::Connectivity(_) => 2,
            BackupError::Preflight(_) => 3,
            BackupError::Transfer(_) => 4,
            BackupError::Prune(_) | BackupError::LockRelease(_) => 5,
            BackupError::Interrupted(_) => 130,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
