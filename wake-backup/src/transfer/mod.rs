//! The rsync run itself.
//!
//! `DEST/current` mirrors the source, deletions included. Every file rsync
//! would overwrite or delete is moved to `DEST/old/<label>` instead.

pub mod observer;
pub mod progress;

use crate::config::Config;
use crate::executor::ssh::SshCommand;
use crate::notify::Notifier;
use crate::utils::errors::TransferError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs the synchronization tool and reports its exit code.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// `progress_file` receives the tool's stdout when set.
    async fn sync(&self, args: &[String], progress_file: Option<&Path>) -> Result<i32, TransferError>;
}

/// [`SyncRunner`] spawning the `rsync` binary.
#[derive(Debug, Clone, Default)]
pub struct Rsync;

#[async_trait]
impl SyncRunner for Rsync {
    async fn sync(&self, args: &[String], progress_file: Option<&Path>) -> Result<i32, TransferError> {
        let stdout = match progress_file {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|source| TransferError::ProgressFile {
                    path: path.to_path_buf(),
                    source,
                })?;
                Stdio::from(file)
            }
            None => Stdio::inherit(),
        };

        let output = Command::new("rsync")
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(TransferError::Spawn)?;

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            return Err(TransferError::Failed {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(code)
    }
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub duration: Duration,
}

/// The complete, deterministic rsync argument list for this run.
pub fn rsync_args(cfg: &Config, label: &str) -> Vec<String> {
    let mut args = vec!["-az".to_string()];

    if let Some(exclude) = &cfg.exclude_file {
        args.push(format!("--exclude-from={}", exclude.display()));
    }

    args.push("--delete".to_string());
    args.push("--delete-excluded".to_string());
    args.push("--backup".to_string());
    // relative to the destination directory, i.e. DEST/current
    args.push(format!("--backup-dir=../old/{label}"));

    if let Some(log) = &cfg.remote_log_path {
        if cfg.destination.is_remote() {
            args.push(format!("--remote-option=--log-file={log}"));
        } else {
            args.push(format!("--log-file={log}"));
        }
    }

    if let Some(login) = cfg.destination.login() {
        args.push("-e".to_string());
        args.push(SshCommand::new(login).port(cfg.ssh_port).rsh());
    }

    if cfg.progress {
        args.push("--info=progress2".to_string());
    }

    let mut source = cfg.source.to_string_lossy().into_owned();
    if !source.ends_with('/') {
        source.push('/');
    }
    args.push(source);
    args.push(cfg.destination.rsync_target());

    args
}

/// Run rsync once and wait for it. Non-zero exit is a failure; no retry.
///
/// With progress enabled, rsync's stdout goes to a temporary side file that
/// an observer task polls every `progress_interval`. Both live only as long
/// as this future: dropping it midway stops the observer and deletes the file.
pub async fn run_transfer(
    cfg: &Config,
    label: &str,
    runner: &dyn SyncRunner,
    notifier: Arc<dyn Notifier>,
    progress_interval: Duration,
) -> Result<TransferReport, TransferError> {
    let args = rsync_args(cfg, label);
    info!(label, args = ?args, "Starting rsync");
    let started = Instant::now();

    let progress_file = if cfg.progress { Some(progress_file()?) } else { None };
    let cancel = CancellationToken::new();
    let observer = progress_file.as_ref().map(|file| {
        observer::spawn_observer(file.path().to_path_buf(), notifier, progress_interval, cancel.clone())
    });

    let result = {
        let _stop_observer = cancel.clone().drop_guard();
        runner.sync(&args, progress_file.as_ref().map(|file| file.path())).await
    };

    if let Some(handle) = observer {
        if let Err(e) = handle.await {
            warn!("Progress observer task failed: {}", e);
        }
    }
    drop(progress_file);

    let code = result?;
    let report = TransferReport {
        duration: started.elapsed(),
    };
    info!(label, code, elapsed = %progress::format_duration(report.duration), "rsync finished");
    Ok(report)
}

/// Empty side file for rsync's progress output, removed when dropped.
fn progress_file() -> Result<NamedTempFile, TransferError> {
    tempfile::Builder::new()
        .prefix("wake-backup-")
        .suffix(".progress")
        .tempfile()
        .map_err(|source| TransferError::ProgressFile {
            path: std::env::temp_dir(),
            source,
        })
}
