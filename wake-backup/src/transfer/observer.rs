//! Side task that turns the rsync progress file into notifications.

use crate::notify::{notify_best_effort, Notifier, Urgency};
use crate::transfer::progress::latest_progress;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Poll `path` every `interval` until `cancel` fires.
///
/// A notification is sent whenever the reported percentage changes.
/// Read errors are ignored; the file may not exist yet. Nothing is sent
/// once `cancel` has fired, not even a notification already under way.
pub fn spawn_observer(
    path: PathBuf,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last_percent = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(path = %path.display(), "Progress file not readable: {}", e);
                    continue;
                }
            };

            let Some(progress) = latest_progress(&String::from_utf8_lossy(&bytes)) else {
                continue;
            };
            if last_percent == Some(progress.percent_complete) {
                continue;
            }
            last_percent = Some(progress.percent_complete);
            let description = progress.describe();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = notify_best_effort(notifier.as_ref(), "Backup in progress", &description, Urgency::Low) => {}
            }
        }

        debug!("Progress observer stopped");
    })
}
