//! Sequencing of one backup run and the cleanup that follows it.
//!
//! `Validated → Connected → Prepared → Transferred → Pruned → Done`, or
//! `Aborted(reason)`. Whatever happens, including a signal, cleanup releases
//! a held sleep lock and a failed run sends exactly one failure notification.

use crate::config::Config;
use crate::connectivity::wake::{UdpWake, WakeSender};
use crate::connectivity::{NetworkProbe, Prober, SystemProbe, Timings};
use crate::executor::{CommandRunner, ShellExecutor};
use crate::notify::{notify_best_effort, DesktopNotifier, LogNotifier, Notifier, Urgency};
use crate::preflight::{self, SleepLock};
use crate::transfer::progress::format_duration;
use crate::transfer::{self, observer, Rsync, SyncRunner};
use crate::utils::errors::{BackupError, ValidationError};
use crate::prune;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Upper bound for releasing a leftover lock during cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Init,
    Validated,
    Connected,
    Prepared,
    Transferred,
    Pruned,
    Done,
    Aborted(String),
}

/// Mutable state of a run, owned by the [`Controller`].
#[derive(Debug, Default)]
pub struct RunState {
    pub stage: Stage,
    /// Present from the moment the lock service hands out a token until it is released
    pub sleep_lock: Option<SleepLock>,
    /// Failure descriptions, in the order they happened
    pub notes: Vec<String>,
    pub snapshot_label: Option<String>,
    /// Wall time of the rsync run, once it succeeded
    pub transfer_time: Option<Duration>,
    pub pruned: Vec<String>,
}

impl RunState {
    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.notes.push(message);
    }
}

/// Result of a run as seen by `main`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stage: Stage,
    pub exit_code: u8,
    pub notes: Vec<String>,
    pub deleted: Vec<String>,
}

/// External systems the run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn NetworkProbe>,
    pub waker: Arc<dyn WakeSender>,
    pub shell: Arc<dyn CommandRunner>,
    pub sync: Arc<dyn SyncRunner>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn system(cfg: &Config) -> Self {
        Self {
            probe: Arc::new(SystemProbe),
            waker: Arc::new(UdpWake::default()),
            shell: Arc::new(ShellExecutor::for_destination(&cfg.destination, cfg.ssh_port)),
            sync: Arc::new(Rsync),
            notifier: notifier_for(cfg.notify_enabled),
        }
    }
}

/// Desktop notifications when enabled, log lines otherwise.
pub fn notifier_for(enabled: bool) -> Arc<dyn Notifier> {
    if enabled {
        Arc::new(DesktopNotifier::default())
    } else {
        Arc::new(LogNotifier)
    }
}

pub struct Controller {
    cfg: Config,
    parts: Collaborators,
    timings: Timings,
    progress_interval: Duration,
    state: RunState,
}

impl Controller {
    pub fn new(cfg: Config, parts: Collaborators) -> Self {
        Self {
            cfg,
            parts,
            timings: Timings::default(),
            progress_interval: observer::PROGRESS_INTERVAL,
            state: RunState {
                stage: Stage::Validated,
                ..Default::default()
            },
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// How often rsync progress is turned into notifications.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Run all stages, racing them against `shutdown`, then clean up.
    ///
    /// `shutdown` resolves with the name of the signal that interrupted the run.
    pub async fn run<S>(self, shutdown: S) -> RunOutcome
    where
        S: Future<Output = String>,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("backup_run", %run_id, destination = %self.cfg.destination);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner<S>(mut self, shutdown: S) -> RunOutcome
    where
        S: Future<Output = String>,
    {
        let started = Instant::now();
        info!("Starting wake-backup v{}", env!("CARGO_PKG_VERSION"));
        for line in self.cfg.summary() {
            info!("{}", line);
        }

        notify_best_effort(
            self.parts.notifier.as_ref(),
            "Backup started",
            &format!(
                "Backing up {}:{} to {}",
                local_hostname(),
                self.cfg.source.display(),
                self.cfg.destination
            ),
            Urgency::Normal,
        )
        .await;

        let result = {
            let stages = run_stages(
                &self.cfg,
                &self.parts,
                self.timings,
                self.progress_interval,
                &mut self.state,
            );
            tokio::select! {
                result = stages => result,
                signal = shutdown => Err(BackupError::Interrupted(signal)),
            }
        };

        self.finish(result, started).await
    }

    async fn finish(mut self, result: Result<(), BackupError>, started: Instant) -> RunOutcome {
        let mut exit_code = match &result {
            Ok(()) => 0,
            Err(e) => {
                self.state.note(e.to_string());
                e.exit_code()
            }
        };

        if let Some(lock) = self.state.sleep_lock.take() {
            warn!(token = lock.token(), "Releasing sleep lock left over by an aborted run");
            let shell = self.parts.shell.as_ref();
            let released = match tokio::time::timeout(CLEANUP_TIMEOUT, lock.release(shell)).await {
                Ok(released) => released,
                Err(_) => Err(format!("no answer within {}", format_duration(CLEANUP_TIMEOUT))),
            };
            if let Err(e) = released {
                let err = BackupError::LockRelease(e);
                self.state.note(err.to_string());
                if exit_code == 0 {
                    exit_code = err.exit_code();
                }
            }
        }

        let elapsed = format_duration(started.elapsed());
        if exit_code != 0 {
            let reason = self.state.notes.first().cloned().unwrap_or_default();
            self.state.stage = Stage::Aborted(reason);
            notify_best_effort(
                self.parts.notifier.as_ref(),
                "Backup failed",
                &self.state.notes.join("\n"),
                Urgency::Critical,
            )
            .await;
            error!(exit_code, elapsed = %elapsed, "Backup failed");
        } else if self.cfg.dry_run {
            self.state.stage = Stage::Done;
            info!(elapsed = %elapsed, "Dry run finished, nothing was changed");
        } else {
            self.state.stage = Stage::Done;
            let label = self.state.snapshot_label.clone().unwrap_or_default();
            let mut body = format!("Snapshot {label} completed in {elapsed}");
            if let Some(took) = self.state.transfer_time {
                body.push_str(&format!(" (rsync {})", format_duration(took)));
            }
            if !self.state.pruned.is_empty() {
                body.push_str(&format!(", removed old backups: {}", self.state.pruned.join(", ")));
            }
            notify_best_effort(self.parts.notifier.as_ref(), "Backup finished", &body, Urgency::Normal).await;
            info!(label = %label, elapsed = %elapsed, "Backup finished");
        }

        RunOutcome {
            stage: self.state.stage,
            exit_code,
            notes: self.state.notes,
            deleted: self.state.pruned,
        }
    }
}

async fn run_stages(
    cfg: &Config,
    parts: &Collaborators,
    timings: Timings,
    progress_interval: Duration,
    state: &mut RunState,
) -> Result<(), BackupError> {
    if cfg.destination.is_remote() {
        Prober::new(parts.probe.as_ref(), parts.waker.as_ref(), timings)
            .ensure_reachable(cfg)
            .await?;
    } else {
        debug!("Local destination, skipping connectivity checks");
    }
    state.stage = Stage::Connected;

    if cfg.dry_run {
        info!("Dry run: would run rsync {}", transfer::rsync_args(cfg, "<label>").join(" "));
        return Ok(());
    }

    let label = cfg.snapshot_namer.label()?;
    info!(label = %label, "Snapshot label for this run");
    state.snapshot_label = Some(label.clone());

    preflight::prepare(cfg, parts.shell.as_ref(), state).await?;
    state.stage = Stage::Prepared;

    let report = transfer::run_transfer(
        cfg,
        &label,
        parts.sync.as_ref(),
        parts.notifier.clone(),
        progress_interval,
    )
    .await?;
    state.transfer_time = Some(report.duration);
    state.stage = Stage::Transferred;

    // The lock is released even when pruning fails.
    let pruned = prune::prune(cfg, parts.shell.as_ref()).await;
    if let Ok(report) = &pruned {
        state.pruned = report.deleted.clone();
    }
    let released = release_lock(parts.shell.as_ref(), state).await;

    match (pruned, released) {
        (Ok(_), Ok(())) => {}
        (Err(e), Ok(())) => return Err(e.into()),
        (Ok(_), Err(e)) => return Err(BackupError::LockRelease(e)),
        (Err(prune_err), Err(release_err)) => {
            state.note(BackupError::LockRelease(release_err).to_string());
            return Err(prune_err.into());
        }
    }
    state.stage = Stage::Pruned;
    Ok(())
}

/// Release the held lock, if any. The lock counts as handed back once the
/// release attempt finished, whatever its outcome.
async fn release_lock(shell: &dyn CommandRunner, state: &mut RunState) -> Result<(), String> {
    let Some(lock) = state.sleep_lock.clone() else {
        return Ok(());
    };
    let result = lock.release(shell).await;
    state.sleep_lock = None;
    result
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Outcome for settings that failed validation; no stage ever ran.
pub async fn reject(err: ValidationError, notifier: &dyn Notifier) -> RunOutcome {
    let err = BackupError::from(err);
    let message = err.to_string();
    error!("{}", message);
    notify_best_effort(notifier, "Backup failed", &message, Urgency::Critical).await;
    RunOutcome {
        stage: Stage::Aborted(message.clone()),
        exit_code: err.exit_code(),
        notes: vec![message],
        deleted: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, Environment, SystemEnvironment};
    use crate::connectivity::tests::{remote_config, FakeProbe, FakeWake};
    use crate::executor::tests::FakeShell;
    use crate::notify::tests::RecordingNotifier;
    use crate::snapshot::SnapshotNamer;
    use crate::transfer::tests::{FakeSync, StalledSync};
    use crate::utils::errors::TransferError;
    use async_trait::async_trait;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const MAC: &str = "00:11:22:33:44:55";

    struct Harness {
        probe: Arc<FakeProbe>,
        waker: Arc<FakeWake>,
        shell: Arc<FakeShell>,
        sync: Arc<FakeSync>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new(shell: FakeShell, sync: FakeSync) -> Self {
            Self {
                probe: Arc::new(FakeProbe::default()),
                waker: Arc::new(FakeWake::default()),
                shell: Arc::new(shell),
                sync: Arc::new(sync),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn probe(mut self, probe: FakeProbe) -> Self {
            self.probe = Arc::new(probe);
            self
        }

        fn parts(&self) -> Collaborators {
            Collaborators {
                probe: self.probe.clone(),
                waker: self.waker.clone(),
                shell: self.shell.clone(),
                sync: self.sync.clone(),
                notifier: self.notifier.clone(),
            }
        }

        async fn run(&self, cfg: Config) -> RunOutcome {
            Controller::new(cfg, self.parts())
                .with_timings(Timings::immediate())
                .run(std::future::pending())
                .await
        }

        /// Body of the single failure notification.
        fn failure(&self) -> String {
            let failures = self.notifier.with_title("Backup failed");
            assert_eq!(failures.len(), 1, "expected exactly one failure notification");
            assert_eq!(failures[0].2, Urgency::Critical);
            failures[0].1.clone()
        }
    }

    fn locked_config() -> Config {
        let mut cfg = remote_config(Some(MAC), 3);
        cfg.use_suspend_lock = true;
        cfg
    }

    #[tokio::test]
    async fn test_successful_remote_run() {
        let h = Harness::new(
            FakeShell::default().with_lock().respond("list snapshots", 0, ""),
            FakeSync::exiting(0),
        );

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stage, Stage::Done);
        assert_eq!(
            h.shell.names(),
            vec![
                "sleeplock enable",
                "sleeplock check",
                "ensure layout",
                "list snapshots",
                "sleeplock release",
                "sleeplock check",
            ]
        );
        assert!(!h.shell.lock_held());
        assert_eq!(h.sync.calls.lock().unwrap().len(), 1);
        assert!(h.sync.calls.lock().unwrap()[0].contains(&"--backup-dir=../old/2026-10-16".to_string()));
        assert_eq!(h.notifier.titles(), vec!["Backup started", "Backup finished"]);
        let finished = &h.notifier.with_title("Backup finished")[0].1;
        assert!(finished.contains("Snapshot 2026-10-16"));
        assert!(finished.contains("(rsync "));
    }

    #[tokio::test]
    async fn test_unreachable_host_without_mac() {
        let h = Harness::new(FakeShell::default().with_lock(), FakeSync::exiting(0))
            .probe(FakeProbe { awake_after: None, ..Default::default() });

        let outcome = h.run(remote_config(None, 5)).await;

        assert_eq!(outcome.exit_code, 2);
        assert!(matches!(outcome.stage, Stage::Aborted(_)));
        assert!(h.waker.sent.lock().unwrap().is_empty());
        assert!(h.shell.names().is_empty());
        assert!(h.sync.calls.lock().unwrap().is_empty());
        assert!(h.failure().contains("does not answer ping"));
    }

    #[tokio::test]
    async fn test_connectivity_failure_after_wake_attempts() {
        let h = Harness::new(FakeShell::default().with_lock(), FakeSync::exiting(0))
            .probe(FakeProbe { awake_after: None, ..Default::default() });

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 2);
        assert_eq!(h.waker.sent.lock().unwrap().len(), 3);
        assert!(!h.shell.lock_held());
        assert!(h.failure().contains("after 3 wake attempt(s)"));
    }

    #[tokio::test]
    async fn test_preflight_failure_releases_lock() {
        let h = Harness::new(
            FakeShell::default()
                .with_lock()
                .respond("ensure layout", 1, "mkdir: cannot create directory 'backup/old': Read-only file system\n"),
            FakeSync::exiting(0),
        );

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 3);
        assert!(h.shell.names().contains(&"sleeplock release"));
        assert!(!h.shell.lock_held());
        assert!(h.sync.calls.lock().unwrap().is_empty());
        assert!(h.failure().contains("Read-only file system"));
    }

    #[tokio::test]
    async fn test_transfer_failure_releases_lock() {
        let h = Harness::new(FakeShell::default().with_lock(), FakeSync::exiting(11));

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 4);
        assert!(!h.shell.names().contains(&"list snapshots"));
        assert!(h.shell.names().contains(&"sleeplock release"));
        assert!(!h.shell.lock_held());
        assert!(h.failure().contains("No space left on device"));
        assert!(h.notifier.with_title("Backup finished").is_empty());
    }

    #[tokio::test]
    async fn test_prune_failure_still_releases_lock() {
        let h = Harness::new(
            FakeShell::default()
                .with_lock()
                .respond("list snapshots", 2, "find: 'backup/old': Permission denied\n"),
            FakeSync::exiting(0),
        );

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 5);
        let names = h.shell.names();
        let listed = names.iter().position(|n| *n == "list snapshots").unwrap();
        let released = names.iter().position(|n| *n == "sleeplock release").unwrap();
        assert!(listed < released);
        assert!(!h.shell.lock_held());

        let body = h.failure();
        assert!(body.contains("Permission denied"));
        assert!(body.contains("data is safe"));
    }

    #[tokio::test]
    async fn test_prune_and_release_failures_are_both_reported() {
        let h = Harness::new(
            FakeShell::default()
                .with_lock()
                .respond("list snapshots", 2, "find: Permission denied\n")
                .respond("sleeplock release", 1, "unknown token\n"),
            FakeSync::exiting(0),
        );

        let outcome = h.run(locked_config()).await;

        assert_eq!(outcome.exit_code, 5);
        assert_eq!(outcome.notes.len(), 2);
        // released once in the stages, not retried during cleanup
        assert_eq!(h.shell.names().iter().filter(|n| **n == "sleeplock release").count(), 1);

        let body = h.failure();
        assert!(body.contains("releasing the sleep lock failed"));
        assert!(body.contains("pruning old backups failed"));
    }

    #[tokio::test]
    async fn test_local_dry_run() {
        let h = Harness::new(FakeShell::default(), FakeSync::exiting(0));
        let mut cfg = remote_config(None, 0);
        cfg.destination = Destination {
            user: None,
            host: None,
            path: "/mnt/backup".into(),
        };
        cfg.dry_run = true;

        let outcome = h.run(cfg).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stage, Stage::Done);
        assert_eq!(h.probe.echoes.load(Ordering::SeqCst), 0);
        assert!(h.shell.names().is_empty());
        assert!(h.sync.calls.lock().unwrap().is_empty());
        assert_eq!(h.notifier.titles(), vec!["Backup started"]);
    }

    struct HangingSync;

    #[async_trait]
    impl SyncRunner for HangingSync {
        async fn sync(&self, _args: &[String], _progress_file: Option<&Path>) -> Result<i32, TransferError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_signal_during_transfer_releases_lock() {
        let h = Harness::new(FakeShell::default().with_lock(), FakeSync::exiting(0));
        let parts = Collaborators {
            sync: Arc::new(HangingSync),
            ..h.parts()
        };

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "SIGTERM".to_string()
        };
        let outcome = Controller::new(locked_config(), parts)
            .with_timings(Timings::immediate())
            .run(shutdown)
            .await;

        assert_eq!(outcome.exit_code, 130);
        assert!(h.shell.names().contains(&"sleeplock release"));
        assert!(!h.shell.lock_held());
        assert!(h.failure().contains("interrupted by SIGTERM"));
    }

    #[tokio::test]
    async fn test_signal_stops_progress_reports() {
        let h = Harness::new(FakeShell::default().with_lock(), FakeSync::exiting(0));
        let stalled = Arc::new(StalledSync::default());
        let parts = Collaborators {
            sync: stalled.clone(),
            ..h.parts()
        };
        let mut cfg = locked_config();
        cfg.progress = true;

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            "SIGINT".to_string()
        };
        let outcome = Controller::new(cfg, parts)
            .with_timings(Timings::immediate())
            .with_progress_interval(Duration::from_millis(10))
            .run(shutdown)
            .await;

        assert_eq!(outcome.exit_code, 130);
        assert!(!h.shell.lock_held());
        let path = stalled.progress_file.lock().unwrap().clone().unwrap();
        assert!(!path.exists(), "progress side file left behind");

        let titles = h.notifier.titles();
        assert_eq!(titles.iter().filter(|t| *t == "Backup in progress").count(), 1);
        assert_eq!(titles.last().map(String::as_str), Some("Backup failed"));

        // rsync output that shows up late is not reported any more
        fs::write(&path, "\r  9,216  90%  1.00kB/s  0:00:01").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::remove_file(&path).unwrap();
        assert_eq!(h.notifier.titles(), titles);
    }

    fn local_run(source: &Path, dest: &Path, label: &'static str) -> Config {
        let mut cfg = remote_config(None, 0);
        cfg.source = source.to_path_buf();
        cfg.destination = Destination {
            user: None,
            host: None,
            path: dest.to_string_lossy().into_owned(),
        };
        cfg.snapshot_namer = SnapshotNamer::from_fn("fixed", move || label.to_string());
        cfg
    }

    fn read(path: impl AsRef<Path>) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_rsync_keeps_replaced_and_deleted_files() {
        if !SystemEnvironment.has_program("rsync") {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), "v1").unwrap();
        fs::write(source.path().join("b.txt"), "keep").unwrap();
        fs::write(source.path().join("c.txt"), "gone").unwrap();
        set_file_mtime(source.path().join("a.txt"), FileTime::from_unix_time(1_760_000_000, 0)).unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let parts = Collaborators {
            probe: Arc::new(FakeProbe::default()),
            waker: Arc::new(FakeWake::default()),
            shell: Arc::new(ShellExecutor::local()),
            sync: Arc::new(Rsync),
            notifier: notifier.clone(),
        };

        let first = Controller::new(local_run(source.path(), dest.path(), "first"), parts.clone())
            .with_timings(Timings::immediate())
            .run(std::future::pending())
            .await;
        assert_eq!(first.exit_code, 0, "{:?}", first.notes);

        let current = dest.path().join("current");
        assert_eq!(read(current.join("a.txt")), "v1");
        assert_eq!(read(current.join("b.txt")), "keep");
        assert_eq!(read(current.join("c.txt")), "gone");
        let old = dest.path().join("old");
        let first_old = old.join("first");
        assert!(!first_old.exists() || fs::read_dir(&first_old).unwrap().next().is_none());

        fs::write(source.path().join("a.txt"), "v2, longer").unwrap();
        set_file_mtime(source.path().join("a.txt"), FileTime::from_unix_time(1_760_000_600, 0)).unwrap();
        fs::remove_file(source.path().join("c.txt")).unwrap();

        let second = Controller::new(local_run(source.path(), dest.path(), "second"), parts)
            .with_timings(Timings::immediate())
            .run(std::future::pending())
            .await;
        assert_eq!(second.exit_code, 0, "{:?}", second.notes);

        assert_eq!(read(current.join("a.txt")), "v2, longer");
        assert_eq!(read(current.join("b.txt")), "keep");
        assert!(!current.join("c.txt").exists());

        let second_old = old.join("second");
        assert_eq!(read(second_old.join("a.txt")), "v1");
        assert_eq!(read(second_old.join("c.txt")), "gone");
        assert!(!second_old.join("b.txt").exists());

        assert_eq!(notifier.with_title("Backup finished").len(), 2);
        assert!(notifier.with_title("Backup failed").is_empty());
    }

    #[tokio::test]
    async fn test_reject_notifies_once() {
        let notifier = RecordingNotifier::default();
        let outcome = reject(ValidationError::MacAddress("zz".into()), &notifier).await;

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(notifier.titles(), vec!["Backup failed"]);
        assert!(outcome.notes[0].contains("invalid MAC address 'zz'"));
    }
}
