//! Everything that must be in place on the destination before rsync runs.

pub mod rotate;
pub mod sleeplock;

use crate::config::Config;
use crate::executor::script::Script;
use crate::executor::CommandRunner;
use crate::lifecycle::RunState;
use crate::utils::errors::PreflightError;
use tracing::info;

pub use sleeplock::SleepLock;

/// Exit status the layout script uses for "exists but is not a directory".
const NOT_A_DIRECTORY: i32 = 3;

const LAYOUT_TEMPLATE: &str = r#"set -u
for dir in {{dirs}}; do
    if [ -e "$dir" ] && [ ! -d "$dir" ]; then
        echo "$dir exists but is not a directory"
        exit 3
    fi
done
mkdir -p -- {{dirs}}
"#;

/// Acquire the sleep lock, create the directory layout, rotate rsync logs.
///
/// The lock token is stored in `state` as soon as the lock service hands
/// it out, so it is released even if confirming it fails.
pub async fn prepare(
    cfg: &Config,
    shell: &dyn CommandRunner,
    state: &mut RunState,
) -> Result<(), PreflightError> {
    if cfg.use_suspend_lock {
        let lock = SleepLock::acquire(shell, &cfg.lock_command).await?;
        let lock = state.sleep_lock.insert(lock);
        lock.confirm_active(shell).await?;
    }

    ensure_layout(cfg, shell).await?;

    if let Some(log) = &cfg.remote_log_path {
        let out = shell.run(&rotate::rotation_script(log)).await?;
        if !out.success() {
            return Err(PreflightError::LogRotation(out.trimmed().to_string()));
        }
        info!(log = %log, "Rotated rsync logs");
    }

    Ok(())
}

/// Create `DEST/current` and `DEST/old`. Safe to run repeatedly.
pub async fn ensure_layout(cfg: &Config, shell: &dyn CommandRunner) -> Result<(), PreflightError> {
    let dirs = [cfg.destination.current_dir(), cfg.destination.old_dir()];
    let out = shell
        .run(&Script::new("ensure layout", LAYOUT_TEMPLATE).values("dirs", dirs))
        .await?;

    match out.status {
        0 => Ok(()),
        NOT_A_DIRECTORY => Err(PreflightError::NotADirectory(out.trimmed().to_string())),
        _ => Err(PreflightError::Layout(out.trimmed().to_string())),
    }
}
