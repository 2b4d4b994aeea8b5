//! Advisory keep-awake lock on the destination host.
//!
//! The lock service is a command on the destination host:
//! `<cmd> enable` prints a token, `<cmd> check <token>` prints `active` or
//! `inactive`, `<cmd> release <token>` drops the lock.

use crate::executor::script::Script;
use crate::executor::CommandRunner;
use crate::utils::errors::{ExecError, PreflightError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Active,
    Inactive,
    Unknown(String),
}

impl LockStatus {
    fn parse(output: &str) -> Self {
        match output.trim() {
            "active" => LockStatus::Active,
            "inactive" => LockStatus::Inactive,
            other => LockStatus::Unknown(other.to_string()),
        }
    }

    fn describe(&self) -> &str {
        match self {
            LockStatus::Active => "active",
            LockStatus::Inactive => "inactive",
            LockStatus::Unknown(s) => s,
        }
    }
}

/// A held lock token. Must be given back with [`SleepLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepLock {
    command: String,
    token: String,
}

impl SleepLock {
    /// Ask the lock service for a token. The lock is not confirmed yet.
    pub async fn acquire(shell: &dyn CommandRunner, command: &str) -> Result<Self, PreflightError> {
        let out = shell
            .run(&Script::new("sleeplock enable", "{{lock}} enable").raw("lock", command))
            .await?;

        let token = out.trimmed().lines().last().unwrap_or_default().trim().to_string();
        if !out.success() || token.is_empty() {
            return Err(PreflightError::LockAcquire(format!(
                "'{command} enable' exited with {}: {}",
                out.status,
                out.trimmed()
            )));
        }

        info!(token = %token, "Sleep lock acquired");
        Ok(Self {
            command: command.to_string(),
            token,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn status(&self, shell: &dyn CommandRunner) -> Result<LockStatus, ExecError> {
        let out = shell
            .run(
                &Script::new("sleeplock check", "{{lock}} check {{token}}")
                    .raw("lock", self.command.as_str())
                    .value("token", self.token.as_str()),
            )
            .await?;
        Ok(LockStatus::parse(&out.output))
    }

    /// Fail unless the lock service reports the token as active.
    pub async fn confirm_active(&self, shell: &dyn CommandRunner) -> Result<(), PreflightError> {
        match self.status(shell).await? {
            LockStatus::Active => Ok(()),
            other => Err(PreflightError::LockNotActive {
                token: self.token.clone(),
                status: other.describe().to_string(),
            }),
        }
    }

    /// Release the token and confirm it now reads `inactive`.
    pub async fn release(self, shell: &dyn CommandRunner) -> Result<(), String> {
        let out = shell
            .run(
                &Script::new("sleeplock release", "{{lock}} release {{token}}")
                    .raw("lock", self.command.as_str())
                    .value("token", self.token.as_str()),
            )
            .await
            .map_err(|e| e.to_string())?;
        if !out.success() {
            warn!(token = %self.token, status = out.status, "Sleep lock release command failed");
        }

        match self.status(shell).await.map_err(|e| e.to_string())? {
            LockStatus::Inactive => {
                info!(token = %self.token, "Sleep lock released");
                Ok(())
            }
            other => Err(format!(
                "lock {} still reads '{}' after release",
                self.token,
                other.describe()
            )),
        }
    }
}
