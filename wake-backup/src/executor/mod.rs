//! Runs shell scripts on the destination host, or locally for local-only backups.
//!
//! The rendered script is fed to `bash -s` on stdin, either directly or
//! through `ssh user@host bash -s`, so there is exactly one shell that
//! evaluates it. Its stderr is folded into stdout; the exit status is
//! returned verbatim and callers decide what non-zero means.

pub mod script;
pub mod ssh;

use crate::config::Destination;
use crate::utils::errors::ExecError;
use async_trait::async_trait;
use script::Script;
use ssh::SshCommand;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Combined output and exit status of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    /// Exit status, or -1 when the shell was killed by a signal
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

/// Anything that can run a [`Script`] where the backup lives.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, script: &Script) -> Result<CommandOutput, ExecError>;
}

#[derive(Debug, Clone)]
enum Target {
    Local,
    Remote(SshCommand),
}

/// [`CommandRunner`] backed by `bash`, locally or over ssh.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    target: Target,
}

impl ShellExecutor {
    pub fn local() -> Self {
        Self { target: Target::Local }
    }

    pub fn remote(login: impl Into<String>, port: u16) -> Self {
        let ssh = SshCommand::new(login).port(port).remote_arg("bash").remote_arg("-s");
        Self {
            target: Target::Remote(ssh),
        }
    }

    /// Remote executor for remote destinations, local otherwise.
    pub fn for_destination(destination: &Destination, port: u16) -> Self {
        match destination.login() {
            Some(login) => Self::remote(login, port),
            None => Self::local(),
        }
    }

    fn command(&self) -> tokio::process::Command {
        match &self.target {
            Target::Local => {
                let mut command = tokio::process::Command::new("bash");
                command.arg("-s");
                command
            }
            Target::Remote(ssh) => ssh.to_command(),
        }
    }

    fn program(&self) -> &str {
        match &self.target {
            Target::Local => "bash",
            Target::Remote(ssh) => ssh.program(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    async fn run(&self, script: &Script) -> Result<CommandOutput, ExecError> {
        let body = script.render().map_err(|reason| ExecError::Render {
            script: script.name().to_string(),
            reason,
        })?;
        let spawn_error = |source| ExecError::Spawn {
            program: self.program().to_string(),
            source,
        };

        debug!(script = script.name(), "Running script");

        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            let text = format!("exec 2>&1\n{body}\n");
            stdin.write_all(text.as_bytes()).await.map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let status = output.status.code().unwrap_or(-1);
        debug!(script = script.name(), status, "Script finished");

        Ok(CommandOutput {
            output: combined,
            status,
        })
    }
}
