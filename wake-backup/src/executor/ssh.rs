//! Argument builder for the OpenSSH client.

use crate::config::DEFAULT_SSH_PORT;

#[derive(Debug, Clone)]
pub struct SshCommand {
    program: String,
    login: String,
    port: u16,
    options: Vec<String>,
    remote_args: Vec<String>,
}

impl SshCommand {
    /// `login` is `host` or `user@host`.
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            program: "ssh".to_string(),
            login: login.into(),
            port: DEFAULT_SSH_PORT,
            options: Vec::new(),
            remote_args: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn remote_arg(mut self, arg: impl Into<String>) -> Self {
        self.remote_args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Options shared by every invocation: never prompt, and the port.
    fn transport_args(&self) -> Vec<String> {
        let mut args = vec!["-oBatchMode=yes".to_string()];
        if self.port != DEFAULT_SSH_PORT {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }
        args.extend(self.options.iter().cloned());
        args
    }

    /// Full argument list after the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.transport_args();
        args.push(self.login.clone());
        args.extend(self.remote_args.iter().cloned());
        args
    }

    /// The remote-shell string for `rsync -e`.
    pub fn rsh(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.transport_args());
        parts.join(" ")
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(self.args());
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_command_uses_batch_mode() {
        let ssh = SshCommand::new("nas");
        assert_eq!(ssh.args(), vec!["-oBatchMode=yes", "nas"]);
        assert_eq!(ssh.rsh(), "ssh -oBatchMode=yes");
    }

    #[test]
    fn test_user_port_options_and_remote_args() {
        let ssh = SshCommand::new("backup@nas")
            .port(2222)
            .option("-oConnectTimeout=10")
            .remote_arg("bash")
            .remote_arg("-s");

        assert_eq!(
            ssh.args(),
            vec!["-oBatchMode=yes", "-p", "2222", "-oConnectTimeout=10", "backup@nas", "bash", "-s"]
        );
        assert_eq!(ssh.rsh(), "ssh -oBatchMode=yes -p 2222 -oConnectTimeout=10");
    }
}
