//! Configuration management for wake-backup.
//!
//! Raw settings come from an optional TOML file with command line
//! overrides applied on top. [`Config::validate`] turns them into the
//! immutable [`Config`] every other component reads from.

use crate::snapshot::SnapshotNamer;
use crate::utils::errors::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC pattern is valid")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    /// Local directory to back up
    pub source: Option<PathBuf>,

    /// `[[user@]host:]path`
    pub destination: Option<String>,

    pub backup: BackupSettings,
    pub wake: WakeSettings,
    pub notify: NotifySettings,
    pub log: LogSettings,

    /// Validate and report only
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub exclude_file: Option<PathBuf>,

    /// Number of `old/<label>` folders to keep
    pub keep_n_backups: u32,

    /// Shell command printing the snapshot label (run once at startup)
    pub name_function: Option<String>,

    /// strftime pattern for the snapshot label
    pub name_format: Option<String>,

    /// rsync log file on the destination host
    pub rsync_log_file: Option<String>,

    pub ssh_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeSettings {
    /// Hardware address of the backup server
    pub mac: Option<String>,

    /// Wake-then-ping rounds before giving up; 0 disables wake packets
    pub max_attempts: u32,

    pub use_sleeplock: bool,

    /// Lock service command on the destination host
    pub lock_command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub enabled: bool,

    /// Push rsync progress as notifications
    pub progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Local log file, appended to
    pub file: Option<PathBuf>,
}

// Default values
pub const DEFAULT_MAX_WAKE_ATTEMPTS: u32 = 30;
pub const DEFAULT_KEEP_N_BACKUPS: u32 = 10;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_LOCK_COMMAND: &str = "sleeplock";

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            exclude_file: None,
            keep_n_backups: DEFAULT_KEEP_N_BACKUPS,
            name_function: None,
            name_format: None,
            rsync_log_file: None,
            ssh_port: DEFAULT_SSH_PORT,
        }
    }
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            mac: None,
            max_attempts: DEFAULT_MAX_WAKE_ATTEMPTS,
            use_sleeplock: false,
            lock_command: DEFAULT_LOCK_COMMAND.to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl RawSettings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| ValidationError::SettingsFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ValidationError::SettingsFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Hardware address of the machine to wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !MAC_PATTERN.is_match(s) {
            return Err(ValidationError::MacAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, pair) in octets.iter_mut().zip(s.split(':')) {
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|_| ValidationError::MacAddress(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Where the backup goes. `host == None` means a local-only backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

impl Destination {
    /// Split `[[user@]host:]path`.
    ///
    /// `default_user` is consulted only when a host is given without a user.
    pub fn parse(
        spec: &str,
        default_user: impl FnOnce() -> String,
    ) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::Destination {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (login, path) = match split_host(spec) {
            Some((login, path)) if !login.is_empty() => (Some(login), path),
            Some((_, path)) => (None, path),
            None => (None, spec),
        };

        let (user, host) = match login {
            Some(login) => {
                let (user, host) = match login.rsplit_once('@') {
                    Some((user, host)) => (user.to_string(), host),
                    None => (default_user(), login),
                };
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid("host name is empty"));
                }
                if user.is_empty() {
                    return Err(invalid("user name is empty"));
                }
                (Some(user), Some(host.to_string()))
            }
            None => (None, None),
        };

        let path = normalize_path(path, host.is_some());
        if path.is_empty() {
            return Err(invalid("path is empty"));
        }

        Ok(Self { user, host, path })
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// `DEST/<name>`
    pub fn join(&self, name: &str) -> String {
        if self.path.ends_with('/') {
            format!("{}{}", self.path, name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    pub fn current_dir(&self) -> String {
        self.join("current")
    }

    pub fn old_dir(&self) -> String {
        self.join("old")
    }

    /// `user@host` for ssh, if remote.
    pub fn login(&self) -> Option<String> {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => Some(format!("{user}@{host}")),
            (None, Some(host)) => Some(host.clone()),
            _ => None,
        }
    }

    /// Destination argument for rsync: `user@host:DEST/current` or `DEST/current`.
    pub fn rsync_target(&self) -> String {
        let current = self.current_dir();
        match (&self.user, &self.host) {
            (Some(user), Some(host)) if host.contains(':') => format!("{user}@[{host}]:{current}"),
            (Some(user), Some(host)) => format!("{user}@{host}:{current}"),
            (None, Some(host)) => format!("{host}:{current}"),
            _ => current,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.login() {
            Some(login) => write!(f, "{login}:{}", self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Find the `host:path` separator, honoring `[ipv6]:path`.
fn split_host(spec: &str) -> Option<(&str, &str)> {
    if let Some(close) = spec.find("]:") {
        if spec[..close].contains('[') {
            return Some((&spec[..close + 1], &spec[close + 2..]));
        }
    }
    spec.split_once(':')
}

/// Strip `~/` (remote paths are relative to the login directory anyway,
/// local ones are expanded) and trailing slashes.
fn normalize_path(path: &str, remote: bool) -> String {
    let mut path = if let Some(rest) = path.strip_prefix("~/") {
        if remote {
            rest.to_string()
        } else {
            match std::env::var_os("HOME") {
                Some(home) => Path::new(&home).join(rest).to_string_lossy().into_owned(),
                None => rest.to_string(),
            }
        }
    } else {
        path.to_string()
    };

    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// The host facts validation depends on.
pub trait Environment {
    fn has_program(&self, name: &str) -> bool;
    fn current_user(&self) -> String;
    fn can_broadcast(&self) -> Result<(), String>;
}

/// The real machine this process runs on.
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn has_program(&self, name: &str) -> bool {
        use std::os::unix::fs::PermissionsExt;

        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| {
            std::fs::metadata(dir.join(name))
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
    }

    fn current_user(&self) -> String {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    fn can_broadcast(&self) -> Result<(), String> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| e.to_string())?;
        socket.set_broadcast(true).map_err(|e| e.to_string())
    }
}

/// Validated, immutable settings of one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub destination: Destination,
    pub exclude_file: Option<PathBuf>,
    pub server_mac: Option<MacAddress>,
    pub max_wake_attempts: u32,
    pub retain_count: usize,
    pub snapshot_namer: SnapshotNamer,
    pub use_suspend_lock: bool,
    pub lock_command: String,
    pub ssh_port: u16,
    pub notify_enabled: bool,
    pub progress: bool,
    pub log_path: Option<PathBuf>,
    pub remote_log_path: Option<String>,
    pub dry_run: bool,
}

impl Config {
    /// Validate against the real machine.
    pub fn validate(raw: &RawSettings) -> Result<Self, ValidationError> {
        Self::validate_with(raw, &SystemEnvironment)
    }

    /// Validate field by field; the first failure is returned.
    pub fn validate_with(raw: &RawSettings, env: &dyn Environment) -> Result<Self, ValidationError> {
        let source = raw
            .source
            .clone()
            .ok_or(ValidationError::MissingArgument("SOURCE"))?;
        check_source(&source)?;

        let spec = raw
            .destination
            .as_deref()
            .ok_or(ValidationError::MissingArgument("DEST"))?;
        let destination = Destination::parse(spec, || env.current_user())?;

        if let Some(exclude) = &raw.backup.exclude_file {
            File::open(exclude).map_err(|_| ValidationError::ExcludeFile(exclude.clone()))?;
        }

        let server_mac = match raw.wake.mac.as_deref() {
            Some(mac) => {
                let mac = mac.parse::<MacAddress>()?;
                env.can_broadcast().map_err(ValidationError::WakeUnavailable)?;
                Some(mac)
            }
            None => None,
        };

        let mut required = vec!["rsync"];
        if destination.is_remote() {
            required.extend(["ssh", "ping"]);
        }
        if let Some(missing) = required.into_iter().find(|p| !env.has_program(p)) {
            return Err(ValidationError::MissingProgram(missing.to_string()));
        }

        let snapshot_namer = match (&raw.backup.name_function, &raw.backup.name_format) {
            (Some(command), _) => SnapshotNamer::from_command(command)?,
            (None, Some(pattern)) => SnapshotNamer::format(pattern)?,
            (None, None) => SnapshotNamer::date(),
        };
        snapshot_namer.label()?;

        if let Some(path) = &raw.log.file {
            if let Err(e) = OpenOptions::new().create(true).append(true).open(path) {
                if !raw.dry_run {
                    return Err(ValidationError::LogFile {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let use_suspend_lock =
            raw.wake.use_sleeplock && destination.is_remote() && server_mac.is_some();

        let remote_log_path = raw
            .backup
            .rsync_log_file
            .as_deref()
            .map(|p| normalize_path(p, destination.is_remote()))
            .filter(|p| !p.is_empty());

        Ok(Self {
            source,
            destination,
            exclude_file: raw.backup.exclude_file.clone(),
            server_mac,
            max_wake_attempts: raw.wake.max_attempts,
            retain_count: raw.backup.keep_n_backups as usize,
            snapshot_namer,
            use_suspend_lock,
            lock_command: raw.wake.lock_command.clone(),
            ssh_port: raw.backup.ssh_port,
            notify_enabled: raw.notify.enabled,
            progress: raw.notify.progress,
            log_path: raw.log.file.clone(),
            remote_log_path,
            dry_run: raw.dry_run,
        })
    }

    /// Human-readable settings, one per line.
    pub fn summary(&self) -> Vec<String> {
        let opt = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        vec![
            format!("source:            {}", self.source.display()),
            format!("destination:       {}", self.destination),
            format!("exclude file:      {}", opt(self.exclude_file.as_ref().map(|p| p.display().to_string()))),
            format!("wake-on-lan:       {}", opt(self.server_mac.map(|m| m.to_string()))),
            format!("max wake attempts: {}", self.max_wake_attempts),
            format!("keep backups:      {}", self.retain_count),
            format!("snapshot name:     {}", self.snapshot_namer.description()),
            format!("sleep lock:        {}", self.use_suspend_lock),
            format!("ssh port:          {}", self.ssh_port),
            format!("notifications:     {}", self.notify_enabled),
            format!("log file:          {}", opt(self.log_path.as_ref().map(|p| p.display().to_string()))),
            format!("rsync log file:    {}", opt(self.remote_log_path.clone())),
            format!("dry run:           {}", self.dry_run),
        ]
    }
}

fn check_source(source: &Path) -> Result<(), ValidationError> {
    let metadata =
        std::fs::metadata(source).map_err(|_| ValidationError::SourceMissing(source.to_path_buf()))?;
    if !metadata.is_dir() || std::fs::read_dir(source).is_err() {
        return Err(ValidationError::SourceUnreadable(source.to_path_buf()));
    }
    Ok(())
}
