//! wake-backup - Main entry point

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use wake_backup::config::{Config, RawSettings};
use wake_backup::lifecycle::{self, Collaborators, Controller};
use wake_backup::utils::errors::ValidationError;
use wake_backup::{shutdown, utils};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Local directory to back up
    #[arg(value_name = "SOURCE")]
    source: Option<PathBuf>,

    /// Backup location, [[user@]host:]path
    #[arg(value_name = "DEST")]
    destination: Option<String>,

    /// MAC address of the backup server (XX:XX:XX:XX:XX:XX)
    #[arg(long, value_name = "MAC")]
    wake_on_lan: Option<String>,

    /// Wake-then-ping rounds before giving up
    #[arg(long, value_name = "N")]
    max_wake_wait: Option<u32>,

    /// File of rsync exclude patterns
    #[arg(long, value_name = "FILE")]
    exclude_file: Option<PathBuf>,

    /// Append log output to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// rsync log file on the backup server, rotated before each run
    #[arg(long, value_name = "PATH")]
    rsync_log_file: Option<String>,

    /// Number of old/<name> folders to keep
    #[arg(long, value_name = "N")]
    keep_n_backups: Option<u32>,

    /// Shell command printing the name of this run's old/<name> folder
    #[arg(long, value_name = "CMD")]
    old_backups_name_function: Option<String>,

    /// strftime pattern for the old/<name> folder
    #[arg(long, value_name = "FORMAT")]
    old_backups_name_format: Option<String>,

    /// Send desktop notifications
    #[arg(long)]
    send_notifications: bool,

    /// Validate and check connectivity, change nothing
    #[arg(long)]
    dry_run: bool,

    /// Keep the backup server awake with its sleep lock service
    #[arg(long)]
    use_sleeplock: bool,

    /// Report rsync progress as notifications
    #[arg(long)]
    progress: bool,

    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// SSH port of the backup server
    #[arg(long, value_name = "PORT")]
    ssh_port: Option<u16>,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

impl Args {
    /// Settings file (if any) with command line flags applied on top.
    fn settings(&self) -> std::result::Result<RawSettings, ValidationError> {
        let mut raw = match &self.config {
            Some(path) => RawSettings::from_file(path)?,
            None => RawSettings::default(),
        };

        if let Some(source) = &self.source {
            raw.source = Some(source.clone());
        }
        if let Some(destination) = &self.destination {
            raw.destination = Some(destination.clone());
        }
        if let Some(mac) = &self.wake_on_lan {
            raw.wake.mac = Some(mac.clone());
        }
        if let Some(attempts) = self.max_wake_wait {
            raw.wake.max_attempts = attempts;
        }
        if let Some(file) = &self.exclude_file {
            raw.backup.exclude_file = Some(file.clone());
        }
        if let Some(file) = &self.log_file {
            raw.log.file = Some(file.clone());
        }
        if let Some(file) = &self.rsync_log_file {
            raw.backup.rsync_log_file = Some(file.clone());
        }
        if let Some(keep) = self.keep_n_backups {
            raw.backup.keep_n_backups = keep;
        }
        if let Some(command) = &self.old_backups_name_function {
            raw.backup.name_function = Some(command.clone());
        }
        if let Some(format) = &self.old_backups_name_format {
            raw.backup.name_format = Some(format.clone());
        }
        if let Some(level) = &self.log_level {
            raw.log.level = level.clone();
        }
        if let Some(port) = self.ssh_port {
            raw.backup.ssh_port = port;
        }

        raw.notify.enabled |= self.send_notifications;
        raw.notify.progress |= self.progress;
        raw.wake.use_sleeplock |= self.use_sleeplock;
        raw.dry_run |= self.dry_run;

        Ok(raw)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("wake-backup: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let signals = shutdown::Signals::install();
    let settings = args.settings();

    // Initialize logging
    let (level, log_file) = match &settings {
        Ok(raw) => (raw.log.level.clone(), raw.log.file.clone()),
        Err(_) => (
            args.log_level.clone().unwrap_or_else(|| "info".to_string()),
            args.log_file.clone(),
        ),
    };
    if let Err(e) = utils::logger::init(&level, log_file.as_deref()) {
        // validation reports the unwritable log file
        utils::logger::init(&level, None)?;
        tracing::warn!("Logging to file disabled: {}", e);
    }

    let settings = match settings {
        Ok(raw) => raw,
        Err(e) => {
            let notifier = lifecycle::notifier_for(args.send_notifications);
            return Ok(lifecycle::reject(e, notifier.as_ref()).await.exit_code);
        }
    };

    let cfg = match Config::validate(&settings) {
        Ok(cfg) => cfg,
        Err(e) => {
            let notifier = lifecycle::notifier_for(settings.notify.enabled);
            return Ok(lifecycle::reject(e, notifier.as_ref()).await.exit_code);
        }
    };

    let parts = Collaborators::system(&cfg);
    let outcome = Controller::new(cfg, parts).run(signals.wait()).await;
    Ok(outcome.exit_code)
}
