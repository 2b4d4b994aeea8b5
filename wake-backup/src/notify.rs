//! Desktop notifications about the state of a backup run.

use crate::utils::errors::NotifyError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), NotifyError>;
}

/// Pops up notifications through `notify-send`.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    app_name: String,
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new("wake-backup")
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), NotifyError> {
        let output = Command::new("notify-send")
            .args(["-a", &self.app_name, "-u", urgency.as_str(), title, body])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NotifyError(format!("cannot run notify-send: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(NotifyError(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

/// Writes notifications to the log only; used when popups are disabled.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), NotifyError> {
        info!(urgency = urgency.as_str(), "{}: {}", title, body);
        Ok(())
    }
}

/// Deliver a notification; failures are logged and swallowed.
pub async fn notify_best_effort(notifier: &dyn Notifier, title: &str, body: &str, urgency: Urgency) {
    if let Err(e) = notifier.notify(title, body, urgency).await {
        warn!(title, "{}", e);
    }
}
