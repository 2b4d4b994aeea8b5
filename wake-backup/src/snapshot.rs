//! Naming of the per-run `old/<label>` folder.

use crate::utils::errors::ValidationError;
use chrono::format::{Item, StrftimeItems};
use std::fmt;
use std::process::Command;
use std::sync::Arc;

pub const DEFAULT_LABEL_FORMAT: &str = "%Y-%m-%d";

type NameFn = dyn Fn() -> String + Send + Sync;

/// Strategy producing the label of the current run's retained-changes folder.
#[derive(Clone)]
pub struct SnapshotNamer {
    description: String,
    name: Arc<NameFn>,
}

impl SnapshotNamer {
    /// Local calendar date, e.g. `2026-10-16`.
    pub fn date() -> Self {
        Self::from_fn(format!("date ({DEFAULT_LABEL_FORMAT})"), || {
            chrono::Local::now().format(DEFAULT_LABEL_FORMAT).to_string()
        })
    }

    /// Local time rendered with a strftime pattern.
    pub fn format(pattern: &str) -> Result<Self, ValidationError> {
        if pattern.trim().is_empty() {
            return Err(ValidationError::SnapshotName("format is empty".into()));
        }
        if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
            return Err(ValidationError::SnapshotName(format!(
                "'{pattern}' is not a valid strftime format"
            )));
        }
        let owned = pattern.to_string();
        let namer = Self::from_fn(format!("format ({pattern})"), move || {
            chrono::Local::now().format(&owned).to_string()
        });
        namer.label()?;
        Ok(namer)
    }

    /// Run `command` through `sh -c` once and freeze its trimmed output.
    pub fn from_command(command: &str) -> Result<Self, ValidationError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| ValidationError::SnapshotName(format!("cannot run '{command}': {e}")))?;

        if !output.status.success() {
            return Err(ValidationError::SnapshotName(format!(
                "'{command}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
        validate_label(&label).map_err(ValidationError::SnapshotName)?;
        Ok(Self::from_fn(format!("command ({command})"), move || label.clone()))
    }

    pub fn from_fn<F>(description: impl Into<String>, name: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            name: Arc::new(name),
        }
    }

    /// Produce and check the label for this run.
    pub fn label(&self) -> Result<String, ValidationError> {
        let label = (self.name)();
        validate_label(&label).map_err(ValidationError::SnapshotName)?;
        Ok(label)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Default for SnapshotNamer {
    fn default() -> Self {
        Self::date()
    }
}

impl fmt::Debug for SnapshotNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotNamer")
            .field("description", &self.description)
            .finish()
    }
}

/// A label must name exactly one directory entry inside `old/`.
pub fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("label is empty".into());
    }
    if label == "." || label == ".." {
        return Err(format!("'{label}' is not a usable folder name"));
    }
    if label.contains('/') || label.contains('\0') || label.contains('\n') {
        return Err(format!("'{label}' contains '/', a newline or a NUL byte"));
    }
    Ok(())
}
