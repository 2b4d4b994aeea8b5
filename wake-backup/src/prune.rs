//! Retention of `DEST/old/<label>` snapshot folders.
//!
//! Age is the folder's modification time on the destination, never the
//! label, so custom snapshot names prune correctly.

use crate::config::Config;
use crate::executor::script::Script;
use crate::executor::CommandRunner;
use crate::utils::errors::PruneError;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{info, warn};

// GNU find prints the listing directly; elsewhere the same
// `<mtime>\t<name>\0` records are built with stat.
const LIST_TEMPLATE: &str = r#"old={{old}}
[ -d "$old" ] || exit 0
cd -- "$old" || exit 1
if find . -maxdepth 0 -printf '' 2>/dev/null; then
    find . -mindepth 1 -maxdepth 1 -printf '%T@\t%P\0'
else
{{portable}}
fi
"#;

const PORTABLE_LISTING: &str = r#"for entry in * .[!.]* ..?*; do
    [ -e "$entry" ] || [ -L "$entry" ] || continue
    mtime=$(stat -c %Y -- "$entry" 2>/dev/null || stat -f %m -- "$entry") || exit 1
    printf '%s\t%s\000' "$mtime" "$entry"
done"#;

const REMOVE_TEMPLATE: &str = "cd -- {{old}} && rm -rf -- {{label}}";

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub label: String,
    /// Seconds since the epoch
    pub modified: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub kept: usize,
    pub deleted: Vec<String>,
}

/// Parse `<mtime>\t<name>\0` records.
pub fn parse_listing(output: &str) -> Vec<Snapshot> {
    output
        .split('\0')
        .map(|entry| entry.trim_start_matches('\n'))
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry
                .split_once('\t')
                .and_then(|(mtime, label)| Some((mtime.parse::<f64>().ok()?, label)));
            match parsed {
                Some((modified, label)) if !label.is_empty() => Some(Snapshot {
                    label: label.to_string(),
                    modified,
                }),
                _ => {
                    warn!(entry, "Ignoring unparsable snapshot listing entry");
                    None
                }
            }
        })
        .collect()
}

/// Oldest snapshots beyond `retain`, oldest first.
pub fn select_expired(mut snapshots: Vec<Snapshot>, retain: usize) -> Vec<Snapshot> {
    snapshots.sort_by(|a, b| {
        a.modified
            .partial_cmp(&b.modified)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
    });
    let excess = snapshots.len().saturating_sub(retain);
    snapshots.truncate(excess);
    snapshots
}

/// Delete all but the newest `cfg.retain_count` snapshots.
///
/// Stops at the first deletion that fails; the snapshots deleted so far
/// stay deleted.
pub async fn prune(cfg: &Config, shell: &dyn CommandRunner) -> Result<PruneReport, PruneError> {
    let old = cfg.destination.old_dir();

    let out = shell
        .run(
            &Script::new("list snapshots", LIST_TEMPLATE)
                .value("old", old.as_str())
                .raw("portable", PORTABLE_LISTING),
        )
        .await?;
    if !out.success() {
        return Err(PruneError::Listing {
            status: out.status,
            output: out.trimmed().to_string(),
        });
    }

    let snapshots = parse_listing(&out.output);
    let total = snapshots.len();
    let expired = select_expired(snapshots, cfg.retain_count);

    let mut report = PruneReport {
        kept: total - expired.len(),
        deleted: Vec::with_capacity(expired.len()),
    };

    for snapshot in expired {
        let out = shell
            .run(
                &Script::new("remove snapshot", REMOVE_TEMPLATE)
                    .value("old", old.as_str())
                    .value("label", snapshot.label.as_str()),
            )
            .await?;
        if !out.success() {
            return Err(PruneError::Remove {
                label: snapshot.label,
                status: out.status,
                output: out.trimmed().to_string(),
            });
        }
        info!(label = %snapshot.label, "Deleted old backup");
        report.deleted.push(snapshot.label);
    }

    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "Pruning finished"),
        Err(e) => warn!("Could not serialize prune report: {}", e),
    }
    Ok(report)
}
