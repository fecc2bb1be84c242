//! Restore command - Put a backup back in place

use anyhow::{Context, Result};
use owo_colors::OwoColorize;

use super::utils;
use session_helper::engine::{BackupStatus, Engine};

/// Execute the restore command
///
/// Without a record id the newest complete backup of the application is used.
pub fn execute(engine: &Engine<'_>, app: &str, record_id: Option<&str>, json: bool) -> Result<()> {
    let record_id = match record_id {
        Some(id) => id.to_string(),
        None => engine
            .list_backups(app)?
            .into_iter()
            .find(|r| r.status == BackupStatus::Complete)
            .map(|r| r.id)
            .with_context(|| format!("No complete backup found for {}", app))?,
    };

    if !json {
        println!("Restoring {} from {}", app, record_id.cyan());
    }

    let result = engine.restore(app, &record_id);
    utils::finish(&result, json)
}
