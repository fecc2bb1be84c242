//! Backup command - Archive the data of an application

use anyhow::Result;

use super::utils;
use session_helper::engine::Engine;

/// Execute the backup command
pub fn execute(engine: &Engine<'_>, app: &str, label: &str, json: bool) -> Result<()> {
    if !json {
        println!("Backing up {} as \"{}\"", app, label);
    }

    let result = engine.backup(app, label);
    utils::finish(&result, json)
}
