//! Delete command - Remove a backup and its index entry

use anyhow::{bail, Result};

use super::utils;
use session_helper::engine::Engine;

/// Execute the delete command
pub fn execute(engine: &Engine<'_>, app: &str, record_id: &str, yes: bool, json: bool) -> Result<()> {
    if json && !yes {
        bail!("--json requires --yes");
    }
    if !yes && !utils::confirm(&format!("Delete backup {}?", record_id))? {
        println!("Aborted.");
        return Ok(());
    }

    let result = engine.delete_backup(app, record_id);
    utils::finish(&result, json)
}
