//! Verify command - Re-hash every backup of an application

use anyhow::{bail, Result};
use owo_colors::OwoColorize;

use super::list::{self, ListOptions};
use super::utils;
use session_helper::engine::Engine;

/// Execute the verify command
///
/// Mismatched or missing archives are flagged `corrupt` in the index and the
/// command exits non-zero.
pub fn execute(engine: &Engine<'_>, app: &str, json: bool) -> Result<()> {
    let result = engine.verify_backups(app);
    if json {
        return utils::finish(&result, true);
    }

    let records = engine.list_backups(app)?;
    if records.is_empty() {
        println!("No backups found for {}.", app);
    } else {
        println!("{}", list::format_table(&records, &ListOptions::default()));
    }

    match (&result.error, result.failed_paths.len()) {
        (None, _) => {
            println!("\n{} {} backup(s) verified", "OK:".green(), records.len());
            Ok(())
        }
        (Some(_), 0) => utils::finish(&result, false),
        (Some(_), corrupt) => {
            println!(
                "\n{} {} of {} backup(s) failed verification",
                "Corrupt:".red(),
                corrupt,
                records.len()
            );
            bail!("verify failed: {} corrupt backup(s)", corrupt)
        }
    }
}
