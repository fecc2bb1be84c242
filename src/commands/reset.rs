//! Reset command - Back up and wipe the data of an application

use anyhow::{bail, Result};
use owo_colors::OwoColorize;

use super::utils;
use session_helper::engine::{Engine, ResetOptions};

/// Execute the reset command
pub fn execute(
    engine: &Engine<'_>,
    app: &str,
    options: ResetOptions,
    yes: bool,
    json: bool,
) -> Result<()> {
    if json && !yes {
        bail!("--json requires --yes");
    }
    let status = engine.status(app)?;

    if !json {
        println!("Resetting {}:", status.display_name);
        for root in &status.data_roots {
            println!("  {}", root.display());
        }
        println!("  Total: {}", utils::format_size(status.size_bytes));

        if !status.running.is_empty() {
            let note = if options.force_kill {
                "will be closed first"
            } else {
                "must be closed first"
            };
            println!(
                "{} {} is running and {}",
                "Warning:".yellow(),
                status.display_name,
                note
            );
        }
        if !options.make_backup {
            println!(
                "{} no backup will be taken, this cannot be undone",
                "Warning:".yellow()
            );
        }
    }

    // Confirm reset
    if !yes && !utils::confirm(&format!("\nReset all {} data?", status.display_name))? {
        println!("Aborted.");
        return Ok(());
    }

    let result = engine.reset(app, options);
    utils::finish(&result, json)
}
