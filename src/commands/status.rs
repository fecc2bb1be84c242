//! Status command - Show what is installed, running and backed up

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use owo_colors::OwoColorize;

use super::utils;
use session_helper::engine::{AppStatus, Engine};

/// Execute the status command
pub fn execute(engine: &Engine<'_>, app: Option<&str>, json: bool) -> Result<()> {
    let statuses = match app {
        Some(app) => vec![engine.status(app)?],
        None => engine.status_all()?,
    };

    if json {
        return utils::print_json(&statuses);
    }

    println!("{}", format_table(&statuses));
    println!("\nBackups are stored in {}", engine.store().root().display());
    Ok(())
}

fn format_table(statuses: &[AppStatus]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Application"),
        Cell::new("Data"),
        Cell::new("Size"),
        Cell::new("Running"),
        Cell::new("Backups"),
    ]);

    for status in statuses {
        let data = if status.installed {
            status
                .data_roots
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            "not found".dimmed().to_string()
        };
        let running = if status.running.is_empty() {
            "-".to_string()
        } else {
            let pids: Vec<String> = status.running.iter().map(|p| p.pid.to_string()).collect();
            format!("{} (pid {})", "yes".yellow(), pids.join(", "))
        };

        table.add_row(vec![
            Cell::new(&status.display_name),
            Cell::new(data),
            Cell::new(utils::format_size(status.size_bytes)),
            Cell::new(running),
            Cell::new(status.backups),
        ]);
    }

    table.to_string()
}
