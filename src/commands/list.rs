//! List command - List backups of an application

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};

use super::utils;
use session_helper::engine::{ArchiveFormat, BackupRecord, Engine};

/// Options for the list command
#[derive(Debug, Default)]
pub struct ListOptions {
    /// Show source paths
    pub with_path: bool,
    /// Limit number of results
    pub limit: Option<usize>,
}

/// Execute the list command
pub fn execute(engine: &Engine<'_>, app: &str, options: &ListOptions, json: bool) -> Result<()> {
    let mut records = engine.list_backups(app)?;
    let total_count = records.len();
    if let Some(n) = options.limit {
        records.truncate(n);
    }

    if json {
        return utils::print_json(&records);
    }

    if records.is_empty() {
        println!("No backups found for {}.", app);
        return Ok(());
    }

    let mut output = format_table(&records, options);
    if records.len() < total_count {
        output.push_str(&format!(
            "\n\nShowing {} of {} backups",
            records.len(),
            total_count
        ));
    } else {
        output.push_str(&format!("\n\n{} backups found", total_count));
    }
    println!("{}", output);
    Ok(())
}

/// Render records as a table, newest first
pub fn format_table(records: &[BackupRecord], options: &ListOptions) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![
        Cell::new("ID"),
        Cell::new("Label"),
        Cell::new("Created"),
        Cell::new("Size"),
        Cell::new("Files"),
        Cell::new("Status"),
    ];
    if options.with_path {
        header.push(Cell::new("Source"));
    }
    table.set_header(header);

    for record in records {
        let size = match record.format {
            ArchiveFormat::Directory => utils::format_size(record.size_bytes),
            ArchiveFormat::TarGz => format!("{} (gz)", utils::format_size(record.size_bytes)),
        };

        let mut row = vec![
            Cell::new(&record.id),
            Cell::new(&record.label),
            Cell::new(utils::format_time(record.created_at)),
            Cell::new(size),
            Cell::new(record.file_count),
            Cell::new(utils::format_status(record.status)),
        ];
        if options.with_path {
            row.push(Cell::new(record.source_path.display()));
        }
        table.add_row(row);
    }

    table.to_string()
}
