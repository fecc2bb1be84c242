//! Shared utilities for commands

use anyhow::{bail, Result};
use chrono::{DateTime, Local, Utc};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::io::{self, Write};

use session_helper::engine::{BackupStatus, OperationResult};

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Local time, minute precision
pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Status word colored by severity
pub fn format_status(status: BackupStatus) -> String {
    match status {
        BackupStatus::Complete => status.to_string().green().to_string(),
        BackupStatus::Partial => status.to_string().yellow().to_string(),
        BackupStatus::Corrupt => status.to_string().red().to_string(),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an operation result and turn a failure into a non-zero exit
pub fn finish(result: &OperationResult, json: bool) -> Result<()> {
    if json {
        print_json(result)?;
    } else {
        print_result(result);
    }

    if !result.succeeded {
        match &result.error {
            Some(e) => bail!("{} failed: {}", result.operation_kind, e),
            None => bail!("{} failed", result.operation_kind),
        }
    }
    Ok(())
}

fn print_result(result: &OperationResult) {
    for id in &result.backup_ids {
        println!("{} {}", "Backup:".green(), id);
    }
    if result.backup_ids.is_empty() {
        if let Some(id) = &result.backup_id {
            println!("{} {}", "Backup:".green(), id);
        }
    }
    for path in &result.affected_paths {
        println!("{} {}", "Updated:".green(), path.display());
    }
    for path in &result.failed_paths {
        eprintln!("{} {}", "Failed:".red(), path.display());
    }
    if let Some(id) = &result.new_identity {
        println!("{} {}", "New identity:".cyan(), id);
    }

    if result.succeeded {
        println!(
            "{} {} {}",
            result.operation_kind.to_string().bold(),
            result.application_name,
            "complete".green()
        );
    }
}

/// Ask a yes/no question; anything but `y` is no
pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{} (y/N) ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}
