//! session-helper: back up, restore and reset the local session data of
//! desktop developer tools
//!
//! This tool is not affiliated with or endorsed by the vendors of the
//! applications it manages. It only touches data stored on your own machine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use session_helper::config::{EngineConfig, SystemPaths};
use session_helper::engine::{Engine, OperationKind, OperationState, ResetOptions, SystemProcessTable};

mod commands;

/// Environment variable holding the log filter (`debug`, `session_helper=info`, ...)
const LOG_ENV: &str = "SESSION_HELPER_LOG";

#[derive(Parser)]
#[command(name = "session-helper")]
#[command(about = "Back up, restore and reset local developer tool sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $SESSION_HELPER_CONFIG or the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show data locations, running processes and backup counts
    Status {
        /// Application name (all configured applications if omitted)
        app: Option<String>,
    },

    /// List backups of an application, newest first
    List {
        app: String,

        /// Show the source path of each backup
        #[arg(long)]
        with_path: bool,

        /// Limit number of results
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Back up the data of an application
    Backup {
        app: String,

        /// Label stored with the backup
        #[arg(short, long, default_value = "manual")]
        label: String,
    },

    /// Restore a backup to where it was taken from
    Restore {
        app: String,

        /// Backup id (newest complete backup if omitted)
        record_id: Option<String>,
    },

    /// Back up, then wipe the data of an application
    Reset {
        app: String,

        /// Skip the safety backup
        #[arg(long)]
        no_backup: bool,

        /// Close the application if it is running
        #[arg(short, long)]
        force: bool,

        /// Write fresh device identifiers after the wipe
        #[arg(long)]
        new_id: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Replace the device identifiers of an application
    RegenerateId { app: String },

    /// Delete a backup
    Delete {
        app: String,

        record_id: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Check every backup of an application against its recorded hash
    Verify { app: String },

    /// Print the config file location
    ConfigPath,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let (config, config_path) = EngineConfig::load_or_default(cli.config.as_deref())?;

    if let Commands::ConfigPath = cli.command {
        let note = if config_path.exists() {
            "".to_string()
        } else {
            format!(" {}", "(not present, using built-in defaults)".dimmed())
        };
        println!("{}{}", config_path.display(), note);
        return Ok(());
    }

    let paths = SystemPaths;
    let processes = SystemProcessTable;
    let mut engine = Engine::new(&config, &paths, &processes)?;
    if !cli.json {
        engine = engine.with_observer(print_progress);
    }

    let json = cli.json;
    match cli.command {
        Commands::Status { app } => commands::status::execute(&engine, app.as_deref(), json)?,

        Commands::List {
            app,
            with_path,
            limit,
        } => {
            let options = commands::list::ListOptions { with_path, limit };
            commands::list::execute(&engine, &app, &options, json)?;
        }

        Commands::Backup { app, label } => commands::backup::execute(&engine, &app, &label, json)?,

        Commands::Restore { app, record_id } => {
            commands::restore::execute(&engine, &app, record_id.as_deref(), json)?
        }

        Commands::Reset {
            app,
            no_backup,
            force,
            new_id,
            yes,
        } => {
            let options = ResetOptions {
                make_backup: !no_backup,
                force_kill: force,
                regenerate_identity: new_id,
            };
            commands::reset::execute(&engine, &app, options, yes, json)?;
        }

        Commands::RegenerateId { app } => commands::regenerate_id::execute(&engine, &app, json)?,

        Commands::Delete {
            app,
            record_id,
            yes,
        } => commands::delete::execute(&engine, &app, &record_id, yes, json)?,

        Commands::Verify { app } => commands::verify::execute(&engine, &app, json)?,

        Commands::ConfigPath => {}
    }

    Ok(())
}

/// Logs go to stderr so `--json` output stays parseable
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_progress(app: &str, kind: OperationKind, state: OperationState) {
    match state {
        OperationState::Idle | OperationState::Done | OperationState::Failed => {}
        state => eprintln!("{} {} {}: {}", "==>".blue(), kind, app, state),
    }
}
