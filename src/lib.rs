//! session-helper library
//!
//! Backup, restore, reset and device identity regeneration for the local
//! session data of desktop developer tools (Cursor, Windsurf, Claude).
//!
//! # Disclaimer
//!
//! This tool is not affiliated with or endorsed by the vendors of the
//! applications it manages. It only touches data stored on your own machine.

pub mod config;
pub mod engine;
