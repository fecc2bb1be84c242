//! CLI commands

pub mod backup;
pub mod delete;
pub mod list;
pub mod regenerate_id;
pub mod reset;
pub mod restore;
pub mod status;
pub mod utils;
pub mod verify;
