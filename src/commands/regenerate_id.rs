//! Regenerate-id command - Write fresh device identifiers

use anyhow::Result;

use super::utils;
use session_helper::engine::Engine;

pub fn execute(engine: &Engine<'_>, app: &str, json: bool) -> Result<()> {
    let result = engine.regenerate_id(app);
    utils::finish(&result, json)
}
