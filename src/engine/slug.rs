//! Slugs for record ids, archive directories and lock files
//!
//! Application names and user labels end up in file names, so they are
//! reduced to ASCII alphanumerics separated by single dashes.

/// Convert free text into a filesystem-safe slug
///
/// 1. Every character that is not an ASCII letter or digit becomes `-`
/// 2. Consecutive `-` collapse into one
/// 3. Leading/trailing `-` are trimmed
///
/// Returns `fallback` when nothing is left.
///
/// # Example
/// ```
/// use session_helper::engine::slug::slugify;
///
/// assert_eq!(slugify("Pre update (v2.1)", "backup"), "Pre-update-v2-1");
/// ```
pub fn slugify(text: &str, fallback: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_dash = false;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c);
            prev_dash = false;
        } else {
            if !prev_dash && !result.is_empty() {
                result.push('-');
            }
            prev_dash = true;
        }
    }

    let trimmed = result.trim_end_matches('-');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
