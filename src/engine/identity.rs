//! Device identity regeneration
//!
//! VS Code based editors keep their telemetry/device identifiers in
//! `User/globalStorage/storage.json`; some builds mirror them into the
//! `ItemTable` of a `state.vscdb` SQLite database. Both are rewritten in
//! place: only the identifier values change, every other byte (or row) is
//! left as it was.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::error::{EngineError, InternalContext, Result};
use crate::config::ApplicationProfile;

/// Result of a regeneration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityUpdate {
    /// The new identifier every field was derived from
    pub new_id: String,
    /// Files that were rewritten
    pub files: Vec<PathBuf>,
}

/// Shape of an identifier value, kept when it is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdShape {
    /// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`
    Uuid { upper: bool },
    /// `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`
    BracedUuid { upper: bool },
    /// 64 hex digits (SHA-256)
    Hex64 { upper: bool },
    /// 32 hex digits
    Hex32 { upper: bool },
}

impl IdShape {
    fn detect(value: &str) -> Option<Self> {
        let upper = value.chars().any(|c| c.is_ascii_uppercase())
            && !value.chars().any(|c| c.is_ascii_lowercase());
        let is_hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());

        if value.len() == 38 && value.starts_with('{') && value.ends_with('}') {
            let inner = &value[1..37];
            return is_hyphenated_uuid(inner).then_some(Self::BracedUuid { upper });
        }
        if value.len() == 36 {
            return is_hyphenated_uuid(value).then_some(Self::Uuid { upper });
        }
        if value.len() == 64 && is_hex(value) {
            return Some(Self::Hex64 { upper });
        }
        if value.len() == 32 && is_hex(value) {
            return Some(Self::Hex32 { upper });
        }
        None
    }

    fn render(self, id: &Uuid) -> String {
        let (value, upper) = match self {
            Self::Uuid { upper } => (id.hyphenated().to_string(), upper),
            Self::BracedUuid { upper } => (format!("{{{}}}", id.hyphenated()), upper),
            Self::Hex64 { upper } => (format!("{:x}", Sha256::digest(id.as_bytes())), upper),
            Self::Hex32 { upper } => (id.simple().to_string(), upper),
        };
        if upper {
            value.to_uppercase()
        } else {
            value
        }
    }
}

fn is_hyphenated_uuid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Pending rewrite of one file
enum Rewrite {
    Json { path: PathBuf, content: String },
    Sqlite { path: PathBuf, updates: Vec<(String, String)> },
}

/// Regenerate the identity of `profile` across its data roots
///
/// Every matched file is parsed and planned before the first one is written,
/// so an unsupported file aborts the whole regeneration untouched.
pub fn regenerate(profile: &ApplicationProfile, roots: &[PathBuf]) -> Result<IdentityUpdate> {
    let files = identity_files(profile, roots)?;
    if files.is_empty() {
        return Err(EngineError::not_found(
            &profile.name,
            "no identity file matched",
        ));
    }

    let new_id = Uuid::new_v4();
    let mut plan = Vec::with_capacity(files.len());
    for path in &files {
        plan.push(if is_sqlite(path) {
            Rewrite::Sqlite {
                path: path.clone(),
                updates: plan_sqlite(path, &profile.identity_fields, &new_id)?,
            }
        } else {
            Rewrite::Json {
                path: path.clone(),
                content: plan_json(path, &profile.identity_fields, &new_id)?,
            }
        });
    }

    for rewrite in &plan {
        match rewrite {
            Rewrite::Json { path, content } => write_atomic(path, content)?,
            Rewrite::Sqlite { path, updates } => apply_sqlite(path, updates)?,
        }
    }

    tracing::info!(app = %profile.name, files = files.len(), "identity regenerated");
    Ok(IdentityUpdate {
        new_id: new_id.hyphenated().to_string(),
        files,
    })
}

/// Files under `roots` matching the profile's identity patterns
pub fn identity_files(profile: &ApplicationProfile, roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for root in roots {
        let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
        for pattern in &profile.identity_file_patterns {
            let full = format!("{}/{}", escaped_root.trim_end_matches(['/', '\\']), pattern);
            let matches = glob::glob(&full)
                .internal(|| format!("Invalid identity pattern: {}", pattern))?;
            for path in matches.flatten() {
                if path.is_file() && !files.contains(&path) {
                    files.push(path);
                }
            }
        }
    }
    Ok(files)
}

fn is_sqlite(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
        Some(ref ext) if ext == "vscdb" || ext == "db" || ext == "sqlite" || ext == "sqlite3"
    )
}

/// New content of a JSON identity file
fn plan_json(path: &Path, fields: &[String], new_id: &Uuid) -> Result<String> {
    let content =
        fs::read_to_string(path).internal(|| format!("Failed to read: {}", path.display()))?;

    let json: Value = serde_json::from_str(&content)
        .map_err(|e| EngineError::unsupported(path, format!("invalid JSON: {}", e)))?;
    let object = json
        .as_object()
        .ok_or_else(|| EngineError::unsupported(path, "top-level value is not an object"))?;

    let mut updated = content.clone();
    let mut replaced = 0;

    for field in fields {
        let Some(value) = object.get(field) else {
            continue;
        };
        let old = value
            .as_str()
            .ok_or_else(|| EngineError::unsupported(path, format!("{} is not a string", field)))?;
        let shape = IdShape::detect(old).ok_or_else(|| {
            EngineError::unsupported(path, format!("{} has an unrecognized format", field))
        })?;

        updated = replace_json_value(&updated, field, old, &shape.render(new_id)).ok_or_else(
            || EngineError::unsupported(path, format!("could not locate the value of {}", field)),
        )?;
        replaced += 1;
    }

    if replaced == 0 {
        return Err(EngineError::unsupported(path, "no identity fields present"));
    }
    Ok(updated)
}

/// Replace the value of the top-level member `"key": "old"` in raw JSON
/// text, leaving every other byte unchanged
fn replace_json_value(text: &str, key: &str, old: &str, new: &str) -> Option<String> {
    let key_token = serde_json::to_string(key).ok()?;
    let old_token = serde_json::to_string(old).ok()?;
    let new_token = serde_json::to_string(new).ok()?;

    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            b'"' => {
                let end = string_end(bytes, pos)?;
                if depth == 1 && text[pos..end] == key_token {
                    if let Some(after_colon) = text[end..].trim_start().strip_prefix(':') {
                        let value = after_colon.trim_start();
                        if value.starts_with(&old_token) {
                            let value_start = text.len() - value.len();
                            let mut out = String::with_capacity(text.len() + new_token.len());
                            out.push_str(&text[..value_start]);
                            out.push_str(&new_token);
                            out.push_str(&text[value_start + old_token.len()..]);
                            return Some(out);
                        }
                    }
                }
                pos = end;
                continue;
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

/// Index just past the closing quote of the string starting at `start`
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'"' => return Some(pos + 1),
            _ => pos += 1,
        }
    }
    None
}

/// Replace `path` with `content` via a temp file in the same directory
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::Internal(format!("No parent: {}", path.display())))?;
    let permissions = fs::metadata(path)
        .internal(|| format!("Failed to stat: {}", path.display()))?
        .permissions();

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .internal(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .internal(|| format!("Failed to write: {}", path.display()))?;
    fs::set_permissions(tmp.path(), permissions)
        .internal(|| format!("Failed to set permissions: {}", path.display()))?;
    tmp.persist(path)
        .internal(|| format!("Failed to write: {}", path.display()))?;
    Ok(())
}

/// Key/value updates for an `ItemTable` database
fn plan_sqlite(path: &Path, fields: &[String], new_id: &Uuid) -> Result<Vec<(String, String)>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| EngineError::unsupported(path, format!("cannot open database: {}", e)))?;

    let mut updates = Vec::new();
    for field in fields {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM ItemTable WHERE key = ?1",
                [field],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EngineError::unsupported(path, format!("cannot read {}: {}", field, e)))?;

        let Some(old) = value else {
            continue;
        };
        let shape = IdShape::detect(&old).ok_or_else(|| {
            EngineError::unsupported(path, format!("{} has an unrecognized format", field))
        })?;
        updates.push((field.clone(), shape.render(new_id)));
    }

    if updates.is_empty() {
        return Err(EngineError::unsupported(path, "no identity fields present"));
    }
    Ok(updates)
}

fn apply_sqlite(path: &Path, updates: &[(String, String)]) -> Result<()> {
    let mut conn =
        Connection::open(path).internal(|| format!("Failed to open: {}", path.display()))?;
    let tx = conn
        .transaction()
        .internal(|| format!("Failed to begin transaction: {}", path.display()))?;
    for (key, value) in updates {
        tx.execute(
            "UPDATE ItemTable SET value = ?1 WHERE key = ?2",
            params![value, key],
        )
        .internal(|| format!("Failed to update {} in {}", key, path.display()))?;
    }
    tx.commit()
        .internal(|| format!("Failed to commit: {}", path.display()))?;
    Ok(())
}
