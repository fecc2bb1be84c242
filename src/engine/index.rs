//! Session index: the persisted list of backups
//!
//! Stored as `<backup_root>/index.json`. The file is replaced atomically
//! (temp file + rename) on every write, so readers see either the previous
//! or the next version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::{EngineError, InternalContext, Result};

/// Current on-disk index version
pub const INDEX_VERSION: u32 = 1;

/// Lifecycle of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Archive written and hashed
    Complete,
    /// Still being built; never persisted
    Partial,
    /// Archive missing, unreadable or hash mismatch
    Corrupt,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
            Self::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// How an archive is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Plain copy of the data tree
    Directory,
    /// Gzip-compressed tarball
    TarGz,
}

/// One archived copy of a data root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// `<app>_<label>_<YYYYMMDD_HHMMSS_micros>`
    pub id: String,
    pub application_name: String,
    /// User-supplied label
    pub label: String,
    /// Data root the archive was taken from (and restores to)
    pub source_path: PathBuf,
    /// Archive location relative to the backup root
    pub archive_path: PathBuf,
    pub format: ArchiveFormat,
    pub created_at: DateTime<Utc>,
    /// Bytes of archived file content
    pub size_bytes: u64,
    pub file_count: u64,
    /// SHA-256 hex: of the tree for directories, of the file for .tar.gz
    pub integrity_hash: String,
    pub status: BackupStatus,
}

/// Ordered list of backup records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIndex {
    pub version: u32,
    pub records: Vec<BackupRecord>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            records: Vec::new(),
        }
    }
}

impl SessionIndex {
    /// Read the index; a missing file is an empty index
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(path).internal(|| format!("Failed to read: {}", path.display()))?;
        let index: Self = serde_json::from_str(&content)
            .internal(|| format!("Failed to parse: {}", path.display()))?;

        if index.version > INDEX_VERSION {
            return Err(EngineError::Internal(format!(
                "Index version {} is newer than supported version {}",
                index.version, INDEX_VERSION
            )));
        }
        Ok(index)
    }

    /// Replace the index file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| EngineError::Internal(format!("No parent: {}", path.display())))?;
        fs::create_dir_all(parent)
            .internal(|| format!("Failed to create: {}", parent.display()))?;

        let content = serde_json::to_string_pretty(self).internal(|| "Failed to encode index")?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .internal(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .internal(|| "Failed to write index")?;
        tmp.persist(path)
            .internal(|| format!("Failed to write: {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, record: BackupRecord) {
        self.records.push(record);
    }

    pub fn remove(&mut self, id: &str) -> Option<BackupRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    /// Flag a record as corrupt; returns whether its status changed
    pub fn mark_corrupt(&mut self, id: &str) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.status != BackupStatus::Corrupt => {
                record.status = BackupStatus::Corrupt;
                true
            }
            _ => false,
        }
    }

    /// Records of one application, newest first
    pub fn records_for(&self, app: &str) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self
            .records
            .iter()
            .filter(|r| r.application_name.eq_ignore_ascii_case(app))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}
