//! Backup store: archives plus the session index
//!
//! Layout under the backup root:
//! - `index.json` / `index.lock`: the session index and its writer lock
//! - `<app>/<record id>` or `<app>/<record id>.tar.gz`: one archive per record
//!
//! Archives are built under a `.staging-*` name and renamed into place only
//! after copying and hashing succeeded; the index entry is written last.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::archive::{self, TreeFilter};
use super::error::{EngineError, InternalContext, Result};
use super::index::{ArchiveFormat, BackupRecord, BackupStatus, SessionIndex};
use super::orchestrator::{OperationKind, OperationResult};
use super::slug::slugify;

/// Owner of the session index and the archive files
pub struct BackupStore {
    root: PathBuf,
    compress: bool,
    free_space_factor: f64,
    writer: Mutex<()>,
    remove: fn(&Path) -> io::Result<()>,
    save: fn(&SessionIndex, &Path) -> Result<()>,
}

/// Exclusive (or shared) hold on the index, in-process and across processes
struct IndexLock<'a> {
    _guard: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for IndexLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Record id for `(app, label, created_at)`
pub fn record_id(app: &str, label: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        slugify(app, "app"),
        slugify(label, "backup"),
        created_at.format("%Y%m%d_%H%M%S_%6f")
    )
}

impl BackupStore {
    /// Open a store rooted at `root`; the directory is created by the first
    /// write
    pub fn open(root: &Path, compress: bool, free_space_factor: f64) -> Result<Self> {
        if root.exists() && !root.is_dir() {
            return Err(EngineError::Internal(format!(
                "Backup root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            compress,
            free_space_factor,
            writer: Mutex::new(()),
            remove: archive::remove_path,
            save: SessionIndex::save,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_remover(mut self, remove: fn(&Path) -> io::Result<()>) -> Self {
        self.remove = remove;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_index_writer(mut self, save: fn(&SessionIndex, &Path) -> Result<()>) -> Self {
        self.save = save;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Absolute location of a record's archive
    pub fn archive_path(&self, record: &BackupRecord) -> PathBuf {
        self.root.join(&record.archive_path)
    }

    fn lock_index(&self, exclusive: bool) -> Result<IndexLock<'_>> {
        let guard = self.writer.lock();
        fs::create_dir_all(&self.root)
            .internal(|| format!("Failed to create: {}", self.root.display()))?;
        let path = self.root.join("index.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .internal(|| format!("Failed to open: {}", path.display()))?;

        if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        }
        .internal(|| format!("Failed to lock: {}", path.display()))?;

        Ok(IndexLock {
            _guard: guard,
            file,
        })
    }

    /// Snapshot of the index
    pub fn load_index(&self) -> Result<SessionIndex> {
        if !self.root.exists() {
            return Ok(SessionIndex::default());
        }
        let _lock = self.lock_index(false)?;
        SessionIndex::load(&self.index_path())
    }

    pub fn get(&self, record_id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.load_index()?.get(record_id).cloned())
    }

    /// Backups of `app`, newest first
    pub fn list_backups(&self, app: &str) -> Result<impl Iterator<Item = BackupRecord>> {
        Ok(self.load_index()?.records_for(app).into_iter())
    }

    /// Refuse to start a copy the disk cannot hold
    fn ensure_space(&self, source_size: u64) -> Result<()> {
        let required = (source_size as f64 * self.free_space_factor).ceil() as u64;
        // The root may not exist yet; its nearest existing ancestor is on the
        // same filesystem
        let probe = self
            .root
            .ancestors()
            .find(|dir| dir.exists())
            .unwrap_or(self.root.as_path());
        let available = fs2::available_space(probe)
            .internal(|| format!("Cannot get disk space for {}", self.root.display()))?;
        if available < required {
            return Err(EngineError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Archive all of `source` as a new `complete` record
    pub fn create_backup(&self, app: &str, source: &Path, label: &str) -> Result<BackupRecord> {
        self.create_filtered_backup(app, source, label, &TreeFilter::all())
    }

    /// Archive the entries of `source` selected by `filter` as a new
    /// `complete` record
    ///
    /// Nothing is added to the index unless the archive was fully written and
    /// hashed; a failed attempt leaves no files behind.
    pub fn create_filtered_backup(
        &self,
        app: &str,
        source: &Path,
        label: &str,
        filter: &TreeFilter,
    ) -> Result<BackupRecord> {
        if !source.is_dir() {
            return Err(EngineError::not_found(
                app,
                format!("source does not exist: {}", source.display()),
            ));
        }

        let source_size = archive::dir_size(source, filter)?;
        self.ensure_space(source_size)?;

        let app_dir_name = slugify(app, "app");
        let app_dir = self.root.join(&app_dir_name);
        fs::create_dir_all(&app_dir)
            .internal(|| format!("Failed to create: {}", app_dir.display()))?;

        let format = if self.compress {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Directory
        };
        let created_at = Utc::now().trunc_subsecs(6);

        let mut record = BackupRecord {
            id: record_id(app, label, created_at),
            application_name: app.to_string(),
            label: label.to_string(),
            source_path: source.to_path_buf(),
            archive_path: PathBuf::new(),
            format,
            created_at,
            size_bytes: 0,
            file_count: 0,
            integrity_hash: String::new(),
            status: BackupStatus::Partial,
        };

        tracing::info!(app, source = %source.display(), "creating backup");
        let staging = app_dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
        if let Err(e) = self.build_archive(source, &staging, filter, &mut record) {
            discard(&staging);
            return Err(e);
        }

        let _lock = match self.lock_index(true) {
            Ok(lock) => lock,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };
        let mut index = match SessionIndex::load(&self.index_path()) {
            Ok(index) => index,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        // Same label within the same microsecond: move the timestamp forward
        // rather than overwrite
        let file_name = |id: &str| match format {
            ArchiveFormat::Directory => id.to_string(),
            ArchiveFormat::TarGz => format!("{}.tar.gz", id),
        };
        while index.contains(&record.id) || app_dir.join(file_name(&record.id)).exists() {
            record.created_at += TimeDelta::microseconds(1);
            record.id = record_id(app, label, record.created_at);
        }

        let final_path = app_dir.join(file_name(&record.id));
        if let Err(e) = fs::rename(&staging, &final_path) {
            discard(&staging);
            return Err(EngineError::Internal(format!(
                "Failed to move archive into place at {}: {}",
                final_path.display(),
                e
            )));
        }

        record.archive_path = PathBuf::from(&app_dir_name).join(file_name(&record.id));
        record.status = BackupStatus::Complete;
        index.insert(record.clone());
        if let Err(e) = (self.save)(&index, &self.index_path()) {
            discard(&final_path);
            return Err(e);
        }

        tracing::info!(app, record_id = %record.id, size = record.size_bytes, "backup complete");
        Ok(record)
    }

    fn build_archive(
        &self,
        source: &Path,
        staging: &Path,
        filter: &TreeFilter,
        record: &mut BackupRecord,
    ) -> Result<()> {
        match record.format {
            ArchiveFormat::Directory => {
                archive::copy_dir(source, staging, filter)?;
                let (hash, stats) = archive::hash_tree(staging, &TreeFilter::all())?;
                record.integrity_hash = hash;
                record.size_bytes = stats.size_bytes;
                record.file_count = stats.file_count;
            }
            ArchiveFormat::TarGz => {
                archive::write_tar_gz(source, staging, filter)?;
                let (_, stats) = archive::hash_tree(source, filter)?;
                record.integrity_hash = archive::hash_file(staging)?;
                record.size_bytes = stats.size_bytes;
                record.file_count = stats.file_count;
            }
        }
        Ok(())
    }

    /// Hash of the archive as it is on disk now
    pub fn current_hash(&self, record: &BackupRecord) -> Result<String> {
        let path = self.archive_path(record);
        match record.format {
            ArchiveFormat::Directory => {
                archive::hash_tree(&path, &TreeFilter::all()).map(|(hash, _)| hash)
            }
            ArchiveFormat::TarGz => archive::hash_file(&path),
        }
    }

    /// Check a record against its archive, flagging it corrupt on mismatch
    pub fn verify_record(&self, record: &BackupRecord) -> Result<()> {
        let actual = self
            .current_hash(record)
            .unwrap_or_else(|e| format!("unreadable ({})", e));

        if actual == record.integrity_hash {
            return Ok(());
        }

        tracing::warn!(record_id = %record.id, "backup failed integrity check");
        self.mark_corrupt(&record.id)?;
        Err(EngineError::Integrity {
            record_id: record.id.clone(),
            expected: record.integrity_hash.clone(),
            actual,
        })
    }

    fn mark_corrupt(&self, record_id: &str) -> Result<()> {
        let _lock = self.lock_index(true)?;
        let mut index = SessionIndex::load(&self.index_path())?;
        if index.mark_corrupt(record_id) {
            (self.save)(&index, &self.index_path())?;
        }
        Ok(())
    }

    /// Re-hash every backup of `app`; returns the records with current status
    pub fn verify(&self, app: &str) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self.list_backups(app)?.collect();
        for record in &mut records {
            match self.verify_record(record) {
                Ok(()) => {}
                Err(EngineError::Integrity { .. }) => record.status = BackupStatus::Corrupt,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Restore a record into `destination`
    ///
    /// The archive is verified first; on mismatch the destination is not
    /// touched. The new tree is materialized next to the destination and
    /// swapped in by rename, so an interruption leaves either the old or the
    /// new tree in place.
    pub fn restore_backup(&self, record_id: &str, destination: &Path) -> OperationResult {
        let mut result = OperationResult::new(OperationKind::Restore, "");
        match self.try_restore(record_id, destination, &mut result) {
            Ok(()) => result.succeeded = true,
            Err(e) => result.error = Some(e),
        }
        result
    }

    fn try_restore(
        &self,
        record_id: &str,
        destination: &Path,
        result: &mut OperationResult,
    ) -> Result<()> {
        let record = self
            .get(record_id)?
            .ok_or_else(|| EngineError::not_found("", format!("no backup {}", record_id)))?;
        result.application_name = record.application_name.clone();
        result.backup_id = Some(record.id.clone());

        self.verify_record(&record)?;

        tracing::info!(record_id, destination = %destination.display(), "restoring backup");
        swap_into(destination, |staging| match record.format {
            ArchiveFormat::Directory => {
                archive::copy_dir(&self.archive_path(&record), staging, &TreeFilter::all())
            }
            ArchiveFormat::TarGz => archive::extract_tar_gz(&self.archive_path(&record), staging),
        })?;

        result.affected_paths.push(destination.to_path_buf());
        Ok(())
    }

    /// Remove the archive and its index entry together
    ///
    /// If the archive cannot be removed the entry stays, flagged corrupt.
    pub fn delete_backup(&self, record_id: &str) -> Result<()> {
        let _lock = self.lock_index(true)?;
        let mut index = SessionIndex::load(&self.index_path())?;
        let record = index
            .get(record_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("", format!("no backup {}", record_id)))?;

        let path = self.archive_path(&record);
        let removal = if fs::symlink_metadata(&path).is_ok() {
            (self.remove)(&path)
        } else {
            Ok(())
        };

        match removal {
            Ok(()) => {
                index.remove(record_id);
                (self.save)(&index, &self.index_path())?;
                tracing::info!(record_id, "backup deleted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(record_id, error = %e, "failed to remove archive, flagging corrupt");
                index.mark_corrupt(record_id);
                (self.save)(&index, &self.index_path())?;
                Err(EngineError::Internal(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

/// Best-effort removal of a half-built archive
fn discard(path: &Path) {
    if fs::symlink_metadata(path).is_ok() {
        if let Err(e) = archive::remove_path(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial archive");
        }
    }
}

/// Replace `destination` with a tree produced by `fill`
fn swap_into<F>(destination: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let parent = destination.parent().ok_or_else(|| {
        EngineError::Internal(format!("No parent: {}", destination.display()))
    })?;
    let name = destination
        .file_name()
        .ok_or_else(|| EngineError::Internal(format!("No file name: {}", destination.display())))?
        .to_string_lossy()
        .into_owned();
    fs::create_dir_all(parent).internal(|| format!("Failed to create: {}", parent.display()))?;

    let tag = Uuid::new_v4().simple().to_string();
    let staging = parent.join(format!(".{}.restore-{}", name, tag));
    if let Err(e) = fill(&staging) {
        discard(&staging);
        return Err(e);
    }

    if fs::symlink_metadata(destination).is_err() {
        return fs::rename(&staging, destination).map_err(|e| {
            discard(&staging);
            EngineError::Internal(format!("Failed to move into {}: {}", destination.display(), e))
        });
    }

    let aside = parent.join(format!(".{}.old-{}", name, tag));
    if let Err(e) = fs::rename(destination, &aside) {
        discard(&staging);
        return Err(EngineError::Internal(format!(
            "Failed to move aside {}: {}",
            destination.display(),
            e
        )));
    }

    if let Err(e) = fs::rename(&staging, destination) {
        if let Err(undo) = fs::rename(&aside, destination) {
            tracing::error!(
                aside = %aside.display(),
                error = %undo,
                "failed to put original data back"
            );
        }
        discard(&staging);
        return Err(EngineError::Internal(format!(
            "Failed to move into {}: {}",
            destination.display(),
            e
        )));
    }

    discard(&aside);
    Ok(())
}
