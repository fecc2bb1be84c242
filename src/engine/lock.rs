//! Per-application operation locks
//!
//! At most one operation per application is in flight: threads of this
//! process queue on an in-memory mutex, other processes on an advisory lock
//! file under `<backup_root>/locks/`.

use fs2::FileExt;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{InternalContext, Result};
use super::slug::slugify;

/// Registry of per-application locks
pub struct AppLocks {
    dir: PathBuf,
    local: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one operation
pub struct AppLockGuard {
    file: File,
    _local: ArcMutexGuard<RawMutex, ()>,
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl AppLocks {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Block until `app` is free, then hold it until the guard drops
    pub fn acquire(&self, app: &str) -> Result<AppLockGuard> {
        let key = slugify(&app.to_lowercase(), "app");
        let slot = self.local.lock().entry(key.clone()).or_default().clone();
        let local = slot.lock_arc();

        fs::create_dir_all(&self.dir)
            .internal(|| format!("Failed to create: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.lock", key));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .internal(|| format!("Failed to open: {}", path.display()))?;
        FileExt::lock_exclusive(&file).internal(|| format!("Failed to lock: {}", path.display()))?;

        tracing::debug!(app, "acquired operation lock");
        Ok(AppLockGuard {
            file,
            _local: local,
        })
    }
}
