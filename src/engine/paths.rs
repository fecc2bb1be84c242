//! Path resolution: application name -> existing data roots

use std::fs;
use std::path::{Path, PathBuf};

use super::error::{EngineError, Result};
use crate::config::{expand_template, ApplicationProfile, EngineConfig, PathProvider};

/// Maps application names to their data roots
pub struct PathResolver<'a> {
    config: &'a EngineConfig,
    paths: &'a dyn PathProvider,
}

impl<'a> PathResolver<'a> {
    pub fn new(config: &'a EngineConfig, paths: &'a dyn PathProvider) -> Self {
        Self { config, paths }
    }

    /// Profile for `app`, or `NotFound` for names outside the profile table
    pub fn profile(&self, app: &str) -> Result<&'a ApplicationProfile> {
        self.config
            .profile(app)
            .ok_or_else(|| EngineError::not_found(app, "unknown application"))
    }

    /// All expandable candidates in priority order, existing or not
    pub fn candidates(&self, app: &str) -> Result<Vec<PathBuf>> {
        let profile = self.profile(app)?;
        let mut out: Vec<PathBuf> = Vec::with_capacity(profile.data_roots.len());

        for template in &profile.data_roots {
            match expand_template(template, self.paths) {
                Some(path) if !out.contains(&path) => out.push(path),
                Some(_) => {}
                None => tracing::debug!(app, template, "data root template not expandable"),
            }
        }
        Ok(out)
    }

    /// Existing data roots in priority order
    ///
    /// Fails with `NotFound` when none exists; that usually means the
    /// application was never run on this account.
    pub fn resolve(&self, app: &str) -> Result<Vec<PathBuf>> {
        let roots: Vec<PathBuf> = self
            .candidates(app)?
            .into_iter()
            .filter(|path| path.exists())
            .collect();

        if roots.is_empty() {
            return Err(EngineError::not_found(app, "no data directory exists"));
        }
        Ok(roots)
    }

    /// Refuse roots that are, contain, or sit inside `backup_root`
    pub fn ensure_outside(&self, roots: &[PathBuf], backup_root: &Path) -> Result<()> {
        let backup_root = normalize(backup_root);
        for root in roots {
            let real = normalize(root);
            if real.starts_with(&backup_root) || backup_root.starts_with(&real) {
                return Err(EngineError::unsafe_path(
                    root,
                    format!("overlaps the backup root {}", backup_root.display()),
                ));
            }
        }
        Ok(())
    }

    /// Refuse roots the engine may not remove or replace: anything
    /// overlapping `backup_root`, and the user's home, documents, desktop or
    /// downloads directory or one of their ancestors
    pub fn ensure_replaceable(&self, roots: &[PathBuf], backup_root: &Path) -> Result<()> {
        self.ensure_outside(roots, backup_root)?;

        let protected: Vec<PathBuf> = [
            self.paths.home_dir(),
            self.paths.documents_dir(),
            self.paths.desktop_dir(),
            self.paths.download_dir(),
        ]
        .into_iter()
        .flatten()
        .map(|dir| normalize(&dir))
        .collect();

        for root in roots {
            let real = normalize(root);
            if let Some(dir) = protected.iter().find(|dir| dir.starts_with(&real)) {
                return Err(EngineError::unsafe_path(
                    root,
                    format!("is or contains {}", dir.display()),
                ));
            }
        }
        Ok(())
    }
}

/// `path` with symlinks resolved as far as it exists
fn normalize(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(real) = fs::canonicalize(current) {
            return missing.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
