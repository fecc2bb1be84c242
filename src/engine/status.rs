//! Per-application detection report

use serde::Serialize;
use std::path::PathBuf;

use super::archive::{self, TreeFilter};
use super::error::Result;
use super::paths::PathResolver;
use super::process::{ProcessController, ProcessInfo};
use super::store::BackupStore;
use crate::config::ApplicationProfile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub display_name: String,
    /// At least one data root exists
    pub installed: bool,
    /// Existing data roots
    pub data_roots: Vec<PathBuf>,
    /// Total size of the existing data roots
    pub size_bytes: u64,
    pub running: Vec<ProcessInfo>,
    /// Number of backups in the index
    pub backups: usize,
}

impl AppStatus {
    pub(crate) fn collect(
        profile: &ApplicationProfile,
        resolver: &PathResolver<'_>,
        processes: &ProcessController<'_>,
        store: &BackupStore,
    ) -> Result<Self> {
        let data_roots: Vec<PathBuf> = resolver
            .candidates(&profile.name)?
            .into_iter()
            .filter(|path| path.is_dir())
            .collect();

        let size_bytes = data_roots
            .iter()
            .map(|root| archive::dir_size(root, &TreeFilter::all()).unwrap_or(0))
            .sum();

        // A process table we cannot read should not hide the rest of the report
        let running = processes
            .running_processes(&profile.name)
            .unwrap_or_else(|e| {
                tracing::warn!(app = %profile.name, error = %e, "could not list processes");
                Vec::new()
            });

        Ok(Self {
            name: profile.name.clone(),
            display_name: profile.display_name().to_string(),
            installed: !data_roots.is_empty(),
            data_roots,
            size_bytes,
            running,
            backups: store.list_backups(&profile.name)?.count(),
        })
    }
}
