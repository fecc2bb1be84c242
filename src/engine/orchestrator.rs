//! Reset orchestrator
//!
//! Every operation runs as a small state machine:
//! `Idle -> Detecting -> (BackingUp) -> Wiping -> (Regenerating) -> Done | Failed`
//! (restores go through `Restoring` instead of `Wiping`). Operations on the
//! same application are serialized by [`AppLocks`]; each one ends with an
//! [`OperationResult`], including when a step panics.

use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::archive::{self, TreeFilter};
use super::error::{EngineError, InternalContext, Result};
use super::identity;
use super::index::BackupRecord;
use super::lock::AppLocks;
use super::paths::PathResolver;
use super::process::{ProcessController, ProcessTable, TerminationResult};
use super::status::AppStatus;
use super::store::BackupStore;
use crate::config::{ApplicationProfile, EngineConfig, PathProvider};

/// Label of the safety backup taken by `reset`
pub const RESET_BACKUP_LABEL: &str = "pre-reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Reset,
    Backup,
    Restore,
    RegenerateId,
    DeleteBackup,
    VerifyBackups,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::RegenerateId => "regenerate-id",
            Self::DeleteBackup => "delete",
            Self::VerifyBackups => "verify",
        };
        f.write_str(name)
    }
}

/// Terminal report of one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub operation_kind: OperationKind,
    pub application_name: String,
    pub succeeded: bool,
    /// First (or only) backup record involved
    pub backup_id: Option<String>,
    /// Every backup record created or checked by the operation
    pub backup_ids: Vec<String>,
    /// Identifier written by identity regeneration
    pub new_identity: Option<String>,
    pub error: Option<EngineError>,
    pub affected_paths: Vec<PathBuf>,
    /// Paths a best-effort step could not process
    pub failed_paths: Vec<PathBuf>,
}

impl OperationResult {
    pub fn new(operation_kind: OperationKind, application_name: &str) -> Self {
        Self {
            operation_kind,
            application_name: application_name.to_string(),
            succeeded: false,
            backup_id: None,
            backup_ids: Vec::new(),
            new_identity: None,
            error: None,
            affected_paths: Vec::new(),
            failed_paths: Vec::new(),
        }
    }
}

/// Steps reported to a [`ProgressObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Detecting,
    BackingUp,
    Wiping,
    Regenerating,
    Restoring,
    Done,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::BackingUp => "backing up",
            Self::Wiping => "wiping",
            Self::Regenerating => "regenerating",
            Self::Restoring => "restoring",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives state transitions; called on the thread running the operation
pub trait ProgressObserver: Send + Sync {
    fn on_state(&self, app: &str, kind: OperationKind, state: OperationState);
}

impl<F> ProgressObserver for F
where
    F: Fn(&str, OperationKind, OperationState) + Send + Sync,
{
    fn on_state(&self, app: &str, kind: OperationKind, state: OperationState) {
        self(app, kind, state)
    }
}

/// Cooperative cancellation, honored only between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options of [`Engine::reset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOptions {
    /// Take a safety backup of every data root before wiping
    pub make_backup: bool,
    /// Terminate running instances instead of refusing
    pub force_kill: bool,
    /// Write fresh device identifiers after the wipe
    pub regenerate_identity: bool,
}

impl Default for ResetOptions {
    fn default() -> Self {
        Self {
            make_backup: true,
            force_kill: false,
            regenerate_identity: false,
        }
    }
}

/// Entry point for every session operation
pub struct Engine<'a> {
    config: &'a EngineConfig,
    resolver: PathResolver<'a>,
    processes: ProcessController<'a>,
    store: BackupStore,
    locks: AppLocks,
    observer: Option<Box<dyn ProgressObserver + 'a>>,
    cancel: CancelToken,
    wipe: fn(&Path) -> io::Result<()>,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a EngineConfig,
        paths: &'a dyn PathProvider,
        processes: &'a dyn ProcessTable,
    ) -> Result<Self> {
        let root = config
            .backup_root(paths)
            .map_err(|e| EngineError::Internal(format!("{:#}", e)))?;
        config
            .validate_paths(paths)
            .map_err(|e| EngineError::unsafe_path(&root, format!("{:#}", e)))?;
        let store = BackupStore::open(&root, config.compress_backups, config.free_space_factor)?;
        let locks = AppLocks::new(&root.join("locks"));

        Ok(Self {
            config,
            resolver: PathResolver::new(config, paths),
            processes: ProcessController::new(config, processes),
            store,
            locks,
            observer: None,
            cancel: CancelToken::new(),
            wipe: archive::remove_path,
        })
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_wipe(mut self, wipe: fn(&Path) -> io::Result<()>) -> Self {
        self.wipe = wipe;
        self
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Back up, wipe and optionally re-identify an application
    pub fn reset(&self, app: &str, options: ResetOptions) -> OperationResult {
        self.run(OperationKind::Reset, app, |profile, result| {
            self.enter(profile, OperationKind::Reset, OperationState::Detecting);
            let roots = self.resolver.resolve(&profile.name)?;
            self.resolver.ensure_replaceable(&roots, self.store.root())?;
            if options.regenerate_identity && profile.identity_file_patterns.is_empty() {
                return Err(EngineError::not_found(
                    &profile.name,
                    "no identity files configured",
                ));
            }
            self.ensure_stopped(profile, options.force_kill)?;

            if options.make_backup {
                self.checkpoint(OperationState::BackingUp)?;
                self.enter(profile, OperationKind::Reset, OperationState::BackingUp);
                self.backup_roots(profile, &roots, RESET_BACKUP_LABEL, result)?;
            } else {
                tracing::warn!(app = %profile.name, "reset without backup");
            }

            self.checkpoint(OperationState::Wiping)?;
            self.enter(profile, OperationKind::Reset, OperationState::Wiping);
            self.wipe_roots(profile, &roots, result)?;

            if options.regenerate_identity {
                self.checkpoint(OperationState::Regenerating)?;
                self.enter(profile, OperationKind::Reset, OperationState::Regenerating);
                write_default_files(profile, &roots[0])?;
                self.regenerate(profile, &roots, result)?;
            }
            Ok(())
        })
    }

    /// Archive every data root of an application
    pub fn backup(&self, app: &str, label: &str) -> OperationResult {
        self.run(OperationKind::Backup, app, |profile, result| {
            self.enter(profile, OperationKind::Backup, OperationState::Detecting);
            let roots = self.resolver.resolve(&profile.name)?;
            self.resolver.ensure_outside(&roots, self.store.root())?;
            match self.processes.is_running(&profile.name) {
                Ok(true) => {
                    tracing::warn!(app = %profile.name, "backing up while the application runs")
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(app = %profile.name, error = %e, "process check failed"),
            }

            self.checkpoint(OperationState::BackingUp)?;
            self.enter(profile, OperationKind::Backup, OperationState::BackingUp);
            self.backup_roots(profile, &roots, label, result)
        })
    }

    /// Put a backup back where it was taken from
    pub fn restore(&self, app: &str, record_id: &str) -> OperationResult {
        self.run(OperationKind::Restore, app, |profile, result| {
            self.enter(profile, OperationKind::Restore, OperationState::Detecting);
            let record = self.owned_record(profile, record_id)?;
            result.backup_id = Some(record.id.clone());
            self.resolver
                .ensure_replaceable(std::slice::from_ref(&record.source_path), self.store.root())?;
            self.ensure_stopped(profile, false)?;

            self.checkpoint(OperationState::Restoring)?;
            self.enter(profile, OperationKind::Restore, OperationState::Restoring);
            let restored = self.store.restore_backup(&record.id, &record.source_path);
            result.affected_paths.extend(restored.affected_paths);
            match restored.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Replace the device identifiers of an application
    pub fn regenerate_id(&self, app: &str) -> OperationResult {
        self.run(OperationKind::RegenerateId, app, |profile, result| {
            self.enter(profile, OperationKind::RegenerateId, OperationState::Detecting);
            let roots = self.resolver.resolve(&profile.name)?;
            self.ensure_stopped(profile, false)?;

            self.checkpoint(OperationState::Regenerating)?;
            self.enter(profile, OperationKind::RegenerateId, OperationState::Regenerating);
            self.regenerate(profile, &roots, result)
        })
    }

    pub fn delete_backup(&self, app: &str, record_id: &str) -> OperationResult {
        self.run(OperationKind::DeleteBackup, app, |profile, result| {
            self.enter(profile, OperationKind::DeleteBackup, OperationState::Detecting);
            let record = self.owned_record(profile, record_id)?;
            result.backup_id = Some(record.id.clone());
            self.store.delete_backup(&record.id)?;
            result.affected_paths.push(self.store.archive_path(&record));
            Ok(())
        })
    }

    /// Re-hash every backup of an application; corrupt ones end up in
    /// `failed_paths` and the first mismatch is reported as the error
    pub fn verify_backups(&self, app: &str) -> OperationResult {
        self.run(OperationKind::VerifyBackups, app, |profile, result| {
            self.enter(profile, OperationKind::VerifyBackups, OperationState::Detecting);
            let mut first_error = None;

            for record in self.store.list_backups(&profile.name)? {
                result.backup_ids.push(record.id.clone());
                match self.store.verify_record(&record) {
                    Ok(()) => {}
                    Err(e @ EngineError::Integrity { .. }) => {
                        result.failed_paths.push(self.store.archive_path(&record));
                        first_error.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            result.backup_id = result.backup_ids.first().cloned();

            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Backups of an application, newest first
    pub fn list_backups(&self, app: &str) -> Result<Vec<BackupRecord>> {
        let profile = self.resolver.profile(app)?;
        Ok(self.store.list_backups(&profile.name)?.collect())
    }

    pub fn status(&self, app: &str) -> Result<AppStatus> {
        let profile = self.resolver.profile(app)?;
        AppStatus::collect(profile, &self.resolver, &self.processes, &self.store)
    }

    /// Status of every configured application
    pub fn status_all(&self) -> Result<Vec<AppStatus>> {
        self.config
            .applications
            .iter()
            .map(|profile| AppStatus::collect(profile, &self.resolver, &self.processes, &self.store))
            .collect()
    }

    /// Lock the application, run `op` and turn whatever happens into a
    /// terminal result
    fn run<F>(&self, kind: OperationKind, app: &str, op: F) -> OperationResult
    where
        F: FnOnce(&'a ApplicationProfile, &mut OperationResult) -> Result<()>,
    {
        let profile = match self.resolver.profile(app) {
            Ok(profile) => profile,
            Err(e) => {
                let mut result = OperationResult::new(kind, app);
                tracing::warn!(app, %kind, error = %e, "operation rejected");
                result.error = Some(e);
                return result;
            }
        };

        let mut result = OperationResult::new(kind, &profile.name);
        let _guard = match self.locks.acquire(&profile.name) {
            Ok(guard) => guard,
            Err(e) => {
                result.error = Some(e);
                self.enter(profile, kind, OperationState::Failed);
                return result;
            }
        };

        tracing::info!(app = %profile.name, %kind, "operation started");
        let outcome = self.checkpoint(OperationState::Detecting).and_then(|()| {
            panic::catch_unwind(AssertUnwindSafe(|| op(profile, &mut result)))
                .unwrap_or_else(|payload| Err(EngineError::Internal(panic_message(payload))))
        });

        match outcome {
            Ok(()) => {
                result.succeeded = true;
                tracing::info!(app = %profile.name, %kind, "operation finished");
                self.enter(profile, kind, OperationState::Done);
            }
            Err(e) => {
                tracing::warn!(app = %profile.name, %kind, error = %e, "operation failed");
                result.succeeded = false;
                result.error = Some(e);
                self.enter(profile, kind, OperationState::Failed);
            }
        }
        result
    }

    fn enter(&self, profile: &ApplicationProfile, kind: OperationKind, state: OperationState) {
        tracing::debug!(app = %profile.name, %kind, %state, "state change");
        if let Some(observer) = &self.observer {
            observer.on_state(&profile.name, kind, state);
        }
    }

    fn checkpoint(&self, next: OperationState) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                step: next.to_string(),
            });
        }
        Ok(())
    }

    /// Refuse while the application runs, unless asked to stop it
    fn ensure_stopped(&self, profile: &ApplicationProfile, force: bool) -> Result<()> {
        let running = self.processes.running_processes(&profile.name)?;
        if running.is_empty() {
            return Ok(());
        }
        if !force {
            return Err(EngineError::ProcessRunning {
                app: profile.name.clone(),
                pids: running.iter().map(|p| p.pid).collect(),
            });
        }

        match self
            .processes
            .terminate(&profile.name, self.config.terminate_timeout())?
        {
            TerminationResult::Failed => {
                let survivors = self
                    .processes
                    .running_processes(&profile.name)
                    .unwrap_or(running);
                Err(EngineError::ProcessRunning {
                    app: profile.name.clone(),
                    pids: survivors.iter().map(|p| p.pid).collect(),
                })
            }
            outcome => {
                tracing::info!(app = %profile.name, ?outcome, "application stopped");
                Ok(())
            }
        }
    }

    /// One record per root; the first failure stops the operation
    fn backup_roots(
        &self,
        profile: &ApplicationProfile,
        roots: &[PathBuf],
        label: &str,
        result: &mut OperationResult,
    ) -> Result<()> {
        let filter = TreeFilter::new(&profile.backup_items, &profile.backup_excludes)?;
        for root in roots {
            let record = self
                .store
                .create_filtered_backup(&profile.name, root, label, &filter)?;
            result.backup_id.get_or_insert_with(|| record.id.clone());
            result.backup_ids.push(record.id);
        }
        Ok(())
    }

    /// Remove every root, carrying on past failures
    fn wipe_roots(
        &self,
        profile: &ApplicationProfile,
        roots: &[PathBuf],
        result: &mut OperationResult,
    ) -> Result<()> {
        for root in roots {
            match (self.wipe)(root) {
                Ok(()) => {
                    tracing::info!(app = %profile.name, path = %root.display(), "data removed");
                    result.affected_paths.push(root.clone());
                }
                Err(e) => {
                    tracing::warn!(app = %profile.name, path = %root.display(), error = %e, "failed to remove data");
                    result.failed_paths.push(root.clone());
                }
            }
        }

        if !result.failed_paths.is_empty() {
            return Err(EngineError::Internal(format!(
                "could not remove {} of {} data path(s)",
                result.failed_paths.len(),
                roots.len()
            )));
        }

        if profile.recreate_roots {
            for root in roots {
                fs::create_dir_all(root)
                    .internal(|| format!("Failed to recreate: {}", root.display()))?;
            }
        }
        Ok(())
    }

    fn regenerate(
        &self,
        profile: &ApplicationProfile,
        roots: &[PathBuf],
        result: &mut OperationResult,
    ) -> Result<()> {
        let update = identity::regenerate(profile, roots)?;
        result.new_identity = Some(update.new_id);
        result.affected_paths.extend(update.files);
        Ok(())
    }

    /// A record of this application, or `NotFound`
    fn owned_record(&self, profile: &ApplicationProfile, record_id: &str) -> Result<BackupRecord> {
        match self.store.get(record_id)? {
            Some(record) if record.application_name.eq_ignore_ascii_case(&profile.name) => {
                Ok(record)
            }
            Some(record) => Err(EngineError::not_found(
                &profile.name,
                format!(
                    "backup {} belongs to {}",
                    record_id, record.application_name
                ),
            )),
            None => Err(EngineError::not_found(
                &profile.name,
                format!("no backup {}", record_id),
            )),
        }
    }
}

/// Recreate the files an application expects before its identity can be
/// rewritten; existing files are kept
fn write_default_files(profile: &ApplicationProfile, root: &Path) -> Result<()> {
    for file in &profile.default_files {
        let path = root.join(&file.path);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .internal(|| format!("Failed to create: {}", parent.display()))?;
        }
        fs::write(&path, &file.contents)
            .internal(|| format!("Failed to write: {}", path.display()))?;
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("operation panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationProfile, FakePaths, DEFAULT_IDENTITY_FIELDS};
    use crate::engine::index::BackupStatus;
    use crate::engine::process::fake::FakeProcessTable;
    use parking_lot::Mutex;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: EngineConfig,
        paths: FakePaths,
        table: FakeProcessTable,
    }

    impl Fixture {
        fn new(table: FakeProcessTable) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cursor = EngineConfig::default().profile("cursor").unwrap().clone();
            let config = EngineConfig {
                backup_root: "{documents}/Backups".to_string(),
                terminate_timeout_secs: 0,
                applications: vec![ApplicationProfile {
                    name: "AppX".to_string(),
                    display_name: None,
                    data_roots: vec!["{config}/AppX".to_string()],
                    identity_file_patterns: cursor.identity_file_patterns.clone(),
                    identity_fields: DEFAULT_IDENTITY_FIELDS
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    process_names: vec!["appx".to_string()],
                    default_files: cursor.default_files.clone(),
                    recreate_roots: true,
                    backup_items: Vec::new(),
                    backup_excludes: cursor.backup_excludes.clone(),
                }],
                ..EngineConfig::default()
            };
            let paths = FakePaths::new(dir.path());
            Self {
                _dir: dir,
                config,
                paths,
                table,
            }
        }

        fn engine(&self) -> Engine<'_> {
            Engine::new(&self.config, &self.paths, &self.table).unwrap()
        }

        fn data(&self) -> PathBuf {
            self.paths.root.join("config").join("AppX")
        }

        fn seed(&self) -> PathBuf {
            let data = self.data();
            fs::create_dir_all(data.join("User")).unwrap();
            fs::write(data.join("a.txt"), "hello").unwrap();
            data
        }

        fn backup_root(&self) -> PathBuf {
            self.paths.root.join("documents").join("Backups")
        }
    }

    fn entries(path: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(path)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_backup_delete_restore_end_to_end() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        let data = fx.seed();

        let backup = engine.backup("AppX", "pre-update");
        assert!(backup.succeeded, "{:?}", backup.error);
        let id = backup.backup_id.clone().unwrap();
        assert!(id.starts_with("AppX_pre-update_"));

        fs::remove_dir_all(&data).unwrap();
        let restore = engine.restore("AppX", &id);
        assert!(restore.succeeded, "{:?}", restore.error);
        assert_eq!(fs::read_to_string(data.join("a.txt")).unwrap(), "hello");
        assert_eq!(restore.affected_paths, vec![data]);
    }

    #[test]
    fn test_no_data_is_not_found_without_changes() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();

        let reset = engine.reset("AppX", ResetOptions::default());
        let backup = engine.backup("AppX", "x");
        for result in [&reset, &backup] {
            assert!(!result.succeeded);
            assert_eq!(result.error.as_ref().unwrap().kind(), "not_found");
            assert!(result.backup_ids.is_empty());
        }
        assert!(!fx.data().exists());
        assert!(!engine.store().index_path().exists());
        // Only the operation locks are written, never archives or the index
        assert_eq!(entries(&fx.backup_root()), vec!["locks"]);
        assert!(!fx.paths.root.join("config").exists());
    }

    #[test]
    fn test_engine_construction_writes_nothing() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        assert!(engine.status("AppX").is_ok());
        assert!(engine.list_backups("AppX").unwrap().is_empty());
        assert!(!fx.backup_root().exists());
    }

    #[test]
    fn test_data_root_holding_backups_is_rejected() {
        let mut fx = Fixture::new(FakeProcessTable::empty());
        fx.config.applications[0].data_roots = vec!["{documents}".to_string()];
        let documents = fx.paths.root.join("documents");
        fs::create_dir_all(&documents).unwrap();
        fs::write(documents.join("thesis.txt"), "chapter 1").unwrap();

        let err = Engine::new(&fx.config, &fx.paths, &fx.table).err().unwrap();
        assert_eq!(err.kind(), "unsafe_path");
        assert_eq!(
            fs::read_to_string(documents.join("thesis.txt")).unwrap(),
            "chapter 1"
        );
    }

    #[test]
    fn test_reset_refuses_user_directory() {
        let mut fx = Fixture::new(FakeProcessTable::empty());
        let desktop = fx.paths.root.join("desktop");
        fx.paths
            .vars
            .insert("APPX_HOME".to_string(), desktop.to_string_lossy().into_owned());
        fx.config.applications[0].data_roots = vec!["%APPX_HOME%".to_string()];
        fs::create_dir_all(&desktop).unwrap();
        fs::write(desktop.join("notes.txt"), "keep me").unwrap();
        let engine = fx.engine();

        let result = engine.reset("AppX", ResetOptions::default());
        assert!(!result.succeeded);
        assert_eq!(result.error.as_ref().unwrap().kind(), "unsafe_path");
        assert!(result.backup_ids.is_empty());
        assert_eq!(fs::read_to_string(desktop.join("notes.txt")).unwrap(), "keep me");
        assert!(!engine.store().index_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_reset_refuses_root_linked_to_backups_parent() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let documents = fx.paths.root.join("documents");
        fs::create_dir_all(&documents).unwrap();
        fs::write(documents.join("thesis.txt"), "chapter 1").unwrap();
        fs::create_dir_all(fx.paths.root.join("config")).unwrap();
        std::os::unix::fs::symlink(&documents, fx.data()).unwrap();
        let engine = fx.engine();

        for result in [
            engine.reset("AppX", ResetOptions::default()),
            engine.backup("AppX", "x"),
        ] {
            assert_eq!(result.error.as_ref().unwrap().kind(), "unsafe_path");
            assert!(result.backup_id.is_none());
        }
        assert_eq!(
            fs::read_to_string(documents.join("thesis.txt")).unwrap(),
            "chapter 1"
        );
        assert!(!engine.store().index_path().exists());
    }

    #[test]
    fn test_backup_skips_excluded_entries() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        let data = fx.seed();
        fs::create_dir_all(data.join("Cache").join("Cache_Data")).unwrap();
        fs::write(data.join("Cache").join("Cache_Data").join("f_000001"), "x".repeat(1024)).unwrap();
        fs::write(data.join("renderer.log"), "noise").unwrap();

        let result = engine.backup("AppX", "slim");
        assert!(result.succeeded, "{:?}", result.error);
        let record = engine
            .store()
            .get(result.backup_id.as_ref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.file_count, 1);
        assert_eq!(record.size_bytes, 5);
        assert_eq!(entries(&engine.store().archive_path(&record)), vec!["User", "a.txt"]);
    }

    #[test]
    fn test_backup_items_limit_what_is_archived() {
        let mut fx = Fixture::new(FakeProcessTable::empty());
        fx.config.applications[0].backup_items = vec!["User".to_string()];
        let engine = fx.engine();
        let data = fx.seed();
        fs::write(data.join("User").join("settings.json"), "{}").unwrap();

        let result = engine.backup("AppX", "items");
        assert!(result.succeeded, "{:?}", result.error);
        let record = engine
            .store()
            .get(result.backup_id.as_ref().unwrap())
            .unwrap()
            .unwrap();
        let archive = engine.store().archive_path(&record);
        assert_eq!(entries(&archive), vec!["User"]);
        assert!(archive.join("User").join("settings.json").is_file());
    }

    #[test]
    fn test_unknown_application() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let result = fx.engine().backup("nope", "x");
        assert_eq!(result.application_name, "nope");
        assert!(matches!(result.error, Some(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_reset_backs_up_then_wipes() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let states = Mutex::new(Vec::new());
        let engine = fx
            .engine()
            .with_observer(|_: &str, _: OperationKind, state: OperationState| {
                states.lock().push(state)
            });
        let data = fx.seed();

        let result = engine.reset("AppX", ResetOptions::default());
        assert!(result.succeeded, "{:?}", result.error);
        assert_eq!(result.backup_ids.len(), 1);
        assert_eq!(result.affected_paths, vec![data.clone()]);
        assert!(data.is_dir());
        assert!(entries(&data).is_empty());

        let record = engine
            .store()
            .get(result.backup_id.as_ref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(record.label, RESET_BACKUP_LABEL);
        drop(engine);

        assert_eq!(
            *states.lock(),
            vec![
                OperationState::Detecting,
                OperationState::BackingUp,
                OperationState::Wiping,
                OperationState::Done
            ]
        );
    }

    #[test]
    fn test_reset_refuses_running_application() {
        let fx = Fixture::new(FakeProcessTable::new(&[(42, "/usr/bin/appx")]));
        let engine = fx.engine();
        let data = fx.seed();

        let result = engine.reset("AppX", ResetOptions::default());
        assert_eq!(
            result.error,
            Some(EngineError::ProcessRunning {
                app: "AppX".to_string(),
                pids: vec![42]
            })
        );
        assert_eq!(fs::read_to_string(data.join("a.txt")).unwrap(), "hello");
        assert!(result.backup_ids.is_empty());
        assert!(fx.table.signals.lock().is_empty());
    }

    #[test]
    fn test_reset_force_kills_first() {
        let fx = Fixture::new(FakeProcessTable::new(&[(42, "appx")]));
        let engine = fx.engine();
        let data = fx.seed();

        let options = ResetOptions {
            force_kill: true,
            ..ResetOptions::default()
        };
        let result = engine.reset("AppX", options);
        assert!(result.succeeded, "{:?}", result.error);
        assert_eq!(*fx.table.signals.lock(), vec![(42, false)]);
        assert!(!data.join("a.txt").exists());
    }

    #[test]
    fn test_reset_stops_when_process_survives() {
        let mut table = FakeProcessTable::new(&[(42, "appx")]);
        table.unkillable = true;
        let fx = Fixture::new(table);
        let engine = fx.engine();
        let data = fx.seed();

        let options = ResetOptions {
            force_kill: true,
            ..ResetOptions::default()
        };
        let result = engine.reset("AppX", options);
        assert_eq!(result.error.as_ref().unwrap().kind(), "process_running");
        assert!(data.join("a.txt").exists());
    }

    #[test]
    fn test_wipe_failure_keeps_restorable_backup() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine().with_wipe(|path| {
            fs::remove_file(path.join("a.txt"))?;
            Err(io::Error::other("directory in use"))
        });
        let data = fx.seed();

        let result = engine.reset("AppX", ResetOptions::default());
        assert!(!result.succeeded);
        assert_eq!(result.failed_paths, vec![data.clone()]);
        assert!(!data.join("a.txt").exists());

        let id = result.backup_id.unwrap();
        let restore = engine.restore("AppX", &id);
        assert!(restore.succeeded, "{:?}", restore.error);
        assert_eq!(fs::read_to_string(data.join("a.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine().with_wipe(|_| panic!("boom"));
        fx.seed();

        let result = engine.reset("AppX", ResetOptions::default());
        assert!(!result.succeeded);
        match result.error {
            Some(EngineError::Internal(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected: {:?}", other),
        }
        // The lock was released
        assert!(engine.backup("AppX", "after").succeeded);
    }

    #[test]
    fn test_reset_regenerates_identity() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        let data = fx.seed();

        let options = ResetOptions {
            regenerate_identity: true,
            ..ResetOptions::default()
        };
        let result = engine.reset("AppX", options);
        assert!(result.succeeded, "{:?}", result.error);

        let new_id = result.new_identity.unwrap();
        let storage = data.join("User").join("globalStorage").join("storage.json");
        let content = fs::read_to_string(&storage).unwrap();
        assert!(content.contains(&new_id));
        assert!(!content.contains("00000000-0000-0000-0000-000000000000"));
        assert!(result.affected_paths.contains(&storage));
    }

    #[test]
    fn test_regenerate_id_without_identity_file() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        fx.seed();

        let result = engine.regenerate_id("AppX");
        assert_eq!(result.error.unwrap().kind(), "not_found");
    }

    #[test]
    fn test_cancelled_before_start() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let cancel = CancelToken::new();
        let engine = fx.engine().with_cancel_token(cancel.clone());
        let data = fx.seed();

        cancel.cancel();
        let result = engine.reset("AppX", ResetOptions::default());
        assert!(matches!(result.error, Some(EngineError::Cancelled { .. })));
        assert!(data.join("a.txt").exists());
        assert!(result.backup_ids.is_empty());
    }

    #[test]
    fn test_concurrent_reset_and_restore_are_serialized() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let events = Mutex::new(Vec::new());
        let engine = fx
            .engine()
            .with_observer(|_: &str, kind: OperationKind, state: OperationState| {
                events.lock().push((kind, state))
            });
        let data = fx.seed();
        let id = engine.backup("AppX", "base").backup_id.unwrap();
        fs::write(data.join("b.txt"), "later").unwrap();
        events.lock().clear();

        let options = ResetOptions {
            make_backup: false,
            ..ResetOptions::default()
        };
        let (reset, restore) = thread::scope(|s| {
            let reset = s.spawn(|| engine.reset("AppX", options));
            let restore = s.spawn(|| engine.restore("AppX", &id));
            (reset.join().unwrap(), restore.join().unwrap())
        });
        assert!(reset.succeeded, "{:?}", reset.error);
        assert!(restore.succeeded, "{:?}", restore.error);
        drop(engine);

        // One operation runs start to finish before the other begins
        let events = events.into_inner();
        let first = events[0].0;
        let switch = events.iter().position(|(kind, _)| *kind != first).unwrap();
        assert_eq!(events[switch - 1], (first, OperationState::Done));
        assert!(events[switch..].iter().all(|(kind, _)| *kind != first));

        let names = entries(&data);
        match first {
            OperationKind::Reset => assert_eq!(names, vec!["User", "a.txt"]),
            _ => assert!(names.is_empty()),
        }
    }

    #[test]
    fn test_restore_rejects_other_applications_backup() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        let src = fx.paths.root.join("elsewhere");
        fs::create_dir_all(&src).unwrap();
        let record = engine.store().create_backup("other", &src, "x").unwrap();

        let result = engine.restore("AppX", &record.id);
        assert_eq!(result.error.unwrap().kind(), "not_found");
    }

    #[test]
    fn test_verify_and_delete() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let engine = fx.engine();
        fx.seed();

        let good = engine.backup("AppX", "good").backup_id.unwrap();
        let bad = engine.backup("AppX", "bad").backup_id.unwrap();
        let bad_record = engine.store().get(&bad).unwrap().unwrap();
        fs::write(engine.store().archive_path(&bad_record).join("a.txt"), "x").unwrap();

        let verify = engine.verify_backups("AppX");
        assert!(!verify.succeeded);
        assert_eq!(verify.backup_ids.len(), 2);
        assert_eq!(
            verify.failed_paths,
            vec![engine.store().archive_path(&bad_record)]
        );
        let statuses: Vec<(String, BackupStatus)> = engine
            .list_backups("appx")
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.status))
            .collect();
        assert!(statuses.contains(&(good.clone(), BackupStatus::Complete)));
        assert!(statuses.contains(&(bad.clone(), BackupStatus::Corrupt)));

        let delete = engine.delete_backup("AppX", &bad);
        assert!(delete.succeeded, "{:?}", delete.error);
        assert!(engine.verify_backups("AppX").succeeded);
    }

    #[test]
    fn test_result_serializes_error_kind() {
        let fx = Fixture::new(FakeProcessTable::empty());
        let result = fx.engine().backup("AppX", "x");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["operation_kind"], "backup");
        assert_eq!(json["succeeded"], false);
        assert_eq!(json["error"]["kind"], "not_found");
    }
}
