//! Engine configuration and platform-specific paths
//!
//! The configuration is loaded once at startup and passed by reference to
//! every component. Application data locations are written as templates
//! (`{config}/Cursor`) and expanded through a [`PathProvider`], so the engine
//! never hard-codes OS conventions.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "SESSION_HELPER_CONFIG";

/// Identity fields rewritten when a profile does not list its own
pub const DEFAULT_IDENTITY_FIELDS: &[&str] = &[
    "telemetry.machineId",
    "telemetry.macMachineId",
    "telemetry.devDeviceId",
    "telemetry.sqmId",
];

/// Entry names never archived unless a profile lists its own
pub const DEFAULT_BACKUP_EXCLUDES: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".venv",
    "venv",
    "*.tmp",
    "*.log",
    "*.cache",
    "Temp",
    "tmp",
    "Cache",
    "CachedData",
    "Code Cache",
    "GPUCache",
];

/// Source of the per-user base directories that templates refer to
pub trait PathProvider: Send + Sync {
    /// `{home}`
    fn home_dir(&self) -> Option<PathBuf>;
    /// `{config}`: roaming application data
    fn config_dir(&self) -> Option<PathBuf>;
    /// `{data_local}`: machine-local application data
    fn data_local_dir(&self) -> Option<PathBuf>;
    /// `{documents}`
    fn documents_dir(&self) -> Option<PathBuf>;
    fn desktop_dir(&self) -> Option<PathBuf>;
    fn download_dir(&self) -> Option<PathBuf>;
    /// `%NAME%` and `${NAME}`
    fn env_var(&self, name: &str) -> Option<String>;
}

/// Paths of the current user on the running OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPaths;

impl PathProvider for SystemPaths {
    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    /// - macOS: ~/Library/Application Support/
    /// - Linux: ~/.config/
    /// - Windows: %APPDATA%/
    fn config_dir(&self) -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            dirs::home_dir().map(|home| home.join("Library").join("Application Support"))
        }

        #[cfg(not(target_os = "macos"))]
        {
            dirs::config_dir()
        }
    }

    /// - macOS: ~/Library/Application Support/
    /// - Linux: ~/.local/share/
    /// - Windows: %LOCALAPPDATA%/
    fn data_local_dir(&self) -> Option<PathBuf> {
        dirs::data_local_dir()
    }

    fn documents_dir(&self) -> Option<PathBuf> {
        dirs::document_dir().or_else(|| dirs::home_dir().map(|home| home.join("Documents")))
    }

    fn desktop_dir(&self) -> Option<PathBuf> {
        dirs::desktop_dir()
    }

    fn download_dir(&self) -> Option<PathBuf> {
        dirs::download_dir()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Expand a path template
///
/// Supports `{home}`, `{config}`, `{data_local}`, `{documents}`, `%VAR%` and
/// `${VAR}`. Returns `None` when a placeholder is unknown or unset, so that
/// candidate is skipped rather than resolved to a wrong location.
pub fn expand_template(template: &str, paths: &dyn PathProvider) -> Option<PathBuf> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '%', '$']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let (value, consumed) = if let Some(inner) = tail.strip_prefix("${") {
            let end = inner.find('}')?;
            (paths.env_var(&inner[..end])?, end + 3)
        } else if let Some(inner) = tail.strip_prefix('{') {
            let end = inner.find('}')?;
            let dir = match &inner[..end] {
                "home" => paths.home_dir(),
                "config" => paths.config_dir(),
                "data_local" => paths.data_local_dir(),
                "documents" => paths.documents_dir(),
                _ => None,
            }?;
            (dir.to_string_lossy().into_owned(), end + 2)
        } else if let Some(inner) = tail.strip_prefix('%') {
            let end = inner.find('%')?;
            (paths.env_var(&inner[..end])?, end + 2)
        } else {
            // A lone `$` is literal
            ("$".to_string(), 1)
        };

        out.push_str(&value);
        rest = &tail[consumed..];
    }
    out.push_str(rest);

    if cfg!(windows) {
        out = out.replace('/', "\\");
    }
    Some(PathBuf::from(out))
}

/// A file written into the primary data root after a wipe, before identity
/// regeneration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultFile {
    /// Path relative to the data root
    pub path: String,
    pub contents: String,
}

/// Static description of one target application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationProfile {
    /// Logical name used on the command line (`cursor`)
    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Candidate data roots in priority order (templates)
    pub data_roots: Vec<String>,

    /// Glob patterns, relative to a data root, of files holding identity fields
    #[serde(default)]
    pub identity_file_patterns: Vec<String>,

    /// Names of the identity fields inside those files
    #[serde(default = "default_identity_fields")]
    pub identity_fields: Vec<String>,

    /// Executable basenames, matched case-insensitively
    pub process_names: Vec<String>,

    /// Files recreated after a wipe when identity regeneration is requested
    #[serde(default)]
    pub default_files: Vec<DefaultFile>,

    /// Recreate wiped data roots as empty directories
    #[serde(default = "default_true")]
    pub recreate_roots: bool,

    /// Paths, relative to a data root, that a backup is limited to; empty
    /// means the whole root
    #[serde(default)]
    pub backup_items: Vec<String>,

    /// Glob patterns matched (case-insensitively) against the name of every
    /// entry; matching files and directories are left out of backups
    #[serde(default = "default_backup_excludes")]
    pub backup_excludes: Vec<String>,
}

impl ApplicationProfile {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Strongly-typed engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Where archives and the session index live (template)
    #[serde(default = "default_backup_root")]
    pub backup_root: String,

    /// Grace period before a graceful shutdown escalates to a forced kill
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,

    /// Store archives as .tar.gz files instead of plain directories
    #[serde(default)]
    pub compress_backups: bool,

    /// Free space required before a backup, as a multiple of the source size
    #[serde(default = "default_free_space_factor")]
    pub free_space_factor: f64,

    #[serde(default = "default_applications")]
    pub applications: Vec<ApplicationProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            terminate_timeout_secs: default_terminate_timeout(),
            compress_backups: false,
            free_space_factor: default_free_space_factor(),
            applications: default_applications(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location; built-in defaults when
    /// the default file does not exist. Returns the path that was consulted.
    pub fn load_or_default(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        if let Some(path) = path {
            return Ok((Self::load(path)?, path.to_path_buf()));
        }

        let path = default_config_path()?;
        if path.exists() {
            Ok((Self::load(&path)?, path))
        } else {
            tracing::debug!(path = %path.display(), "no config file, using built-in profiles");
            Ok((Self::default(), path))
        }
    }

    /// Reject configurations that would make the engine ambiguous
    pub fn validate(&self) -> Result<()> {
        if !(self.free_space_factor >= 0.0 && self.free_space_factor.is_finite()) {
            bail!("free_space_factor must be a non-negative number");
        }

        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                bail!("Application name must not be empty");
            }
            if !seen.insert(app.name.to_lowercase()) {
                bail!("Duplicate application: {}", app.name);
            }
            if app.data_roots.is_empty() {
                bail!("Application {} has no data_roots", app.name);
            }
            if app.process_names.iter().all(|p| p.trim().is_empty()) {
                bail!("Application {} has no process_names", app.name);
            }
            for pattern in &app.identity_file_patterns {
                glob::Pattern::new(pattern).with_context(|| {
                    format!("Invalid identity pattern for {}: {}", app.name, pattern)
                })?;
            }
            for pattern in &app.backup_excludes {
                glob::Pattern::new(pattern).with_context(|| {
                    format!("Invalid backup exclude for {}: {}", app.name, pattern)
                })?;
            }
            for item in &app.backup_items {
                let item = Path::new(item);
                if item.as_os_str().is_empty()
                    || item.has_root()
                    || item.components().any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    bail!("Invalid backup item for {}: {}", app.name, item.display());
                }
            }
        }
        Ok(())
    }

    /// Reject data roots that are, contain, or sit inside the backup root
    ///
    /// Wiping such a root would take the backups with it. Templates that do not
    /// expand are skipped, as the resolver skips them.
    pub fn validate_paths(&self, paths: &dyn PathProvider) -> Result<()> {
        let backup_root = self.backup_root(paths)?;
        for app in &self.applications {
            for template in &app.data_roots {
                let Some(root) = expand_template(template, paths) else {
                    continue;
                };
                if root.starts_with(&backup_root) || backup_root.starts_with(&root) {
                    bail!(
                        "Data root of {} overlaps the backup root: {} and {}",
                        app.name,
                        root.display(),
                        backup_root.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a profile by name (case-insensitive)
    pub fn profile(&self, name: &str) -> Option<&ApplicationProfile> {
        self.applications
            .iter()
            .find(|app| app.name.eq_ignore_ascii_case(name))
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Expanded backup root
    pub fn backup_root(&self, paths: &dyn PathProvider) -> Result<PathBuf> {
        expand_template(&self.backup_root, paths)
            .with_context(|| format!("Could not expand backup_root: {}", self.backup_root))
    }
}

/// Default config location
/// - `$SESSION_HELPER_CONFIG` if set
/// - otherwise `<config dir>/session-helper/config.json`
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("session-helper").join("config.json"))
}

fn default_true() -> bool {
    true
}

fn default_backup_root() -> String {
    "{documents}/SessionHelper/Backups".to_string()
}

fn default_terminate_timeout() -> u64 {
    5
}

fn default_free_space_factor() -> f64 {
    1.5
}

fn default_identity_fields() -> Vec<String> {
    DEFAULT_IDENTITY_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_backup_excludes() -> Vec<String> {
    DEFAULT_BACKUP_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

/// Built-in profile table
pub fn default_applications() -> Vec<ApplicationProfile> {
    vec![
        vscode_fork("cursor", "Cursor", &["{config}/Cursor"], process_names("Cursor")),
        vscode_fork(
            "windsurf",
            "Windsurf",
            &["{config}/Windsurf"],
            process_names("Windsurf"),
        ),
        ApplicationProfile {
            name: "claude".to_string(),
            display_name: Some("Claude".to_string()),
            data_roots: vec!["{config}/Claude".to_string()],
            identity_file_patterns: Vec::new(),
            identity_fields: default_identity_fields(),
            process_names: process_names("Claude"),
            default_files: Vec::new(),
            recreate_roots: true,
            backup_items: Vec::new(),
            backup_excludes: default_backup_excludes(),
        },
    ]
}

/// Cursor and Windsurf share the VS Code layout: telemetry ids in
/// `User/globalStorage/storage.json`
fn vscode_fork(
    name: &str,
    display_name: &str,
    roots: &[&str],
    process_names: Vec<String>,
) -> ApplicationProfile {
    let mut data_roots: Vec<String> = roots.iter().map(|r| r.to_string()).collect();
    // Portable installs keep their data next to the executable
    if cfg!(windows) {
        data_roots.push(format!("{{data_local}}/Programs/{}/data", name));
    }

    let storage_json = format!(
        "{{\n  \"telemetry.machineId\": \"{zeros}\",\n  \"telemetry.macMachineId\": \"{zeros}\",\n  \"telemetry.devDeviceId\": \"00000000-0000-0000-0000-000000000000\"\n}}\n",
        zeros = "0".repeat(64)
    );

    ApplicationProfile {
        name: name.to_string(),
        display_name: Some(display_name.to_string()),
        data_roots,
        identity_file_patterns: vec!["User/globalStorage/storage.json".to_string()],
        identity_fields: default_identity_fields(),
        process_names,
        default_files: vec![DefaultFile {
            path: "User/globalStorage/storage.json".to_string(),
            contents: storage_json,
        }],
        recreate_roots: true,
        backup_items: Vec::new(),
        backup_excludes: default_backup_excludes(),
    }
}

/// Executable names per OS
fn process_names(product: &str) -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        vec![format!("{}.exe", product)]
    }

    #[cfg(target_os = "macos")]
    {
        vec![product.to_string()]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![product.to_lowercase(), format!("{}.AppImage", product)]
    }
}

/// Fake provider rooted in a temporary directory
#[cfg(test)]
pub(crate) struct FakePaths {
    pub root: PathBuf,
    pub vars: std::collections::HashMap<String, String>,
}

#[cfg(test)]
impl FakePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            vars: std::collections::HashMap::new(),
        }
    }
}

#[cfg(test)]
impl PathProvider for FakePaths {
    fn home_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("home"))
    }

    fn config_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("config"))
    }

    fn data_local_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("local"))
    }

    fn documents_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("documents"))
    }

    fn desktop_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("desktop"))
    }

    fn download_dir(&self) -> Option<PathBuf> {
        Some(self.root.join("downloads"))
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}
