//! Process detection and termination
//!
//! Processes are matched by exact executable basename (case-insensitive)
//! against the profile's `process_names`, so `cursor` never matches
//! `cursor-helper`.

use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

use super::error::{EngineError, InternalContext, Result};
use crate::config::{ApplicationProfile, EngineConfig};

/// A running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name or path as reported by the OS
    pub name: String,
}

/// Outcome of [`ProcessController::terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationResult {
    /// Nothing matched
    NotRunning,
    /// Every match exited after the graceful request
    Graceful,
    /// A forced kill was needed
    Forced,
    /// At least one match survived the forced kill
    Failed,
}

/// OS process table
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>>;

    /// Request termination; `force` kills without letting the process clean up
    fn signal(&self, pid: u32, force: bool) -> Result<()>;
}

/// Detects and stops running instances of target applications
pub struct ProcessController<'a> {
    config: &'a EngineConfig,
    table: &'a dyn ProcessTable,
    poll_interval: Duration,
}

impl<'a> ProcessController<'a> {
    pub fn new(config: &'a EngineConfig, table: &'a dyn ProcessTable) -> Self {
        Self {
            config,
            table,
            poll_interval: Duration::from_millis(100),
        }
    }

    fn profile(&self, app: &str) -> Result<&'a ApplicationProfile> {
        self.config
            .profile(app)
            .ok_or_else(|| EngineError::not_found(app, "unknown application"))
    }

    /// Running processes that belong to `app`
    pub fn running_processes(&self, app: &str) -> Result<Vec<ProcessInfo>> {
        let profile = self.profile(app)?;
        Ok(self
            .table
            .snapshot()?
            .into_iter()
            .filter(|p| matches_process(&p.name, &profile.process_names))
            .collect())
    }

    pub fn is_running(&self, app: &str) -> Result<bool> {
        Ok(!self.running_processes(app)?.is_empty())
    }

    /// Stop every instance of `app`: graceful request first, forced kill after
    /// `timeout`. A `Failed` result must stop destructive work downstream.
    pub fn terminate(&self, app: &str, timeout: Duration) -> Result<TerminationResult> {
        let targets = self.running_processes(app)?;
        if targets.is_empty() {
            return Ok(TerminationResult::NotRunning);
        }

        tracing::info!(app, count = targets.len(), "requesting graceful shutdown");
        for process in &targets {
            if let Err(e) = self.table.signal(process.pid, false) {
                tracing::warn!(app, pid = process.pid, error = %e, "graceful shutdown request failed");
            }
        }
        if self.wait_until_stopped(app, timeout) {
            return Ok(TerminationResult::Graceful);
        }

        let survivors = match self.running_processes(app) {
            Ok(survivors) => survivors,
            Err(e) => {
                tracing::warn!(app, error = %e, "could not enumerate processes");
                return Ok(TerminationResult::Failed);
            }
        };
        tracing::warn!(app, count = survivors.len(), "escalating to forced kill");
        for process in &survivors {
            if let Err(e) = self.table.signal(process.pid, true) {
                tracing::warn!(app, pid = process.pid, error = %e, "forced kill failed");
            }
        }
        if self.wait_until_stopped(app, timeout.max(Duration::from_secs(1))) {
            Ok(TerminationResult::Forced)
        } else {
            Ok(TerminationResult::Failed)
        }
    }

    /// Poll until no match is left; `false` on timeout or enumeration error
    fn wait_until_stopped(&self, app: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.running_processes(app) {
                Ok(list) if list.is_empty() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Exact, case-insensitive basename match
pub fn matches_process(reported: &str, wanted: &[String]) -> bool {
    let basename = reported
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reported)
        .trim();
    if basename.is_empty() {
        return false;
    }
    let basename = basename.to_lowercase();
    wanted
        .iter()
        .any(|name| !name.is_empty() && name.to_lowercase() == basename)
}

/// Process table of the running OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
        platform::snapshot()
    }

    fn signal(&self, pid: u32, force: bool) -> Result<()> {
        platform::signal(pid, force)
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::fs;

    pub fn snapshot() -> Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        let entries = fs::read_dir("/proc").internal(|| "Failed to read /proc")?;

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            // `exe` holds the full name; `comm` is truncated to 15 bytes but
            // readable for processes of other users
            let name = fs::read_link(entry.path().join("exe"))
                .ok()
                .and_then(|exe| {
                    exe.file_name()
                        .map(|n| n.to_string_lossy().trim_end_matches(" (deleted)").to_string())
                })
                .or_else(|| {
                    fs::read_to_string(entry.path().join("comm"))
                        .ok()
                        .map(|s| s.trim().to_string())
                });

            if let Some(name) = name {
                processes.push(ProcessInfo { pid, name });
            }
        }
        Ok(processes)
    }

    pub fn signal(pid: u32, force: bool) -> Result<()> {
        super::unix_signal(pid, force)
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::*;
    use std::process::Command;

    pub fn snapshot() -> Result<Vec<ProcessInfo>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,comm="])
            .output()
            .internal(|| "Failed to run ps")?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!("ps exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (pid, name) = line.trim_start().split_once(char::is_whitespace)?;
                Some(ProcessInfo {
                    pid: pid.parse().ok()?,
                    name: name.trim().to_string(),
                })
            })
            .collect())
    }

    pub fn signal(pid: u32, force: bool) -> Result<()> {
        super::unix_signal(pid, force)
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::process::Command;

    pub fn snapshot() -> Result<Vec<ProcessInfo>> {
        let output = Command::new("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .output()
            .internal(|| "Failed to run tasklist")?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "tasklist exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_tasklist_line).collect())
    }

    /// `"Cursor.exe","1234","Console","1","120,000 K"`
    pub(super) fn parse_tasklist_line(line: &str) -> Option<ProcessInfo> {
        let mut fields = line.trim().trim_matches('"').split("\",\"");
        let name = fields.next()?.to_string();
        let pid = fields.next()?.parse().ok()?;
        Some(ProcessInfo { pid, name })
    }

    pub fn signal(pid: u32, force: bool) -> Result<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str()];
        if force {
            args.push("/F");
        }
        let output = Command::new("taskkill")
            .args(&args)
            .output()
            .internal(|| format!("Failed to run taskkill for pid {}", pid))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "taskkill failed for pid {}: {}",
                pid,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(unix)]
fn unix_signal(pid: u32, force: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).internal(|| format!("Invalid pid {}", pid))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(raw), signal) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(EngineError::Internal(format!(
            "Failed to send {} to pid {}: {}",
            signal, pid, e
        ))),
    }
}

/// Scripted process table for tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;

    pub struct FakeProcessTable {
        pub processes: Mutex<Vec<ProcessInfo>>,
        /// Ignores SIGTERM-style requests
        pub ignores_graceful: bool,
        /// Survives forced kills too
        pub unkillable: bool,
        pub signals: Mutex<Vec<(u32, bool)>>,
    }

    impl FakeProcessTable {
        pub fn new(processes: &[(u32, &str)]) -> Self {
            Self {
                processes: Mutex::new(
                    processes
                        .iter()
                        .map(|(pid, name)| ProcessInfo {
                            pid: *pid,
                            name: name.to_string(),
                        })
                        .collect(),
                ),
                ignores_graceful: false,
                unkillable: false,
                signals: Mutex::new(Vec::new()),
            }
        }

        pub fn empty() -> Self {
            Self::new(&[])
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn snapshot(&self) -> Result<Vec<ProcessInfo>> {
            Ok(self.processes.lock().clone())
        }

        fn signal(&self, pid: u32, force: bool) -> Result<()> {
            self.signals.lock().push((pid, force));
            let dies = if force {
                !self.unkillable
            } else {
                !self.ignores_graceful && !self.unkillable
            };
            if dies {
                self.processes.lock().retain(|p| p.pid != pid);
            }
            Ok(())
        }
    }
}
