//! Process id to executable path lookup.

use std::path::PathBuf;
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// Looks up the executable path of a running process.
pub trait ProgramLocator: Send + Sync {
    /// Returns `None` when the process is gone or its path is unavailable.
    fn program_path_for_pid(&self, pid: i32) -> Option<PathBuf>;
}

/// [`ProgramLocator`] backed by `sysinfo`, refreshing one pid per lookup.
#[derive(Debug)]
pub struct SysinfoLocator {
    system: Mutex<System>,
}

impl SysinfoLocator {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramLocator for SysinfoLocator {
    fn program_path_for_pid(&self, pid: i32) -> Option<PathBuf> {
        let pid = Pid::from_u32(u32::try_from(pid).ok()?);
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
        );

        let path = system
            .process(pid)
            .and_then(|process| process.exe())
            .filter(|path| !path.as_os_str().is_empty())
            .map(PathBuf::from);
        if path.is_none() {
            debug!(pid = %pid, "No executable path for process");
        }
        path
    }
}
