//! Host fallback backend.
//!
//! Runs the toolchain directly on the host inside the scratch directory.
//! There is no container: no memory cap, no network cut, no capability drop.
//! Only the wall budget and process-group kill apply. Must be selected
//! explicitly (`backend = "host"`).

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use super::{exit_code_of, ExitReport, IsolationBackend, LaunchSpec, SandboxError};
use crate::language::ToolchainDescriptor;

/// Backend that runs submissions as plain host processes.
#[derive(Debug, Default, Clone)]
pub struct HostBackend {
    /// Process group of every launched sandbox still held, by sandbox name.
    groups: Arc<Mutex<HashMap<String, Pid>>>,
}

impl HostBackend {
    /// Create a new host backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn group_of(&self, name: &str) -> Option<Pid> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    fn forget(&self, name: &str) -> Option<Pid> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

/// SIGKILL every process in `group`. A group that is already empty is fine.
fn kill_group(name: &str, group: Pid) {
    match killpg(group, Signal::SIGKILL) {
        Ok(()) => debug!(name, %group, "Process group killed"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(name, %group, error = %e, "Failed to kill process group"),
    }
}

#[async_trait]
impl IsolationBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn is_available(&self, descriptor: &ToolchainDescriptor) -> bool {
        which::which(&descriptor.binary).is_ok()
    }

    async fn prepare(&self, descriptor: &ToolchainDescriptor) -> Result<(), SandboxError> {
        which::which(&descriptor.binary)
            .map(|_| ())
            .map_err(|e| SandboxError::ImageMissing {
                image: descriptor.binary.clone(),
                detail: e.to_string(),
            })
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, workdir = %spec.workdir.display()))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child, SandboxError> {
        debug!(script_len = spec.script.len(), "Spawning host sandbox");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.script)
            .current_dir(&spec.workdir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", &spec.workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so a stop reaches every descendant.
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(SandboxError::Launch)?;
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            self.groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(spec.name.clone(), Pid::from_raw(pid));
        }
        Ok(child)
    }

    async fn stop(&self, name: &str, child: &mut Child) {
        if let Some(group) = self.group_of(name) {
            kill_group(name, group);
        }
        if let Err(e) = child.start_kill() {
            debug!(name, error = %e, "Sandbox process already gone");
        }
    }

    async fn release(&self, name: &str) {
        // Background children survive the shell's own exit.
        if let Some(group) = self.group_of(name) {
            kill_group(name, group);
        }
    }

    async fn inspect(&self, _name: &str, status: ExitStatus) -> Result<ExitReport, SandboxError> {
        Ok(ExitReport {
            exit_code: exit_code_of(status),
            oom_killed: false,
        })
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        if let Some(group) = self.forget(name) {
            kill_group(name, group);
        }
        Ok(())
    }
}
