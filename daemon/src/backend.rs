//! Isolation backend trait and implementations.
//!
//! A backend knows how to start one sandbox for a prepared scratch directory,
//! stop it, report how it exited, and clean up after it. The sandbox runner
//! drives the lifecycle; the backend only talks to the container runtime
//! (or, in host mode, to the local process table).

mod docker;
mod host;

pub use docker::DockerBackend;
pub use host::HostBackend;

use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;

use crate::envelope::Reason;
use crate::language::ToolchainDescriptor;

/// Failures of the sandbox machinery itself (never of the user program).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("toolchain '{image}' is not available: {detail}")]
    ImageMissing { image: String, detail: String },

    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to launch sandbox: {0}")]
    Launch(#[source] std::io::Error),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl SandboxError {
    /// Envelope reason this failure is reported under.
    pub const fn reason(&self) -> Reason {
        match self {
            Self::ImageMissing { .. } => Reason::ImageMissing,
            Self::Scratch(_) | Self::Launch(_) | Self::Runtime(_) => Reason::Internal,
        }
    }
}

/// Everything a backend needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique sandbox name (container name in Docker mode).
    pub name: String,
    pub image: String,
    /// Host path of the scratch directory; becomes the working directory.
    pub workdir: PathBuf,
    /// Shell script run with `sh -c`.
    pub script: String,
    pub memory_bytes: u64,
    pub cpu_share: f64,
    pub pids_limit: u32,
    pub tmpfs_bytes: u64,
}

/// How a sandbox that exited on its own ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub exit_code: i32,
    pub oom_killed: bool,
}

/// Trait for isolation backends.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the toolchain is present, without running user code or pulling.
    async fn is_available(&self, descriptor: &ToolchainDescriptor) -> bool;

    /// Make the toolchain usable, pulling its image when allowed.
    async fn prepare(&self, descriptor: &ToolchainDescriptor) -> Result<(), SandboxError>;

    /// Start the sandbox. The returned child has stdout and stderr piped.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child, SandboxError>;

    /// Forcefully stop a live sandbox. Best effort; never fails.
    async fn stop(&self, name: &str, child: &mut Child);

    /// Kill anything the sandbox left behind after its entry process exited
    /// on its own. Best effort; never fails.
    async fn release(&self, _name: &str) {}

    /// Exit report for a sandbox whose launcher process exited with `status`.
    async fn inspect(&self, name: &str, status: ExitStatus) -> Result<ExitReport, SandboxError>;

    /// Current memory usage of a live sandbox, if the runtime reports it.
    async fn memory_usage(&self, _name: &str) -> Option<u64> {
        None
    }

    /// Remove whatever the runtime still holds for `name`. Idempotent.
    async fn remove(&self, name: &str) -> Result<(), SandboxError>;
}

/// Exit code of a SIGKILLed process as a shell reports it (`128 + 9`).
pub const SIGKILL_EXIT: i32 = 137;

/// Exit code of a process, mapping death-by-signal to `128 + signal`
/// the way shells report it.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(crate::envelope::ABNORMAL_EXIT)
}
