//! Sandbox runner.
//!
//! Owns the lifecycle of exactly one sandbox: scratch directory, toolchain
//! preparation, launch, supervision against the wall deadline and the cancel
//! handle, output capture, classification, and teardown. Whatever happens,
//! `run` returns an envelope and leaves nothing behind.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{IsolationBackend, LaunchSpec, SandboxError, SIGKILL_EXIT};
use crate::capture::{Captured, OutputCollector};
use crate::config::Config;
use crate::envelope::{EnvelopeBuilder, OutputCaps, Reason, ResultEnvelope, RunOutcome, Termination};
use crate::language::{EntryPoint, ToolchainDescriptor};

/// File the run step reads standard input from.
pub const STDIN_FILENAME: &str = "stdin.in";

/// Created in the scratch directory once the compile step succeeded.
pub const COMPILED_SENTINEL: &str = ".compiled";

/// Smallest wall budget ever granted.
pub const MIN_WALL_BUDGET: Duration = Duration::from_secs(1);

const SENTINEL_POLL: Duration = Duration::from_millis(50);
const MEMORY_SAMPLE: Duration = Duration::from_millis(250);

/// Notified as a run moves from compiling to running.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    async fn compiled(&self);
}

/// Listener that ignores progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

#[async_trait]
impl ProgressListener for NoProgress {
    async fn compiled(&self) {}
}

/// One unit of work for the runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: String,
    pub descriptor: Arc<ToolchainDescriptor>,
    pub source: String,
    pub stdin: String,
    /// Caller's budget; clamped to the descriptor's ceiling.
    pub wall_budget: Option<Duration>,
}

/// Engine-wide knobs the runner needs.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub caps: OutputCaps,
    pub scratch_root: PathBuf,
    pub pids_limit: u32,
    pub tmpfs_bytes: u64,
    /// How long to wait for a killed sandbox and its pipes.
    pub grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            caps: OutputCaps {
                stdout: config.stdout_byte_cap,
                stderr: config.stderr_byte_cap,
            },
            scratch_root: config.scratch_root(),
            pids_limit: config.pids_limit,
            tmpfs_bytes: config.tmpfs_bytes,
            grace: config.grace_period(),
        }
    }
}

/// Budget actually enforced for `descriptor`.
pub fn effective_budget(descriptor: &ToolchainDescriptor, requested: Option<Duration>) -> Duration {
    let ceiling = descriptor.wall_timeout();
    requested
        .map_or(ceiling, |budget| budget.min(ceiling))
        .max(MIN_WALL_BUDGET)
}

/// Shell script executed inside the sandbox.
///
/// The sentinel is touched between the two steps so a failed exit can be
/// attributed to the compiler or to the program.
pub fn build_script(descriptor: &ToolchainDescriptor, entry: &EntryPoint) -> String {
    let run = descriptor.run_command(entry);
    match descriptor.compile_command(entry) {
        Some(compile) => format!("{{ {compile}\n}} && : > {COMPILED_SENTINEL} && {{ {run}\n}}"),
        None => run,
    }
}

/// Whether a SIGKILL exit came from the OOM killer rather than the program.
///
/// The runtime does not always flag OOM kills of a child process, so a
/// SIGKILL counts as one when the sampled peak reached 90% of the cap.
fn killed_at_memory_cap(exit_code: i32, peak: u64, cap: u64) -> bool {
    exit_code == SIGKILL_EXIT && cap > 0 && peak.saturating_mul(10) >= cap.saturating_mul(9)
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// A sandbox error plus whatever the sandbox printed before it.
struct SupervisionFailure {
    error: SandboxError,
    stderr: Captured,
}

impl SupervisionFailure {
    fn bare(error: SandboxError) -> Self {
        Self {
            error,
            stderr: Captured::default(),
        }
    }

    fn message(&self) -> String {
        let output = String::from_utf8_lossy(&self.stderr.bytes);
        let output = output.trim();
        if output.is_empty() {
            self.error.to_string()
        } else {
            format!("{}\n{output}", self.error)
        }
    }
}

/// Removes the sandbox if the run is abandoned before teardown.
struct SandboxGuard {
    backend: Option<Arc<dyn IsolationBackend>>,
    name: String,
}

impl SandboxGuard {
    async fn remove(mut self) {
        if let Some(backend) = self.backend.take() {
            if let Err(e) = backend.remove(&self.name).await {
                warn!(name = %self.name, error = %e, "Failed to remove sandbox");
            }
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.remove(&name).await {
                    warn!(%name, error = %e, "Failed to remove abandoned sandbox");
                }
            });
        }
    }
}

fn collect<R>(pipe: Option<R>, cap: usize) -> OutputCollector
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    match pipe {
        Some(pipe) => OutputCollector::spawn(pipe, cap),
        None => OutputCollector::spawn(tokio::io::empty(), cap),
    }
}

/// Runs submissions in sandboxes provided by an isolation backend.
pub struct SandboxRunner {
    backend: Arc<dyn IsolationBackend>,
    settings: RunnerSettings,
}

impl SandboxRunner {
    pub fn new(backend: Arc<dyn IsolationBackend>, settings: RunnerSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub const fn caps(&self) -> OutputCaps {
        self.settings.caps
    }

    /// Execute one submission and classify the result.
    #[instrument(
        skip_all,
        fields(execution = %request.execution_id, language = %request.descriptor.language_id)
    )]
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        progress: &dyn ProgressListener,
    ) -> ResultEnvelope {
        let started = Instant::now();
        let descriptor = Arc::clone(&request.descriptor);
        let builder = EnvelopeBuilder::new(
            &request.execution_id,
            &descriptor.language_id,
            self.settings.caps,
        );
        let budget = effective_budget(&descriptor, request.wall_budget);
        let deadline = tokio::time::Instant::now() + budget;

        if cancel.is_cancelled() {
            return builder.cancelled(started.elapsed());
        }

        let entry = match descriptor.entry_point(&request.source) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Rejected entry point");
                return builder.compile_rejected(&e.to_string(), started.elapsed());
            }
        };

        let scratch = match self.prepare_scratch(&request, &entry).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Scratch preparation failed");
                return builder.sandbox_failure(e.reason(), &e.to_string(), started.elapsed());
            }
        };

        // Image preparation counts against the wall budget.
        let prepared = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            prepared = tokio::time::timeout_at(deadline, self.backend.prepare(&descriptor)) => Some(prepared),
        };
        let envelope = match prepared {
            None => builder.cancelled(started.elapsed()),
            Some(Err(_)) => builder.sandbox_failure(
                Reason::ImageMissing,
                &format!(
                    "toolchain image '{}' was not ready within the {}s wall budget",
                    descriptor.image,
                    budget.as_secs()
                ),
                started.elapsed(),
            ),
            Some(Ok(Err(e))) => {
                warn!(error = %e, "Toolchain preparation failed");
                builder.sandbox_failure(e.reason(), &e.to_string(), started.elapsed())
            }
            Some(Ok(Ok(()))) => {
                let spec = LaunchSpec {
                    name: format!("sandbox-{}", Uuid::new_v4().simple()),
                    image: descriptor.image.clone(),
                    workdir: scratch.path().to_path_buf(),
                    script: build_script(&descriptor, &entry),
                    memory_bytes: descriptor.memory_bytes,
                    cpu_share: descriptor.cpu_share,
                    pids_limit: self.settings.pids_limit,
                    tmpfs_bytes: self.settings.tmpfs_bytes,
                };
                let guard = SandboxGuard {
                    backend: Some(Arc::clone(&self.backend)),
                    name: spec.name.clone(),
                };
                let outcome = self
                    .supervise(&spec, &descriptor, deadline, &cancel, progress, started)
                    .await;
                guard.remove().await;
                match outcome {
                    Ok(run) => builder.from_run(&run),
                    Err(failure) => {
                        warn!(error = %failure.error, "Sandbox failed");
                        builder.sandbox_failure(
                            failure.error.reason(),
                            &failure.message(),
                            started.elapsed(),
                        )
                    }
                }
            }
        };

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove scratch directory");
        }

        info!(
            ok = envelope.ok,
            reason = envelope.reason.map(Reason::as_str),
            exit_code = envelope.exit_code,
            wall_ms = envelope.wall_time_millis,
            "Execution finished"
        );
        envelope
    }

    async fn prepare_scratch(
        &self,
        request: &RunRequest,
        entry: &EntryPoint,
    ) -> Result<TempDir, SandboxError> {
        let root = &self.settings.scratch_root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(SandboxError::Scratch)?;
        let dir = tempfile::Builder::new()
            .prefix("exec-")
            .tempdir_in(root)
            .map_err(SandboxError::Scratch)?;
        tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(SandboxError::Scratch)?;
        tokio::fs::write(dir.path().join(&entry.source_filename), &request.source)
            .await
            .map_err(SandboxError::Scratch)?;
        tokio::fs::write(dir.path().join(STDIN_FILENAME), &request.stdin)
            .await
            .map_err(SandboxError::Scratch)?;
        debug!(path = %dir.path().display(), file = %entry.source_filename, "Scratch directory ready");
        Ok(dir)
    }

    async fn supervise(
        &self,
        spec: &LaunchSpec,
        descriptor: &ToolchainDescriptor,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        progress: &dyn ProgressListener,
        started: Instant,
    ) -> Result<RunOutcome, SupervisionFailure> {
        let mut child = self
            .backend
            .launch(spec)
            .await
            .map_err(SupervisionFailure::bare)?;
        let stdout = collect(child.stdout.take(), self.settings.caps.stdout);
        let stderr = collect(child.stderr.take(), self.settings.caps.stderr);

        let peak = Arc::new(AtomicU64::new(0));
        let sampler = self.spawn_memory_sampler(&spec.name, Arc::clone(&peak));

        let sentinel = spec.workdir.join(COMPILED_SENTINEL);
        let mut compiled = !descriptor.has_compile_step();
        let mut poll = tokio::time::interval(SENTINEL_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let waited = loop {
            tokio::select! {
                status = child.wait() => break Waited::Exited(status),
                () = tokio::time::sleep_until(deadline) => break Waited::TimedOut,
                () = cancel.cancelled() => break Waited::Cancelled,
                _ = poll.tick(), if !compiled => {
                    if tokio::fs::try_exists(&sentinel).await.unwrap_or(false) {
                        compiled = true;
                        debug!("Compile step finished");
                        progress.compiled().await;
                    }
                }
            }
        };
        let wall_time = started.elapsed();

        if matches!(waited, Waited::TimedOut | Waited::Cancelled) {
            self.stop(spec, &mut child).await;
        } else {
            self.backend.release(&spec.name).await;
        }
        sampler.abort();

        let stdout = stdout.finish(self.settings.grace).await;
        let stderr = stderr.finish(self.settings.grace).await;

        if !compiled && tokio::fs::try_exists(&sentinel).await.unwrap_or(false) {
            compiled = true;
            progress.compiled().await;
        }

        let (termination, oom_killed) = match waited {
            Waited::TimedOut => {
                info!(elapsed = ?wall_time, "Wall budget exceeded");
                (Termination::TimedOut, false)
            }
            Waited::Cancelled => (Termination::Cancelled, false),
            Waited::Exited(Err(e)) => {
                return Err(SupervisionFailure {
                    error: SandboxError::Launch(e),
                    stderr,
                })
            }
            Waited::Exited(Ok(status)) => match self.backend.inspect(&spec.name, status).await {
                Ok(report) => {
                    let oom_killed = report.oom_killed
                        || killed_at_memory_cap(
                            report.exit_code,
                            peak.load(Ordering::Relaxed),
                            spec.memory_bytes,
                        );
                    (Termination::Exited(report.exit_code), oom_killed)
                }
                Err(error) => return Err(SupervisionFailure { error, stderr }),
            },
        };

        Ok(RunOutcome {
            termination,
            oom_killed,
            has_compile_step: descriptor.has_compile_step(),
            compiled,
            stdout,
            stderr,
            wall_time,
            peak_memory_bytes: peak.load(Ordering::Relaxed),
        })
    }

    /// Kill the sandbox and give it `grace` to be reaped.
    async fn stop(&self, spec: &LaunchSpec, child: &mut Child) {
        self.backend.stop(&spec.name, child).await;
        if tokio::time::timeout(self.settings.grace, child.wait())
            .await
            .is_err()
        {
            warn!(name = %spec.name, "Sandbox did not exit within the grace period");
        }
    }

    fn spawn_memory_sampler(
        &self,
        name: &str,
        peak: Arc<AtomicU64>,
    ) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MEMORY_SAMPLE);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(bytes) = backend.memory_usage(&name).await {
                    peak.fetch_max(bytes, Ordering::Relaxed);
                }
            }
        })
    }
}

impl std::fmt::Debug for SandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRunner")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .finish()
    }
}
