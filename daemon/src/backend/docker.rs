//! Docker backend.
//!
//! Drives the `docker` CLI. Each submission gets one container with the
//! network disabled, every capability dropped, no-new-privileges, a
//! read-only root filesystem with a small `noexec` tmpfs at `/tmp`, hard
//! memory and CPU caps, and a process-count cap. The scratch directory is
//! the only writable bind mount.

use std::os::unix::fs::MetadataExt;
use std::process::{ExitStatus, Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use super::{exit_code_of, ExitReport, IsolationBackend, LaunchSpec, SandboxError};
use crate::language::ToolchainDescriptor;

/// Mount point of the scratch directory inside the container.
const CONTAINER_WORKDIR: &str = "/sandbox";

/// CFS period used to express `cpu_share` as a quota.
const CPU_PERIOD_MICROS: u64 = 100_000;

/// Exit status the `docker` CLI uses when the daemon itself failed.
const DOCKER_DAEMON_FAILURE: i32 = 125;

/// Subset of `docker inspect` `.State`.
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: i32,
}

/// Backend that runs every submission in a fresh Docker container.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    /// Path or name of the docker CLI.
    docker: String,
    pull_missing: bool,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DockerBackend {
    #[must_use]
    pub fn new(pull_missing: bool) -> Self {
        Self {
            docker: "docker".to_string(),
            pull_missing,
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<Output, SandboxError> {
        Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(SandboxError::Launch)
    }

    async fn image_present(&self, image: &str) -> Result<bool, SandboxError> {
        let output = self.docker(&["image", "inspect", "--format", "{{.Id}}", image]).await?;
        image_lookup(output.status.success(), &output.stderr)
    }

    /// Arguments for `docker run`, excluding the docker binary itself.
    fn run_args(spec: &LaunchSpec, user: Option<(u32, u32)>) -> Vec<String> {
        let cpu_quota = cpu_quota(spec.cpu_share);
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            "none".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            format!("/tmp:rw,noexec,nosuid,size={}", spec.tmpfs_bytes),
            "--memory".to_string(),
            format!("{}b", spec.memory_bytes),
            // Same value as --memory: no swap on top of the cap.
            "--memory-swap".to_string(),
            format!("{}b", spec.memory_bytes),
            "--cpu-period".to_string(),
            CPU_PERIOD_MICROS.to_string(),
            "--cpu-quota".to_string(),
            cpu_quota.to_string(),
            "--pids-limit".to_string(),
            spec.pids_limit.to_string(),
            "--volume".to_string(),
            format!("{}:{CONTAINER_WORKDIR}:rw", spec.workdir.display()),
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
            "--env".to_string(),
            "HOME=/tmp".to_string(),
            "--env".to_string(),
            "GOCACHE=/tmp/.gocache".to_string(),
            "--env".to_string(),
            "LANG=C.UTF-8".to_string(),
        ];
        if let Some((uid, gid)) = user {
            args.push("--user".to_string());
            args.push(format!("{uid}:{gid}"));
        }
        args.extend([
            spec.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            spec.script.clone(),
        ]);
        args
    }
}

/// `cpu_share` of one core expressed as a CFS quota over [`CPU_PERIOD_MICROS`].
fn cpu_quota(share: f64) -> u64 {
    // Docker rejects quotas under 1ms.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let quota = (share * CPU_PERIOD_MICROS as f64).round() as u64;
    quota.max(1_000)
}

/// Outcome of `docker image inspect`. Only a "no such image" answer means
/// the image is missing; anything else is the runtime failing.
fn image_lookup(success: bool, stderr: &[u8]) -> Result<bool, SandboxError> {
    if success {
        return Ok(true);
    }
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.to_ascii_lowercase().contains("no such image") {
        Ok(false)
    } else {
        Err(SandboxError::Runtime(format!(
            "image lookup failed: {}",
            stderr.trim()
        )))
    }
}

/// Parse the used half of `docker stats` `MemUsage`, e.g. `"12.5MiB / 64MiB"`.
fn parse_mem_usage(text: &str) -> Option<u64> {
    let used = text.split('/').next()?.trim();
    let split = used
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(used.len());
    let (number, unit) = used.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((value * multiplier).round() as u64)
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self, descriptor: &ToolchainDescriptor) -> bool {
        self.image_present(&descriptor.image).await.unwrap_or(false)
    }

    #[instrument(skip(self, descriptor), fields(image = %descriptor.image))]
    async fn prepare(&self, descriptor: &ToolchainDescriptor) -> Result<(), SandboxError> {
        let image = descriptor.image.as_str();
        let missing = |detail: String| SandboxError::ImageMissing {
            image: image.to_string(),
            detail,
        };

        if self.image_present(image).await? {
            return Ok(());
        }
        if !self.pull_missing {
            return Err(missing("image not present locally and pulling is disabled".to_string()));
        }

        info!("Pulling toolchain image");
        let output = self.docker(&["pull", "--quiet", image]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(missing(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child, SandboxError> {
        // Run as the owner of the scratch dir so the 0700 bind mount stays writable
        // without DAC_OVERRIDE.
        let user = std::fs::metadata(&spec.workdir)
            .map(|meta| (meta.uid(), meta.gid()))
            .map_err(SandboxError::Scratch)?;

        let args = Self::run_args(spec, Some(user));
        debug!(memory = spec.memory_bytes, cpu_share = spec.cpu_share, "Starting container");

        Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Launch)
    }

    async fn stop(&self, name: &str, child: &mut Child) {
        match self.docker(&["kill", name]).await {
            Ok(output) if output.status.success() => debug!(name, "Container killed"),
            Ok(output) => debug!(
                name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker kill failed (container may have exited)"
            ),
            Err(e) => warn!(name, error = %e, "Failed to run docker kill"),
        }
        if let Err(e) = child.start_kill() {
            debug!(name, error = %e, "docker CLI process already gone");
        }
    }

    async fn inspect(&self, name: &str, status: ExitStatus) -> Result<ExitReport, SandboxError> {
        let output = self
            .docker(&["inspect", "--type", "container", "--format", "{{json .State}}", name])
            .await?;

        if output.status.success() {
            let state: ContainerState = serde_json::from_slice(&output.stdout)
                .map_err(|e| SandboxError::Runtime(format!("unparseable container state: {e}")))?;
            // A 137 without OOMKilled is left to the runner, which weighs it
            // against the sampled peak memory.
            return Ok(ExitReport {
                exit_code: state.exit_code,
                oom_killed: state.oom_killed,
            });
        }

        let code = exit_code_of(status);
        if code == DOCKER_DAEMON_FAILURE {
            return Err(SandboxError::Runtime(format!(
                "container '{name}' failed to start"
            )));
        }
        // Container already gone; trust the CLI's exit status.
        Ok(ExitReport {
            exit_code: code,
            oom_killed: false,
        })
    }

    async fn memory_usage(&self, name: &str) -> Option<u64> {
        let output = self
            .docker(&["stats", "--no-stream", "--format", "{{.MemUsage}}", name])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_mem_usage(String::from_utf8_lossy(&output.stdout).trim())
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let output = self.docker(&["rm", "--force", "--volumes", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(SandboxError::Runtime(format!(
            "failed to remove container '{name}': {}",
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            name: "sandbox-abc".to_string(),
            image: "python:3.12-slim".to_string(),
            workdir: PathBuf::from("/tmp/exec-xyz"),
            script: "python3 -u main.py < stdin.in".to_string(),
            memory_bytes: 64 * 1024 * 1024,
            cpu_share: 0.5,
            pids_limit: 128,
            tmpfs_bytes: 64 * 1024 * 1024,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn run_args_apply_isolation() {
        let args = DockerBackend::run_args(&spec(), Some((1000, 1000)));
        assert_eq!(args[0], "run");
        assert!(has_pair(&args, "--name", "sandbox-abc"));
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(args.iter().any(|a| a == "--read-only"));
        assert!(has_pair(&args, "--tmpfs", "/tmp:rw,noexec,nosuid,size=67108864"));
        assert!(has_pair(&args, "--memory", "67108864b"));
        assert!(has_pair(&args, "--memory-swap", "67108864b"));
        assert!(has_pair(&args, "--cpu-period", "100000"));
        assert!(has_pair(&args, "--cpu-quota", "50000"));
        assert!(has_pair(&args, "--pids-limit", "128"));
        assert!(has_pair(&args, "--volume", "/tmp/exec-xyz:/sandbox:rw"));
        assert!(has_pair(&args, "--workdir", "/sandbox"));
        assert!(has_pair(&args, "--user", "1000:1000"));
        // Never auto-removed: state is inspected before an explicit remove.
        assert!(!args.iter().any(|a| a == "--rm"));
    }

    #[test]
    fn run_args_end_with_shell_invocation() {
        let args = DockerBackend::run_args(&spec(), None);
        let tail: Vec<_> = args.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(
            tail,
            ["python:3.12-slim", "sh", "-c", "python3 -u main.py < stdin.in"]
        );
        assert!(!args.iter().any(|a| a == "--user"));
    }

    #[test]
    fn cpu_quota_scales_share() {
        assert_eq!(cpu_quota(0.5), 50_000);
        assert_eq!(cpu_quota(1.0), 100_000);
        assert_eq!(cpu_quota(2.0), 200_000);
        assert_eq!(cpu_quota(0.001), 1_000);
    }

    #[test]
    fn parse_mem_usage_units() {
        assert_eq!(parse_mem_usage("12MiB / 64MiB"), Some(12 * 1024 * 1024));
        assert_eq!(parse_mem_usage("1.5KiB / 1GiB"), Some(1536));
        assert_eq!(parse_mem_usage("0B / 0B"), Some(0));
        assert_eq!(parse_mem_usage("2GB / 4GB"), Some(2_000_000_000));
        assert_eq!(parse_mem_usage("--"), None);
        assert_eq!(parse_mem_usage(""), None);
    }

    #[test]
    fn image_lookup_separates_missing_from_runtime_failure() {
        assert!(image_lookup(true, b"").unwrap());
        assert!(!image_lookup(false, b"Error: No such image: gcc:13\n").unwrap());
        assert!(!image_lookup(false, b"Error response from daemon: no such image: gcc:13").unwrap());

        let err = image_lookup(
            false,
            b"Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        )
        .unwrap_err();
        assert_eq!(err.reason(), crate::envelope::Reason::Internal);
        assert!(err.to_string().contains("Cannot connect"));
    }

    #[test]
    fn parse_container_state() {
        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"exited","OOMKilled":true,"ExitCode":137}"#).unwrap();
        assert!(state.oom_killed);
        assert_eq!(state.exit_code, 137);
    }
}
