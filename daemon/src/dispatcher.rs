//! Submission dispatcher.
//!
//! Front door of the engine. Validates submissions, registers them, and
//! either runs them inline under the shared concurrency semaphore or hands
//! them to the worker pool. Input problems never surface as errors: they
//! come back as envelopes with `phase_at_failure = sandbox`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::IsolationBackend;
use crate::config::Config;
use crate::envelope::{EnvelopeBuilder, Reason, ResultEnvelope};
use crate::language::{LanguageRegistry, LanguageSummary};
use crate::probe::ToolchainProber;
use crate::registry::{
    CancelOutcome, ExecutionRegistry, ExecutionStatus, Mode, Phase, ResultLookup,
};
use crate::runner::{RunRequest, RunnerSettings, SandboxRunner};
use crate::worker::{run_tracked, EnqueueError, Job, WorkerPool};

/// Drops a sync entry whose caller went away before its sandbox started.
/// Entries already running are finished by their own task and reaped later.
struct PendingSync {
    registry: Arc<ExecutionRegistry>,
    execution_id: Option<String>,
}

impl PendingSync {
    fn disarm(mut self) {
        self.execution_id = None;
    }
}

impl Drop for PendingSync {
    fn drop(&mut self) {
        let Some(execution_id) = self.execution_id.take() else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if registry.remove_queued(&execution_id).await {
                    debug!(execution = %execution_id, "Dropped abandoned sync submission");
                }
            });
        }
    }
}

/// A request to execute code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub execution_id: Option<String>,
    pub language_id: String,
    pub source: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub wall_budget_seconds: Option<u64>,
}

/// Sync submissions that end without an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("execution {0} was cancelled")]
    Cancelled(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Outcome of an async submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncSubmission {
    Accepted { execution_id: String },
    Rejected(ResultEnvelope),
}

/// Entry of the languages view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageAvailability {
    pub language_id: String,
    pub name: String,
    pub extension: String,
    pub available: bool,
}

#[derive(Debug, Clone, Copy)]
struct InputLimits {
    source: usize,
    stdin: usize,
}

/// The execution engine.
#[derive(Debug)]
pub struct Dispatcher {
    languages: LanguageRegistry,
    registry: Arc<ExecutionRegistry>,
    runner: Arc<SandboxRunner>,
    permits: Arc<Semaphore>,
    pool: WorkerPool,
    prober: ToolchainProber,
    limits: InputLimits,
    grace: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build the engine and spawn its workers and result reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &Config,
        backend: Arc<dyn IsolationBackend>,
        languages: LanguageRegistry,
    ) -> Self {
        let languages = languages.with_overrides(&config.languages);
        let registry = Arc::new(ExecutionRegistry::new(config.result_retention()));
        let runner = Arc::new(SandboxRunner::new(
            Arc::clone(&backend),
            RunnerSettings::from_config(config),
        ));
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        let pool = WorkerPool::start(
            config.max_concurrent,
            config.queue_capacity,
            Arc::clone(&runner),
            Arc::clone(&registry),
            Arc::clone(&permits),
        );
        let reaper = registry.start_reaper(config.reaper_interval());

        info!(
            backend = backend.name(),
            max_concurrent = config.max_concurrent,
            queue_capacity = config.queue_capacity,
            languages = languages.list().len(),
            "Dispatcher started"
        );

        Self {
            languages,
            registry,
            runner,
            permits,
            pool,
            prober: ToolchainProber::new(backend),
            limits: InputLimits {
                source: config.source_byte_cap,
                stdin: config.stdin_byte_cap,
            },
            grace: config.grace_period(),
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Run a submission and wait for its envelope.
    ///
    /// Rejections come back as `Ok` envelopes. `Err` means the execution was
    /// cancelled (or the engine stopped) before producing a result.
    #[instrument(skip_all, fields(language = %submission.language_id))]
    pub async fn submit_sync(&self, submission: Submission) -> Result<ResultEnvelope, DispatchError> {
        let request = match self.admit(submission, Mode::Synchronous).await {
            Ok(request) => request,
            Err(rejection) => return Ok(rejection),
        };
        let execution_id = request.execution_id.clone();
        let pending = PendingSync {
            registry: Arc::clone(&self.registry),
            execution_id: Some(execution_id.clone()),
        };

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            pending.disarm();
            self.registry.remove(&execution_id).await;
            return Err(DispatchError::ShuttingDown);
        };

        let outcome = run_tracked(&self.runner, &self.registry, request, permit).await;
        pending.disarm();
        self.registry.remove(&execution_id).await;

        match outcome {
            Some((_, Phase::Cancelled)) | None => Err(DispatchError::Cancelled(execution_id)),
            Some((envelope, _)) => Ok(envelope),
        }
    }

    /// Queue a submission and return its id without waiting.
    #[instrument(skip_all, fields(language = %submission.language_id))]
    pub async fn submit_async(&self, submission: Submission) -> AsyncSubmission {
        let request = match self.admit(submission, Mode::Asynchronous).await {
            Ok(request) => request,
            Err(rejection) => return AsyncSubmission::Rejected(rejection),
        };
        let execution_id = request.execution_id.clone();
        let builder = EnvelopeBuilder::new(
            &execution_id,
            &request.descriptor.language_id,
            self.runner.caps(),
        );

        match self.pool.try_submit(Job { request }) {
            Ok(()) => {
                debug!(execution = %execution_id, "Async submission queued");
                AsyncSubmission::Accepted { execution_id }
            }
            Err(e) => {
                self.registry.remove(&execution_id).await;
                let reason = match e {
                    EnqueueError::Full(_) => Reason::QueueFull,
                    EnqueueError::Closed(_) => Reason::Internal,
                };
                info!(execution = %execution_id, %reason, "Async submission refused");
                AsyncSubmission::Rejected(builder.rejected(reason, &e.to_string()))
            }
        }
    }

    pub async fn status_of(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.registry.lookup(execution_id).await
    }

    /// Envelope of a finished async execution.
    pub async fn result_of(&self, execution_id: &str) -> ResultLookup {
        self.registry.result_of(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> CancelOutcome {
        self.registry.cancel(execution_id).await
    }

    /// Registered languages in order, without probing.
    pub fn registered_languages(&self) -> Vec<LanguageSummary> {
        self.languages.list()
    }

    /// Registered languages in order, with current availability.
    pub async fn languages(&self) -> Vec<LanguageAvailability> {
        let availability = self.prober.probe(&self.languages).await;
        self.languages
            .list()
            .into_iter()
            .map(|summary| LanguageAvailability {
                available: availability
                    .get(&summary.language_id)
                    .copied()
                    .unwrap_or(false),
                language_id: summary.language_id,
                name: summary.name,
                extension: summary.extension,
            })
            .collect()
    }

    /// Stop accepting work, cancel everything in flight, and join workers.
    pub async fn shutdown(&self) {
        self.pool.close();
        self.permits.close();
        let cancelled = self.registry.cancel_all().await;
        if cancelled > 0 {
            info!(cancelled, "Cancelled executions on shutdown");
        }
        // A cancelled run needs up to one grace period to stop and another to drain.
        self.pool.shutdown(self.grace * 2 + Duration::from_secs(1)).await;
        if let Some(reaper) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }
        info!("Dispatcher stopped");
    }

    /// Validate a submission and register it in phase `queued`.
    async fn admit(&self, submission: Submission, mode: Mode) -> Result<RunRequest, ResultEnvelope> {
        let Submission {
            execution_id,
            language_id,
            source,
            stdin,
            wall_budget_seconds,
        } = submission;
        let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let reject = |language_id: &str, reason: Reason, message: String| {
            info!(execution = %execution_id, %reason, "Submission rejected");
            EnvelopeBuilder::new(&execution_id, language_id, self.runner.caps())
                .rejected(reason, &message)
        };

        let descriptor = match self.languages.resolve(&language_id) {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(reject(&language_id, Reason::UnknownLanguage, e.to_string())),
        };
        let language_id = descriptor.language_id.as_str();

        if source.trim().is_empty() {
            return Err(reject(language_id, Reason::EmptySource, "source is empty".to_string()));
        }
        if source.len() > self.limits.source {
            return Err(reject(
                language_id,
                Reason::InputTooLarge,
                format!(
                    "source is {} bytes; the limit is {} bytes",
                    source.len(),
                    self.limits.source
                ),
            ));
        }
        if stdin.len() > self.limits.stdin {
            return Err(reject(
                language_id,
                Reason::InputTooLarge,
                format!(
                    "stdin is {} bytes; the limit is {} bytes",
                    stdin.len(),
                    self.limits.stdin
                ),
            ));
        }
        if let Err(e) = self.registry.insert(&execution_id, language_id, mode).await {
            warn!(execution = %execution_id, "Duplicate execution id");
            return Err(reject(language_id, Reason::DuplicateExecutionId, e.to_string()));
        }

        debug!(
            execution = %execution_id,
            language = language_id,
            ?mode,
            source_bytes = source.len(),
            stdin_bytes = stdin.len(),
            "Submission accepted"
        );
        Ok(RunRequest {
            execution_id,
            descriptor: Arc::clone(&descriptor),
            source,
            stdin,
            wall_budget: wall_budget_seconds.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::config::BackendType;
    use crate::envelope::FailurePhase;
    use crate::runner::tests::{checked_shell_descriptor, shell_descriptor};
    use std::time::Instant;
    use tokio_test::assert_ok;

    fn config(scratch: &tempfile::TempDir, max_concurrent: usize, queue_capacity: usize) -> Config {
        Config {
            backend: BackendType::Host,
            max_concurrent,
            queue_capacity,
            stdout_byte_cap: 4096,
            stderr_byte_cap: 4096,
            source_byte_cap: 256,
            stdin_byte_cap: 64,
            scratch_root: Some(scratch.path().to_path_buf()),
            grace_period_seconds: 1,
            ..Config::default()
        }
    }

    fn languages() -> LanguageRegistry {
        let mut missing = shell_descriptor();
        missing.language_id = "missing".to_string();
        missing.name = "Missing".to_string();
        missing.binary = "definitely-not-a-real-toolchain".to_string();
        LanguageRegistry::new(vec![shell_descriptor(), checked_shell_descriptor(), missing])
    }

    fn engine(scratch: &tempfile::TempDir, max_concurrent: usize, queue_capacity: usize) -> Dispatcher {
        Dispatcher::start(
            &config(scratch, max_concurrent, queue_capacity),
            Arc::new(HostBackend::new()),
            languages(),
        )
    }

    fn submission(language: &str, source: &str) -> Submission {
        Submission {
            language_id: language.to_string(),
            source: source.to_string(),
            ..Submission::default()
        }
    }

    fn with_id(id: &str, language: &str, source: &str) -> Submission {
        Submission {
            execution_id: Some(id.to_string()),
            ..submission(language, source)
        }
    }

    async fn wait_for_phase(engine: &Dispatcher, id: &str, phase: Phase) {
        for _ in 0..200 {
            if engine.status_of(id).await.is_some_and(|s| s.phase == phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("{id} never reached {phase:?}");
    }

    async fn wait_for_result(engine: &Dispatcher, id: &str) -> ResultEnvelope {
        for _ in 0..200 {
            if let ResultLookup::Ready(envelope) = engine.result_of(id).await {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no result for {id}");
    }

    #[tokio::test]
    async fn sync_hello_world() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let envelope = assert_ok!(engine.submit_sync(submission("SHELL", "echo hello")).await);
        assert!(envelope.ok);
        assert_eq!(envelope.stdout, "hello\n");
        assert_eq!(envelope.language_id, "shell");
        assert!(Uuid::parse_str(&envelope.execution_id).is_ok());
        // Sync entries are gone once the envelope is returned.
        assert!(engine.status_of(&envelope.execution_id).await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn sync_passes_stdin() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);
        let mut sub = submission("shell", "read line; echo \"got $line\"");
        sub.stdin = "ping\n".to_string();

        let envelope = assert_ok!(engine.submit_sync(sub).await);
        assert_eq!(envelope.stdout, "got ping\n");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected_with_reasons() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let cases = [
            (submission("cobol", "DISPLAY 'HI'."), Reason::UnknownLanguage),
            (submission("shell", "   \n"), Reason::EmptySource),
            (submission("shell", &"#".repeat(257)), Reason::InputTooLarge),
            (
                Submission {
                    stdin: "x".repeat(65),
                    ..submission("shell", "cat")
                },
                Reason::InputTooLarge,
            ),
        ];
        for (sub, reason) in cases {
            let envelope = assert_ok!(engine.submit_sync(sub).await);
            assert!(!envelope.ok);
            assert_eq!(envelope.reason, Some(reason));
            assert_eq!(envelope.phase_at_failure, FailurePhase::Sandbox);
            assert!(!envelope.stderr.is_empty());
        }

        match engine.submit_async(submission("cobol", "x")).await {
            AsyncSubmission::Rejected(envelope) => {
                assert_eq!(envelope.reason, Some(Reason::UnknownLanguage));
                assert_eq!(envelope.language_id, "cobol");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn source_at_cap_is_accepted() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let envelope = assert_ok!(engine.submit_sync(submission("shell", &"#".repeat(256))).await);
        assert!(envelope.ok, "{envelope:?}");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn empty_stdin_reads_eof() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let envelope = assert_ok!(
            engine
                .submit_sync(submission("shell", "if read line; then echo data; else echo eof; fi"))
                .await
        );
        assert_eq!(envelope.stdout, "eof\n");
        assert!(envelope.wall_time_millis < 5000);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn pure_program_output_is_deterministic() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);
        let program = Submission {
            stdin: "3\n1\n2\n".to_string(),
            ..submission("shell", "sort -n")
        };

        let first = assert_ok!(engine.submit_sync(program.clone()).await);
        let second = assert_ok!(engine.submit_sync(program).await);
        assert_eq!(first.stdout, "1\n2\n3\n");
        assert_eq!(first.stdout, second.stdout);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_execution_id_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let first = engine.submit_async(with_id("dup", "shell", "sleep 5")).await;
        assert_eq!(
            first,
            AsyncSubmission::Accepted {
                execution_id: "dup".to_string()
            }
        );
        let envelope = assert_ok!(engine.submit_sync(with_id("dup", "shell", "echo hi")).await);
        assert_eq!(envelope.reason, Some(Reason::DuplicateExecutionId));
        assert_eq!(envelope.execution_id, "dup");

        engine.cancel("dup").await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn async_result_is_retained() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let AsyncSubmission::Accepted { execution_id } =
            engine.submit_async(submission("shell", "echo later")).await
        else {
            panic!("submission refused");
        };
        let envelope = wait_for_result(&engine, &execution_id).await;
        assert!(envelope.ok);
        assert_eq!(envelope.stdout, "later\n");

        let status = engine.status_of(&execution_id).await.unwrap();
        assert_eq!(status.phase, Phase::Finished);
        assert_eq!(status.language_id, "shell");
        assert!(status.started_at.is_some());
        assert_eq!(engine.cancel(&execution_id).await, CancelOutcome::NotRunning);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn compiled_language_moves_through_phases() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 1, 4);

        let accepted = engine
            .submit_async(with_id("phases", "checked-shell", "sleep 30"))
            .await;
        assert!(matches!(accepted, AsyncSubmission::Accepted { .. }));
        wait_for_phase(&engine, "phases", Phase::Running).await;

        assert_eq!(engine.cancel("phases").await, CancelOutcome::Cancelled);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_running_async_execution() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        engine.submit_async(with_id("long", "shell", "echo partial; sleep 30")).await;
        wait_for_phase(&engine, "long", Phase::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.cancel("long").await, CancelOutcome::Cancelled);
        assert_eq!(engine.cancel("long").await, CancelOutcome::NotRunning);

        let envelope = wait_for_result(&engine, "long").await;
        assert_eq!(envelope.reason, Some(Reason::Cancelled));
        assert_eq!(envelope.stdout, "partial\n");
        assert_eq!(engine.status_of("long").await.unwrap().phase, Phase::Cancelled);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_sync_execution() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(&scratch, 2, 4));

        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.submit_sync(with_id("inline", "shell", "sleep 30")).await })
        };
        wait_for_phase(&engine, "inline", Phase::Running).await;
        assert_eq!(engine.cancel("inline").await, CancelOutcome::Cancelled);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(DispatchError::Cancelled("inline".to_string())));
        assert!(engine.status_of("inline").await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_ids() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 1, 1);
        assert!(engine.status_of("nope").await.is_none());
        assert_eq!(engine.cancel("nope").await, CancelOutcome::Unknown);
        assert_eq!(engine.result_of("nope").await, ResultLookup::Unknown);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 1, 1);

        let mut refused = None;
        for i in 0..4 {
            if let AsyncSubmission::Rejected(envelope) = engine
                .submit_async(with_id(&format!("q{i}"), "shell", "sleep 30"))
                .await
            {
                refused = Some(envelope);
                break;
            }
        }
        let envelope = refused.expect("queue never filled");
        assert_eq!(envelope.reason, Some(Reason::QueueFull));
        assert_eq!(envelope.phase_at_failure, FailurePhase::Sandbox);
        assert!(engine.status_of(&envelope.execution_id).await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 2, 4);

        let started = Instant::now();
        let runs = (0..4).map(|_| engine.submit_sync(submission("shell", "sleep 0.5")));
        let results = futures_util::future::join_all(runs).await;
        for result in results {
            assert!(assert_ok!(result).ok);
        }
        // Four half-second runs, two at a time.
        assert!(started.elapsed() >= Duration::from_millis(950));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_sync_caller_still_holds_its_slot() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(&scratch, 1, 4));

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.submit_sync(with_id("first", "shell", "sleep 2")).await })
        };
        wait_for_phase(&engine, "first", Phase::Running).await;
        first.abort();
        let _ = first.await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(500),
            engine.submit_sync(submission("shell", "echo hi")),
        )
        .await;
        assert!(blocked.is_err(), "second run started while the first was live");
        // The abandoned waiter never started, so it left nothing behind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.registry.len().await, 1);
        assert_eq!(
            engine.status_of("first").await.map(|s| s.phase),
            Some(Phase::Running)
        );

        let second = assert_ok!(engine.submit_sync(submission("shell", "echo hi")).await);
        assert!(second.ok);
        assert_eq!(
            engine.status_of("first").await.map(|s| s.phase),
            Some(Phase::Finished)
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn languages_report_availability_in_order() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 1, 1);

        let view = engine.languages().await;
        let ids: Vec<_> = view.iter().map(|l| l.language_id.as_str()).collect();
        assert_eq!(ids, ["shell", "checked-shell", "missing"]);
        assert!(view[0].available);
        assert!(!view[2].available);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_live_work() {
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch, 1, 4);

        engine.submit_async(with_id("live", "shell", "sleep 30")).await;
        wait_for_phase(&engine, "live", Phase::Running).await;

        let started = Instant::now();
        engine.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.status_of("live").await.unwrap().phase, Phase::Cancelled);

        let late = engine.submit_sync(submission("shell", "echo hi")).await;
        assert_eq!(late, Err(DispatchError::ShuttingDown));
    }
}

/// End-to-end scenarios against a real Docker daemon with the builtin
/// toolchain images. Enabled by setting `EXEC_SANDBOX_DOCKER_TEST`; the
/// images should already be pulled, since a pull counts against the budget.
#[cfg(test)]
mod docker_scenarios {
    use super::*;
    use crate::backend::DockerBackend;
    use crate::config::{BackendType, LanguageOverride};
    use crate::envelope::FailurePhase;
    use std::collections::HashMap;
    use std::time::Instant;

    fn enabled() -> bool {
        std::env::var_os("EXEC_SANDBOX_DOCKER_TEST").is_some()
    }

    fn engine(scratch: &tempfile::TempDir) -> Dispatcher {
        let mut languages = HashMap::new();
        languages.insert(
            "python".to_string(),
            LanguageOverride {
                memory_bytes: Some(64 * 1024 * 1024),
                ..LanguageOverride::default()
            },
        );
        let config = Config {
            backend: BackendType::Docker,
            scratch_root: Some(scratch.path().to_path_buf()),
            languages,
            ..Config::default()
        };
        Dispatcher::start(
            &config,
            Arc::new(DockerBackend::new(true)),
            LanguageRegistry::builtin(),
        )
    }

    async fn run(engine: &Dispatcher, language: &str, source: &str, stdin: &str) -> ResultEnvelope {
        engine
            .submit_sync(Submission {
                language_id: language.to_string(),
                source: source.to_string(),
                stdin: stdin.to_string(),
                ..Submission::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn python_hello() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);

        let envelope = run(&engine, "python", "print('hello')", "").await;
        assert!(envelope.ok, "{envelope:?}");
        assert_eq!(envelope.stdout, "hello\n");
        assert_eq!(envelope.exit_code, 0);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cpp_echo() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);
        let source = r#"
#include <algorithm>
#include <cctype>
#include <iostream>
#include <string>

int main() {
    std::string line;
    std::getline(std::cin, line);
    std::transform(line.begin(), line.end(), line.begin(), ::toupper);
    std::cout << line << std::endl;
}
"#;

        let envelope = run(&engine, "cpp", source, "abc\n").await;
        assert!(envelope.ok, "{envelope:?}");
        assert_eq!(envelope.stdout, "ABC\n");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn java_missing_public_class() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);

        let envelope = run(&engine, "java", "class X {}", "").await;
        assert!(!envelope.ok);
        assert_eq!(envelope.phase_at_failure, FailurePhase::Compile);
        assert_eq!(envelope.reason, Some(Reason::CompileError));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);

        let started = Instant::now();
        let envelope = engine
            .submit_sync(Submission {
                language_id: "python".to_string(),
                source: "while True: pass".to_string(),
                wall_budget_seconds: Some(2),
                ..Submission::default()
            })
            .await
            .unwrap();
        assert_eq!(envelope.reason, Some(Reason::Timeout));
        assert!(envelope.wall_time_millis >= 2000);
        assert!(started.elapsed() < Duration::from_secs(2 + 2 + 5));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn memory_bomb_is_killed() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);

        let envelope = run(
            &engine,
            "python",
            "chunks = []\nwhile True:\n    chunks.append(bytearray(16 * 1024 * 1024))\n",
            "",
        )
        .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.reason, Some(Reason::MemoryExceeded), "{envelope:?}");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn network_is_denied() {
        if !enabled() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let engine = engine(&scratch);
        let source = "import socket\nsocket.create_connection(('1.1.1.1', 80), timeout=3)\nprint('connected')\n";

        let envelope = run(&engine, "python", source, "").await;
        assert!(!envelope.ok);
        assert_eq!(envelope.reason, Some(Reason::RuntimeError));
        assert!(!envelope.stdout.contains("connected"));
        assert!(envelope.stderr.contains("Error"), "{}", envelope.stderr);
        engine.shutdown().await;
    }
}
