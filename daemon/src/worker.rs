//! Async worker pool.
//!
//! A fixed set of workers drains the bounded submission queue. Workers and
//! synchronous submissions share one semaphore, so the number of live
//! sandboxes never exceeds `max_concurrent` whichever way work arrives.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{EnvelopeBuilder, Reason, ResultEnvelope};
use crate::registry::{ExecutionRegistry, Phase};
use crate::runner::{ProgressListener, RunRequest, SandboxRunner};

/// Queued async submission.
#[derive(Debug)]
pub struct Job {
    pub request: RunRequest,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("submission queue is full")]
    Full(Job),
    #[error("worker pool is shut down")]
    Closed(Job),
}

/// Moves a registry entry from compiling to running.
struct RegistryProgress {
    registry: Arc<ExecutionRegistry>,
    execution_id: String,
}

#[async_trait]
impl ProgressListener for RegistryProgress {
    async fn compiled(&self) {
        self.registry
            .update_phase(&self.execution_id, Phase::Running)
            .await;
    }
}

/// Run an admitted submission while keeping its registry entry current.
///
/// Returns `None` when the entry was cancelled (or vanished) before a
/// sandbox was started. Otherwise the envelope is recorded in the registry
/// and returned with the entry's final phase.
///
/// The sandbox runs on its own task, which owns `permit` and records the
/// result. Dropping the caller's future leaves both in place until the
/// sandbox is gone.
pub async fn run_tracked(
    runner: &Arc<SandboxRunner>,
    registry: &Arc<ExecutionRegistry>,
    request: RunRequest,
    permit: OwnedSemaphorePermit,
) -> Option<(ResultEnvelope, Phase)> {
    let execution_id = request.execution_id.clone();
    let language_id = request.descriptor.language_id.clone();
    let phase = if request.descriptor.has_compile_step() {
        Phase::Compiling
    } else {
        Phase::Running
    };

    let cancel = CancellationToken::new();
    if !registry.begin(&execution_id, phase, cancel.clone()).await {
        debug!(execution = %execution_id, "Execution cancelled before start, dropping");
        return None;
    }

    let progress = RegistryProgress {
        registry: Arc::clone(registry),
        execution_id: execution_id.clone(),
    };
    let task_runner = Arc::clone(runner);
    let task_registry = Arc::clone(registry);
    let caps = runner.caps();
    let tracked = tokio::spawn(async move {
        let _permit = permit;
        let run = tokio::spawn(async move { task_runner.run(request, cancel, &progress).await });
        let envelope = match run.await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(execution = %execution_id, error = %e, "Runner task failed");
                EnvelopeBuilder::new(&execution_id, &language_id, caps).sandbox_failure(
                    Reason::Internal,
                    &format!("execution aborted: {e}"),
                    Duration::ZERO,
                )
            }
        };
        let phase = task_registry
            .finish(&execution_id, envelope.clone())
            .await
            .unwrap_or_else(|| Phase::for_envelope(&envelope));
        (envelope, phase)
    });

    match tracked.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(error = %e, "Tracking task failed");
            None
        }
    }
}

/// Fixed-size pool of queue workers.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` workers draining a queue of `capacity` jobs.
    pub fn start(
        workers: usize,
        capacity: usize,
        runner: Arc<SandboxRunner>,
        registry: Arc<ExecutionRegistry>,
        permits: Arc<Semaphore>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    index,
                    receiver: Arc::clone(&receiver),
                    runner: Arc::clone(&runner),
                    registry: Arc::clone(&registry),
                    permits: Arc::clone(&permits),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers, capacity, "Worker pool started");
        Self {
            sender,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, job: Job) -> Result<(), EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed(job));
        }
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => EnqueueError::Full(job),
            mpsc::error::TrySendError::Closed(job) => EnqueueError::Closed(job),
        })
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Stop accepting and dequeuing jobs. Jobs still queued are abandoned.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Close the pool and wait up to `timeout` per worker for in-flight runs.
    pub async fn shutdown(&self, timeout: Duration) {
        self.close();
        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker task failed"),
                Err(_) => warn!("Worker did not stop in time"),
            }
        }
        info!("Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.queued())
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct Worker {
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<SandboxRunner>,
    registry: Arc<ExecutionRegistry>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let job = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                job = self.next_job() => job,
            };
            let Some(job) = job else { break };

            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else { break };

            let execution_id = job.request.execution_id.clone();
            debug!(worker = self.index, execution = %execution_id, "Worker picked up job");
            if let Some((envelope, phase)) =
                run_tracked(&self.runner, &self.registry, job.request, permit).await
            {
                debug!(
                    worker = self.index,
                    execution = %execution_id,
                    ok = envelope.ok,
                    ?phase,
                    "Async execution stored"
                );
            }
        }
        debug!(worker = self.index, "Worker exiting");
    }

    async fn next_job(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::registry::{Mode, ResultLookup};
    use crate::runner::tests::{settings, shell_descriptor};

    fn request(id: &str, source: &str) -> RunRequest {
        RunRequest {
            execution_id: id.to_string(),
            descriptor: Arc::new(shell_descriptor()),
            source: source.to_string(),
            stdin: String::new(),
            wall_budget: None,
        }
    }

    fn fixture(scratch: &tempfile::TempDir) -> (Arc<SandboxRunner>, Arc<ExecutionRegistry>) {
        let runner = Arc::new(SandboxRunner::new(
            Arc::new(HostBackend::new()),
            settings(scratch.path().to_path_buf(), 4096),
        ));
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(600)));
        (runner, registry)
    }

    fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    async fn wait_for_result(registry: &ExecutionRegistry, id: &str) -> ResultEnvelope {
        for _ in 0..200 {
            if let ResultLookup::Ready(envelope) = registry.result_of(id).await {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no result for {id}");
    }

    #[tokio::test]
    async fn run_tracked_records_result() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        registry.insert("a", "shell", Mode::Asynchronous).await.unwrap();

        let (envelope, phase) = run_tracked(&runner, &registry, request("a", "echo hi"), permit())
            .await
            .unwrap();
        assert!(envelope.ok);
        assert_eq!(phase, Phase::Finished);
        assert_eq!(registry.lookup("a").await.unwrap().phase, Phase::Finished);
    }

    #[tokio::test]
    async fn run_tracked_skips_cancelled_entry() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        registry.insert("a", "shell", Mode::Asynchronous).await.unwrap();
        registry.cancel("a").await;

        assert!(run_tracked(&runner, &registry, request("a", "echo hi"), permit())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn abandoned_run_keeps_its_permit() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        let permits = Arc::new(Semaphore::new(1));
        registry.insert("a", "shell", Mode::Synchronous).await.unwrap();

        let held = Arc::clone(&permits).acquire_owned().await.unwrap();
        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                run_tracked(&runner, &registry, request("a", "sleep 1"), held).await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        caller.abort();
        let _ = caller.await;

        assert_eq!(permits.available_permits(), 0);
        assert_eq!(registry.lookup("a").await.unwrap().phase, Phase::Running);

        let envelope = wait_for_result(&registry, "a").await;
        assert!(envelope.ok);
        assert_eq!(registry.lookup("a").await.unwrap().phase, Phase::Finished);
        let _permit = tokio::time::timeout(Duration::from_secs(5), permits.acquire())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn pool_drains_queue() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        let pool = WorkerPool::start(
            2,
            8,
            runner,
            Arc::clone(&registry),
            Arc::new(Semaphore::new(2)),
        );

        for i in 0..4 {
            let id = format!("job-{i}");
            registry.insert(&id, "shell", Mode::Asynchronous).await.unwrap();
            pool.try_submit(Job {
                request: request(&id, &format!("echo {i}")),
            })
            .unwrap();
        }
        for i in 0..4 {
            let envelope = wait_for_result(&registry, &format!("job-{i}")).await;
            assert_eq!(envelope.stdout, format!("{i}\n"));
        }
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        // No permits: workers block, so the queue fills up.
        let pool = WorkerPool::start(1, 1, runner, registry, Arc::new(Semaphore::new(0)));

        let mut outcomes = Vec::new();
        for i in 0..3 {
            outcomes.push(pool.try_submit(Job {
                request: request(&format!("job-{i}"), "echo hi"),
            }));
        }
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(EnqueueError::Full(_)))));
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn closed_pool_rejects() {
        let scratch = tempfile::tempdir().unwrap();
        let (runner, registry) = fixture(&scratch);
        let pool = WorkerPool::start(1, 4, runner, registry, Arc::new(Semaphore::new(1)));
        pool.shutdown(Duration::from_secs(5)).await;

        let outcome = pool.try_submit(Job {
            request: request("late", "echo hi"),
        });
        assert!(matches!(outcome, Err(EnqueueError::Closed(_))));
    }
}
