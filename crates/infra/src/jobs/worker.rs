//! Queue worker: claim -> dispatch -> settle, in a loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::processor::ProcessorDispatcher;
use super::registry::{QueueError, QueueHandle};
use super::types::{FailureOutcome, JobId};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty or erroring
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            name: "queue-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Result of one claim-dispatch-settle cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed { job_id: JobId },
    Retrying { job_id: JobId, attempts: u32 },
    DeadLettered { job_id: JobId, attempts: u32 },
}

/// Pulls jobs from one queue and runs them through the dispatcher.
///
/// Retry and dead-letter decisions stay with the broker; the worker only
/// reports success or failure of each attempt.
#[derive(Debug, Clone)]
pub struct QueueWorker {
    queue: QueueHandle,
    dispatcher: Arc<ProcessorDispatcher>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(queue: QueueHandle, dispatcher: Arc<ProcessorDispatcher>, config: WorkerConfig) -> Self {
        Self {
            queue,
            dispatcher,
            config,
        }
    }

    /// Process at most one job. `Ok(None)` means the queue had nothing ready.
    pub async fn process_next(&self) -> Result<Option<WorkOutcome>, QueueError> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };
        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );

        let result = self.dispatcher.process_job(&job).await;
        if result.success {
            self.queue.complete(job.id, result.data).await?;
            return Ok(Some(WorkOutcome::Completed { job_id: job.id }));
        }

        let error = result.error.unwrap_or_else(|| "job failed".to_string());
        let outcome = match self.queue.fail(job.id, &error).await? {
            FailureOutcome::Retrying { attempts, .. } => WorkOutcome::Retrying {
                job_id: job.id,
                attempts,
            },
            FailureOutcome::DeadLettered { attempts } => WorkOutcome::DeadLettered {
                job_id: job.id,
                attempts,
            },
        };
        Ok(Some(outcome))
    }

    /// Run the loop on a tokio task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let task = tokio::spawn(worker_loop(self, shutdown_rx, stats.clone()));

        WorkerHandle {
            shutdown: shutdown_tx,
            task: Some(task),
            stats,
        }
    }
}

async fn worker_loop(
    worker: QueueWorker,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let name = worker.config.name.clone();
    info!(worker = %name, queue = %worker.queue.name(), "queue worker started");
    let started = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match worker.process_next().await {
            Ok(Some(outcome)) => {
                let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                s.processed += 1;
                match outcome {
                    WorkOutcome::Completed { .. } => s.succeeded += 1,
                    WorkOutcome::Retrying { .. } => s.failed += 1,
                    WorkOutcome::DeadLettered { .. } => {
                        s.failed += 1;
                        s.dead_lettered += 1;
                    }
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(worker = %name, error = %e, "failed to process job");
                true
            }
        };

        stats.lock().unwrap_or_else(|p| p.into_inner()).uptime_secs = started.elapsed().as_secs();

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(worker.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    info!(worker = %name, "queue worker stopped");
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the current job and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
