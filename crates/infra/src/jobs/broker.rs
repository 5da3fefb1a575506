//! Broker port: the durable system that stores, orders and delivers jobs.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::types::{
    DeadLetterEntry, FailureOutcome, Job, JobId, JobState, QueueMetricsSnapshot, QueueOptions,
};

/// Broker-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("broker command error: {0}")]
    Command(String),
}

impl BrokerError {
    /// Connectivity problems are transient; everything else is the caller's fault or data.
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(value: serde_json::Error) -> Self {
        BrokerError::Serialization(value.to_string())
    }
}

/// A dead-lettered job together with the fresh job that replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedJob {
    pub previous: Job,
    pub job: Job,
}

/// Durable job broker.
///
/// One connection is shared by every queue of a process. Retry scheduling and
/// dead-lettering happen inside the broker so every consumer sees the same policy.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + core::fmt::Debug {
    /// Round-trip health check.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Declare a queue with its options (idempotent; the first declaration wins).
    async fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    /// Store a new job as waiting or delayed, depending on its state.
    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError>;

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Promote due delayed jobs, then claim the oldest waiting one.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, BrokerError>;

    /// Settle an active job as completed.
    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        return_value: Option<JsonValue>,
    ) -> Result<Job, BrokerError>;

    /// Settle an active job as failed; the broker schedules a retry or dead-letters it.
    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
    ) -> Result<(Job, FailureOutcome), BrokerError>;

    /// Fail every active job whose lease has lapsed, exactly as [`fail`](Self::fail)
    /// would with [`STALLED_ERROR`](super::types::STALLED_ERROR).
    async fn recover_stalled(&self, queue: &str) -> Result<Vec<(Job, FailureOutcome)>, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueMetricsSnapshot, BrokerError>;

    async fn list_by_state(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError>;

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError>;

    /// Replace a dead-lettered job with a fresh waiting copy.
    async fn release_dead_letter(&self, queue: &str, id: JobId) -> Result<ReleasedJob, BrokerError>;

    /// Purge the dead-letter view; returns how many jobs were removed.
    async fn clear_dead_letters(&self, queue: &str) -> Result<u64, BrokerError>;
}

/// Creates the shared broker connection on demand.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync + core::fmt::Debug {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

#[async_trait::async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn ping(&self) -> Result<(), BrokerError> {
        (**self).ping().await
    }

    async fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        (**self).ensure_queue(queue, options).await
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        (**self).enqueue(job).await
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        (**self).get_job(queue, id).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        (**self).claim_next(queue).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        return_value: Option<JsonValue>,
    ) -> Result<Job, BrokerError> {
        (**self).complete(queue, id, return_value).await
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
    ) -> Result<(Job, FailureOutcome), BrokerError> {
        (**self).fail(queue, id, error).await
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<(Job, FailureOutcome)>, BrokerError> {
        (**self).recover_stalled(queue).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetricsSnapshot, BrokerError> {
        (**self).counts(queue).await
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError> {
        (**self).list_by_state(queue, state, limit).await
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        (**self).list_dead_letters(queue, limit).await
    }

    async fn release_dead_letter(&self, queue: &str, id: JobId) -> Result<ReleasedJob, BrokerError> {
        (**self).release_dead_letter(queue, id).await
    }

    async fn clear_dead_letters(&self, queue: &str) -> Result<u64, BrokerError> {
        (**self).clear_dead_letters(queue).await
    }
}
