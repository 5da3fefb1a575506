//! Lifecycle notifications published on each queue's companion stream.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::JobId;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEventKind {
    Queued,
    Active,
    Completed { duration_ms: u64 },
    Retrying { attempt: u32, retry_at: DateTime<Utc> },
    DeadLettered { attempts: u32, error: String },
    Released { new_job_id: JobId },
    Purged { count: u64 },
}

/// One lifecycle notification. `job_id` is absent for queue-wide events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub queue: String,
    pub job_id: Option<JobId>,
    pub kind: QueueEventKind,
    pub at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn for_job(queue: impl Into<String>, job_id: JobId, kind: QueueEventKind, at: DateTime<Utc>) -> Self {
        Self {
            queue: queue.into(),
            job_id: Some(job_id),
            kind,
            at,
        }
    }

    pub fn for_queue(queue: impl Into<String>, kind: QueueEventKind, at: DateTime<Utc>) -> Self {
        Self {
            queue: queue.into(),
            job_id: None,
            kind,
            at,
        }
    }
}
