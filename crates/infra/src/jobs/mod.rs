//! Durable job queues with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Named queues share one lazily created broker connection per process
//! - Retry policy with exponential backoff, enforced by the broker
//! - Jobs that exhaust their attempts move to a per-queue dead-letter view
//! - Workers route jobs to processors by job type
//!
//! ## Components
//!
//! - `Job`: the envelope stored by the broker
//! - `Broker` / `BrokerConnector`: persistence port (in-memory or Redis)
//! - `JobQueueRegistry` / `QueueHandle`: the entry point producers and consumers use
//! - `ProcessorDispatcher`: `job type -> processor` routing
//! - `QueueWorker`: claim, dispatch, settle

pub mod broker;
pub mod events;
pub mod in_memory;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod registry;
pub mod types;
pub mod worker;

pub use broker::{Broker, BrokerConnector, BrokerError, ReleasedJob};
pub use events::{QueueEvent, QueueEventKind};
pub use in_memory::{InMemoryBroker, InMemoryConnector};
pub use processor::{
    DispatchConfigError, JobProcessor, ProcessorDispatcher, ProcessorResult, ProcessorStats,
};
#[cfg(feature = "redis")]
pub use redis_broker::{RedisBroker, RedisConnector};
pub use registry::{ConnectionStatus, JobQueueRegistry, QueueError, QueueHandle, RegistryConfig};
pub use types::{
    Backoff, BackoffStrategy, DeadLetterEntry, FailureOutcome, Job, JobAttemptRecord, JobId,
    JobOptions, JobState, JobStatus, QueueMetricsSnapshot, QueueOptions, RetryPolicy, STALLED_ERROR,
};
pub use worker::{QueueWorker, WorkOutcome, WorkerConfig, WorkerHandle, WorkerStats};
