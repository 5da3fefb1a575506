//! Job queue registry: named durable queues over one shared broker connection.
//!
//! ## Connection handling
//!
//! - The broker connection is created lazily on first use and shared by every queue
//! - Concurrent first uses are serialised; only one connect runs at a time
//! - The first connect retries `connect_attempts` times with capped exponential backoff
//! - While disconnected, calls fail fast with [`QueueError::Unavailable`] and a single
//!   background task keeps reconnecting
//!
//! Queue handles hold a weak reference back to the registry, so the handle cache
//! never keeps the registry alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use modbridge_core::Clock;
use modbridge_observability::Metrics;

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry};

use super::broker::{Broker, BrokerConnector, BrokerError};
use super::events::{QueueEvent, QueueEventKind};
use super::types::{
    Backoff, DeadLetterEntry, FailureOutcome, Job, JobId, JobOptions, JobState, JobStatus,
    QueueMetricsSnapshot, QueueOptions, STALLED_ERROR,
};

/// Registry-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue broker unavailable after {attempts} connection attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
    #[error("circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String },
    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),
    #[error("job {id} not found in queue {queue}")]
    JobNotFound { queue: String, id: JobId },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Registry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Connection attempts before the first use gives up
    pub connect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Options applied to every queue created through the registry
    pub queue_defaults: QueueOptions,
    /// Wrap enqueues in a per-queue circuit breaker
    pub protect_enqueue: bool,
    pub breaker: CircuitBreakerConfig,
    /// Buffer of each queue's lifecycle stream
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            queue_defaults: QueueOptions::default(),
            protect_enqueue: true,
            breaker: CircuitBreakerConfig::default(),
            event_capacity: 256,
        }
    }
}

/// Connection health as seen by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_available: bool,
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RegistryInner {
    connector: Arc<dyn BrokerConnector>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    breakers: Arc<CircuitBreakerRegistry>,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    /// Bumped on every successful connect; queues redeclare themselves when it moves.
    generation: AtomicU64,
    status: Mutex<ConnectionStatus>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    queues: Mutex<HashMap<String, QueueHandle>>,
    closed: AtomicBool,
}

impl RegistryInner {
    fn current_broker(&self) -> Option<Arc<dyn Broker>> {
        self.broker.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn reconnecting(&self) -> bool {
        let slot = self.reconnect.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn unavailable(&self) -> QueueError {
        if self.closed.load(Ordering::SeqCst) {
            return closed_error();
        }
        let status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        QueueError::Unavailable {
            attempts: status.connection_attempts,
            last_error: status
                .last_error
                .clone()
                .unwrap_or_else(|| "not connected".to_string()),
        }
    }

    fn reconnect_backoff(&self) -> Backoff {
        Backoff::exponential(self.config.reconnect_base, self.config.reconnect_max)
    }

    async fn broker(self: &Arc<Self>) -> Result<Arc<dyn Broker>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        if let Some(broker) = self.current_broker() {
            return Ok(broker);
        }
        if self.reconnecting() {
            return Err(self.unavailable());
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(broker) = self.current_broker() {
            return Ok(broker);
        }
        if self.reconnecting() {
            return Err(self.unavailable());
        }

        let attempts = self.config.connect_attempts.max(1);
        let backoff = self.reconnect_backoff();
        for attempt in 1..=attempts {
            if let Ok(broker) = self.try_connect().await {
                return Ok(broker);
            }
            if attempt < attempts {
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            }
        }

        self.spawn_reconnect();
        Err(self.unavailable())
    }

    async fn try_connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        {
            let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
            status.connection_attempts = status.connection_attempts.saturating_add(1);
        }

        let connected = match self.connector.connect().await {
            Ok(broker) => broker.ping().await.map(|_| broker),
            Err(err) => Err(err),
        };

        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        match connected {
            Ok(broker) => {
                *self.broker.write().unwrap_or_else(|p| p.into_inner()) = Some(broker.clone());
                self.generation.fetch_add(1, Ordering::SeqCst);
                status.is_available = true;
                status.last_error = None;
                status.connected_at = Some(self.clock.now());
                info!(attempts = status.connection_attempts, "queue broker connected");
                Ok(broker)
            }
            Err(err) => {
                status.is_available = false;
                status.last_error = Some(err.to_string());
                warn!(attempts = status.connection_attempts, error = %err, "queue broker connection failed");
                Err(err)
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.reconnect.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let backoff = self.reconnect_backoff();
        *slot = Some(tokio::spawn(async move {
            let mut attempt = 1u32;
            loop {
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) || inner.current_broker().is_some() {
                    break;
                }
                if inner.try_connect().await.is_ok() {
                    break;
                }
                attempt = attempt.saturating_add(1);
            }
        }));
        debug!("queue broker reconnect loop started");
    }

    /// Translate a broker error; connection loss flips the registry to unavailable.
    fn on_broker_error(self: &Arc<Self>, err: BrokerError) -> QueueError {
        if !err.is_connection() {
            return QueueError::Broker(err);
        }

        *self.broker.write().unwrap_or_else(|p| p.into_inner()) = None;
        {
            let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
            status.is_available = false;
            status.last_error = Some(err.to_string());
        }
        warn!(error = %err, "queue broker connection lost");
        self.spawn_reconnect();
        self.unavailable()
    }
}

fn closed_error() -> QueueError {
    QueueError::Unavailable {
        attempts: 0,
        last_error: "queue registry shut down".to_string(),
    }
}

fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}

/// Single entry point to every named queue of the process.
///
/// Cheap to clone; clones share the connection, the handle cache and the breakers.
#[derive(Debug, Clone)]
pub struct JobQueueRegistry {
    inner: Arc<RegistryInner>,
}

impl JobQueueRegistry {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breaker,
            clock.clone(),
            metrics.clone(),
        ));
        Self::with_breakers(connector, config, clock, metrics, breakers)
    }

    /// Like [`JobQueueRegistry::new`] but sharing an existing breaker registry.
    pub fn with_breakers(
        connector: Arc<dyn BrokerConnector>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                config,
                clock,
                metrics,
                breakers,
                broker: RwLock::new(None),
                generation: AtomicU64::new(0),
                status: Mutex::new(ConnectionStatus::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect: Mutex::new(None),
                queues: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect eagerly instead of on first use.
    pub async fn connect(&self) -> Result<(), QueueError> {
        self.inner.broker().await.map(|_| ())
    }

    /// Handle for `name`, created with the registry's default options on first call.
    pub fn get_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        validate_queue_name(name)?;

        let mut queues = self.inner.queues.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = queues.get(name) {
            return Ok(handle.clone());
        }

        let (events, _) = broadcast::channel(self.inner.config.event_capacity.max(1));
        let handle = QueueHandle {
            shared: Arc::new(QueueShared {
                name: name.to_string(),
                options: self.inner.config.queue_defaults,
                events,
                declared: AtomicU64::new(0),
            }),
            registry: Arc::downgrade(&self.inner),
        };
        queues.insert(name.to_string(), handle.clone());
        info!(queue = %name, max_attempts = handle.shared.options.retry.max_attempts, "queue created");
        Ok(handle)
    }

    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.get_queue(queue)?.add(job_type, payload, options).await
    }

    pub async fn get_job_status(&self, queue: &str, id: JobId) -> Result<Option<JobStatus>, QueueError> {
        self.get_queue(queue)?.status(id).await
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> Result<QueueMetricsSnapshot, QueueError> {
        self.get_queue(queue)?.metrics().await
    }

    pub async fn list_dead_letter_jobs(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.get_queue(queue)?.dead_letters(limit).await
    }

    pub async fn release_from_quarantine(&self, queue: &str, id: JobId) -> Result<JobId, QueueError> {
        self.get_queue(queue)?.release(id).await
    }

    pub async fn clear_dead_letter_queue(&self, queue: &str) -> Result<u64, QueueError> {
        self.get_queue(queue)?.clear_dead_letters().await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.inner.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop reconnecting and release the broker; later calls fail with `Unavailable`.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .inner
            .reconnect
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        *self.inner.broker.write().unwrap_or_else(|p| p.into_inner()) = None;
        self.inner
            .status
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_available = false;
        info!("queue registry shut down");
    }
}

#[derive(Debug)]
struct QueueShared {
    name: String,
    options: QueueOptions,
    events: broadcast::Sender<QueueEvent>,
    /// Connection generation the queue was last declared on (0 = never)
    declared: AtomicU64,
}

/// Handle to one named queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    shared: Arc<QueueShared>,
    registry: Weak<RegistryInner>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Subscribe to this queue's lifecycle stream.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Enqueue a job now, or later when `options.delay` is set.
    pub async fn add(
        &self,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        let inner = self.registry()?;
        let job = Job::new(
            self.name(),
            job_type,
            payload,
            &self.shared.options.retry,
            &options,
            inner.clock.now(),
        );
        let delayed = job.state == JobState::Delayed;

        let id = if inner.config.protect_enqueue {
            let breaker = inner.breakers.get(&format!("queue.{}.enqueue", self.name()));
            breaker
                .call(|| self.enqueue(&inner, job))
                .await
                .map_err(|err| match err {
                    CircuitBreakerError::Open { name, .. } => QueueError::CircuitOpen { breaker: name },
                    CircuitBreakerError::Inner(err) => err,
                })?
        } else {
            self.enqueue(&inner, job).await?
        };

        inner.metrics.record_job_queued(self.name());
        self.emit(&inner, Some(id), QueueEventKind::Queued);
        debug!(queue = %self.name(), job_id = %id, job_type = %job_type, delayed, "job queued");
        Ok(id)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        broker
            .get_job(self.name(), id)
            .await
            .map_err(|e| self.map_err(&inner, e))
    }

    pub async fn status(&self, id: JobId) -> Result<Option<JobStatus>, QueueError> {
        Ok(self.job(id).await?.as_ref().map(JobStatus::from))
    }

    pub async fn metrics(&self) -> Result<QueueMetricsSnapshot, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        broker
            .counts(self.name())
            .await
            .map_err(|e| self.map_err(&inner, e))
    }

    pub async fn jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        broker
            .list_by_state(self.name(), state, limit)
            .await
            .map_err(|e| self.map_err(&inner, e))
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        broker
            .list_dead_letters(self.name(), limit)
            .await
            .map_err(|e| self.map_err(&inner, e))
    }

    /// Re-enqueue a dead-lettered job as a fresh job with zero attempts.
    pub async fn release(&self, id: JobId) -> Result<JobId, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        let released = broker
            .release_dead_letter(self.name(), id)
            .await
            .map_err(|e| self.map_err(&inner, e))?;

        info!(
            queue = %self.name(),
            job_id = %id,
            new_job_id = %released.job.id,
            previous_attempts = released.previous.attempts,
            last_error = released.previous.last_error.as_deref().unwrap_or(""),
            "dead-lettered job released; attempts reset to 0"
        );
        self.emit(
            &inner,
            Some(id),
            QueueEventKind::Released {
                new_job_id: released.job.id,
            },
        );
        Ok(released.job.id)
    }

    /// Irreversibly purge the dead-letter view.
    pub async fn clear_dead_letters(&self) -> Result<u64, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        let count = broker
            .clear_dead_letters(self.name())
            .await
            .map_err(|e| self.map_err(&inner, e))?;

        info!(queue = %self.name(), count, "dead-letter queue cleared");
        self.emit(&inner, None, QueueEventKind::Purged { count });
        Ok(count)
    }

    /// Claim the next ready job for processing.
    ///
    /// Active jobs whose lease lapsed are failed first, so a worker that died
    /// mid-job costs one attempt instead of holding the job forever.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        let stalled = broker
            .recover_stalled(self.name())
            .await
            .map_err(|e| self.map_err(&inner, e))?;
        for (job, outcome) in stalled {
            warn!(
                queue = %self.name(),
                job_id = %job.id,
                attempt = job.attempts,
                "active job lease lapsed; counting the attempt as failed"
            );
            self.report_failure(&inner, &job, outcome, STALLED_ERROR);
        }

        let job = broker
            .claim_next(self.name())
            .await
            .map_err(|e| self.map_err(&inner, e))?;

        if let Some(job) = &job {
            debug!(queue = %self.name(), job_id = %job.id, attempt = job.attempts, "job claimed");
            self.emit(&inner, Some(job.id), QueueEventKind::Active);
        }
        Ok(job)
    }

    pub async fn complete(&self, id: JobId, return_value: Option<JsonValue>) -> Result<Job, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        let job = broker
            .complete(self.name(), id, return_value)
            .await
            .map_err(|e| self.map_err(&inner, e))?;

        let duration_ms = job.duration_ms().unwrap_or(0);
        inner.metrics.record_job_completed(self.name(), duration_ms);
        self.emit(&inner, Some(id), QueueEventKind::Completed { duration_ms });
        debug!(queue = %self.name(), job_id = %id, duration_ms, "job completed");
        Ok(job)
    }

    /// Record a failed attempt; the broker decides between retry and dead letter.
    pub async fn fail(&self, id: JobId, error: &str) -> Result<FailureOutcome, QueueError> {
        let inner = self.registry()?;
        let broker = self.broker(&inner).await?;
        let (job, outcome) = broker
            .fail(self.name(), id, error)
            .await
            .map_err(|e| self.map_err(&inner, e))?;

        self.report_failure(&inner, &job, outcome, error);
        Ok(outcome)
    }

    fn report_failure(&self, inner: &RegistryInner, job: &Job, outcome: FailureOutcome, error: &str) {
        let id = job.id;
        inner.metrics.record_job_failed(self.name(), job.duration_ms());

        match outcome {
            FailureOutcome::Retrying { attempts, retry_at } => {
                debug!(queue = %self.name(), job_id = %id, attempts, %retry_at, error, "job scheduled for retry");
                self.emit(
                    inner,
                    Some(id),
                    QueueEventKind::Retrying {
                        attempt: attempts,
                        retry_at,
                    },
                );
            }
            FailureOutcome::DeadLettered { attempts } => {
                inner.metrics.record_job_dead_lettered(self.name());
                warn!(queue = %self.name(), job_id = %id, attempts, error, "job dead-lettered");
                self.emit(
                    inner,
                    Some(id),
                    QueueEventKind::DeadLettered {
                        attempts,
                        error: error.to_string(),
                    },
                );
            }
        }
    }

    fn registry(&self) -> Result<Arc<RegistryInner>, QueueError> {
        self.registry.upgrade().ok_or_else(closed_error)
    }

    async fn broker(&self, inner: &Arc<RegistryInner>) -> Result<Arc<dyn Broker>, QueueError> {
        let broker = inner.broker().await?;
        let generation = inner.generation.load(Ordering::SeqCst);
        if self.shared.declared.load(Ordering::SeqCst) != generation {
            broker
                .ensure_queue(self.name(), &self.shared.options)
                .await
                .map_err(|e| inner.on_broker_error(e))?;
            self.shared.declared.store(generation, Ordering::SeqCst);
        }
        Ok(broker)
    }

    async fn enqueue(&self, inner: &Arc<RegistryInner>, job: Job) -> Result<JobId, QueueError> {
        let broker = self.broker(inner).await?;
        broker.enqueue(job).await.map_err(|e| self.map_err(inner, e))
    }

    fn map_err(&self, inner: &Arc<RegistryInner>, err: BrokerError) -> QueueError {
        match err {
            BrokerError::NotFound(id) => QueueError::JobNotFound {
                queue: self.name().to_string(),
                id,
            },
            other => inner.on_broker_error(other),
        }
    }

    fn emit(&self, inner: &RegistryInner, job_id: Option<JobId>, kind: QueueEventKind) {
        let now = inner.clock.now();
        let event = match job_id {
            Some(id) => QueueEvent::for_job(self.name(), id, kind, now),
            None => QueueEvent::for_queue(self.name(), kind, now),
        };
        // Nobody listening is fine.
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::{InMemoryBroker, InMemoryConnector};
    use modbridge_core::ManualClock;
    use modbridge_observability::metrics::names;
    use modbridge_observability::metrics::test_harness::MetricTestHarness;

    struct Fixture {
        registry: JobQueueRegistry,
        broker: Arc<InMemoryBroker>,
        clock: ManualClock,
        metrics: MetricTestHarness,
    }

    fn fixture(config: RegistryConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let broker = InMemoryBroker::arc(shared_clock.clone());
        let metrics = MetricTestHarness::new();
        let registry = JobQueueRegistry::new(
            Arc::new(InMemoryConnector::new(broker.clone())),
            config,
            shared_clock,
            metrics.metrics.clone(),
        );
        Fixture {
            registry,
            broker,
            clock,
            metrics,
        }
    }

    fn fast_reconnect() -> RegistryConfig {
        RegistryConfig {
            connect_attempts: 2,
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_queue_is_idempotent_and_validates_names() {
        let f = fixture(RegistryConfig::default());
        let a = f.registry.get_queue("moderation").unwrap();
        let b = f.registry.get_queue("moderation").unwrap();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        assert_eq!(a.options().retry.max_attempts, 3);

        for bad in ["", "has space", "slash/y"] {
            assert!(matches!(
                f.registry.get_queue(bad),
                Err(QueueError::InvalidQueueName(_))
            ));
        }
        assert_eq!(f.registry.queue_names(), vec!["moderation".to_string()]);
    }

    #[tokio::test]
    async fn add_job_connects_lazily_and_reports_status() {
        let f = fixture(RegistryConfig::default());
        assert!(!f.registry.connection_status().is_available);

        let id = f
            .registry
            .add_job("moderation", "BAN_USER", serde_json::json!({"targetUserId": "123"}), JobOptions::default())
            .await
            .unwrap();

        let status = f.registry.connection_status();
        assert!(status.is_available);
        assert_eq!(status.connection_attempts, 1);

        let job = f.registry.get_job_status("moderation", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.job_type, "BAN_USER");
        assert!(f.registry.get_job_status("moderation", JobId::new()).await.unwrap().is_none());

        let counts = f.registry.get_queue_metrics("moderation").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(f.metrics.counter(names::JOBS_QUEUED, &[("queue", "moderation")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_fails_fast_and_reconnects_in_background() {
        let f = fixture(fast_reconnect());
        f.broker.go_offline();

        let err = f
            .registry
            .add_job("moderation", "BAN_USER", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { attempts: 2, .. }));

        // Reconnect loop is running: no new connect attempt from the caller.
        let err = f.registry.get_queue_metrics("moderation").await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { attempts: 2, .. }));
        let status = f.registry.connection_status();
        assert!(!status.is_available);
        assert_eq!(status.last_error.as_deref(), Some("broker connection error: broker offline"));

        f.broker.go_online();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(f.registry.connection_status().is_available);
        f.registry
            .add_job("moderation", "BAN_USER", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_flips_availability() {
        let f = fixture(fast_reconnect());
        f.registry.connect().await.unwrap();

        f.broker.go_offline();
        let err = f.registry.get_queue_metrics("moderation").await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
        assert!(!f.registry.connection_status().is_available);

        f.broker.go_online();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = f.registry.connection_status();
        assert!(status.is_available);
        assert_eq!(status.connection_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_breaker_opens_on_repeated_unavailability() {
        let f = fixture(RegistryConfig {
            connect_attempts: 1,
            reconnect_base: Duration::from_secs(60),
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        f.broker.go_offline();

        let first = f
            .registry
            .add_job("moderation", "KICK", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(first, QueueError::Unavailable { .. }));

        let second = f
            .registry
            .add_job("moderation", "KICK", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            second,
            QueueError::CircuitOpen {
                breaker: "queue.moderation.enqueue".to_string()
            }
        );
    }

    #[tokio::test]
    async fn lifecycle_events_and_metrics() {
        let f = fixture(RegistryConfig::default());
        let queue = f.registry.get_queue("moderation").unwrap();
        let mut events = queue.events();

        let id = queue
            .add("TIMEOUT_USER", serde_json::json!({}), JobOptions::default())
            .await
            .unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        queue.complete(id, Some(serde_json::json!({"ok": true}))).await.unwrap();

        let kinds: Vec<QueueEventKind> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                QueueEventKind::Queued,
                QueueEventKind::Active,
                QueueEventKind::Completed { duration_ms: 0 }
            ]
        );
        assert_eq!(f.metrics.counter(names::JOBS_COMPLETED, &[("queue", "moderation")]), 1);
        assert_eq!(f.metrics.histogram(names::JOB_DURATION, &[("queue", "moderation")]), (1, 0.0));

        let done = queue.jobs(JobState::Completed, 10).await.unwrap();
        assert_eq!(done[0].return_value, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn dead_letter_release_and_clear() {
        let f = fixture(RegistryConfig::default());
        let queue = f.registry.get_queue("moderation").unwrap();
        let options = JobOptions::default().with_max_attempts(1);

        let a = queue.add("BAN_USER", serde_json::json!({}), options).await.unwrap();
        let b = queue.add("BAN_USER", serde_json::json!({}), options).await.unwrap();
        for id in [a, b] {
            queue.claim().await.unwrap();
            let outcome = queue.fail(id, "gateway timeout").await.unwrap();
            assert_eq!(outcome, FailureOutcome::DeadLettered { attempts: 1 });
        }
        assert_eq!(f.metrics.counter(names::JOBS_DEAD_LETTERED, &[("queue", "moderation")]), 2);

        let dead = f.registry.list_dead_letter_jobs("moderation", 10).await.unwrap();
        assert_eq!(dead.len(), 2);

        let mut events = queue.events();
        let new_id = f.registry.release_from_quarantine("moderation", a).await.unwrap();
        let released = queue.job(new_id).await.unwrap().unwrap();
        assert_eq!(released.attempts, 0);
        assert_eq!(released.state, JobState::Waiting);
        assert_eq!(released.released_from, Some(a));
        assert_eq!(
            events.try_recv().unwrap().kind,
            QueueEventKind::Released { new_job_id: new_id }
        );

        assert!(matches!(
            f.registry.release_from_quarantine("moderation", a).await,
            Err(QueueError::JobNotFound { .. })
        ));

        assert_eq!(f.registry.clear_dead_letter_queue("moderation").await.unwrap(), 1);
        assert_eq!(events.try_recv().unwrap().kind, QueueEventKind::Purged { count: 1 });
        assert!(f.registry.list_dead_letter_jobs("moderation", 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn job_left_active_by_a_lost_settle_is_retried_after_its_lease() {
        let f = fixture(fast_reconnect());
        let queue = f.registry.get_queue("moderation").unwrap();
        let options = JobOptions::default().with_max_attempts(2);
        let id = queue.add("BAN_USER", serde_json::json!({}), options).await.unwrap();
        queue.claim().await.unwrap().unwrap();

        f.broker.go_offline();
        let err = queue.complete(id, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
        f.broker.go_online();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.registry.connection_status().is_available);

        let mut events = queue.events();
        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.metrics().await.unwrap().active, 1);

        f.clock.advance(Duration::from_secs(30));
        assert!(queue.claim().await.unwrap().is_none());
        assert!(matches!(
            events.try_recv().unwrap().kind,
            QueueEventKind::Retrying { attempt: 1, .. }
        ));
        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Delayed);
        assert_eq!(status.last_error.as_deref(), Some(STALLED_ERROR));
        assert_eq!(f.metrics.counter(names::JOBS_FAILED, &[("queue", "moderation")]), 1);

        f.clock.advance(Duration::from_secs(2));
        let again = queue.claim().await.unwrap().unwrap();
        assert_eq!((again.id, again.attempts), (id, 2));
    }

    #[tokio::test]
    async fn shutdown_rejects_further_calls() {
        let f = fixture(RegistryConfig::default());
        f.registry.connect().await.unwrap();
        f.registry.shutdown();

        let err = f.registry.get_queue_metrics("moderation").await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { attempts: 0, .. }));
        assert!(!f.registry.connection_status().is_available);
    }
}
