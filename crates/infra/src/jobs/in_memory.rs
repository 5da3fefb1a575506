//! In-memory broker for tests and single-process deployments.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use modbridge_core::Clock;

use super::broker::{Broker, BrokerConnector, BrokerError, ReleasedJob};
use super::types::{
    DeadLetterEntry, FailureOutcome, Job, JobId, JobState, QueueMetricsSnapshot, QueueOptions,
    STALLED_ERROR,
};

#[derive(Debug, Default)]
struct QueueData {
    options: QueueOptions,
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    active: HashSet<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl QueueData {
    fn with_options(options: QueueOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(ready_at, id)) = self.delayed.first() {
            if ready_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.waiting.push_back(id);
        }
    }

    fn take_active(&mut self, id: JobId) -> Result<&mut Job, BrokerError> {
        if !self.jobs.contains_key(&id) {
            return Err(BrokerError::NotFound(id));
        }
        if !self.active.remove(&id) {
            return Err(BrokerError::Command(format!("job {id} is not active")));
        }
        self.jobs.get_mut(&id).ok_or(BrokerError::NotFound(id))
    }

    fn route_failure(&mut self, id: JobId, outcome: FailureOutcome) {
        match outcome {
            FailureOutcome::Retrying { retry_at, .. } => {
                self.delayed.insert((retry_at, id));
            }
            FailureOutcome::DeadLettered { .. } => {
                self.failed.push_back(id);
                let keep = self.options.keep_failed;
                QueueData::trim(&mut self.failed, &mut self.jobs, keep);
            }
        }
    }

    fn trim(history: &mut VecDeque<JobId>, jobs: &mut HashMap<JobId, Job>, keep: usize) {
        while history.len() > keep {
            if let Some(evicted) = history.pop_front() {
                jobs.remove(&evicted);
            }
        }
    }

    fn collect<'a>(&self, ids: impl Iterator<Item = &'a JobId>, limit: usize) -> Vec<Job> {
        ids.filter_map(|id| self.jobs.get(id).cloned()).take(limit).collect()
    }
}

/// In-memory broker.
///
/// - No IO; time comes from the injected clock
/// - Completed and dead-lettered history is bounded per queue
/// - Can be taken offline to exercise the registry's connection handling
#[derive(Debug)]
pub struct InMemoryBroker {
    clock: Arc<dyn Clock>,
    queues: RwLock<HashMap<String, QueueData>>,
    online: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queues: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Simulate losing the connection: every call fails with `BrokerError::Connection`.
    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BrokerError::Connection("broker offline".to_string()))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, QueueData>>, BrokerError> {
        self.check_online()?;
        Ok(self.queues.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, QueueData>>, BrokerError> {
        self.check_online()?;
        Ok(self.queues.write().unwrap_or_else(|p| p.into_inner()))
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_online()
    }

    async fn ensure_queue(&self, queue: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut queues = self.write()?;
        queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueData::with_options(*options));
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, BrokerError> {
        let mut queues = self.write()?;
        let data = queues.entry(job.queue_name.clone()).or_default();
        if data.jobs.contains_key(&job.id) {
            return Err(BrokerError::Command(format!("job already exists: {}", job.id)));
        }

        let id = job.id;
        match job.state {
            JobState::Delayed => {
                data.delayed.insert((job.ready_at, id));
            }
            _ => data.waiting.push_back(id),
        }
        data.jobs.insert(id, job);
        Ok(id)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, BrokerError> {
        let queues = self.read()?;
        Ok(queues.get(queue).and_then(|q| q.jobs.get(&id)).cloned())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, BrokerError> {
        let now = self.clock.now();
        let mut queues = self.write()?;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(None);
        };

        data.promote_due(now);
        let lease = data.options.stall_timeout;
        while let Some(id) = data.waiting.pop_front() {
            // Ids whose job was evicted or released are skipped.
            if let Some(job) = data.jobs.get_mut(&id) {
                job.mark_active(now, lease);
                data.active.insert(id);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        return_value: Option<JsonValue>,
    ) -> Result<Job, BrokerError> {
        let now = self.clock.now();
        let mut queues = self.write()?;
        let data = queues.get_mut(queue).ok_or(BrokerError::NotFound(id))?;

        let job = data.take_active(id)?;
        job.mark_completed(now, return_value);
        let snapshot = job.clone();

        data.completed.push_back(id);
        let keep = data.options.keep_completed;
        QueueData::trim(&mut data.completed, &mut data.jobs, keep);
        Ok(snapshot)
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        error: &str,
    ) -> Result<(Job, FailureOutcome), BrokerError> {
        let now = self.clock.now();
        let mut queues = self.write()?;
        let data = queues.get_mut(queue).ok_or(BrokerError::NotFound(id))?;

        let job = data.take_active(id)?;
        let outcome = job.mark_failed(now, error);
        let snapshot = job.clone();

        data.route_failure(id, outcome);
        Ok((snapshot, outcome))
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<(Job, FailureOutcome)>, BrokerError> {
        let now = self.clock.now();
        let mut queues = self.write()?;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut stalled: Vec<JobId> = data
            .active
            .iter()
            .copied()
            .filter(|id| data.jobs.get(id).is_some_and(|job| job.is_stalled(now)))
            .collect();
        stalled.sort();

        let mut recovered = Vec::with_capacity(stalled.len());
        for id in stalled {
            let job = data.take_active(id)?;
            let outcome = job.mark_failed(now, STALLED_ERROR);
            let snapshot = job.clone();
            data.route_failure(id, outcome);
            recovered.push((snapshot, outcome));
        }
        Ok(recovered)
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetricsSnapshot, BrokerError> {
        let queues = self.read()?;
        Ok(queues
            .get(queue)
            .map(|q| QueueMetricsSnapshot {
                waiting: q.waiting.len() as u64,
                active: q.active.len() as u64,
                completed: q.completed.len() as u64,
                failed: q.failed.len() as u64,
                delayed: q.delayed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError> {
        let queues = self.read()?;
        let Some(q) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        let jobs = match state {
            JobState::Waiting => q.collect(q.waiting.iter(), limit),
            JobState::Delayed => q.collect(q.delayed.iter().map(|(_, id)| id), limit),
            JobState::Active => {
                let mut active = q.collect(q.active.iter(), usize::MAX);
                active.sort_by_key(|j| (j.processed_at, j.id));
                active.truncate(limit);
                active
            }
            // Newest first.
            JobState::Completed => q.collect(q.completed.iter().rev(), limit),
            JobState::Failed => q.collect(q.failed.iter().rev(), limit),
        };
        Ok(jobs)
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let jobs = self.list_by_state(queue, JobState::Failed, limit).await?;
        Ok(jobs.into_iter().map(DeadLetterEntry::from_job).collect())
    }

    async fn release_dead_letter(&self, queue: &str, id: JobId) -> Result<ReleasedJob, BrokerError> {
        let now = self.clock.now();
        let mut queues = self.write()?;
        let data = queues.get_mut(queue).ok_or(BrokerError::NotFound(id))?;

        let position = data
            .failed
            .iter()
            .position(|candidate| *candidate == id)
            .ok_or(BrokerError::NotFound(id))?;
        data.failed.remove(position);
        let previous = data.jobs.remove(&id).ok_or(BrokerError::NotFound(id))?;

        let job = previous.released(now);
        data.waiting.push_back(job.id);
        data.jobs.insert(job.id, job.clone());

        Ok(ReleasedJob { previous, job })
    }

    async fn clear_dead_letters(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut queues = self.write()?;
        let Some(data) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let purged: Vec<JobId> = data.failed.drain(..).collect();
        for id in &purged {
            data.jobs.remove(id);
        }
        Ok(purged.len() as u64)
    }
}

/// Connector handing out a shared [`InMemoryBroker`].
///
/// Connecting fails while the broker is offline, which is how tests model an
/// unreachable broker.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait::async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.broker.check_online()?;
        let broker: Arc<dyn Broker> = self.broker.clone();
        Ok(broker)
    }
}
