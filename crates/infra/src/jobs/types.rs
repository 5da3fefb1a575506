//! Core job types and policies.

use std::time::Duration;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use modbridge_core::JobId;

/// Where a job currently sits in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready, waiting to be picked up
    Waiting,
    /// Scheduled for later (explicit delay or retry backoff)
    Delayed,
    /// Claimed by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts; held in the dead-letter view
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            delay,
            max_delay: delay,
        }
    }

    pub fn exponential(delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay,
            max_delay,
        }
    }

    pub fn linear(delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
                self.delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay.max(self.delay))
    }
}

/// Retry policy applied to every job of a queue unless overridden per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first run (1 = never retried)
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::fixed(delay),
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_delay, max_delay),
        }
    }
}

/// Per-queue settings, fixed when the queue is first declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub retry: RetryPolicy,
    /// Completed jobs retained for inspection (oldest evicted first)
    pub keep_completed: usize,
    /// Dead-lettered jobs retained (oldest evicted first)
    pub keep_failed: usize,
    /// How long a claimed job may stay active before it counts as a failed attempt
    #[serde(default = "default_stall_timeout", with = "duration_ms")]
    pub stall_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            keep_completed: 100,
            keep_failed: 50,
            stall_timeout: default_stall_timeout(),
        }
    }
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Failure recorded for an attempt whose lease ran out.
pub const STALLED_ERROR: &str = "job stalled: lease expired before it was settled";

/// Per-job overrides passed to `add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttemptRecord {
    pub attempt: u32,
    #[serde(with = "ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A queued job, as stored by the broker.
///
/// The application only ever holds copies; the broker owns the authoritative record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: JsonValue,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// While active: when the claim lapses and the attempt is treated as failed
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub state: JobState,
    /// Earliest time the job may be claimed
    #[serde(with = "ts_milliseconds")]
    pub ready_at: DateTime<Utc>,
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<JsonValue>,
    /// Dead-lettered job this one was re-created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_from: Option<JobId>,
    #[serde(default)]
    pub history: Vec<JobAttemptRecord>,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for another attempt at `retry_at`.
    Retrying { attempts: u32, retry_at: DateTime<Utc> },
    /// Out of attempts; moved to the dead-letter view.
    DeadLettered { attempts: u32 },
}

impl Job {
    /// Create a new job using the queue policy and per-job overrides.
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: JsonValue,
        policy: &RetryPolicy,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, ready_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, saturating_add(now, delay)),
            _ => (JobState::Waiting, now),
        };

        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(policy.max_attempts).max(1),
            created_at: now,
            processed_at: None,
            finished_at: None,
            lease_until: None,
            last_error: None,
            state,
            ready_at,
            backoff: options.backoff.unwrap_or(policy.backoff),
            return_value: None,
            released_from: None,
            history: Vec::new(),
        }
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.ready_at <= now
    }

    /// Mark job as claimed by a worker, holding it for `lease`.
    pub fn mark_active(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.processed_at = Some(now);
        self.lease_until = Some(saturating_add(now, lease));
    }

    /// Active past its lease: the worker died or could not settle it.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_until.is_some_and(|until| until <= now)
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>, return_value: Option<JsonValue>) {
        self.push_history(now, true, None);
        self.lease_until = None;
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.return_value = return_value;
    }

    /// Mark the current attempt as failed and decide between retry and dead letter.
    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> FailureOutcome {
        let error = error.into();
        self.push_history(now, false, Some(error.clone()));
        self.last_error = Some(error);
        self.lease_until = None;

        if self.attempts < self.max_attempts {
            let retry_at = saturating_add(now, self.backoff.delay_for_attempt(self.attempts));
            self.state = JobState::Delayed;
            self.ready_at = retry_at;
            FailureOutcome::Retrying {
                attempts: self.attempts,
                retry_at,
            }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            FailureOutcome::DeadLettered {
                attempts: self.attempts,
            }
        }
    }

    /// Fresh copy of a dead-lettered job: new id, zero attempts, no failure trace.
    pub fn released(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue_name: self.queue_name.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            processed_at: None,
            finished_at: None,
            lease_until: None,
            last_error: None,
            state: JobState::Waiting,
            ready_at: now,
            backoff: self.backoff,
            return_value: None,
            released_from: Some(self.id),
            history: Vec::new(),
        }
    }

    /// Milliseconds between claim and finish of the latest attempt.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.processed_at?;
        let finished = self.finished_at.or_else(|| self.history.last().map(|r| r.finished_at))?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }

    fn push_history(&mut self, now: DateTime<Utc>, success: bool, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at: self.processed_at.unwrap_or(now),
            finished_at: now,
            success,
            error,
        });
    }
}

/// Read view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub return_value: Option<JsonValue>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
            last_error: job.last_error.clone(),
            return_value: job.return_value.clone(),
        }
    }
}

/// Point-in-time job counts for one queue. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Entry in the dead-letter view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn from_job(job: Job) -> Self {
        Self {
            dead_lettered_at: job.finished_at.unwrap_or(job.created_at),
            reason: job.last_error.clone().unwrap_or_default(),
            job,
        }
    }
}

/// `at + d`, clamped to the latest representable instant instead of overflowing.
pub(crate) fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn job_with(policy: RetryPolicy) -> Job {
        Job::new(
            "moderation",
            "BAN_USER",
            serde_json::json!({"targetUserId": "123"}),
            &policy,
            &JobOptions::default(),
            now(),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::exponential(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = Backoff::fixed(Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = Backoff::linear(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn delayed_option_schedules_job() {
        let job = Job::new(
            "q",
            "T",
            serde_json::json!({}),
            &RetryPolicy::default(),
            &JobOptions::delayed(Duration::from_secs(10)),
            now(),
        );
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_ready(now()));
        assert!(job.is_ready(now() + chrono::Duration::seconds(10)));
    }

    #[test]
    fn per_job_options_override_the_queue_policy() {
        let job = Job::new(
            "q",
            "T",
            serde_json::json!({}),
            &RetryPolicy::default(),
            &JobOptions::default()
                .with_max_attempts(5)
                .with_backoff(Backoff::fixed(Duration::from_millis(250))),
            now(),
        );
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff.delay_for_attempt(4), Duration::from_millis(250));
    }

    #[test]
    fn oversized_delays_clamp_instead_of_overflowing() {
        let job = Job::new(
            "q",
            "T",
            serde_json::json!({}),
            &RetryPolicy::default(),
            &JobOptions::delayed(Duration::from_secs(u64::MAX)),
            now(),
        );
        assert_eq!(job.ready_at, DateTime::<Utc>::MAX_UTC);

        let mut job = job_with(RetryPolicy::fixed(3, Duration::MAX));
        job.mark_active(now(), LEASE);
        assert_eq!(
            job.mark_failed(now(), "boom"),
            FailureOutcome::Retrying {
                attempts: 1,
                retry_at: DateTime::<Utc>::MAX_UTC
            }
        );
        assert_eq!(job.state, JobState::Delayed);
    }

    #[test]
    fn default_policy_retries_after_two_and_four_seconds_then_dead_letters() {
        let mut job = job_with(RetryPolicy::default());
        let mut t = now();

        job.mark_active(t, LEASE);
        let first = job.mark_failed(t, "boom");
        assert_eq!(
            first,
            FailureOutcome::Retrying {
                attempts: 1,
                retry_at: t + chrono::Duration::seconds(2)
            }
        );

        t += chrono::Duration::seconds(2);
        job.mark_active(t, LEASE);
        let second = job.mark_failed(t, "boom");
        assert_eq!(
            second,
            FailureOutcome::Retrying {
                attempts: 2,
                retry_at: t + chrono::Duration::seconds(4)
            }
        );

        t += chrono::Duration::seconds(4);
        job.mark_active(t, LEASE);
        assert_eq!(
            job.mark_failed(t, "boom"),
            FailureOutcome::DeadLettered { attempts: 3 }
        );
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.history.len(), 3);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn completion_records_return_value_and_duration() {
        let mut job = job_with(RetryPolicy::default());
        job.mark_active(now(), LEASE);
        job.mark_completed(
            now() + chrono::Duration::milliseconds(150),
            Some(serde_json::json!({"ok": true})),
        );

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.duration_ms(), Some(150));
        assert!(job.history[0].success);
    }

    #[test]
    fn release_resets_attempts_and_links_origin() {
        let mut job = job_with(RetryPolicy::no_retry());
        job.mark_active(now(), LEASE);
        job.mark_failed(now(), "nope");

        let released = job.released(now());
        assert_ne!(released.id, job.id);
        assert_eq!(released.attempts, 0);
        assert_eq!(released.state, JobState::Waiting);
        assert_eq!(released.last_error, None);
        assert_eq!(released.released_from, Some(job.id));
        assert_eq!(released.payload, job.payload);
    }

    #[test]
    fn lease_marks_stall_and_settling_clears_it() {
        let mut job = job_with(RetryPolicy::default());
        job.mark_active(now(), LEASE);

        assert_eq!(job.lease_until, Some(now() + chrono::Duration::seconds(30)));
        assert!(!job.is_stalled(now() + chrono::Duration::seconds(29)));
        assert!(job.is_stalled(now() + chrono::Duration::seconds(30)));

        job.mark_failed(now(), STALLED_ERROR);
        assert_eq!(job.lease_until, None);
        assert!(!job.is_stalled(now() + chrono::Duration::days(1)));
    }

    #[test]
    fn queue_options_without_stall_timeout_deserialize_with_default() {
        let options: QueueOptions = serde_json::from_value(serde_json::json!({
            "retry": serde_json::to_value(RetryPolicy::default()).unwrap(),
            "keepCompleted": 10,
            "keepFailed": 5
        }))
        .unwrap();
        assert_eq!(options.stall_timeout, Duration::from_secs(30));
    }

    #[test]
    fn job_serializes_wire_shape() {
        let job = job_with(RetryPolicy::default());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "BAN_USER");
        assert_eq!(value["queueName"], "moderation");
        assert_eq!(value["maxAttempts"], 3);
        assert_eq!(value["createdAt"], 1_700_000_000_000i64);
        assert!(value.get("lastError").is_none());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never shrink as attempts grow and never exceed the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..600_000,
            attempt in 1u32..64
        ) {
            let backoff = Backoff::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let cap = Duration::from_millis(cap_ms.max(base_ms));
            let a = backoff.delay_for_attempt(attempt);
            let b = backoff.delay_for_attempt(attempt + 1);
            prop_assert!(a <= b);
            prop_assert!(b <= cap);
        }
    }
}
