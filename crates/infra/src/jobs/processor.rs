//! Type-based job dispatch.
//!
//! Processors declare the job types they accept; the dispatcher builds a
//! `job type -> processor` table once at construction and never changes it.
//! Handler failures, missing handlers and panics all come back as a
//! [`ProcessorResult`] with `success = false`; nothing propagates to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use modbridge_core::{Clock, SystemClock};

use super::types::Job;

/// Code that knows how to execute one or more job types.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    /// Stable name used in stats and logs.
    fn name(&self) -> &str;

    /// Job types this processor owns.
    fn job_types(&self) -> Vec<String>;

    /// Execute the job. `Ok(Some(data))` is attached to the job as its return value.
    async fn process_job(&self, job: &Job) -> anyhow::Result<Option<JsonValue>>;
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessorResult {
    pub fn ok(data: Option<JsonValue>, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp,
        }
    }

    pub fn failed(error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp,
        }
    }
}

/// Invalid processor set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchConfigError {
    #[error("job type {job_type:?} is claimed by both {first:?} and {second:?}")]
    DuplicateJobType {
        job_type: String,
        first: String,
        second: String,
    },
    #[error("processor name {0:?} is registered twice")]
    DuplicateProcessorName(String),
    #[error("processor {0:?} declares no job types")]
    EmptyJobTypes(String),
}

/// Per-processor counters, as reported by [`ProcessorDispatcher::processor_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub name: String,
    pub job_types: Vec<String>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

struct Registered {
    processor: Arc<dyn JobProcessor>,
    name: String,
    job_types: Vec<String>,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Routes jobs to processors by `job.job_type`.
pub struct ProcessorDispatcher {
    processors: Vec<Registered>,
    routes: HashMap<String, usize>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for ProcessorDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessorDispatcher")
            .field("processors", &self.processors.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl ProcessorDispatcher {
    /// Build the routing table. Two processors claiming one type is an error.
    pub fn new(processors: Vec<Arc<dyn JobProcessor>>) -> Result<Self, DispatchConfigError> {
        let mut registered: Vec<Registered> = Vec::with_capacity(processors.len());
        let mut routes: HashMap<String, usize> = HashMap::new();

        for processor in processors {
            let name = processor.name().to_string();
            if registered.iter().any(|r| r.name == name) {
                return Err(DispatchConfigError::DuplicateProcessorName(name));
            }

            let mut job_types = processor.job_types();
            job_types.sort();
            job_types.dedup();
            if job_types.is_empty() {
                return Err(DispatchConfigError::EmptyJobTypes(name));
            }

            let index = registered.len();
            for job_type in &job_types {
                if let Some(&owner) = routes.get(job_type) {
                    return Err(DispatchConfigError::DuplicateJobType {
                        job_type: job_type.clone(),
                        first: registered[owner].name.clone(),
                        second: name,
                    });
                }
                routes.insert(job_type.clone(), index);
            }

            debug!(processor = %name, job_types = ?job_types, "processor registered");
            registered.push(Registered {
                processor,
                name,
                job_types,
                processed: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            });
        }

        Ok(Self {
            processors: registered,
            routes,
            clock: SystemClock::shared(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handles(&self, job_type: &str) -> bool {
        self.routes.contains_key(job_type)
    }

    /// Every routed job type, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the processor for `job.job_type` and capture its outcome.
    pub async fn process_job(&self, job: &Job) -> ProcessorResult {
        let Some(&index) = self.routes.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no processor for job type");
            return ProcessorResult::failed(
                format!("no processor for type {}", job.job_type),
                self.clock.now(),
            );
        };
        let registered = &self.processors[index];
        registered.processed.fetch_add(1, Ordering::Relaxed);

        // A separate task turns a panicking handler into a failed result.
        let processor = registered.processor.clone();
        let owned = job.clone();
        let outcome = tokio::spawn(async move { processor.process_job(&owned).await }).await;

        let result = match outcome {
            Ok(Ok(data)) => ProcessorResult::ok(data, self.clock.now()),
            Ok(Err(err)) => ProcessorResult::failed(format!("{err:#}"), self.clock.now()),
            Err(join) if join.is_panic() => {
                ProcessorResult::failed("processor panicked", self.clock.now())
            }
            Err(_) => ProcessorResult::failed("processor cancelled", self.clock.now()),
        };

        if result.success {
            registered.succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(processor = %registered.name, job_id = %job.id, "job processed");
        } else {
            registered.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                processor = %registered.name,
                job_id = %job.id,
                job_type = %job.job_type,
                error = result.error.as_deref().unwrap_or(""),
                "processor failed"
            );
        }
        result
    }

    pub fn processor_stats(&self) -> Vec<ProcessorStats> {
        self.processors
            .iter()
            .map(|r| ProcessorStats {
                name: r.name.clone(),
                job_types: r.job_types.clone(),
                processed: r.processed.load(Ordering::Relaxed),
                succeeded: r.succeeded.load(Ordering::Relaxed),
                failed: r.failed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use anyhow::Context;

    use crate::jobs::types::{JobOptions, RetryPolicy};

    struct Recording {
        name: &'static str,
        types: &'static [&'static str],
        calls: AtomicUsize,
    }

    impl Recording {
        fn new(name: &'static str, types: &'static [&'static str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                types,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl JobProcessor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn job_types(&self) -> Vec<String> {
            self.types.iter().map(|t| t.to_string()).collect()
        }

        async fn process_job(&self, job: &Job) -> anyhow::Result<Option<JsonValue>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(serde_json::json!({ "handled": job.job_type })))
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl JobProcessor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn job_types(&self) -> Vec<String> {
            vec!["BAN_USER".to_string()]
        }

        async fn process_job(&self, _job: &Job) -> anyhow::Result<Option<JsonValue>> {
            Err(anyhow::anyhow!("missing permissions")).context("ban failed")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl JobProcessor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn job_types(&self) -> Vec<String> {
            vec!["EXPLODE".to_string()]
        }

        async fn process_job(&self, _job: &Job) -> anyhow::Result<Option<JsonValue>> {
            panic!("boom")
        }
    }

    fn job(job_type: &str) -> Job {
        Job::new(
            "q",
            job_type,
            serde_json::json!({}),
            &RetryPolicy::default(),
            &JobOptions::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn routes_by_job_type() {
        let a = Recording::new("a", &["X"]);
        let b = Recording::new("b", &["Y", "W"]);
        let processors: Vec<Arc<dyn JobProcessor>> = vec![a.clone(), b.clone()];
        let clock = modbridge_core::ManualClock::starting_now();
        let dispatcher = ProcessorDispatcher::new(processors)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        let result = dispatcher.process_job(&job("W")).await;
        assert!(result.success);
        assert_eq!(result.timestamp, clock.now());
        assert_eq!(result.data, Some(serde_json::json!({"handled": "W"})));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.job_types(), vec!["W", "X", "Y"]);
    }

    #[tokio::test]
    async fn unknown_type_invokes_nobody() {
        let a = Recording::new("a", &["X"]);
        let b = Recording::new("b", &["Y"]);
        let processors: Vec<Arc<dyn JobProcessor>> = vec![a.clone(), b.clone()];
        let dispatcher = ProcessorDispatcher::new(processors).unwrap();

        let result = dispatcher.process_job(&job("Z")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no processor for type Z"));
        assert_eq!(a.calls.load(Ordering::SeqCst) + b.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let clashing: Vec<Arc<dyn JobProcessor>> =
            vec![Recording::new("a", &["X"]), Recording::new("b", &["Y", "X"])];
        let err = ProcessorDispatcher::new(clashing).unwrap_err();
        assert_eq!(
            err,
            DispatchConfigError::DuplicateJobType {
                job_type: "X".to_string(),
                first: "a".to_string(),
                second: "b".to_string(),
            }
        );

        let same_name: Vec<Arc<dyn JobProcessor>> =
            vec![Recording::new("a", &["X"]), Recording::new("a", &["Y"])];
        let err = ProcessorDispatcher::new(same_name).unwrap_err();
        assert_eq!(err, DispatchConfigError::DuplicateProcessorName("a".to_string()));

        let empty: Vec<Arc<dyn JobProcessor>> = vec![Recording::new("empty", &[])];
        let err = ProcessorDispatcher::new(empty).unwrap_err();
        assert_eq!(err, DispatchConfigError::EmptyJobTypes("empty".to_string()));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_results() {
        let processors: Vec<Arc<dyn JobProcessor>> = vec![Arc::new(Failing), Arc::new(Panicking)];
        let dispatcher = ProcessorDispatcher::new(processors).unwrap();

        let failed = dispatcher.process_job(&job("BAN_USER")).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("ban failed: missing permissions"));

        let panicked = dispatcher.process_job(&job("EXPLODE")).await;
        assert_eq!(panicked.error.as_deref(), Some("processor panicked"));

        let stats = dispatcher.processor_stats();
        assert_eq!(stats[0].name, "failing");
        assert_eq!((stats[0].processed, stats[0].failed), (1, 1));
        assert_eq!(stats[1].job_types, vec!["EXPLODE".to_string()]);
    }
}
