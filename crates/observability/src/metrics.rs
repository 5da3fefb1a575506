use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Instrument names shared by every component.
pub mod names {
    pub const JOBS_QUEUED: &str = "modbridge.jobs.queued";
    pub const JOBS_COMPLETED: &str = "modbridge.jobs.completed";
    pub const JOBS_FAILED: &str = "modbridge.jobs.failed";
    pub const JOBS_DEAD_LETTERED: &str = "modbridge.jobs.dead_lettered";
    pub const JOB_DURATION: &str = "modbridge.job.duration";

    pub const BREAKER_CALLS: &str = "modbridge.breaker.calls";
    pub const BREAKER_TRANSITIONS: &str = "modbridge.breaker.transitions";
    pub const BREAKER_ERROR_RATE: &str = "modbridge.breaker.error_rate";

    pub const THROTTLE_REJECTIONS: &str = "modbridge.throttle.rejections";

    pub const QUERIES: &str = "modbridge.queries";
}

/// OTel instruments for the coordination components.
///
/// Created once at process start and shared as `Arc<Metrics>`. Without a
/// configured meter provider every instrument is a no-op.
pub struct Metrics {
    jobs_queued: Counter<u64>,
    jobs_completed: Counter<u64>,
    jobs_failed: Counter<u64>,
    jobs_dead_lettered: Counter<u64>,
    job_duration: Histogram<f64>,
    breaker_calls: Counter<u64>,
    breaker_transitions: Counter<u64>,
    breaker_error_rate: Gauge<f64>,
    throttle_rejections: Counter<u64>,
    queries: Counter<u64>,
}

impl core::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Instruments from the global meter provider.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("modbridge");
        Self::from_meter(&meter)
    }

    /// Shareable handle on the global meter, the form components take it in.
    pub fn shared() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            jobs_queued: meter
                .u64_counter(names::JOBS_QUEUED)
                .with_description("Jobs enqueued")
                .build(),
            jobs_completed: meter
                .u64_counter(names::JOBS_COMPLETED)
                .with_description("Jobs completed successfully")
                .build(),
            jobs_failed: meter
                .u64_counter(names::JOBS_FAILED)
                .with_description("Failed job attempts")
                .build(),
            jobs_dead_lettered: meter
                .u64_counter(names::JOBS_DEAD_LETTERED)
                .with_description("Jobs moved to the dead-letter view")
                .build(),
            job_duration: meter
                .f64_histogram(names::JOB_DURATION)
                .with_description("Time between claim and settle of an attempt")
                .with_unit("ms")
                .build(),
            breaker_calls: meter
                .u64_counter(names::BREAKER_CALLS)
                .with_description("Calls through a circuit breaker by outcome")
                .build(),
            breaker_transitions: meter
                .u64_counter(names::BREAKER_TRANSITIONS)
                .with_description("Circuit breaker state changes by target state")
                .build(),
            breaker_error_rate: meter
                .f64_gauge(names::BREAKER_ERROR_RATE)
                .with_description("Share of breaker requests that did not succeed")
                .build(),
            throttle_rejections: meter
                .u64_counter(names::THROTTLE_REJECTIONS)
                .with_description("Actions rejected by the rate limiter")
                .build(),
            queries: meter
                .u64_counter(names::QUERIES)
                .with_description("Cross-process queries by outcome")
                .build(),
        }
    }

    pub fn record_job_queued(&self, queue: &str) {
        self.jobs_queued.add(1, &[queue_attr(queue)]);
    }

    pub fn record_job_completed(&self, queue: &str, duration_ms: u64) {
        let attrs = [queue_attr(queue)];
        self.jobs_completed.add(1, &attrs);
        self.job_duration.record(duration_ms as f64, &attrs);
    }

    /// A failed attempt; `duration_ms` is absent when the attempt never started.
    pub fn record_job_failed(&self, queue: &str, duration_ms: Option<u64>) {
        let attrs = [queue_attr(queue)];
        self.jobs_failed.add(1, &attrs);
        if let Some(duration_ms) = duration_ms {
            self.job_duration.record(duration_ms as f64, &attrs);
        }
    }

    pub fn record_job_dead_lettered(&self, queue: &str) {
        self.jobs_dead_lettered.add(1, &[queue_attr(queue)]);
    }

    /// `outcome` is one of `success`, `failure`, `rejected`.
    pub fn record_breaker_call(&self, breaker: &str, outcome: &'static str) {
        self.breaker_calls.add(
            1,
            &[
                KeyValue::new("breaker", breaker.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn record_breaker_transition(&self, breaker: &str, state: &'static str) {
        self.breaker_transitions.add(
            1,
            &[
                KeyValue::new("breaker", breaker.to_string()),
                KeyValue::new("state", state),
            ],
        );
    }

    pub fn record_breaker_error_rate(&self, breaker: &str, rate: f64) {
        self.breaker_error_rate
            .record(rate, &[KeyValue::new("breaker", breaker.to_string())]);
    }

    pub fn record_throttle_rejection(&self, action: &str) {
        self.throttle_rejections
            .add(1, &[KeyValue::new("action", action.to_string())]);
    }

    pub fn record_query(&self, event: &str, outcome: &'static str) {
        self.queries.add(
            1,
            &[
                KeyValue::new("event", event.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}

/// Test harness wiring [`Metrics`] to an in-memory exporter.
#[cfg(any(test, feature = "testing"))]
pub mod test_harness {
    use std::sync::Arc;

    use opentelemetry::KeyValue;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics};
    use opentelemetry_sdk::metrics::in_memory_exporter::InMemoryMetricExporter;
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    use super::Metrics;

    /// Metrics bound to a private meter provider whose exports stay in memory.
    pub struct MetricTestHarness {
        pub metrics: Arc<Metrics>,
        exporter: InMemoryMetricExporter,
        meter_provider: SdkMeterProvider,
    }

    impl Default for MetricTestHarness {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MetricTestHarness {
        pub fn new() -> Self {
            let exporter = InMemoryMetricExporter::default();
            let reader = PeriodicReader::builder(exporter.clone()).build();
            let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();
            let meter = meter_provider.meter("modbridge-test");
            Self {
                metrics: Arc::new(Metrics::from_meter(&meter)),
                exporter,
                meter_provider,
            }
        }

        /// Current counter value for the series with exactly `attrs` (0 if absent).
        pub fn counter(&self, name: &str, attrs: &[(&'static str, &str)]) -> u64 {
            let expected = key_values(attrs);
            self.latest(name, |data| match data {
                AggregatedMetrics::U64(MetricData::Sum(sum)) => sum
                    .data_points()
                    .find(|dp| same_attrs(dp.attributes(), &expected))
                    .map(|dp| dp.value()),
                _ => None,
            })
            .unwrap_or(0)
        }

        /// `(count, sum)` of a histogram series with exactly `attrs`.
        pub fn histogram(&self, name: &str, attrs: &[(&'static str, &str)]) -> (u64, f64) {
            let expected = key_values(attrs);
            self.latest(name, |data| match data {
                AggregatedMetrics::F64(MetricData::Histogram(histogram)) => histogram
                    .data_points()
                    .find(|dp| same_attrs(dp.attributes(), &expected))
                    .map(|dp| (dp.count(), dp.sum())),
                _ => None,
            })
            .unwrap_or((0, 0.0))
        }

        /// Last recorded gauge value for the series with exactly `attrs`.
        pub fn gauge(&self, name: &str, attrs: &[(&'static str, &str)]) -> Option<f64> {
            let expected = key_values(attrs);
            self.latest(name, |data| match data {
                AggregatedMetrics::F64(MetricData::Gauge(gauge)) => gauge
                    .data_points()
                    .find(|dp| same_attrs(dp.attributes(), &expected))
                    .map(|dp| dp.value()),
                _ => None,
            })
        }

        /// Export the cumulative state once and search it.
        fn latest<T>(&self, name: &str, read: impl Fn(&AggregatedMetrics) -> Option<T>) -> Option<T> {
            self.exporter.reset();
            let _ = self.meter_provider.force_flush();
            let exported: Vec<ResourceMetrics> =
                self.exporter.get_finished_metrics().unwrap_or_default();

            exported.iter().rev().find_map(|rm| {
                rm.scope_metrics()
                    .flat_map(|sm| sm.metrics())
                    .filter(|metric: &&Metric| metric.name() == name)
                    .find_map(|metric| read(metric.data()))
            })
        }
    }

    fn key_values(attrs: &[(&'static str, &str)]) -> Vec<KeyValue> {
        attrs
            .iter()
            .map(|(k, v)| KeyValue::new(*k, (*v).to_string()))
            .collect()
    }

    fn same_attrs<'a>(actual: impl Iterator<Item = &'a KeyValue>, expected: &[KeyValue]) -> bool {
        let actual: Vec<&KeyValue> = actual.collect();
        actual.len() == expected.len() && expected.iter().all(|kv| actual.contains(&kv))
    }
}
