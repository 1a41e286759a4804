//! Metrics collection and export module

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Submission
    pub submissions_total: IntCounter,
    pub submissions_success: IntCounter,
    pub submissions_failed: IntCounter,
    pub submission_attempts: IntCounter,
    pub submission_failures_by_category: IntCounterVec,
    pub engine_failovers: IntCounter,
    pub dry_run_submissions: IntCounter,

    // Confirmation
    pub confirmations_by_status: IntCounterVec,
    pub confirmation_polls: IntCounter,

    // Orchestration
    pub passes_total: IntCounter,
    pub passes_overlapped: IntCounter,
    pub units_processed: IntCounter,
    pub units_succeeded: IntCounter,
    pub units_failed: IntCounter,
    pub units_skipped: IntCounter,
    pub units_in_flight: IntGauge,

    // Histograms
    pub submission_latency: Histogram,
    pub confirmation_latency: Histogram,
    pub pass_duration: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let submissions_total = IntCounter::with_opts(Opts::new(
            "relay_submissions_total",
            "Total number of transaction sets handed to the submitter",
        ))?;

        let submissions_success = IntCounter::with_opts(Opts::new(
            "relay_submissions_success",
            "Submissions accepted by a relay",
        ))?;

        let submissions_failed = IntCounter::with_opts(Opts::new(
            "relay_submissions_failed",
            "Submissions that gave up on an engine",
        ))?;

        let submission_attempts = IntCounter::with_opts(Opts::new(
            "relay_submission_attempts_total",
            "Individual POST attempts against relay endpoints",
        ))?;

        let submission_failures_by_category = IntCounterVec::new(
            Opts::new(
                "relay_submission_failures_total",
                "Failed attempts by classified category",
            ),
            &["category"],
        )?;

        let engine_failovers = IntCounter::with_opts(Opts::new(
            "relay_engine_failovers_total",
            "Times the coordinator moved on to the next engine",
        ))?;

        let dry_run_submissions = IntCounter::with_opts(Opts::new(
            "relay_dry_run_submissions_total",
            "Submissions short-circuited by dry-run mode",
        ))?;

        let confirmations_by_status = IntCounterVec::new(
            Opts::new(
                "relay_confirmations_total",
                "Final confirmation outcomes by status",
            ),
            &["status"],
        )?;

        let confirmation_polls = IntCounter::with_opts(Opts::new(
            "relay_confirmation_polls_total",
            "Status endpoint polls issued",
        ))?;

        let passes_total = IntCounter::with_opts(Opts::new(
            "automation_passes_total",
            "Orchestration passes started",
        ))?;

        let passes_overlapped = IntCounter::with_opts(Opts::new(
            "automation_passes_overlapped_total",
            "Passes skipped because another pass was still running",
        ))?;

        let units_processed = IntCounter::with_opts(Opts::new(
            "automation_units_processed_total",
            "Work units evaluated",
        ))?;

        let units_succeeded = IntCounter::with_opts(Opts::new(
            "automation_units_succeeded_total",
            "Work units whose action landed",
        ))?;

        let units_failed = IntCounter::with_opts(Opts::new(
            "automation_units_failed_total",
            "Work units whose action failed",
        ))?;

        let units_skipped = IntCounter::with_opts(Opts::new(
            "automation_units_skipped_total",
            "Work units skipped (below minimum, in flight)",
        ))?;

        let units_in_flight = IntGauge::with_opts(Opts::new(
            "automation_units_in_flight",
            "Work units currently held by the in-flight registry",
        ))?;

        let submission_latency = Histogram::with_opts(
            HistogramOpts::new(
                "relay_submission_latency_seconds",
                "Time from first attempt to relay acceptance",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 15.0, 60.0, 300.0]),
        )?;

        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "relay_confirmation_latency_seconds",
                "Time spent polling for a terminal status",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0]),
        )?;

        let pass_duration = Histogram::with_opts(
            HistogramOpts::new("automation_pass_duration_seconds", "Orchestration pass duration")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(submissions_success.clone()))?;
        registry.register(Box::new(submissions_failed.clone()))?;
        registry.register(Box::new(submission_attempts.clone()))?;
        registry.register(Box::new(submission_failures_by_category.clone()))?;
        registry.register(Box::new(engine_failovers.clone()))?;
        registry.register(Box::new(dry_run_submissions.clone()))?;
        registry.register(Box::new(confirmations_by_status.clone()))?;
        registry.register(Box::new(confirmation_polls.clone()))?;
        registry.register(Box::new(passes_total.clone()))?;
        registry.register(Box::new(passes_overlapped.clone()))?;
        registry.register(Box::new(units_processed.clone()))?;
        registry.register(Box::new(units_succeeded.clone()))?;
        registry.register(Box::new(units_failed.clone()))?;
        registry.register(Box::new(units_skipped.clone()))?;
        registry.register(Box::new(units_in_flight.clone()))?;
        registry.register(Box::new(submission_latency.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;

        Ok(Self {
            registry,
            submissions_total,
            submissions_success,
            submissions_failed,
            submission_attempts,
            submission_failures_by_category,
            engine_failovers,
            dry_run_submissions,
            confirmations_by_status,
            confirmation_polls,
            passes_total,
            passes_overlapped,
            units_processed,
            units_succeeded,
            units_failed,
            units_skipped,
            units_in_flight,
            submission_latency,
            confirmation_latency,
            pass_duration,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_failure_category(&self, category: &str) {
        self.submission_failures_by_category
            .with_label_values(&[category])
            .inc();
    }

    pub fn record_confirmation(&self, status: &str) {
        self.confirmations_by_status.with_label_values(&[status]).inc();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_counters_show_up_in_export() {
        let m = Metrics::new().unwrap();
        m.record_failure_category("rate_limit");
        m.record_confirmation("landed");
        let text = m.encode_text().unwrap();
        assert!(text.contains("relay_submission_failures_total{category=\"rate_limit\"} 1"));
        assert!(text.contains("relay_confirmations_total{status=\"landed\"} 1"));
    }
}
