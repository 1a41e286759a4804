//! Structured logging for relay and automation events

use crate::observability::CorrelationId;

/// Structured logger bound to one correlation id
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    context_id: CorrelationId,
}

impl StructuredLogger {
    pub fn new(context_id: CorrelationId) -> Self {
        Self { context_id }
    }

    pub fn context_id(&self) -> &CorrelationId {
        &self.context_id
    }

    pub fn log_submission_attempt(&self, engine: &str, endpoint: &str, attempt: u32, tx_count: usize) {
        tracing::debug!(
            context_id = %self.context_id,
            engine = %engine,
            endpoint = %endpoint,
            attempt = attempt,
            tx_count = tx_count,
            "Submitting transaction set"
        );
    }

    pub fn log_attempt_failed(
        &self,
        engine: &str,
        endpoint: &str,
        attempt: u32,
        category: &str,
        delay_ms: Option<u64>,
        reason: &str,
    ) {
        tracing::warn!(
            context_id = %self.context_id,
            engine = %engine,
            endpoint = %endpoint,
            attempt = attempt,
            category = %category,
            delay_ms = ?delay_ms,
            reason = %reason,
            "Submission attempt failed"
        );
    }

    pub fn log_submission_success(&self, engine: &str, endpoint: &str, id: &str, attempts: u32, latency_ms: u64) {
        tracing::info!(
            context_id = %self.context_id,
            engine = %engine,
            endpoint = %endpoint,
            bundle_id = %id,
            attempts = attempts,
            latency_ms = latency_ms,
            "Transaction set accepted"
        );
    }

    pub fn log_submission_failure(&self, engine: &str, error: &str) {
        tracing::warn!(
            context_id = %self.context_id,
            engine = %engine,
            error = %error,
            "Engine gave up on transaction set"
        );
    }

    pub fn log_poll_progress(&self, id: &str, poll: u32, status: &str) {
        tracing::debug!(
            context_id = %self.context_id,
            bundle_id = %id,
            poll = poll,
            status = %status,
            "Confirmation poll"
        );
    }

    pub fn log_unit_skipped(&self, unit_id: &str, reason: &str) {
        tracing::info!(
            context_id = %self.context_id,
            unit_id = %unit_id,
            reason = %reason,
            "Work unit skipped"
        );
    }

    pub fn log_unit_succeeded(&self, unit_id: &str, amount: &str, tx_id: &str) {
        tracing::info!(
            context_id = %self.context_id,
            unit_id = %unit_id,
            amount = %amount,
            tx_id = %tx_id,
            "Work unit executed"
        );
    }

    pub fn log_unit_failed(&self, unit_id: &str, error: &str) {
        tracing::warn!(
            context_id = %self.context_id,
            unit_id = %unit_id,
            error = %error,
            "Work unit failed"
        );
    }

    pub fn log_pass_summary(&self, kind: &str, processed: u32, succeeded: u32, failed: u32, skipped: u32, duration_ms: u64) {
        tracing::info!(
            context_id = %self.context_id,
            kind = %kind,
            processed = processed,
            succeeded = succeeded,
            failed = failed,
            skipped = skipped,
            duration_ms = duration_ms,
            "Automation pass complete"
        );
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(CorrelationId::new())
    }
}
