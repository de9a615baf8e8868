//! Observability infrastructure for the fleet controller
//!
//! Provides:
//! - Prometheus metrics (checkpoint latency and volume, transitions, failovers,
//!   optimizer actions)
//! - Structured JSON logging with tracing

use crate::models::{Checkpoint, PauseReason, RestoreResult};
use prometheus::{
    Counter, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for checkpoint and cycle latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

struct FleetMetricsInner {
    registry: Registry,
    checkpoint_create_seconds: Histogram,
    checkpoint_restore_seconds: Histogram,
    checkpoint_bytes_uploaded: IntCounter,
    checkpoint_bytes_downloaded: IntCounter,
    checkpoint_failures: IntCounterVec,
    hibernation_events: IntCounterVec,
    machines_monitored: IntGauge,
    savings_usd: Counter,
    failovers: IntCounter,
    optimizer_actions: IntCounterVec,
    optimizer_cycle_seconds: Histogram,
    provider_errors: IntCounterVec,
}

/// Fleet metrics for Prometheus exposition
///
/// Each handle owns its own registry so independent controllers (and tests)
/// never collide on metric names. Clones share the same metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    inner: Arc<FleetMetricsInner>,
}

impl FleetMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let checkpoint_create_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fleet_checkpoint_create_seconds",
                "Time spent creating a checkpoint",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let checkpoint_restore_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fleet_checkpoint_restore_seconds",
                "Time spent restoring a checkpoint",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let checkpoint_bytes_uploaded = IntCounter::new(
            "fleet_checkpoint_bytes_uploaded_total",
            "Compressed bytes written to object storage",
        )?;
        let checkpoint_bytes_downloaded = IntCounter::new(
            "fleet_checkpoint_bytes_downloaded_total",
            "Compressed bytes read from object storage",
        )?;
        let checkpoint_failures = IntCounterVec::new(
            Opts::new(
                "fleet_checkpoint_failures_total",
                "Failed checkpoint operations by operation and error kind",
            ),
            &["operation", "kind"],
        )?;
        let hibernation_events = IntCounterVec::new(
            Opts::new(
                "fleet_hibernation_events_total",
                "Hibernation events by type",
            ),
            &["event"],
        )?;
        let machines_monitored = IntGauge::new(
            "fleet_machines_monitored",
            "Machines with an active idle monitor",
        )?;
        let savings_usd = Counter::new(
            "fleet_savings_usd_total",
            "Estimated savings from paused machines in USD",
        )?;
        let failovers = IntCounter::new(
            "fleet_warm_pool_failovers_total",
            "Standby promotions performed",
        )?;
        let optimizer_actions = IntCounterVec::new(
            Opts::new(
                "fleet_optimizer_actions_total",
                "Cost optimizer actions by action and outcome",
            ),
            &["action", "outcome"],
        )?;
        let optimizer_cycle_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "fleet_optimizer_cycle_seconds",
                "Duration of one cost optimizer cycle",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let provider_errors = IntCounterVec::new(
            Opts::new(
                "fleet_provider_errors_total",
                "Provider call failures by provider and operation",
            ),
            &["provider", "operation"],
        )?;

        registry.register(Box::new(checkpoint_create_seconds.clone()))?;
        registry.register(Box::new(checkpoint_restore_seconds.clone()))?;
        registry.register(Box::new(checkpoint_bytes_uploaded.clone()))?;
        registry.register(Box::new(checkpoint_bytes_downloaded.clone()))?;
        registry.register(Box::new(checkpoint_failures.clone()))?;
        registry.register(Box::new(hibernation_events.clone()))?;
        registry.register(Box::new(machines_monitored.clone()))?;
        registry.register(Box::new(savings_usd.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(optimizer_actions.clone()))?;
        registry.register(Box::new(optimizer_cycle_seconds.clone()))?;
        registry.register(Box::new(provider_errors.clone()))?;

        Ok(Self {
            inner: Arc::new(FleetMetricsInner {
                registry,
                checkpoint_create_seconds,
                checkpoint_restore_seconds,
                checkpoint_bytes_uploaded,
                checkpoint_bytes_downloaded,
                checkpoint_failures,
                hibernation_events,
                machines_monitored,
                savings_usd,
                failovers,
                optimizer_actions,
                optimizer_cycle_seconds,
                provider_errors,
            }),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn observe_checkpoint_created(&self, duration_secs: f64, compressed_bytes: u64) {
        self.inner.checkpoint_create_seconds.observe(duration_secs);
        self.inner
            .checkpoint_bytes_uploaded
            .inc_by(compressed_bytes);
    }

    pub fn observe_checkpoint_restored(&self, duration_secs: f64, compressed_bytes: u64) {
        self.inner.checkpoint_restore_seconds.observe(duration_secs);
        self.inner
            .checkpoint_bytes_downloaded
            .inc_by(compressed_bytes);
    }

    pub fn inc_checkpoint_failure(&self, operation: &str, kind: &str) {
        self.inner
            .checkpoint_failures
            .with_label_values(&[operation, kind])
            .inc();
    }

    pub fn inc_hibernation_event(&self, event: &str) {
        self.inner
            .hibernation_events
            .with_label_values(&[event])
            .inc();
    }

    pub fn set_machines_monitored(&self, count: i64) {
        self.inner.machines_monitored.set(count);
    }

    pub fn add_savings(&self, usd: f64) {
        if usd > 0.0 {
            self.inner.savings_usd.inc_by(usd);
        }
    }

    pub fn inc_failovers(&self) {
        self.inner.failovers.inc();
    }

    pub fn inc_optimizer_action(&self, action: &str, outcome: &str) {
        self.inner
            .optimizer_actions
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn observe_optimizer_cycle(&self, duration_secs: f64) {
        self.inner.optimizer_cycle_seconds.observe(duration_secs);
    }

    pub fn inc_provider_error(&self, provider: &str, operation: &str) {
        self.inner
            .provider_errors
            .with_label_values(&[provider, operation])
            .inc();
    }
}

/// Structured logger for fleet lifecycle events
///
/// Provides consistent JSON-formatted logging for pauses, resumes,
/// checkpoints, failovers and optimizer actions.
#[derive(Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_startup(&self, version: &str, providers: &[String]) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            providers = ?providers,
            "Fleet controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Fleet controller shutting down"
        );
    }

    pub fn log_pause(&self, machine_id: &str, reason: PauseReason, checkpoint_id: Option<&str>) {
        info!(
            event = "machine_paused",
            controller = %self.controller,
            machine_id = %machine_id,
            reason = ?reason,
            checkpoint_id = ?checkpoint_id,
            "Machine paused"
        );
    }

    pub fn log_resume(&self, machine_id: &str, paused_hours: f64, savings_usd: f64) {
        info!(
            event = "machine_resumed",
            controller = %self.controller,
            machine_id = %machine_id,
            paused_hours = paused_hours,
            savings_usd = savings_usd,
            "Machine resumed"
        );
    }

    pub fn log_transition_error(&self, machine_id: &str, operation: &str, error: &str) {
        warn!(
            event = "transition_failed",
            controller = %self.controller,
            machine_id = %machine_id,
            operation = %operation,
            error = %error,
            "Hibernation transition failed, machine left in error state"
        );
    }

    pub fn log_checkpoint_created(&self, checkpoint: &Checkpoint, duration_ms: u64) {
        info!(
            event = "checkpoint_created",
            controller = %self.controller,
            checkpoint_id = %checkpoint.checkpoint_id,
            machine_id = %checkpoint.machine_id,
            checkpoint_type = %checkpoint.checkpoint_type,
            size_original = checkpoint.size_original,
            size_compressed = checkpoint.size_compressed,
            num_chunks = checkpoint.num_chunks,
            files_changed = checkpoint.files_changed,
            duration_ms = duration_ms,
            "Checkpoint created"
        );
    }

    pub fn log_checkpoint_restored(&self, result: &RestoreResult) {
        if result.success {
            info!(
                event = "checkpoint_restored",
                controller = %self.controller,
                checkpoint_id = %result.checkpoint_id,
                files_restored = result.files_restored,
                bytes_restored = result.bytes_restored,
                download_time_ms = result.download_time_ms,
                decompress_time_ms = result.decompress_time_ms,
                total_time_ms = result.total_time_ms,
                "Checkpoint restored"
            );
        } else {
            warn!(
                event = "checkpoint_restore_failed",
                controller = %self.controller,
                checkpoint_id = %result.checkpoint_id,
                total_time_ms = result.total_time_ms,
                error = ?result.error,
                "Checkpoint restore failed"
            );
        }
    }

    pub fn log_failover(
        &self,
        machine_id: &str,
        previous_primary: Option<&str>,
        new_primary: &str,
        failover_count: u32,
    ) {
        warn!(
            event = "failover_completed",
            controller = %self.controller,
            machine_id = %machine_id,
            previous_primary = ?previous_primary,
            new_primary = %new_primary,
            failover_count = failover_count,
            "Standby promoted to primary"
        );
    }

    pub fn log_optimizer_action(
        &self,
        instance_id: &str,
        provider: &str,
        action: &str,
        dry_run: bool,
        success: bool,
        reason: &str,
    ) {
        if success {
            info!(
                event = "optimizer_action",
                controller = %self.controller,
                instance_id = %instance_id,
                provider = %provider,
                action = %action,
                dry_run = dry_run,
                reason = %reason,
                "Cost optimizer action applied"
            );
        } else {
            warn!(
                event = "optimizer_action",
                controller = %self.controller,
                instance_id = %instance_id,
                provider = %provider,
                action = %action,
                dry_run = dry_run,
                reason = %reason,
                "Cost optimizer action failed"
            );
        }
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("fleetd")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_metrics_creation() {
        let metrics = FleetMetrics::new().unwrap();

        metrics.observe_checkpoint_created(1.5, 1024);
        metrics.observe_checkpoint_restored(0.5, 1024);
        metrics.inc_checkpoint_failure("create", "storage");
        metrics.inc_hibernation_event("auto_paused");
        metrics.set_machines_monitored(3);
        metrics.add_savings(2.5);
        metrics.inc_failovers();
        metrics.inc_optimizer_action("pause", "success");
        metrics.inc_provider_error("vast", "list");

        let text = String::from_utf8(metrics.encode_text().unwrap()).unwrap();
        assert!(text.contains("fleet_checkpoint_bytes_uploaded_total 1024"));
        assert!(text.contains("fleet_machines_monitored 3"));
        assert!(text.contains("fleet_warm_pool_failovers_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        // Two handles must not collide on registration
        let a = FleetMetrics::new().unwrap();
        let b = FleetMetrics::new().unwrap();
        a.inc_failovers();

        let text = String::from_utf8(b.encode_text().unwrap()).unwrap();
        assert!(text.contains("fleet_warm_pool_failovers_total 0"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-controller");
        assert_eq!(logger.controller, "test-controller");
    }
}
