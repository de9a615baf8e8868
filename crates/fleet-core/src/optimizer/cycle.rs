//! Periodic cost optimization across every provider

use super::notifier::{LogNotifier, Notifier, OptimizerNotification};
use super::policy::{decide, Decision, InstanceMetrics, OptimizerAction, OptimizerConfig};
use crate::error::{with_timeout, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{Instance, InstanceState};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::provider::{self, ComputeProvider, ProviderAction, ProviderRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one instance during a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Kept,
    Exempt { reason: &'static str },
    Acted { action: OptimizerAction, reason: String },
    DryRun { action: OptimizerAction, reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub provider: String,
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
    /// Whether the pre-action notification was delivered
    pub notified: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub instances: Vec<InstanceReport>,
    /// Providers whose instance listing failed
    pub provider_errors: Vec<(String, String)>,
}

impl CycleReport {
    pub fn count(&self, action: OptimizerAction) -> usize {
        self.instances
            .iter()
            .filter(|r| matches!(&r.outcome, InstanceOutcome::Acted { action: a, .. } if *a == action))
            .count()
    }

    pub fn errors(&self) -> usize {
        self.provider_errors.len()
            + self
                .instances
                .iter()
                .filter(|r| matches!(r.outcome, InstanceOutcome::Failed { .. }))
                .count()
    }

    pub fn outcome(&self, instance_id: &str) -> Option<&InstanceOutcome> {
        self.instances
            .iter()
            .find(|r| r.instance_id == instance_id)
            .map(|r| &r.outcome)
    }
}

/// Decides per instance whether to pause or delete, then does it
pub struct CostOptimizer {
    providers: Arc<ProviderRegistry>,
    config: OptimizerConfig,
    notifier: Arc<dyn Notifier>,
    history: DashMap<String, InstanceMetrics>,
    metrics: Option<FleetMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

fn history_key(provider: &str, instance_id: &str) -> String {
    format!("{provider}/{instance_id}")
}

impl CostOptimizer {
    pub fn new(providers: Arc<ProviderRegistry>, config: OptimizerConfig) -> Self {
        Self {
            providers,
            config,
            notifier: Arc::new(LogNotifier),
            history: DashMap::new(),
            metrics: None,
            health: None,
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Samples currently held for an instance
    pub fn window_len(&self, provider: &str, instance_id: &str) -> usize {
        self.history
            .get(&history_key(provider, instance_id))
            .map(|m| m.samples.len())
            .unwrap_or(0)
    }

    pub fn tracked_instances(&self) -> usize {
        self.history.len()
    }

    /// Run cycles until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            dry_run = self.config.dry_run,
            "Starting cost optimizer"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if let Some(health) = &self.health {
                        health.report_cycle(components::OPTIMIZER, report.errors()).await;
                    }
                }
            }
        }

        info!("Cost optimizer stopped");
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let started_at = Utc::now();

        let mut provider_errors = Vec::new();
        let mut listed = Vec::new();
        let mut listed_providers = HashSet::new();
        for provider in self.providers.all() {
            let name = provider.name().to_string();
            match with_timeout(
                format!("{name}.list"),
                self.config.provider_timeout,
                provider.list_instances(),
            )
            .await
            {
                Ok(instances) => {
                    listed_providers.insert(name);
                    listed.extend(instances.into_iter().map(|i| (provider.clone(), i)));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "Failed to list instances");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_provider_error(&name, "list");
                    }
                    provider_errors.push((name, e.to_string()));
                }
            }
        }

        let seen: HashSet<String> = listed
            .iter()
            .map(|(_, i)| history_key(&i.provider, &i.instance_id))
            .collect();

        let instances = join_all(
            listed
                .iter()
                .map(|(provider, instance)| self.evaluate_instance(provider.as_ref(), instance)),
        )
        .await;

        // Forget instances that vanished from a provider that answered
        self.history.retain(|key, _| {
            seen.contains(key)
                || !listed_providers
                    .iter()
                    .any(|p| key.starts_with(&format!("{p}/")))
        });

        let report = CycleReport {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            instances,
            provider_errors,
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_optimizer_cycle(started.elapsed().as_secs_f64());
        }
        info!(
            instances = report.instances.len(),
            paused = report.count(OptimizerAction::Pause),
            deleted = report.count(OptimizerAction::Delete),
            errors = report.errors(),
            duration_ms = report.duration_ms,
            "Optimizer cycle complete"
        );
        report
    }

    /// Metric update, decision and action for one instance, in that order
    async fn evaluate_instance(
        &self,
        provider: &dyn ComputeProvider,
        instance: &Instance,
    ) -> InstanceReport {
        let mut report = InstanceReport {
            instance_id: instance.instance_id.clone(),
            provider: instance.provider.clone(),
            outcome: InstanceOutcome::Kept,
            notified: None,
        };

        match self.try_evaluate(provider, instance, &mut report).await {
            Ok(outcome) => report.outcome = outcome,
            Err(e) => {
                warn!(
                    instance_id = %instance.instance_id,
                    provider = %instance.provider,
                    error = %e,
                    "Instance evaluation failed"
                );
                report.outcome = InstanceOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }
        report
    }

    async fn try_evaluate(
        &self,
        provider: &dyn ComputeProvider,
        instance: &Instance,
        report: &mut InstanceReport,
    ) -> Result<InstanceOutcome> {
        if instance.state == InstanceState::Terminated {
            return Ok(InstanceOutcome::Kept);
        }

        let sample = if instance.state == InstanceState::Running {
            with_timeout(
                format!("{}.metrics", instance.provider),
                self.config.provider_timeout,
                provider.get_metrics(&instance.instance_id),
            )
            .await?
        } else {
            None
        };

        let now = Utc::now();
        let decision = {
            let mut metrics = self
                .history
                .entry(history_key(&instance.provider, &instance.instance_id))
                .or_insert_with(|| InstanceMetrics::new(now));
            match sample {
                Some(sample) => metrics.push(sample, &self.config, now),
                None => metrics.prune(self.config.metrics_window_minutes, now),
            }
            decide(&self.config, instance, &metrics, now)
        };

        let (action, reason) = match decision {
            Decision::Keep => return Ok(InstanceOutcome::Kept),
            Decision::Exempt(reason) => return Ok(InstanceOutcome::Exempt { reason }),
            Decision::Act { action, reason } => (action, reason),
        };

        let notification = OptimizerNotification {
            action,
            instance_id: instance.instance_id.clone(),
            provider: instance.provider.clone(),
            reason: reason.clone(),
            dry_run: self.config.dry_run,
            timestamp: now,
        };
        report.notified = Some(match self.notifier.notify(&notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    instance_id = %instance.instance_id,
                    action = %action,
                    error = %e,
                    "Notification failed, continuing with action"
                );
                false
            }
        });

        if self.config.dry_run {
            self.record_action(instance, action, "dry_run", true, &reason);
            return Ok(InstanceOutcome::DryRun { action, reason });
        }

        let provider_action = match action {
            OptimizerAction::Pause => ProviderAction::Pause,
            OptimizerAction::Delete => ProviderAction::Destroy,
        };
        let result = provider::invoke(
            provider,
            provider_action,
            &instance.instance_id,
            self.config.provider_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                if action == OptimizerAction::Delete {
                    self.history
                        .remove(&history_key(&instance.provider, &instance.instance_id));
                }
                self.record_action(instance, action, "success", true, &reason);
                Ok(InstanceOutcome::Acted { action, reason })
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_provider_error(&instance.provider, provider_action.as_str());
                }
                self.record_action(instance, action, "failure", false, &e.to_string());
                Err(e)
            }
        }
    }

    fn record_action(
        &self,
        instance: &Instance,
        action: OptimizerAction,
        outcome: &str,
        success: bool,
        reason: &str,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_optimizer_action(action.as_str(), outcome);
        }
        self.logger.log_optimizer_action(
            &instance.instance_id,
            &instance.provider,
            action.as_str(),
            self.config.dry_run,
            success,
            reason,
        );
        debug!(instance_id = %instance.instance_id, outcome = %outcome, "Optimizer action recorded");
    }
}
