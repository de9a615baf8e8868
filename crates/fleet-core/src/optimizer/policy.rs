//! Pause and delete decisions over a rolling utilization window

use crate::models::{Instance, InstanceState, UtilizationSample};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Samples required before the pause policy may fire
pub const MIN_PAUSE_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Time between optimizer cycles
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub metrics_window_minutes: f64,
    pub pause_threshold_gpu: f64,
    pub pause_threshold_cpu: f64,
    pub delete_threshold_hours: f64,
    pub min_instance_age_hours: f64,
    /// Instance ids never paused or deleted
    pub protected_instances: HashSet<String>,
    /// Decide and notify without calling the provider
    pub dry_run: bool,
    /// Deadline for each provider call
    #[serde(with = "duration_secs")]
    pub provider_timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            metrics_window_minutes: 30.0,
            pause_threshold_gpu: 10.0,
            pause_threshold_cpu: 5.0,
            delete_threshold_hours: 24.0,
            min_instance_age_hours: 1.0,
            protected_instances: HashSet::new(),
            dry_run: false,
            provider_timeout: Duration::from_secs(60),
        }
    }
}

/// Durations as whole seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Rolling utilization window of one instance
#[derive(Debug, Clone)]
pub struct InstanceMetrics {
    pub samples: VecDeque<UtilizationSample>,
    pub first_seen: DateTime<Utc>,
    /// Newest sample above the pause thresholds, or `first_seen`
    pub last_active: DateTime<Utc>,
}

impl InstanceMetrics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            samples: VecDeque::new(),
            first_seen: now,
            last_active: now,
        }
    }

    /// Append a sample and drop everything older than the window
    pub fn push(&mut self, sample: UtilizationSample, config: &OptimizerConfig, now: DateTime<Utc>) {
        if !sample.is_idle(config.pause_threshold_gpu, config.pause_threshold_cpu)
            && sample.timestamp > self.last_active
        {
            self.last_active = sample.timestamp;
        }
        self.samples.push_back(sample);
        self.prune(config.metrics_window_minutes, now);
    }

    pub fn prune(&mut self, window_minutes: f64, now: DateTime<Utc>) {
        let cutoff = now - minutes(window_minutes);
        while self
            .samples
            .front()
            .map(|s| s.timestamp <= cutoff)
            .unwrap_or(false)
        {
            self.samples.pop_front();
        }
    }
}

fn minutes(value: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((value * 60_000.0) as i64)
}

fn hours(value: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((value * 3_600_000.0) as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerAction {
    Pause,
    Delete,
}

impl OptimizerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerAction::Pause => "pause",
            OptimizerAction::Delete => "delete",
        }
    }
}

impl fmt::Display for OptimizerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Keep,
    Exempt(&'static str),
    Act {
        action: OptimizerAction,
        reason: String,
    },
}

/// Protected or too young to touch
pub fn exemption(
    config: &OptimizerConfig,
    instance: &Instance,
    now: DateTime<Utc>,
) -> Option<&'static str> {
    if config.protected_instances.contains(&instance.instance_id) {
        return Some("protected");
    }
    if now - instance.created_at < hours(config.min_instance_age_hours) {
        return Some("too_young");
    }
    None
}

/// Every sample in a window of at least [`MIN_PAUSE_SAMPLES`] has GPU and CPU below threshold
pub fn should_pause(config: &OptimizerConfig, instance: &Instance, metrics: &InstanceMetrics) -> bool {
    instance.state == InstanceState::Running
        && metrics.samples.len() >= MIN_PAUSE_SAMPLES
        && metrics
            .samples
            .iter()
            .all(|s| s.is_idle(config.pause_threshold_gpu, config.pause_threshold_cpu))
}

pub fn should_delete(
    config: &OptimizerConfig,
    instance: &Instance,
    metrics: &InstanceMetrics,
    now: DateTime<Utc>,
) -> bool {
    !matches!(instance.state, InstanceState::Terminated)
        && now - metrics.last_active > hours(config.delete_threshold_hours)
}

/// Pause is checked first; delete only when pause does not apply
pub fn decide(
    config: &OptimizerConfig,
    instance: &Instance,
    metrics: &InstanceMetrics,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(reason) = exemption(config, instance, now) {
        return Decision::Exempt(reason);
    }

    if should_pause(config, instance, metrics) {
        return Decision::Act {
            action: OptimizerAction::Pause,
            reason: format!(
                "{} samples below gpu {}% and cpu {}%",
                metrics.samples.len(),
                config.pause_threshold_gpu,
                config.pause_threshold_cpu
            ),
        };
    }

    if should_delete(config, instance, metrics, now) {
        let idle_hours = (now - metrics.last_active).num_minutes() as f64 / 60.0;
        return Decision::Act {
            action: OptimizerAction::Delete,
            reason: format!("no activity for {idle_hours:.1}h"),
        };
    }

    Decision::Keep
}
