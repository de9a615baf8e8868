//! Fleet-wide cost optimization
//!
//! This module provides:
//! - Rolling utilization windows per provider instance
//! - Pause policy (every sample idle on both GPU and CPU) and delete policy
//!   (no activity for a configured number of hours)
//! - Notification before every action, delivered by webhook or log
//! - A periodic loop that evaluates all instances in parallel

mod cycle;
mod notifier;
mod policy;

pub use cycle::{CostOptimizer, CycleReport, InstanceOutcome, InstanceReport};
pub use notifier::{LogNotifier, Notifier, OptimizerNotification, WebhookNotifier};
pub use policy::{
    decide, exemption, should_delete, should_pause, Decision, InstanceMetrics, OptimizerAction,
    OptimizerConfig, MIN_PAUSE_SAMPLES,
};
