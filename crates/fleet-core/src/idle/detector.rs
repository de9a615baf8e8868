//! Per-machine idle classification
//!
//! Keeps the most recent samples per machine and answers two questions:
//! is the machine idle right now, and for how long has it been idle without
//! interruption. A single active sample resets the idle run; spikes are never
//! averaged away.

use crate::models::{Heartbeat, UtilizationSample};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

/// Number of samples kept per machine
pub const MAX_HISTORY_SAMPLES: usize = 60;

/// Default age after which a machine's newest sample no longer counts
pub const DEFAULT_MAX_SAMPLE_AGE_SECS: i64 = 180;

/// Utilization percentages below which a machine counts as idle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleThresholds {
    pub gpu: f64,
    pub cpu: f64,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            gpu: 10.0,
            cpu: 5.0,
        }
    }
}

#[derive(Debug, Default)]
struct MachineHistory {
    samples: VecDeque<UtilizationSample>,
    /// Timestamp of the first sample of the current idle run
    ///
    /// Outlives eviction, so runs longer than the retained window keep
    /// their true start.
    run_start: Option<DateTime<Utc>>,
}

impl MachineHistory {
    fn push(
        &mut self,
        sample: UtilizationSample,
        thresholds: IdleThresholds,
        max_gap: Duration,
    ) {
        let gap = self
            .samples
            .back()
            .map(|prev| sample.timestamp - prev.timestamp > max_gap)
            .unwrap_or(false);

        if !sample.is_idle(thresholds.gpu, thresholds.cpu) {
            self.run_start = None;
        } else if gap || self.run_start.is_none() {
            self.run_start = Some(sample.timestamp);
        }

        self.samples.push_back(sample);
        while self.samples.len() > MAX_HISTORY_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Backward scan over the retained samples
    fn rescan(&mut self, thresholds: IdleThresholds, max_gap: Duration) {
        let mut run_start: Option<DateTime<Utc>> = None;
        for sample in self.samples.iter().rev() {
            let contiguous = run_start
                .map(|start| start - sample.timestamp <= max_gap)
                .unwrap_or(true);
            if sample.is_idle(thresholds.gpu, thresholds.cpu) && contiguous {
                run_start = Some(sample.timestamp);
            } else {
                break;
            }
        }
        self.run_start = run_start;
    }
}

/// Classifies machines as idle or active from their recent samples
pub struct IdleDetector {
    default_thresholds: IdleThresholds,
    /// Freshness limit; a larger gap between samples also breaks an idle run
    max_sample_age: Duration,
    thresholds: DashMap<String, IdleThresholds>,
    history: DashMap<String, MachineHistory>,
}

impl IdleDetector {
    pub fn new() -> Self {
        Self::with_thresholds(IdleThresholds::default())
    }

    pub fn with_thresholds(default_thresholds: IdleThresholds) -> Self {
        Self {
            default_thresholds,
            max_sample_age: Duration::seconds(DEFAULT_MAX_SAMPLE_AGE_SECS),
            thresholds: DashMap::new(),
            history: DashMap::new(),
        }
    }

    pub fn with_max_sample_age(mut self, max_sample_age: Duration) -> Self {
        self.max_sample_age = max_sample_age;
        self
    }

    pub fn max_sample_age(&self) -> Duration {
        self.max_sample_age
    }

    /// Override thresholds for one machine
    pub fn set_thresholds(&self, machine_id: &str, thresholds: IdleThresholds) {
        self.thresholds.insert(machine_id.to_string(), thresholds);
        if let Some(mut history) = self.history.get_mut(machine_id) {
            history.rescan(thresholds, self.max_sample_age);
        }
    }

    pub fn thresholds(&self, machine_id: &str) -> IdleThresholds {
        self.thresholds
            .get(machine_id)
            .map(|t| *t)
            .unwrap_or(self.default_thresholds)
    }

    /// Record a sample taken now
    pub fn update(
        &self,
        machine_id: &str,
        gpu_util: f64,
        cpu_util: f64,
        mem_util: f64,
        net_rx: u64,
        net_tx: u64,
    ) {
        self.record(
            machine_id,
            UtilizationSample {
                timestamp: Utc::now(),
                gpu_util,
                cpu_util,
                mem_util,
                net_rx_bytes: net_rx,
                net_tx_bytes: net_tx,
            },
        );
    }

    /// Record a pre-timestamped sample
    pub fn record(&self, machine_id: &str, sample: UtilizationSample) {
        let thresholds = self.thresholds(machine_id);
        self.history
            .entry(machine_id.to_string())
            .or_default()
            .push(sample, thresholds, self.max_sample_age);
    }

    /// Feed an agent heartbeat into the machine's history
    pub fn ingest_heartbeat(&self, heartbeat: &Heartbeat) {
        debug!(
            machine_id = %heartbeat.machine_id,
            gpu_util = heartbeat.gpu_metrics.utilization,
            status = %heartbeat.status,
            "Heartbeat received"
        );
        self.record(&heartbeat.machine_id, heartbeat.to_sample());
    }

    /// Whether the machine is idle
    ///
    /// Explicit utilization values take precedence; omitted values come from
    /// the newest sample. With no sample and no explicit values the machine
    /// is reported active.
    pub fn check(&self, machine_id: &str, gpu_util: Option<f64>, cpu_util: Option<f64>) -> bool {
        let latest = self.latest(machine_id);

        let gpu = match gpu_util.or(latest.map(|s| s.gpu_util)) {
            Some(v) => v,
            None => return false,
        };
        let cpu = match cpu_util.or(latest.map(|s| s.cpu_util)) {
            Some(v) => v,
            None => return false,
        };

        let thresholds = self.thresholds(machine_id);
        gpu < thresholds.gpu && cpu < thresholds.cpu
    }

    /// Minutes since the current uninterrupted idle run began
    pub fn idle_duration_minutes(&self, machine_id: &str) -> f64 {
        self.idle_duration_minutes_at(machine_id, Utc::now())
    }

    pub fn idle_duration_minutes_at(&self, machine_id: &str, now: DateTime<Utc>) -> f64 {
        match self.idle_since(machine_id) {
            Some(start) => ((now - start).num_milliseconds() as f64 / 60_000.0).max(0.0),
            None => 0.0,
        }
    }

    /// Start of the current contiguous idle run; `None` when the newest
    /// sample is active or there is no sample
    pub fn idle_since(&self, machine_id: &str) -> Option<DateTime<Utc>> {
        self.history.get(machine_id).and_then(|h| h.run_start)
    }

    /// Whether the newest sample is at most `max_sample_age` old at `now`
    pub fn has_fresh_sample(&self, machine_id: &str, now: DateTime<Utc>) -> bool {
        self.latest(machine_id)
            .map(|s| now - s.timestamp <= self.max_sample_age)
            .unwrap_or(false)
    }

    pub fn latest(&self, machine_id: &str) -> Option<UtilizationSample> {
        self.history
            .get(machine_id)
            .and_then(|h| h.samples.back().copied())
    }

    pub fn sample_count(&self, machine_id: &str) -> usize {
        self.history
            .get(machine_id)
            .map(|h| h.samples.len())
            .unwrap_or(0)
    }

    /// Drop history and thresholds for a machine
    pub fn forget(&self, machine_id: &str) {
        self.history.remove(machine_id);
        self.thresholds.remove(machine_id);
    }

    pub fn tracked_machines(&self) -> Vec<String> {
        self.history.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for IdleDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn sample(offset_secs: i64, gpu: f64, cpu: f64) -> UtilizationSample {
        UtilizationSample::new(t0() + Duration::seconds(offset_secs), gpu, cpu)
    }

    #[test]
    fn test_check_fails_closed_without_samples() {
        let detector = IdleDetector::new();
        assert!(!detector.check("m1", None, None));
        // Partial arguments still need a sample for the missing value
        assert!(!detector.check("m1", Some(1.0), None));
        assert!(detector.check("m1", Some(1.0), Some(1.0)));
    }

    #[test]
    fn test_check_requires_both_resources_idle() {
        let detector = IdleDetector::new();

        detector.record("m1", sample(0, 2.0, 50.0));
        assert!(!detector.check("m1", None, None));

        detector.record("m1", sample(30, 2.0, 1.0));
        assert!(detector.check("m1", None, None));

        // Explicit values override the newest sample
        assert!(!detector.check("m1", Some(80.0), None));
    }

    #[test]
    fn test_history_is_bounded() {
        let detector = IdleDetector::new();
        for i in 0..100 {
            detector.record("m1", sample(i * 30, 1.0, 1.0));
        }
        assert_eq!(detector.sample_count("m1"), MAX_HISTORY_SAMPLES);
        assert_eq!(
            detector.latest("m1").unwrap().timestamp,
            t0() + Duration::seconds(99 * 30)
        );
    }

    #[test]
    fn test_idle_duration_contiguous_run() {
        let detector = IdleDetector::new();
        for i in 0..10 {
            detector.record("m1", sample(i * 60, 1.0, 1.0));
        }

        let now = t0() + Duration::minutes(10);
        assert!((detector.idle_duration_minutes_at("m1", now) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_active_sample_resets_duration() {
        let detector = IdleDetector::new();
        for i in 0..30 {
            detector.record("m1", sample(i * 60, 1.0, 1.0));
        }
        detector.record("m1", sample(30 * 60, 95.0, 1.0));

        let now = t0() + Duration::minutes(31);
        assert_eq!(detector.idle_duration_minutes_at("m1", now), 0.0);

        // A fresh idle run starts from the next idle sample only
        detector.record("m1", sample(31 * 60, 1.0, 1.0));
        let now = t0() + Duration::minutes(33);
        assert!((detector.idle_duration_minutes_at("m1", now) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_per_machine_thresholds() {
        let detector = IdleDetector::new();
        detector.set_thresholds("m1", IdleThresholds { gpu: 30.0, cpu: 30.0 });

        detector.record("m1", sample(0, 20.0, 20.0));
        detector.record("m2", sample(0, 20.0, 20.0));

        assert!(detector.check("m1", None, None));
        assert!(!detector.check("m2", None, None));

        detector.forget("m1");
        assert_eq!(detector.sample_count("m1"), 0);
        assert_eq!(detector.thresholds("m1"), IdleThresholds::default());
    }

    #[test]
    fn test_idle_run_outlives_history_window() {
        let detector = IdleDetector::new();
        for i in 0..(MAX_HISTORY_SAMPLES as i64 * 3) {
            detector.record("m1", sample(i * 10, 1.0, 1.0));
        }

        assert_eq!(detector.sample_count("m1"), MAX_HISTORY_SAMPLES);
        assert_eq!(detector.idle_since("m1"), Some(t0()));
        let now = t0() + Duration::minutes(30);
        assert!((detector.idle_duration_minutes_at("m1", now) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_change_rescans_history() {
        let detector = IdleDetector::new();
        detector.record("m1", sample(0, 20.0, 1.0));
        detector.record("m1", sample(60, 20.0, 1.0));
        assert_eq!(detector.idle_since("m1"), None);

        detector.set_thresholds("m1", IdleThresholds { gpu: 30.0, cpu: 5.0 });
        assert_eq!(detector.idle_since("m1"), Some(t0()));
    }

    #[test]
    fn test_sample_freshness() {
        let detector = IdleDetector::new().with_max_sample_age(Duration::minutes(3));
        assert!(!detector.has_fresh_sample("m1", t0()));

        detector.record("m1", sample(0, 1.0, 1.0));
        assert!(detector.has_fresh_sample("m1", t0() + Duration::minutes(3)));
        assert!(!detector.has_fresh_sample("m1", t0() + Duration::minutes(4)));
    }

    #[test]
    fn test_gap_in_samples_breaks_idle_run() {
        let detector = IdleDetector::new();
        detector.record("m1", sample(0, 1.0, 1.0));
        detector.record("m1", sample(60, 1.0, 1.0));
        assert_eq!(detector.idle_since("m1"), Some(t0()));

        // Heartbeats stopped for ten minutes
        detector.record("m1", sample(660, 1.0, 1.0));
        assert_eq!(detector.idle_since("m1"), Some(t0() + Duration::seconds(660)));

        // The backward scan agrees after a threshold change
        detector.set_thresholds("m1", IdleThresholds { gpu: 20.0, cpu: 20.0 });
        assert_eq!(detector.idle_since("m1"), Some(t0() + Duration::seconds(660)));
    }
}
