//! Hibernation manager and per-machine monitor loops

use crate::checkpoint::CheckpointPipeline;
use crate::error::{FleetError, Result};
use crate::idle::{IdleDetector, IdleThresholds};
use crate::models::{
    HibernationEvent, HibernationEventType, IdleConfig, MachineIdleStatus, MachineRef,
    MachineState, PauseReason,
};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::provider::{self, ProviderAction, ProviderRegistry};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HibernationConfig {
    /// Time between monitor ticks
    pub tick_interval: Duration,
    /// Deadline for each provider pause/resume call
    pub provider_timeout: Duration,
    /// Events kept in memory
    pub max_events: usize,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(120),
            max_events: 10_000,
        }
    }
}

/// What one monitor tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Machine is mid-transition, paused or in error
    Skipped(MachineState),
    Active,
    /// Newest sample is older than the detector's `max_sample_age`; the
    /// idle timer is reset
    Stale,
    /// `ACTIVE → IDLE` on this tick
    IdleDetected,
    /// Still idle, below the pause threshold or outside the schedule
    Idle { idle_minutes: f64 },
    /// `IDLE → ACTIVE` on this tick
    Reactivated,
    AutoPaused,
    /// Auto-pause was attempted and left the machine in `ERROR`
    PauseFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub machine_id: Option<String>,
    pub event_type: Option<HibernationEventType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SavingsSummary {
    pub machines: usize,
    pub paused_machines: usize,
    pub total_paused_hours: f64,
    pub total_savings_usd: f64,
    /// Sum of hourly rates of currently paused machines
    pub current_hourly_savings_usd: f64,
}

struct MachineEntry {
    machine: MachineRef,
    config: RwLock<Arc<IdleConfig>>,
    status: RwLock<MachineIdleStatus>,
    /// Serializes pause/resume for this machine
    transition: AsyncMutex<()>,
}

pub struct HibernationManager {
    providers: Arc<ProviderRegistry>,
    detector: Arc<IdleDetector>,
    checkpoints: Option<Arc<CheckpointPipeline>>,
    config: HibernationConfig,
    machines: DashMap<String, Arc<MachineEntry>>,
    monitors: DashMap<String, CancellationToken>,
    events: Mutex<VecDeque<HibernationEvent>>,
    metrics: Option<FleetMetrics>,
    logger: StructuredLogger,
}

impl HibernationManager {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        detector: Arc<IdleDetector>,
        config: HibernationConfig,
    ) -> Self {
        Self {
            providers,
            detector,
            checkpoints: None,
            config,
            machines: DashMap::new(),
            monitors: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            metrics: None,
            logger: StructuredLogger::default(),
        }
    }

    /// Snapshot workspaces through `pipeline` before pausing
    pub fn with_checkpoints(mut self, pipeline: Arc<CheckpointPipeline>) -> Self {
        self.checkpoints = Some(pipeline);
        self
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn detector(&self) -> &Arc<IdleDetector> {
        &self.detector
    }

    /// Register a machine or replace its idle policy
    ///
    /// The machine reference is fixed by the first call; later calls only
    /// swap the policy, which the next tick picks up.
    pub async fn configure(&self, machine: MachineRef, config: IdleConfig) {
        let machine_id = machine.machine_id.clone();
        self.detector.set_thresholds(
            &machine_id,
            IdleThresholds {
                gpu: config.gpu_threshold,
                cpu: config.cpu_threshold,
            },
        );

        let config = Arc::new(config);
        let existing = match self.machines.entry(machine_id.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(slot) => {
                let status = MachineIdleStatus::new(&machine.machine_id, &machine.provider);
                slot.insert(Arc::new(MachineEntry {
                    machine,
                    config: RwLock::new(config.clone()),
                    status: RwLock::new(status),
                    transition: AsyncMutex::new(()),
                }));
                None
            }
        };

        match existing {
            Some(entry) => {
                *entry.config.write().await = config;
                info!(machine_id = %machine_id, "Idle policy updated");
            }
            None => info!(machine_id = %machine_id, "Machine registered for hibernation"),
        }
    }

    fn entry(&self, machine_id: &str) -> Result<Arc<MachineEntry>> {
        self.machines
            .get(machine_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::UnknownMachine(machine_id.to_string()))
    }

    pub async fn idle_config(&self, machine_id: &str) -> Result<IdleConfig> {
        let entry = self.entry(machine_id)?;
        let config = entry.config.read().await;
        Ok(IdleConfig::clone(&config))
    }

    pub async fn set_auto_pause(&self, machine_id: &str, enabled: bool) -> Result<()> {
        let entry = self.entry(machine_id)?;
        let mut config = entry.config.write().await;
        let mut updated = IdleConfig::clone(&config);
        updated.auto_pause_enabled = enabled;
        *config = Arc::new(updated);

        info!(machine_id = %machine_id, enabled = enabled, "Auto-pause toggled");
        Ok(())
    }

    /// Spawn the monitor loop; returns `false` when one is already running
    pub fn start_monitoring(self: &Arc<Self>, machine_id: &str) -> Result<bool> {
        self.entry(machine_id)?;

        let token = match self.monitors.entry(machine_id.to_string()) {
            Entry::Occupied(_) => {
                warn!(machine_id = %machine_id, "Machine is already monitored");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                token
            }
        };

        let manager = Arc::clone(self);
        let id = machine_id.to_string();
        tokio::spawn(async move { manager.monitor_loop(id, token).await });

        self.update_monitor_gauge();
        Ok(true)
    }

    /// Cancel a monitor loop at its next tick boundary
    pub fn stop_monitoring(&self, machine_id: &str) -> bool {
        let stopped = match self.monitors.remove(machine_id) {
            Some((_, token)) => {
                token.cancel();
                info!(machine_id = %machine_id, "Stopping idle monitor");
                true
            }
            None => false,
        };
        self.update_monitor_gauge();
        stopped
    }

    pub fn is_monitoring(&self, machine_id: &str) -> bool {
        self.monitors.contains_key(machine_id)
    }

    /// Stop every monitor loop
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_monitoring(&id);
        }
    }

    fn update_monitor_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_machines_monitored(self.monitors.len() as i64);
        }
    }

    async fn monitor_loop(self: Arc<Self>, machine_id: String, cancel: CancellationToken) {
        info!(
            machine_id = %machine_id,
            tick_secs = self.config.tick_interval.as_secs(),
            "Starting idle monitor"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.evaluate(&machine_id, Utc::now()).await {
                        Ok(TickOutcome::PauseFailed(error)) => {
                            warn!(machine_id = %machine_id, error = %error, "Auto-pause failed");
                        }
                        Ok(outcome) => {
                            debug!(machine_id = %machine_id, outcome = ?outcome, "Monitor tick");
                        }
                        Err(e) => {
                            warn!(machine_id = %machine_id, error = %e, "Monitor tick failed");
                        }
                    }
                }
            }
        }

        info!(machine_id = %machine_id, "Idle monitor stopped");
    }

    /// One monitor tick at wall-clock time `now`
    pub async fn evaluate(&self, machine_id: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let entry = self.entry(machine_id)?;
        let config = entry.config.read().await.clone();

        let state = entry.status.read().await.state;
        if !matches!(state, MachineState::Active | MachineState::Idle) {
            return Ok(TickOutcome::Skipped(state));
        }

        let fresh = self.detector.has_fresh_sample(machine_id, now);
        let run_start = if fresh {
            self.detector.idle_since(machine_id)
        } else {
            None
        };

        let (outcome, idle_minutes) = {
            let mut status = entry.status.write().await;
            match (status.state, run_start) {
                (MachineState::Active | MachineState::Idle, None) => {
                    let was_idle = status.state == MachineState::Idle;
                    status.state = MachineState::Active;
                    status.idle_since = None;
                    status.idle_minutes = 0.0;
                    status.updated_at = now;
                    return Ok(match (fresh, was_idle) {
                        (false, _) => {
                            debug!(machine_id = %machine_id, "No recent utilization sample");
                            TickOutcome::Stale
                        }
                        (true, true) => {
                            debug!(machine_id = %machine_id, "Activity resumed, idle timer reset");
                            TickOutcome::Reactivated
                        }
                        (true, false) => TickOutcome::Active,
                    });
                }
                (state @ (MachineState::Active | MachineState::Idle), Some(since)) => {
                    let minutes = ((now - since).num_milliseconds() as f64 / 60_000.0).max(0.0);
                    if state == MachineState::Idle && status.idle_since != Some(since) {
                        debug!(machine_id = %machine_id, "Idle run restarted between ticks");
                    }
                    status.state = MachineState::Idle;
                    status.idle_since = Some(since);
                    status.idle_minutes = minutes;
                    status.updated_at = now;
                    let outcome = if state == MachineState::Active {
                        TickOutcome::IdleDetected
                    } else {
                        TickOutcome::Idle {
                            idle_minutes: minutes,
                        }
                    };
                    (outcome, minutes)
                }
                // A transition started between the two reads
                (other, _) => return Ok(TickOutcome::Skipped(other)),
            }
        };

        if outcome == TickOutcome::IdleDetected {
            self.record_event(HibernationEvent {
                machine_id: machine_id.to_string(),
                event_type: HibernationEventType::IdleDetected,
                timestamp: now,
                idle_hours: 0.0,
                savings_usd: 0.0,
                message: None,
            });
        }

        if idle_minutes < config.pause_after_minutes() || !config.auto_pause_allowed_at(now) {
            return Ok(outcome);
        }

        info!(
            machine_id = %machine_id,
            idle_minutes = idle_minutes,
            threshold_minutes = config.pause_after_minutes(),
            "Idle threshold reached, pausing"
        );
        match self.pause_at(machine_id, PauseReason::Idle, now).await {
            Ok(_) => Ok(TickOutcome::AutoPaused),
            Err(e) => Ok(TickOutcome::PauseFailed(e.to_string())),
        }
    }

    /// Pause a machine; pausing a `PAUSED` machine is a no-op success
    ///
    /// Calling this on an `ERROR` machine is the manual retry.
    pub async fn pause(&self, machine_id: &str, reason: PauseReason) -> Result<MachineIdleStatus> {
        self.pause_at(machine_id, reason, Utc::now()).await
    }

    pub(crate) async fn pause_at(
        &self,
        machine_id: &str,
        reason: PauseReason,
        now: DateTime<Utc>,
    ) -> Result<MachineIdleStatus> {
        let entry = self.entry(machine_id)?;
        let _guard = entry.transition.lock().await;
        let config = entry.config.read().await.clone();

        let idle_hours = {
            let mut status = entry.status.write().await;
            match status.state {
                MachineState::Paused => {
                    debug!(machine_id = %machine_id, "Already paused");
                    return Ok(status.clone());
                }
                MachineState::Pausing | MachineState::Resuming => {
                    return Err(FleetError::InvalidStateTransition {
                        machine_id: machine_id.to_string(),
                        state: status.state.to_string(),
                        operation: "pause",
                    });
                }
                MachineState::Active | MachineState::Idle | MachineState::Error => {}
            }
            status.state = MachineState::Pausing;
            status.last_error = None;
            status.updated_at = now;
            status.idle_minutes / 60.0
        };

        let mut checkpoint_id = None;
        if config.snapshot_before_pause {
            if let (Some(pipeline), Some(workspace)) = (&self.checkpoints, &entry.machine.workspace)
            {
                match pipeline
                    .snapshot(machine_id, &entry.machine.provider, workspace)
                    .await
                {
                    Ok(checkpoint) => checkpoint_id = Some(checkpoint.checkpoint_id),
                    Err(e) => return Err(self.fail_transition(&entry, "pause", e, now).await),
                }
            }
        }

        if let Err(e) = self
            .call_provider(&entry.machine, ProviderAction::Pause)
            .await
        {
            return Err(self.fail_transition(&entry, "pause", e, now).await);
        }

        let status = {
            let mut status = entry.status.write().await;
            status.state = MachineState::Paused;
            status.paused_at.get_or_insert(now);
            if checkpoint_id.is_some() {
                status.last_checkpoint_id = checkpoint_id.clone();
            }
            status.updated_at = now;
            status.clone()
        };

        let event_type = match reason {
            PauseReason::Idle => HibernationEventType::AutoPaused,
            PauseReason::Manual => HibernationEventType::ManualPaused,
        };
        self.record_event(HibernationEvent {
            machine_id: machine_id.to_string(),
            event_type,
            timestamp: now,
            idle_hours,
            savings_usd: 0.0,
            message: checkpoint_id.as_ref().map(|id| format!("checkpoint {id}")),
        });
        self.logger
            .log_pause(machine_id, reason, checkpoint_id.as_deref());
        Ok(status)
    }

    /// Resume a `PAUSED` machine and book the savings of the pause
    pub async fn resume(&self, machine_id: &str) -> Result<MachineIdleStatus> {
        self.resume_at(machine_id, Utc::now(), false).await
    }

    /// Resume a paused machine, or retry a resume that left it in `ERROR`
    pub async fn wake(&self, machine_id: &str) -> Result<MachineIdleStatus> {
        self.resume_at(machine_id, Utc::now(), true).await
    }

    pub(crate) async fn resume_at(
        &self,
        machine_id: &str,
        now: DateTime<Utc>,
        retry_failed: bool,
    ) -> Result<MachineIdleStatus> {
        let entry = self.entry(machine_id)?;
        let _guard = entry.transition.lock().await;
        let config = entry.config.read().await.clone();

        let paused_at = {
            let mut status = entry.status.write().await;
            let retryable =
                retry_failed && status.state == MachineState::Error && status.paused_at.is_some();
            if status.state != MachineState::Paused && !retryable {
                return Err(FleetError::InvalidStateTransition {
                    machine_id: machine_id.to_string(),
                    state: status.state.to_string(),
                    operation: if retry_failed { "wake" } else { "resume" },
                });
            }
            status.state = MachineState::Resuming;
            status.last_error = None;
            status.updated_at = now;
            status.paused_at.unwrap_or(now)
        };

        let paused_hours = ((now - paused_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        let savings = paused_hours * config.hourly_rate_usd;

        if let Err(e) = self
            .call_provider(&entry.machine, ProviderAction::Resume)
            .await
        {
            return Err(self.fail_transition(&entry, "resume", e, now).await);
        }

        let status = {
            let mut status = entry.status.write().await;
            status.state = MachineState::Active;
            status.total_paused_hours += paused_hours;
            status.total_savings_usd += savings;
            status.idle_since = None;
            status.idle_minutes = 0.0;
            status.paused_at = None;
            status.updated_at = now;
            status.clone()
        };

        self.record_event(HibernationEvent {
            machine_id: machine_id.to_string(),
            event_type: HibernationEventType::Resumed,
            timestamp: now,
            idle_hours: paused_hours,
            savings_usd: savings,
            message: None,
        });
        if let Some(metrics) = &self.metrics {
            metrics.add_savings(savings);
        }
        self.logger.log_resume(machine_id, paused_hours, savings);
        Ok(status)
    }

    async fn call_provider(&self, machine: &MachineRef, action: ProviderAction) -> Result<()> {
        let provider = self.providers.get(&machine.provider)?;
        let result = provider::invoke(
            provider.as_ref(),
            action,
            &machine.machine_id,
            self.config.provider_timeout,
        )
        .await;

        if result.is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.inc_provider_error(&machine.provider, action.as_str());
            }
        }
        result
    }

    /// Park the machine in `ERROR` and hand the error back
    async fn fail_transition(
        &self,
        entry: &MachineEntry,
        operation: &'static str,
        error: FleetError,
        now: DateTime<Utc>,
    ) -> FleetError {
        let machine_id = &entry.machine.machine_id;
        {
            let mut status = entry.status.write().await;
            status.state = MachineState::Error;
            status.last_error = Some(error.to_string());
            status.updated_at = now;
        }

        self.record_event(HibernationEvent {
            machine_id: machine_id.clone(),
            event_type: HibernationEventType::Error,
            timestamp: now,
            idle_hours: 0.0,
            savings_usd: 0.0,
            message: Some(format!("{operation} failed: {error}")),
        });
        self.logger
            .log_transition_error(machine_id, operation, &error.to_string());
        error
    }

    fn record_event(&self, event: HibernationEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_hibernation_event(&event.event_type.to_string());
        }

        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > self.config.max_events {
            events.pop_front();
        }
    }

    pub async fn status(&self, machine_id: &str) -> Result<MachineIdleStatus> {
        let entry = self.entry(machine_id)?;
        let status = entry.status.read().await.clone();
        Ok(status)
    }

    /// All machine statuses ordered by id
    pub async fn statuses(&self) -> Vec<MachineIdleStatus> {
        let entries: Vec<Arc<MachineEntry>> =
            self.machines.iter().map(|e| e.value().clone()).collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(entry.status.read().await.clone());
        }
        statuses.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        statuses
    }

    /// Most recent `limit` events matching `filter`, oldest first
    pub fn events(&self, filter: &EventFilter, limit: usize) -> Vec<HibernationEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<HibernationEvent> = events
            .iter()
            .rev()
            .filter(|e| {
                filter
                    .machine_id
                    .as_ref()
                    .map(|id| &e.machine_id == id)
                    .unwrap_or(true)
                    && filter
                        .event_type
                        .map(|t| e.event_type == t)
                        .unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub async fn savings_summary(&self) -> SavingsSummary {
        let entries: Vec<Arc<MachineEntry>> =
            self.machines.iter().map(|e| e.value().clone()).collect();

        let mut summary = SavingsSummary {
            machines: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let status = entry.status.read().await;
            summary.total_paused_hours += status.total_paused_hours;
            summary.total_savings_usd += status.total_savings_usd;
            if status.state == MachineState::Paused {
                summary.paused_machines += 1;
                summary.current_hourly_savings_usd += entry.config.read().await.hourly_rate_usd;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointConfig, MemoryObjectStore};
    use crate::models::{InstanceState, UtilizationSample};
    use crate::provider::SimulatedProvider;
    use chrono::{Duration as ChronoDuration, TimeZone};

    struct Harness {
        manager: Arc<HibernationManager>,
        provider: Arc<SimulatedProvider>,
        detector: Arc<IdleDetector>,
    }

    async fn harness(config: IdleConfig) -> Harness {
        let provider = Arc::new(SimulatedProvider::new("sim"));
        provider.add_instance("m1", InstanceState::Running);
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider.clone());
        let detector = Arc::new(IdleDetector::new());

        let manager = Arc::new(HibernationManager::new(
            registry,
            detector.clone(),
            HibernationConfig::default(),
        ));
        manager.configure(MachineRef::new("m1", "sim"), config).await;

        Harness {
            manager,
            provider,
            detector,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn count(manager: &HibernationManager, event_type: HibernationEventType) -> usize {
        manager
            .events(
                &EventFilter {
                    machine_id: Some("m1".to_string()),
                    event_type: Some(event_type),
                },
                usize::MAX,
            )
            .len()
    }

    #[tokio::test]
    async fn test_idle_machine_pauses_after_forty_ticks() {
        let h = harness(IdleConfig::default()).await;

        let mut paused_on = None;
        for tick in 1..=60 {
            let now = t0() + ChronoDuration::seconds(30 * (tick - 1));
            h.detector.record("m1", UtilizationSample::new(now, 2.0, 1.0));

            let outcome = h.manager.evaluate("m1", now).await.unwrap();
            if tick == 1 {
                assert_eq!(outcome, TickOutcome::IdleDetected);
                assert_eq!(h.manager.status("m1").await.unwrap().state, MachineState::Idle);
            }
            if outcome == TickOutcome::AutoPaused {
                paused_on = Some(tick);
                break;
            }
        }

        // 15 + 5 minutes at 30 s ticks
        assert_eq!(paused_on, Some(41));
        let status = h.manager.status("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Paused);
        assert_eq!(h.provider.instance("m1").unwrap().state, InstanceState::Paused);
        assert_eq!(count(&h.manager, HibernationEventType::IdleDetected), 1);
        assert_eq!(count(&h.manager, HibernationEventType::AutoPaused), 1);

        // Paused machines are left alone
        let later = t0() + ChronoDuration::minutes(30);
        assert_eq!(
            h.manager.evaluate("m1", later).await.unwrap(),
            TickOutcome::Skipped(MachineState::Paused)
        );
    }

    #[tokio::test]
    async fn test_activity_resets_idle_timer() {
        let h = harness(IdleConfig::default()).await;

        h.detector.record("m1", UtilizationSample::new(t0(), 2.0, 1.0));
        h.manager.evaluate("m1", t0()).await.unwrap();

        let busy = t0() + ChronoDuration::minutes(10);
        h.detector.record("m1", UtilizationSample::new(busy, 85.0, 40.0));
        assert_eq!(
            h.manager.evaluate("m1", busy).await.unwrap(),
            TickOutcome::Reactivated
        );

        let status = h.manager.status("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Active);
        assert!(status.idle_since.is_none());

        // Idle again: the timer starts over
        let quiet = t0() + ChronoDuration::minutes(25);
        h.detector.record("m1", UtilizationSample::new(quiet, 1.0, 1.0));
        assert_eq!(
            h.manager.evaluate("m1", quiet).await.unwrap(),
            TickOutcome::IdleDetected
        );
        assert_eq!(h.provider.calls("pause"), 0);
    }

    #[tokio::test]
    async fn test_busy_sample_between_ticks_resets_idle_timer() {
        let h = harness(IdleConfig::default()).await;
        let busy_at = t0() + ChronoDuration::seconds(30 * 40 - 40);

        let mut outcomes = Vec::new();
        for tick in 1..=41 {
            let now = t0() + ChronoDuration::seconds(30 * (tick - 1));
            // Three heartbeats per tick
            for offset in [-20, -10, 0] {
                let at = now + ChronoDuration::seconds(offset);
                let gpu = if at == busy_at { 95.0 } else { 2.0 };
                h.detector.record("m1", UtilizationSample::new(at, gpu, 1.0));
            }
            outcomes.push(h.manager.evaluate("m1", now).await.unwrap());
        }

        assert!(!outcomes.contains(&TickOutcome::AutoPaused));
        assert_eq!(h.provider.calls("pause"), 0);

        let status = h.manager.status("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Idle);
        assert_eq!(status.idle_since, Some(busy_at + ChronoDuration::seconds(10)));
        assert!(status.idle_minutes < 1.0);
    }

    #[tokio::test]
    async fn test_stale_samples_never_count_as_idle() {
        let h = harness(IdleConfig::default()).await;
        h.detector.record("m1", UtilizationSample::new(t0(), 2.0, 1.0));

        let mut last = None;
        for tick in 1..=60 {
            let now = t0() + ChronoDuration::seconds(30 * (tick - 1));
            last = Some(h.manager.evaluate("m1", now).await.unwrap());
            assert_ne!(last, Some(TickOutcome::AutoPaused));
        }

        assert_eq!(last, Some(TickOutcome::Stale));
        assert_eq!(h.provider.calls("pause"), 0);
        let status = h.manager.status("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Active);
        assert!(status.idle_since.is_none());

        // Heartbeats come back and the timer starts over
        let back = t0() + ChronoDuration::minutes(31);
        h.detector.record("m1", UtilizationSample::new(back, 2.0, 1.0));
        assert_eq!(
            h.manager.evaluate("m1", back).await.unwrap(),
            TickOutcome::IdleDetected
        );
        assert_eq!(h.manager.status("m1").await.unwrap().idle_since, Some(back));
    }

    #[tokio::test]
    async fn test_gpu_idle_but_cpu_busy_is_not_idle() {
        let h = harness(IdleConfig::default()).await;
        h.detector.record("m1", UtilizationSample::new(t0(), 2.0, 60.0));

        assert_eq!(h.manager.evaluate("m1", t0()).await.unwrap(), TickOutcome::Active);
    }

    #[tokio::test]
    async fn test_auto_pause_disabled_keeps_machine_idle() {
        let h = harness(IdleConfig::default()).await;
        h.manager.set_auto_pause("m1", false).await.unwrap();

        h.detector.record("m1", UtilizationSample::new(t0(), 2.0, 1.0));
        h.manager.evaluate("m1", t0()).await.unwrap();

        for minute in 1..=120 {
            let at = t0() + ChronoDuration::minutes(minute);
            h.detector.record("m1", UtilizationSample::new(at, 1.0, 1.0));
        }
        let later = t0() + ChronoDuration::hours(2);
        let outcome = h.manager.evaluate("m1", later).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Idle { idle_minutes } if idle_minutes >= 120.0));
        assert_eq!(h.provider.calls("pause"), 0);
    }

    #[tokio::test]
    async fn test_second_pause_is_idempotent() {
        let h = harness(IdleConfig::default()).await;

        h.manager.pause("m1", PauseReason::Manual).await.unwrap();
        let status = h.manager.pause("m1", PauseReason::Manual).await.unwrap();

        assert_eq!(status.state, MachineState::Paused);
        assert_eq!(h.provider.calls("pause"), 1);
        assert_eq!(count(&h.manager, HibernationEventType::ManualPaused), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pauses_are_serialized() {
        let h = harness(IdleConfig::default()).await;
        h.provider.set_latency(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            h.manager.pause("m1", PauseReason::Manual),
            h.manager.pause("m1", PauseReason::Manual)
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.provider.calls("pause"), 1);
        assert_eq!(count(&h.manager, HibernationEventType::ManualPaused), 1);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let h = harness(IdleConfig::default()).await;

        let err = h.manager.resume("m1").await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidStateTransition { .. }));
        assert_eq!(h.provider.calls("resume"), 0);
        assert_eq!(h.manager.status("m1").await.unwrap().state, MachineState::Active);
    }

    #[tokio::test]
    async fn test_resume_books_savings() {
        let h = harness(IdleConfig {
            hourly_rate_usd: 2.0,
            ..Default::default()
        })
        .await;

        h.manager
            .pause_at("m1", PauseReason::Manual, t0())
            .await
            .unwrap();
        let status = h
            .manager
            .resume_at("m1", t0() + ChronoDuration::hours(3), false)
            .await
            .unwrap();

        assert_eq!(status.state, MachineState::Active);
        assert!((status.total_paused_hours - 3.0).abs() < 1e-9);
        assert!((status.total_savings_usd - 6.0).abs() < 1e-9);
        assert!(status.paused_at.is_none());

        let resumed = h.manager.events(
            &EventFilter {
                event_type: Some(HibernationEventType::Resumed),
                ..Default::default()
            },
            10,
        );
        assert_eq!(resumed.len(), 1);
        assert!((resumed[0].savings_usd - 6.0).abs() < 1e-9);

        let summary = h.manager.savings_summary().await;
        assert_eq!(summary.machines, 1);
        assert_eq!(summary.paused_machines, 0);
        assert!((summary.total_savings_usd - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_provider_failure_is_sticky_error() {
        let h = harness(IdleConfig::default()).await;
        h.provider.set_failing("pause", true);

        let err = h.manager.pause("m1", PauseReason::Manual).await.unwrap_err();
        assert!(matches!(err, FleetError::ProviderUnavailable { .. }));

        let status = h.manager.status("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Error);
        assert!(status.last_error.is_some());
        assert_eq!(count(&h.manager, HibernationEventType::Error), 1);

        // No automatic retry from the monitor
        h.detector.record("m1", UtilizationSample::new(t0(), 1.0, 1.0));
        assert_eq!(
            h.manager.evaluate("m1", t0()).await.unwrap(),
            TickOutcome::Skipped(MachineState::Error)
        );
        assert_eq!(h.provider.calls("pause"), 1);

        // A manual pause is the retry
        h.provider.set_failing("pause", false);
        let status = h.manager.pause("m1", PauseReason::Manual).await.unwrap();
        assert_eq!(status.state, MachineState::Paused);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_wake_retries_failed_resume() {
        let h = harness(IdleConfig::default()).await;
        h.manager.pause("m1", PauseReason::Manual).await.unwrap();

        h.provider.set_failing("resume", true);
        assert!(h.manager.resume("m1").await.is_err());
        assert_eq!(h.manager.status("m1").await.unwrap().state, MachineState::Error);

        // Plain resume refuses ERROR, wake retries it
        assert!(matches!(
            h.manager.resume("m1").await,
            Err(FleetError::InvalidStateTransition { .. })
        ));
        h.provider.set_failing("resume", false);
        let status = h.manager.wake("m1").await.unwrap();
        assert_eq!(status.state, MachineState::Active);

        assert!(matches!(
            h.manager.wake("m1").await,
            Err(FleetError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_pause_after_failed_resume_keeps_paused_at() {
        let h = harness(IdleConfig {
            hourly_rate_usd: 2.0,
            ..Default::default()
        })
        .await;
        h.manager
            .pause_at("m1", PauseReason::Manual, t0())
            .await
            .unwrap();

        h.provider.set_failing("resume", true);
        let failed_at = t0() + ChronoDuration::hours(1);
        assert!(h.manager.resume_at("m1", failed_at, false).await.is_err());

        let status = h
            .manager
            .pause_at("m1", PauseReason::Manual, failed_at)
            .await
            .unwrap();
        assert_eq!(status.state, MachineState::Paused);
        assert_eq!(status.paused_at, Some(t0()));

        h.provider.set_failing("resume", false);
        let status = h
            .manager
            .resume_at("m1", t0() + ChronoDuration::hours(3), false)
            .await
            .unwrap();
        assert!((status.total_paused_hours - 3.0).abs() < 1e-9);
        assert!((status.total_savings_usd - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let h = harness(IdleConfig::default()).await;
        assert!(matches!(
            h.manager.pause("nope", PauseReason::Manual).await,
            Err(FleetError::UnknownMachine(_))
        ));
        assert!(h.manager.start_monitoring("nope").is_err());
    }

    #[tokio::test]
    async fn test_reconfigure_replaces_policy() {
        let h = harness(IdleConfig::default()).await;
        h.manager
            .configure(
                MachineRef::new("m1", "sim"),
                IdleConfig {
                    gpu_threshold: 50.0,
                    cpu_threshold: 50.0,
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(h.manager.idle_config("m1").await.unwrap().gpu_threshold, 50.0);
        h.detector.record("m1", UtilizationSample::new(t0(), 30.0, 30.0));
        assert_eq!(
            h.manager.evaluate("m1", t0()).await.unwrap(),
            TickOutcome::IdleDetected
        );
        assert_eq!(h.manager.statuses().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_lifecycle() {
        let h = harness(IdleConfig {
            idle_threshold_minutes: 0.0,
            pause_delay_minutes: 0.0,
            ..Default::default()
        })
        .await;
        h.detector.update("m1", 1.0, 1.0, 0.0, 0, 0);

        assert!(h.manager.start_monitoring("m1").unwrap());
        assert!(!h.manager.start_monitoring("m1").unwrap());
        assert!(h.manager.is_monitoring("m1"));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(h.manager.status("m1").await.unwrap().state, MachineState::Paused);

        assert!(h.manager.stop_monitoring("m1"));
        assert!(!h.manager.stop_monitoring("m1"));
        assert!(!h.manager.is_monitoring("m1"));
    }

    #[tokio::test]
    async fn test_snapshot_before_pause() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("state.bin"), vec![7u8; 4096]).unwrap();

        let provider = Arc::new(SimulatedProvider::new("sim"));
        provider.add_instance("m1", InstanceState::Running);
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider.clone());

        let pipeline = Arc::new(
            CheckpointPipeline::new(
                Arc::new(MemoryObjectStore::new()),
                CheckpointConfig {
                    chunk_size: 1024,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let manager = HibernationManager::new(
            registry,
            Arc::new(IdleDetector::new()),
            HibernationConfig::default(),
        )
        .with_checkpoints(pipeline.clone());

        manager
            .configure(
                MachineRef::new("m1", "sim").with_workspace(workspace.path()),
                IdleConfig {
                    snapshot_before_pause: true,
                    ..Default::default()
                },
            )
            .await;

        let status = manager.pause("m1", PauseReason::Manual).await.unwrap();
        let latest = pipeline.latest_checkpoint("m1").unwrap();
        assert_eq!(status.last_checkpoint_id, Some(latest.checkpoint_id));
        assert_eq!(latest.num_chunks, 4);
    }
}
