//! Core data models for the fleet controller

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hibernation lifecycle state of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Active,
    Idle,
    Pausing,
    Paused,
    Resuming,
    Error,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Active => write!(f, "active"),
            MachineState::Idle => write!(f, "idle"),
            MachineState::Pausing => write!(f, "pausing"),
            MachineState::Paused => write!(f, "paused"),
            MachineState::Resuming => write!(f, "resuming"),
            MachineState::Error => write!(f, "error"),
        }
    }
}

/// Identifies a machine and the provider that bills for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRef {
    /// Machine identifier, also the provider's instance id
    pub machine_id: String,
    /// Name of the provider in the registry
    pub provider: String,
    /// Local workspace directory snapshotted before a pause
    #[serde(default)]
    pub workspace: Option<std::path::PathBuf>,
}

impl MachineRef {
    pub fn new(machine_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            provider: provider.into(),
            workspace: None,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<std::path::PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

/// Per-machine hibernation status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineIdleStatus {
    pub machine_id: String,
    pub provider: String,
    pub state: MachineState,
    pub idle_since: Option<DateTime<Utc>>,
    pub idle_minutes: f64,
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused_hours: f64,
    pub total_savings_usd: f64,
    pub last_checkpoint_id: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MachineIdleStatus {
    pub fn new(machine_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            provider: provider.into(),
            state: MachineState::Active,
            idle_since: None,
            idle_minutes: 0.0,
            paused_at: None,
            total_paused_hours: 0.0,
            total_savings_usd: 0.0,
            last_checkpoint_id: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Daily window during which auto-pause may fire (UTC hours, may wrap midnight)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl ScheduleWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour() as u8;

        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Window spans midnight
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Per-machine idle policy, replaced wholesale on reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// GPU utilization percent below which the machine counts as idle
    pub gpu_threshold: f64,
    /// CPU utilization percent below which the machine counts as idle
    pub cpu_threshold: f64,
    pub idle_threshold_minutes: f64,
    pub pause_delay_minutes: f64,
    pub auto_pause_enabled: bool,
    pub schedule: Option<ScheduleWindow>,
    /// Assumed hourly price used to compute savings
    pub hourly_rate_usd: f64,
    pub snapshot_before_pause: bool,
}

impl IdleConfig {
    /// Idle minutes after which auto-pause fires
    pub fn pause_after_minutes(&self) -> f64 {
        self.idle_threshold_minutes + self.pause_delay_minutes
    }

    pub fn auto_pause_allowed_at(&self, at: DateTime<Utc>) -> bool {
        self.auto_pause_enabled && self.schedule.map(|w| w.contains(at)).unwrap_or(true)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            gpu_threshold: 10.0,
            cpu_threshold: 5.0,
            idle_threshold_minutes: 15.0,
            pause_delay_minutes: 5.0,
            auto_pause_enabled: true,
            schedule: None,
            hourly_rate_usd: 0.0,
            snapshot_before_pause: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HibernationEventType {
    IdleDetected,
    AutoPaused,
    ManualPaused,
    Resumed,
    Error,
}

impl fmt::Display for HibernationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HibernationEventType::IdleDetected => write!(f, "idle_detected"),
            HibernationEventType::AutoPaused => write!(f, "auto_paused"),
            HibernationEventType::ManualPaused => write!(f, "manual_paused"),
            HibernationEventType::Resumed => write!(f, "resumed"),
            HibernationEventType::Error => write!(f, "error"),
        }
    }
}

/// Append-only audit record of a hibernation transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HibernationEvent {
    pub machine_id: String,
    pub event_type: HibernationEventType,
    pub timestamp: DateTime<Utc>,
    pub idle_hours: f64,
    pub savings_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Why a pause was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    Idle,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    Full,
    Incremental,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointType::Full => write!(f, "full"),
            CheckpointType::Incremental => write!(f, "incremental"),
        }
    }
}

/// Immutable record of a completed snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub machine_id: String,
    pub checkpoint_type: CheckpointType,
    pub storage_path: String,
    pub provider: String,
    pub size_original: u64,
    pub size_compressed: u64,
    pub num_chunks: usize,
    pub base_checkpoint_id: Option<String>,
    pub files_changed: usize,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn compression_ratio(&self) -> f64 {
        if self.size_original == 0 {
            return 0.0;
        }
        (1.0 - (self.size_compressed as f64 / self.size_original as f64)) * 100.0
    }
}

/// Outcome of one restore call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub checkpoint_id: String,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub download_time_ms: u64,
    pub decompress_time_ms: u64,
    pub total_time_ms: u64,
    pub files_restored: usize,
    pub bytes_restored: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmPoolState {
    Inactive,
    Starting,
    Active,
    Failover,
    Error,
}

impl fmt::Display for WarmPoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarmPoolState::Inactive => write!(f, "inactive"),
            WarmPoolState::Starting => write!(f, "starting"),
            WarmPoolState::Active => write!(f, "active"),
            WarmPoolState::Failover => write!(f, "failover"),
            WarmPoolState::Error => write!(f, "error"),
        }
    }
}

/// Connection details of one side of a warm pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub instance_id: String,
    pub provider: String,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl From<&Instance> for PoolMember {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            provider: instance.provider.clone(),
            host: instance.host.clone(),
            port: instance.port,
        }
    }
}

/// Warm-pool status of one protected primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmPoolStatus {
    pub machine_id: String,
    pub state: WarmPoolState,
    pub primary: Option<PoolMember>,
    pub standby: Option<PoolMember>,
    pub standby_checkpoint_id: Option<String>,
    pub failover_count: u32,
    pub last_failover_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WarmPoolStatus {
    pub fn new(machine_id: impl Into<String>, primary: Option<PoolMember>) -> Self {
        Self {
            machine_id: machine_id.into(),
            state: WarmPoolState::Inactive,
            primary,
            standby: None,
            standby_checkpoint_id: None,
            failover_count: 0,
            last_failover_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Paused,
    Stopped,
    Interrupted,
    Terminated,
    Unknown,
}

impl InstanceState {
    /// Whether the instance can no longer serve as a primary
    pub fn is_lost(&self) -> bool {
        matches!(self, InstanceState::Interrupted | InstanceState::Terminated)
    }
}

/// Provider-tagged machine handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub provider: String,
    pub name: String,
    pub state: InstanceState,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
    pub gpu_ram_gb: f64,
    pub price_per_hour: f64,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Request for a new instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub min_gpu_ram_gb: f64,
    pub max_price_per_hour: f64,
    pub preferred_gpu_types: Vec<String>,
    pub gpu_count: u32,
}

/// One utilization reading for a machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub gpu_util: f64,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

impl UtilizationSample {
    pub fn new(timestamp: DateTime<Utc>, gpu_util: f64, cpu_util: f64) -> Self {
        Self {
            timestamp,
            gpu_util,
            cpu_util,
            mem_util: 0.0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
        }
    }

    /// Both resources below threshold
    pub fn is_idle(&self, gpu_threshold: f64, cpu_threshold: f64) -> bool {
        self.gpu_util < gpu_threshold && self.cpu_util < cpu_threshold
    }
}

/// GPU section of an agent heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub utilization: f64,
    pub gpu_count: u32,
    #[serde(default)]
    pub per_gpu_utilization: Vec<f64>,
    #[serde(default)]
    pub memory_used: Vec<u64>,
    #[serde(default)]
    pub memory_total: Vec<u64>,
}

impl GpuMetrics {
    /// Fraction of GPU memory in use across all devices, as percent
    pub fn memory_utilization(&self) -> f64 {
        let total: u64 = self.memory_total.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let used: u64 = self.memory_used.iter().sum();
        used as f64 / total as f64 * 100.0
    }
}

/// Host section of an agent heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_utilization: f64,
    #[serde(default)]
    pub memory_utilization: f64,
    #[serde(default)]
    pub net_rx_bytes: u64,
    #[serde(default)]
    pub net_tx_bytes: u64,
}

/// Heartbeat pushed by the on-machine agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub machine_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub gpu_metrics: GpuMetrics,
    #[serde(default)]
    pub system_metrics: Option<SystemMetrics>,
}

impl Heartbeat {
    pub fn to_sample(&self) -> UtilizationSample {
        let system = self.system_metrics.clone().unwrap_or_default();
        let mem_util = if system.memory_utilization > 0.0 {
            system.memory_utilization
        } else {
            self.gpu_metrics.memory_utilization()
        };

        UtilizationSample {
            timestamp: self.timestamp,
            gpu_util: self.gpu_metrics.utilization,
            cpu_util: system.cpu_utilization,
            mem_util,
            net_rx_bytes: system.net_rx_bytes,
            net_tx_bytes: system.net_tx_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_schedule_window_wraps_midnight() {
        let window = ScheduleWindow {
            start_hour: 22,
            end_hour: 6,
        };
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();

        assert!(window.contains(at(23)));
        assert!(window.contains(at(2)));
        assert!(!window.contains(at(6)));
        assert!(!window.contains(at(12)));
    }

    #[test]
    fn test_auto_pause_respects_schedule() {
        let config = IdleConfig {
            schedule: Some(ScheduleWindow {
                start_hour: 1,
                end_hour: 5,
            }),
            ..Default::default()
        };
        let night = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        let day = Utc.with_ymd_and_hms(2024, 1, 1, 14, 0, 0).unwrap();

        assert!(config.auto_pause_allowed_at(night));
        assert!(!config.auto_pause_allowed_at(day));
        assert_eq!(config.pause_after_minutes(), 20.0);
    }

    #[test]
    fn test_heartbeat_without_system_metrics() {
        let json = r#"{
            "machine_id": "m1",
            "status": "online",
            "timestamp": "2024-01-01T00:00:00Z",
            "gpu_metrics": {
                "utilization": 42.0,
                "gpu_count": 2,
                "per_gpu_utilization": [40.0, 44.0],
                "memory_used": [1024, 3072],
                "memory_total": [8192, 8192]
            }
        }"#;

        let heartbeat: Heartbeat = serde_json::from_str(json).unwrap();
        let sample = heartbeat.to_sample();

        assert_eq!(sample.gpu_util, 42.0);
        assert_eq!(sample.cpu_util, 0.0);
        assert!((sample.mem_util - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&MachineState::Paused).unwrap(),
            "\"paused\""
        );
        assert_eq!(
            serde_json::to_string(&HibernationEventType::IdleDetected).unwrap(),
            "\"idle_detected\""
        );
    }
}
