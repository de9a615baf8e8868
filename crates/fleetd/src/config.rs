//! Daemon configuration

use anyhow::{Context, Result};
use fleet_core::{
    idle::DEFAULT_MAX_SAMPLE_AGE_SECS, optimizer::OptimizerConfig, CheckpointConfig,
    HibernationConfig, IdleConfig, IdleDetector, MachineRef, WarmPoolConfig,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Name attached to every structured log line
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// API server port for health, metrics and heartbeats
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderEntry>,

    #[serde(default)]
    pub hibernation: HibernationSection,

    /// Machines watched for idleness
    #[serde(default)]
    pub machines: Vec<MachineEntry>,

    #[serde(default)]
    pub checkpoint: CheckpointSection,

    #[serde(default)]
    pub warm_pool: WarmPoolSection,

    #[serde(default)]
    pub optimizer: OptimizerSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    /// Implementation kind understood by the provider factory
    #[serde(default = "default_provider_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HibernationSection {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    /// Newest heartbeat older than this never counts as idle
    #[serde(default = "default_max_sample_age")]
    pub max_sample_age_secs: u64,
}

impl Default for HibernationSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            provider_timeout_secs: default_provider_timeout(),
            max_sample_age_secs: default_max_sample_age(),
        }
    }
}

impl HibernationSection {
    pub fn to_config(&self) -> HibernationConfig {
        HibernationConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            ..Default::default()
        }
    }

    pub fn idle_detector(&self) -> IdleDetector {
        let max_age = self.max_sample_age_secs.max(self.tick_interval_secs.max(1));
        IdleDetector::new().with_max_sample_age(chrono::Duration::seconds(max_age as i64))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEntry {
    pub machine_id: String,
    pub provider: String,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub idle: IdleConfig,
}

impl MachineEntry {
    pub fn machine_ref(&self) -> MachineRef {
        let machine = MachineRef::new(&self.machine_id, &self.provider);
        match &self.workspace {
            Some(dir) => machine.with_workspace(dir),
            None => machine,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    /// Directory backing the object store
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: usize,
    /// Chunk workers, defaults to the number of cores
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "default_true")]
    pub incremental: bool,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            codec: default_codec(),
            chunk_size_mb: default_chunk_size_mb(),
            parallelism: None,
            incremental: true,
        }
    }
}

impl CheckpointSection {
    pub fn to_config(&self) -> CheckpointConfig {
        let mut config = CheckpointConfig {
            chunk_size: self.chunk_size_mb.max(1) * 1024 * 1024,
            codec: self.codec.clone(),
            incremental: self.incremental,
            ..Default::default()
        };
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism.max(1);
            config.queue_depth = config.parallelism * 2;
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmPoolSection {
    #[serde(default = "default_tick_interval")]
    pub check_interval_secs: u64,
    /// Protected machines
    #[serde(default)]
    pub pools: Vec<WarmPoolConfig>,
}

impl Default for WarmPoolSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_tick_interval(),
            pools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizerSection {
    #[serde(default)]
    pub enabled: bool,
    /// Webhook receiving a JSON notification before each action
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(flatten)]
    pub policy: OptimizerConfig,
}

fn default_controller_name() -> String {
    "fleetd".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_provider_kind() -> String {
    "simulated".to_string()
}

fn default_providers() -> Vec<ProviderEntry> {
    vec![ProviderEntry {
        name: "simulated".to_string(),
        kind: default_provider_kind(),
    }]
}

fn default_tick_interval() -> u64 {
    30
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_max_sample_age() -> u64 {
    DEFAULT_MAX_SAMPLE_AGE_SECS as u64
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/fleetd/checkpoints")
}

fn default_codec() -> String {
    "zstd".to_string()
}

fn default_chunk_size_mb() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl FleetConfig {
    /// Load configuration from the optional `FLEET_CONFIG` file, then environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("FLEET_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid fleet configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn parse(toml: &str) -> FleetConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("");

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.providers, default_providers());
        assert_eq!(config.hibernation.to_config().tick_interval, Duration::from_secs(30));
        assert_eq!(
            config.hibernation.idle_detector().max_sample_age(),
            chrono::Duration::seconds(180)
        );
        assert_eq!(config.checkpoint.to_config().chunk_size, 64 * 1024 * 1024);
        assert!(!config.optimizer.enabled);
        assert!(config.machines.is_empty());
    }

    #[test]
    fn test_machine_and_pool_sections() {
        let config = parse(
            r#"
            api_port = 9100

            [hibernation]
            tick_interval_secs = 60
            max_sample_age_secs = 30

            [[machines]]
            machine_id = "m1"
            provider = "vast"
            workspace = "/data/m1"
            idle = { hourly_rate_usd = 2.5, pause_delay_minutes = 0.0 }

            [checkpoint]
            codec = "gzip"
            chunk_size_mb = 8
            parallelism = 3

            [[warm_pool.pools]]
            machine_id = "m1"
            provider = "vast"
            primary_instance_id = "i-42"
            min_gpu_ram_gb = 24.0
            max_price_per_hour = 1.5
            auto_failover = true

            [optimizer]
            enabled = true
            dry_run = true
            pause_threshold_gpu = 8.0
            "#,
        );

        // Never shorter than one tick
        assert_eq!(
            config.hibernation.idle_detector().max_sample_age(),
            chrono::Duration::seconds(60)
        );

        let machine = &config.machines[0];
        assert_eq!(machine.idle.hourly_rate_usd, 2.5);
        assert_eq!(machine.idle.idle_threshold_minutes, 15.0);
        assert_eq!(
            machine.machine_ref().workspace,
            Some(PathBuf::from("/data/m1"))
        );

        let checkpoint = config.checkpoint.to_config();
        assert_eq!(checkpoint.codec, "gzip");
        assert_eq!(checkpoint.chunk_size, 8 * 1024 * 1024);
        assert_eq!(checkpoint.queue_depth, 6);

        assert!(config.warm_pool.pools[0].auto_failover);
        assert!(config.optimizer.enabled);
        assert!(config.optimizer.policy.dry_run);
        assert_eq!(config.optimizer.policy.pause_threshold_gpu, 8.0);
        assert_eq!(config.optimizer.policy.pause_threshold_cpu, 5.0);
    }
}
