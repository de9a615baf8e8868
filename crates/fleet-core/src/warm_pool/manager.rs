use crate::checkpoint::CheckpointPipeline;
use crate::error::{with_timeout, FleetError, Result};
use crate::models::{InstanceSpec, PoolMember, WarmPoolState, WarmPoolStatus};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::provider::{self, ProviderAction, ProviderRegistry};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Standby policy for one protected machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolConfig {
    pub machine_id: String,
    /// Provider hosting both the primary and the standby
    pub provider: String,
    /// Instance currently serving as primary
    pub primary_instance_id: Option<String>,
    pub min_gpu_ram_gb: f64,
    pub max_price_per_hour: f64,
    #[serde(default)]
    pub preferred_gpu_types: Vec<String>,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    /// Promote the standby automatically when the primary is lost
    #[serde(default)]
    pub auto_failover: bool,
}

fn default_gpu_count() -> u32 {
    1
}

impl WarmPoolConfig {
    pub fn new(machine_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            provider: provider.into(),
            primary_instance_id: None,
            min_gpu_ram_gb: 0.0,
            max_price_per_hour: f64::MAX,
            preferred_gpu_types: Vec::new(),
            gpu_count: default_gpu_count(),
            auto_failover: false,
        }
    }

    pub fn with_primary(mut self, instance_id: impl Into<String>) -> Self {
        self.primary_instance_id = Some(instance_id.into());
        self
    }

    fn standby_spec(&self) -> InstanceSpec {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        InstanceSpec {
            name: format!("{}-standby-{}", self.machine_id, &suffix[..8]),
            min_gpu_ram_gb: self.min_gpu_ram_gb,
            max_price_per_hour: self.max_price_per_hour,
            preferred_gpu_types: self.preferred_gpu_types.clone(),
            gpu_count: self.gpu_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmPoolManagerConfig {
    /// Time between primary health checks
    pub check_interval: Duration,
    /// Deadline for listing instances
    pub list_timeout: Duration,
    /// Deadline for provisioning a standby
    pub create_timeout: Duration,
    /// Deadline for destroying a standby
    pub destroy_timeout: Duration,
}

impl Default for WarmPoolManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            list_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(600),
            destroy_timeout: Duration::from_secs(120),
        }
    }
}

/// Promoted primary returned by a failover
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverResult {
    pub machine_id: String,
    pub previous_primary: Option<PoolMember>,
    pub primary: PoolMember,
    pub failover_count: u32,
    /// Newest checkpoint of the machine, to be restored onto the new primary
    pub restore_checkpoint_id: Option<String>,
}

struct PoolEntry {
    config: RwLock<Arc<WarmPoolConfig>>,
    status: RwLock<WarmPoolStatus>,
    /// Serializes provisioning and teardown for this pool
    provisioning: AsyncMutex<()>,
}

pub struct WarmPoolManager {
    providers: Arc<ProviderRegistry>,
    checkpoints: Option<Arc<CheckpointPipeline>>,
    config: WarmPoolManagerConfig,
    pools: DashMap<String, Arc<PoolEntry>>,
    monitors: DashMap<String, CancellationToken>,
    metrics: Option<FleetMetrics>,
    logger: StructuredLogger,
}

impl WarmPoolManager {
    pub fn new(providers: Arc<ProviderRegistry>, config: WarmPoolManagerConfig) -> Self {
        Self {
            providers,
            checkpoints: None,
            config,
            pools: DashMap::new(),
            monitors: DashMap::new(),
            metrics: None,
            logger: StructuredLogger::default(),
        }
    }

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

    /// Register a protected machine or replace its standby policy
    pub async fn configure(&self, config: WarmPoolConfig) {
        let machine_id = config.machine_id.clone();
        let primary = config.primary_instance_id.as_ref().map(|id| PoolMember {
            instance_id: id.clone(),
            provider: config.provider.clone(),
            host: None,
            port: None,
        });
        let config = Arc::new(config);

        let existing = match self.pools.entry(machine_id.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(PoolEntry {
                    config: RwLock::new(config.clone()),
                    status: RwLock::new(WarmPoolStatus::new(&machine_id, primary)),
                    provisioning: AsyncMutex::new(()),
                }));
                None
            }
        };

        match existing {
            Some(entry) => {
                *entry.config.write().await = config;
                info!(machine_id = %machine_id, "Warm pool policy updated");
            }
            None => info!(machine_id = %machine_id, "Warm pool configured"),
        }
    }

    fn entry(&self, machine_id: &str) -> Result<Arc<PoolEntry>> {
        self.pools
            .get(machine_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::UnknownMachine(machine_id.to_string()))
    }

    pub async fn status(&self, machine_id: &str) -> Result<WarmPoolStatus> {
        let entry = self.entry(machine_id)?;
        let status = entry.status.read().await.clone();
        Ok(status)
    }

    pub async fn statuses(&self) -> Vec<WarmPoolStatus> {
        let entries: Vec<Arc<PoolEntry>> = self.pools.iter().map(|e| e.value().clone()).collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(entry.status.read().await.clone());
        }
        statuses.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        statuses
    }

    /// Provision a standby and start watching the primary
    ///
    /// A pool that is already `ACTIVE` is left untouched.
    pub async fn start(self: &Arc<Self>, machine_id: &str) -> Result<WarmPoolStatus> {
        let entry = self.entry(machine_id)?;
        let _guard = entry.provisioning.lock().await;

        {
            let mut status = entry.status.write().await;
            if status.state == WarmPoolState::Active {
                debug!(machine_id = %machine_id, "Warm pool already active");
                return Ok(status.clone());
            }
            status.state = WarmPoolState::Starting;
            status.error_message = None;
        }

        info!(machine_id = %machine_id, "Starting warm pool");
        let status = self.provision_standby(&entry).await?;
        if status.state == WarmPoolState::Active {
            self.spawn_monitor(machine_id);
        }
        Ok(status)
    }

    /// Create a standby and publish it in one step
    ///
    /// Caller holds the pool's provisioning lock.
    async fn provision_standby(&self, entry: &PoolEntry) -> Result<WarmPoolStatus> {
        let config = entry.config.read().await.clone();
        let machine_id = &config.machine_id;

        let created = match self.providers.get(&config.provider) {
            Ok(provider) => {
                let spec = config.standby_spec();
                with_timeout(
                    format!("{}.create", config.provider),
                    self.config.create_timeout,
                    provider.create(&spec),
                )
                .await
            }
            Err(e) => Err(e),
        };

        let instance = match created {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_provider_error(&config.provider, "create");
                }
                let mut status = entry.status.write().await;
                status.state = WarmPoolState::Error;
                status.standby = None;
                status.error_message = Some(e.to_string());
                error!(machine_id = %machine_id, error = %e, "Failed to provision standby");
                return Err(e);
            }
        };

        let checkpoint_id = self.latest_checkpoint_id(machine_id);
        let mut status = entry.status.write().await;
        if status.state == WarmPoolState::Inactive {
            // Stopped while the instance was being created
            drop(status);
            warn!(
                machine_id = %machine_id,
                instance_id = %instance.instance_id,
                "Pool stopped during provisioning, releasing standby"
            );
            self.destroy_instance(&config.provider, &instance.instance_id)
                .await;
            return self.status(machine_id).await;
        }

        status.standby = Some(PoolMember::from(&instance));
        status.standby_checkpoint_id = checkpoint_id;
        status.state = WarmPoolState::Active;
        status.error_message = None;
        info!(
            machine_id = %machine_id,
            standby = %instance.instance_id,
            gpu_type = ?instance.gpu_type,
            price_per_hour = instance.price_per_hour,
            "Standby ready"
        );
        Ok(status.clone())
    }

    fn latest_checkpoint_id(&self, machine_id: &str) -> Option<String> {
        self.checkpoints
            .as_ref()
            .and_then(|p| p.latest_checkpoint(machine_id))
            .map(|c| c.checkpoint_id)
    }

    /// Promote the standby to primary
    ///
    /// The pool reads `FAILOVER` until the new primary is recorded in both
    /// status and config. Returns as soon as the promotion is recorded; a
    /// replacement standby is provisioned in the background.
    pub async fn trigger_failover(self: &Arc<Self>, machine_id: &str) -> Result<FailoverResult> {
        let entry = self.entry(machine_id)?;

        let result = {
            let mut status = entry.status.write().await;
            if status.state != WarmPoolState::Active {
                return Err(FleetError::InvalidStateTransition {
                    machine_id: machine_id.to_string(),
                    state: status.state.to_string(),
                    operation: "failover",
                });
            }
            let standby = status
                .standby
                .take()
                .ok_or_else(|| FleetError::NoStandby(machine_id.to_string()))?;

            let previous_primary = status.primary.replace(standby.clone());
            status.standby_checkpoint_id = None;
            status.failover_count += 1;
            status.last_failover_at = Some(Utc::now());
            status.state = WarmPoolState::Failover;

            FailoverResult {
                machine_id: machine_id.to_string(),
                previous_primary,
                primary: standby,
                failover_count: status.failover_count,
                restore_checkpoint_id: self.latest_checkpoint_id(machine_id),
            }
        };

        {
            let mut config = entry.config.write().await;
            let mut updated = WarmPoolConfig::clone(&config);
            updated.primary_instance_id = Some(result.primary.instance_id.clone());
            *config = Arc::new(updated);
        }
        {
            // A concurrent stop wins
            let mut status = entry.status.write().await;
            if status.state == WarmPoolState::Failover {
                status.state = WarmPoolState::Active;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.inc_failovers();
        }
        self.logger.log_failover(
            machine_id,
            result
                .previous_primary
                .as_ref()
                .map(|p| p.instance_id.as_str()),
            &result.primary.instance_id,
            result.failover_count,
        );

        self.spawn_replenish(entry);
        Ok(result)
    }

    fn spawn_replenish(self: &Arc<Self>, entry: Arc<PoolEntry>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = entry.provisioning.lock().await;
            {
                let status = entry.status.read().await;
                if status.state != WarmPoolState::Active || status.standby.is_some() {
                    return;
                }
            }
            if let Err(e) = manager.provision_standby(&entry).await {
                warn!(error = %e, "Standby replenishment failed");
            }
        });
    }

    /// Destroy the standby, stop the monitor and mark the pool `INACTIVE`
    pub async fn stop(&self, machine_id: &str) -> Result<WarmPoolStatus> {
        let entry = self.entry(machine_id)?;

        if let Some((_, token)) = self.monitors.remove(machine_id) {
            token.cancel();
        }

        {
            let mut status = entry.status.write().await;
            status.state = WarmPoolState::Inactive;
        }

        let _guard = entry.provisioning.lock().await;
        let config = entry.config.read().await.clone();
        let standby = {
            let mut status = entry.status.write().await;
            status.state = WarmPoolState::Inactive;
            status.standby_checkpoint_id = None;
            status.error_message = None;
            status.standby.take()
        };

        if let Some(standby) = standby {
            self.destroy_instance(&config.provider, &standby.instance_id)
                .await;
        }

        info!(machine_id = %machine_id, "Warm pool stopped");
        self.status(machine_id).await
    }

    /// Best-effort teardown; failures are logged and the instance forgotten
    async fn destroy_instance(&self, provider_name: &str, instance_id: &str) {
        let result = match self.providers.get(provider_name) {
            Ok(provider) => {
                provider::invoke(
                    provider.as_ref(),
                    ProviderAction::Destroy,
                    instance_id,
                    self.config.destroy_timeout,
                )
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Some(metrics) = &self.metrics {
                metrics.inc_provider_error(provider_name, "destroy");
            }
            warn!(
                provider = %provider_name,
                instance_id = %instance_id,
                error = %e,
                "Failed to destroy standby"
            );
        }
    }

    fn spawn_monitor(self: &Arc<Self>, machine_id: &str) {
        let token = match self.monitors.entry(machine_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                token
            }
        };

        let manager = Arc::clone(self);
        let id = machine_id.to_string();
        tokio::spawn(async move { manager.monitor_loop(id, token).await });
    }

    pub fn is_monitoring(&self, machine_id: &str) -> bool {
        self.monitors.contains_key(machine_id)
    }

    /// Cancel every monitor loop; standbys are left running
    pub fn shutdown(&self) {
        for entry in self.monitors.iter() {
            entry.value().cancel();
        }
        self.monitors.clear();
    }

    async fn monitor_loop(self: Arc<Self>, machine_id: String, cancel: CancellationToken) {
        info!(machine_id = %machine_id, "Starting warm pool monitor");

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the standby was just created
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_pool(&machine_id).await {
                        warn!(machine_id = %machine_id, error = %e, "Warm pool check failed");
                    }
                }
            }
        }

        info!(machine_id = %machine_id, "Warm pool monitor stopped");
    }

    /// One health check of the primary and standby
    ///
    /// Returns the failover performed, if any. A listing failure is
    /// reported as an error and never read as a lost primary.
    pub async fn check_pool(self: &Arc<Self>, machine_id: &str) -> Result<Option<FailoverResult>> {
        let entry = self.entry(machine_id)?;
        let config = entry.config.read().await.clone();
        let (primary_id, standby_id, state) = {
            let status = entry.status.read().await;
            (
                status.primary.as_ref().map(|p| p.instance_id.clone()),
                status.standby.as_ref().map(|s| s.instance_id.clone()),
                status.state,
            )
        };
        if state != WarmPoolState::Active {
            return Ok(None);
        }

        let provider = self.providers.get(&config.provider)?;
        let instances = with_timeout(
            format!("{}.list", config.provider),
            self.config.list_timeout,
            provider.list_instances(),
        )
        .await
        .map_err(|e| {
            if let Some(metrics) = &self.metrics {
                metrics.inc_provider_error(&config.provider, "list");
            }
            e
        })?;

        let alive = |id: &str| {
            instances
                .iter()
                .any(|i| i.instance_id == id && !i.state.is_lost())
        };

        if let Some(standby_id) = &standby_id {
            if !alive(standby_id) {
                warn!(machine_id = %machine_id, standby = %standby_id, "Standby lost, replacing");
                let mut status = entry.status.write().await;
                if status.standby.as_ref().map(|s| &s.instance_id) == Some(standby_id) {
                    status.standby = None;
                    status.standby_checkpoint_id = None;
                }
                drop(status);
                self.spawn_replenish(entry.clone());
                return Ok(None);
            }
        }

        let primary_id = match primary_id {
            Some(id) => id,
            None => return Ok(None),
        };
        if alive(&primary_id) {
            return Ok(None);
        }

        warn!(machine_id = %machine_id, primary = %primary_id, "Primary lost");
        if !config.auto_failover {
            return Ok(None);
        }
        self.trigger_failover(machine_id).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceState;
    use crate::provider::SimulatedProvider;
    use tokio_test::{assert_err, assert_ok};

    async fn harness(auto_failover: bool) -> (Arc<WarmPoolManager>, Arc<SimulatedProvider>) {
        let provider = Arc::new(SimulatedProvider::new("sim"));
        provider.add_instance("primary-1", InstanceState::Running);
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider.clone());

        let manager = Arc::new(WarmPoolManager::new(
            registry,
            WarmPoolManagerConfig::default(),
        ));
        let mut config = WarmPoolConfig::new("m1", "sim").with_primary("primary-1");
        config.min_gpu_ram_gb = 16.0;
        config.max_price_per_hour = 1.0;
        config.auto_failover = auto_failover;
        manager.configure(config).await;

        (manager, provider)
    }

    async fn wait_for_standby(manager: &WarmPoolManager) -> PoolMember {
        for _ in 0..100 {
            if let Some(standby) = manager.status("m1").await.unwrap().standby {
                return standby;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("standby was not replenished");
    }

    #[tokio::test]
    async fn test_start_provisions_standby() {
        let (manager, provider) = harness(false).await;

        let status = assert_ok!(manager.start("m1").await);
        assert_eq!(status.state, WarmPoolState::Active);
        let standby = status.standby.unwrap();
        assert!(standby.instance_id.starts_with("m1-standby-"));
        assert!(standby.host.is_some());
        assert_eq!(provider.calls("create"), 1);
        assert!(manager.is_monitoring("m1"));

        // Second start is a no-op
        manager.start("m1").await.unwrap();
        assert_eq!(provider.calls("create"), 1);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_standby() {
        let (manager, provider) = harness(false).await;
        provider.set_failing("create", true);

        assert_err!(manager.start("m1").await);
        let status = manager.status("m1").await.unwrap();
        assert_eq!(status.state, WarmPoolState::Error);
        assert!(status.standby.is_none());
        assert!(status.error_message.is_some());

        // Retry from ERROR
        provider.set_failing("create", false);
        let status = assert_ok!(manager.start("m1").await);
        assert_eq!(status.state, WarmPoolState::Active);
        assert!(status.error_message.is_none());
    }

    #[tokio::test]
    async fn test_policy_the_provider_cannot_meet() {
        let (manager, _provider) = harness(false).await;
        let mut config = WarmPoolConfig::new("m1", "sim").with_primary("primary-1");
        config.min_gpu_ram_gb = 80.0;
        manager.configure(config).await;

        let err = manager.start("m1").await.unwrap_err();
        assert!(matches!(err, FleetError::ProviderRejected { .. }));
        assert!(manager.status("m1").await.unwrap().standby.is_none());
    }

    #[tokio::test]
    async fn test_failover_promotes_and_replenishes() {
        let (manager, provider) = harness(false).await;
        let standby = manager.start("m1").await.unwrap().standby.unwrap();

        let result = manager.trigger_failover("m1").await.unwrap();
        assert_eq!(result.primary, standby);
        assert_eq!(result.failover_count, 1);
        assert_eq!(
            result.previous_primary.map(|p| p.instance_id),
            Some("primary-1".to_string())
        );

        let status = manager.status("m1").await.unwrap();
        assert_eq!(status.primary, Some(standby.clone()));
        assert_eq!(status.failover_count, 1);
        assert!(status.last_failover_at.is_some());

        let replacement = wait_for_standby(&manager).await;
        assert_ne!(replacement.instance_id, standby.instance_id);
        assert_eq!(provider.calls("create"), 2);
        assert_eq!(manager.status("m1").await.unwrap().state, WarmPoolState::Active);
    }

    #[tokio::test]
    async fn test_failover_requires_standby() {
        let (manager, provider) = harness(false).await;

        let err = manager.trigger_failover("m1").await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidStateTransition { .. }));

        manager.start("m1").await.unwrap();
        provider.set_latency(Duration::from_millis(200));
        manager.trigger_failover("m1").await.unwrap();

        // Replenishment still in flight
        let err = manager.trigger_failover("m1").await.unwrap_err();
        assert!(matches!(err, FleetError::NoStandby(_)));
    }

    #[tokio::test]
    async fn test_stop_destroys_standby() {
        let (manager, provider) = harness(false).await;
        let standby = manager.start("m1").await.unwrap().standby.unwrap();

        let status = manager.stop("m1").await.unwrap();
        assert_eq!(status.state, WarmPoolState::Inactive);
        assert!(status.standby.is_none());
        assert!(provider.instance(&standby.instance_id).is_none());
        assert!(!manager.is_monitoring("m1"));
    }

    #[tokio::test]
    async fn test_lost_primary_triggers_failover() {
        let (manager, provider) = harness(true).await;
        let standby = manager.start("m1").await.unwrap().standby.unwrap();

        assert!(manager.check_pool("m1").await.unwrap().is_none());

        provider.set_state("primary-1", InstanceState::Interrupted);
        let result = manager.check_pool("m1").await.unwrap().unwrap();
        assert_eq!(result.primary.instance_id, standby.instance_id);
    }

    #[tokio::test]
    async fn test_listing_failure_is_not_a_lost_primary() {
        let (manager, provider) = harness(true).await;
        manager.start("m1").await.unwrap();
        provider.set_failing("list", true);

        assert_err!(manager.check_pool("m1").await);
        let status = manager.status("m1").await.unwrap();
        assert_eq!(status.failover_count, 0);
        assert_eq!(status.primary.unwrap().instance_id, "primary-1");
    }

    #[tokio::test]
    async fn test_lost_primary_without_auto_failover() {
        let (manager, provider) = harness(false).await;
        manager.start("m1").await.unwrap();
        provider.remove_instance("primary-1");

        assert!(manager.check_pool("m1").await.unwrap().is_none());
        assert_eq!(manager.status("m1").await.unwrap().failover_count, 0);
    }

    #[tokio::test]
    async fn test_lost_standby_is_replaced() {
        let (manager, provider) = harness(true).await;
        let standby = manager.start("m1").await.unwrap().standby.unwrap();
        provider.remove_instance(&standby.instance_id);

        assert!(manager.check_pool("m1").await.unwrap().is_none());
        let replacement = wait_for_standby(&manager).await;
        assert_ne!(replacement.instance_id, standby.instance_id);
    }

    #[tokio::test]
    async fn test_failover_state_visible_during_promotion() {
        let (manager, _provider) = harness(false).await;
        let standby = assert_ok!(manager.start("m1").await).standby.unwrap();

        let entry = manager.entry("m1").unwrap();
        let config_guard = entry.config.write().await;

        let promoting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.trigger_failover("m1").await })
        };
        for _ in 0..100 {
            if manager.status("m1").await.unwrap().state == WarmPoolState::Failover {
                break;
            }
            tokio::task::yield_now().await;
        }

        let status = manager.status("m1").await.unwrap();
        assert_eq!(status.state, WarmPoolState::Failover);
        assert_eq!(status.primary, Some(standby.clone()));
        let err = assert_err!(manager.trigger_failover("m1").await);
        assert!(matches!(err, FleetError::InvalidStateTransition { .. }));

        drop(config_guard);
        let result = assert_ok!(promoting.await.unwrap());
        assert_eq!(result.primary, standby);
        assert_eq!(manager.status("m1").await.unwrap().state, WarmPoolState::Active);
        assert_eq!(
            entry.config.read().await.primary_instance_id,
            Some(standby.instance_id)
        );
    }
}
