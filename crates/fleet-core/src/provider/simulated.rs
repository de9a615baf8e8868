//! In-memory compute provider
//!
//! Keeps instances and their latest utilization in memory. Used by the
//! daemon's `simulated` provider kind for local runs and by tests, which can
//! inject latency and per-operation failures.

use super::{async_trait, ComputeProvider};
use crate::error::{FleetError, Result};
use crate::models::{Instance, InstanceSpec, InstanceState, UtilizationSample};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// The single offer the simulator can provision
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedOffer {
    pub gpu_type: String,
    pub gpu_ram_gb: f64,
    pub price_per_hour: f64,
}

impl Default for SimulatedOffer {
    fn default() -> Self {
        Self {
            gpu_type: "RTX_4090".to_string(),
            gpu_ram_gb: 24.0,
            price_per_hour: 0.45,
        }
    }
}

pub struct SimulatedProvider {
    name: String,
    offer: SimulatedOffer,
    instances: DashMap<String, Instance>,
    metrics: DashMap<String, UtilizationSample>,
    failing: DashSet<&'static str>,
    calls: DashMap<&'static str, u64>,
    latency_ms: AtomicU64,
    next_port: AtomicU64,
}

impl SimulatedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offer: SimulatedOffer::default(),
            instances: DashMap::new(),
            metrics: DashMap::new(),
            failing: DashSet::new(),
            calls: DashMap::new(),
            latency_ms: AtomicU64::new(0),
            next_port: AtomicU64::new(22_000),
        }
    }

    pub fn with_offer(mut self, offer: SimulatedOffer) -> Self {
        self.offer = offer;
        self
    }

    /// Add a running-age-zero instance with the default offer's hardware
    pub fn add_instance(&self, instance_id: &str, state: InstanceState) -> Instance {
        let instance = Instance {
            instance_id: instance_id.to_string(),
            provider: self.name.clone(),
            name: instance_id.to_string(),
            state,
            gpu_type: Some(self.offer.gpu_type.clone()),
            gpu_count: 1,
            gpu_ram_gb: self.offer.gpu_ram_gb,
            price_per_hour: self.offer.price_per_hour,
            host: Some(format!("{instance_id}.sim.local")),
            port: Some(22),
            created_at: Utc::now(),
        };
        self.insert_instance(instance.clone());
        instance
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.instances.insert(instance.instance_id.clone(), instance);
    }

    pub fn remove_instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.remove(instance_id).map(|(_, i)| i)
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    pub fn set_metrics(&self, instance_id: &str, sample: UtilizationSample) {
        self.metrics.insert(instance_id.to_string(), sample);
    }

    /// Make every call to `operation` fail with `ProviderUnavailable`
    ///
    /// Operation names: `list`, `pause`, `resume`, `destroy`, `create`, `metrics`.
    pub fn set_failing(&self, operation: &'static str, failing: bool) {
        if failing {
            self.failing.insert(operation);
        } else {
            self.failing.remove(operation);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &'static str) -> u64 {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    async fn enter(&self, operation: &'static str) -> Result<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.failing.contains(operation) {
            return Err(FleetError::ProviderUnavailable {
                provider: self.name.clone(),
                operation,
                message: "simulated outage".to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, instance_id: &str, from: &[InstanceState], to: InstanceState) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(mut instance) if from.contains(&instance.state) || instance.state == to => {
                instance.state = to;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ComputeProvider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.enter("list").await?;
        let mut instances: Vec<Instance> = self.instances.iter().map(|i| i.clone()).collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn pause(&self, instance_id: &str) -> Result<bool> {
        self.enter("pause").await?;
        Ok(self.transition(instance_id, &[InstanceState::Running], InstanceState::Paused))
    }

    async fn resume(&self, instance_id: &str) -> Result<bool> {
        self.enter("resume").await?;
        Ok(self.transition(
            instance_id,
            &[InstanceState::Paused, InstanceState::Stopped],
            InstanceState::Running,
        ))
    }

    async fn destroy(&self, instance_id: &str) -> Result<bool> {
        self.enter("destroy").await?;
        debug!(provider = %self.name, instance_id = %instance_id, "Destroying simulated instance");
        Ok(self.instances.remove(instance_id).is_some())
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.enter("create").await?;

        let gpu_matches = spec.preferred_gpu_types.is_empty()
            || spec
                .preferred_gpu_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&self.offer.gpu_type));
        if self.offer.gpu_ram_gb < spec.min_gpu_ram_gb
            || self.offer.price_per_hour > spec.max_price_per_hour
            || !gpu_matches
        {
            return Err(FleetError::ProviderRejected {
                provider: self.name.clone(),
                operation: "create",
                instance_id: spec.name.clone(),
            });
        }

        let instance_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
        let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
        let instance = Instance {
            instance_id: instance_id.clone(),
            provider: self.name.clone(),
            name: spec.name.clone(),
            state: InstanceState::Running,
            gpu_type: Some(self.offer.gpu_type.clone()),
            gpu_count: spec.gpu_count.max(1),
            gpu_ram_gb: self.offer.gpu_ram_gb,
            price_per_hour: self.offer.price_per_hour,
            host: Some(format!("{instance_id}.sim.local")),
            port: Some(port),
            created_at: Utc::now(),
        };
        self.insert_instance(instance.clone());
        Ok(instance)
    }

    async fn get_metrics(&self, instance_id: &str) -> Result<Option<UtilizationSample>> {
        self.enter("metrics").await?;
        Ok(self.metrics.get(instance_id).map(|m| UtilizationSample {
            timestamp: Utc::now(),
            ..*m
        }))
    }
}
