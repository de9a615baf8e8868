//! Compute provider capability interface
//!
//! Every cloud or GPU market is wrapped behind [`ComputeProvider`]. The
//! controller never calls a provider SDK directly; it resolves the provider
//! for a machine through [`ProviderRegistry`] by name.

mod simulated;

pub use simulated::{SimulatedProvider, SimulatedOffer};

use crate::error::{with_timeout, FleetError, Result};
use crate::models::{Instance, InstanceSpec, UtilizationSample};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Capability interface implemented once per provider
///
/// Expected failure modes (unreachable host, rate limit, unknown instance)
/// are reported through `Ok(false)` or `Ok(None)`; `Err` is reserved for
/// transport-level failures.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Registry name of this provider
    fn name(&self) -> &str;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    async fn pause(&self, instance_id: &str) -> Result<bool>;

    async fn resume(&self, instance_id: &str) -> Result<bool>;

    async fn destroy(&self, instance_id: &str) -> Result<bool>;

    async fn create(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Latest utilization reading, `None` when the host cannot be sampled
    async fn get_metrics(&self, instance_id: &str) -> Result<Option<UtilizationSample>>;
}

/// State-changing provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAction {
    Pause,
    Resume,
    Destroy,
}

impl ProviderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderAction::Pause => "pause",
            ProviderAction::Resume => "resume",
            ProviderAction::Destroy => "destroy",
        }
    }
}

/// Run a state-changing call under a deadline and turn a refusal into an error
pub async fn invoke(
    provider: &dyn ComputeProvider,
    action: ProviderAction,
    instance_id: &str,
    timeout: Duration,
) -> Result<()> {
    let operation = format!("{}.{}", provider.name(), action.as_str());
    let accepted = with_timeout(operation, timeout, async {
        match action {
            ProviderAction::Pause => provider.pause(instance_id).await,
            ProviderAction::Resume => provider.resume(instance_id).await,
            ProviderAction::Destroy => provider.destroy(instance_id).await,
        }
    })
    .await?;

    if accepted {
        Ok(())
    } else {
        Err(FleetError::ProviderRejected {
            provider: provider.name().to_string(),
            operation: action.as_str(),
            instance_id: instance_id.to_string(),
        })
    }
}

/// Name-keyed set of providers
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn ComputeProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous entry
    pub fn register(&self, provider: Arc<dyn ComputeProvider>) {
        let name = provider.name().to_string();
        tracing::info!(provider = %name, "Registered compute provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ComputeProvider>> {
        self.providers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FleetError::UnknownProvider(name.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<dyn ComputeProvider>> {
        let mut providers: Vec<_> = self
            .providers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        providers
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Create a provider implementation from its configured kind
///
/// Cloud and marketplace adapters live outside this crate and register
/// themselves with [`ProviderRegistry::register`]; the built-in factory only
/// knows the in-memory simulator.
pub fn create_provider(kind: &str, name: &str) -> Result<Arc<dyn ComputeProvider>> {
    match kind {
        "simulated" => {
            tracing::info!(provider = %name, "Using simulated compute provider");
            Ok(Arc::new(SimulatedProvider::new(name)))
        }
        other => Err(FleetError::UnknownProvider(other.to_string())),
    }
}
