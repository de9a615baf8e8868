//! Core library for the GPU fleet hibernation controller
//!
//! This crate provides the core functionality for:
//! - Idle detection from utilization samples
//! - Per-machine hibernation (pause/resume) state machines
//! - Chunked, parallel, compressed workspace checkpoints
//! - Warm-pool standby failover
//! - Fleet-wide cost optimization
//! - Health checks and observability

pub mod checkpoint;
pub mod error;
pub mod health;
pub mod hibernation;
pub mod idle;
pub mod models;
pub mod observability;
pub mod optimizer;
pub mod provider;
pub mod retry;
pub mod warm_pool;

pub use checkpoint::{CheckpointConfig, CheckpointPipeline, ObjectStore, RestoreTarget};
pub use error::{FleetError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use hibernation::{HibernationConfig, HibernationManager};
pub use idle::IdleDetector;
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use optimizer::{CostOptimizer, OptimizerConfig};
pub use provider::{ComputeProvider, ProviderRegistry};
pub use retry::RetryPolicy;
pub use warm_pool::{WarmPoolConfig, WarmPoolManager};
