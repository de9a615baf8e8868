//! Standby instances for protected machines
//!
//! This module provides:
//! - Provisioning of one standby instance per protected primary
//! - Failover that promotes the standby without waiting for a replacement
//! - Background replenishment of the standby after a promotion
//! - A monitor loop that fails over when the primary disappears

mod manager;

pub use manager::{FailoverResult, WarmPoolConfig, WarmPoolManager, WarmPoolManagerConfig};
