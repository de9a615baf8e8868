//! Idle detection from utilization samples
//!
//! This module provides:
//! - Bounded per-machine utilization history fed by heartbeats or pulled metrics
//! - Idle/active classification against per-machine thresholds
//! - Contiguous idle-run duration tracking

mod detector;

pub use detector::{
    IdleDetector, IdleThresholds, DEFAULT_MAX_SAMPLE_AGE_SECS, MAX_HISTORY_SAMPLES,
};
