//! Per-machine hibernation state machine
//!
//! Machines move `ACTIVE → IDLE → PAUSING → PAUSED → RESUMING → ACTIVE`.
//! `ERROR` is entered when a provider call fails during a transition and
//! stays until an explicit `pause()` or `wake()` retries it.

mod manager;

pub use manager::{
    EventFilter, HibernationConfig, HibernationManager, SavingsSummary, TickOutcome,
};
