//! Error taxonomy shared by every fleet component

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by hibernation, checkpoint, warm-pool and optimizer calls
#[derive(Error, Debug)]
pub enum FleetError {
    /// Network or API failure talking to a compute provider
    #[error("provider {provider} unavailable during {operation}: {message}")]
    ProviderUnavailable {
        provider: String,
        operation: &'static str,
        message: String,
    },

    /// The provider answered but refused the operation
    #[error("provider {provider} rejected {operation} for instance {instance_id}")]
    ProviderRejected {
        provider: String,
        operation: &'static str,
        instance_id: String,
    },

    /// Operation not permitted from the machine's current state
    #[error("cannot {operation} machine {machine_id} in state {state}")]
    InvalidStateTransition {
        machine_id: String,
        state: String,
        operation: &'static str,
    },

    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("warm pool for {0} has no standby instance")]
    NoStandby(String),

    /// Restored bytes do not hash to the value recorded at creation
    #[error("checksum mismatch for checkpoint {checkpoint_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        checkpoint_id: String,
        expected: String,
        actual: String,
    },

    /// An incremental checkpoint's ancestor could not be resolved
    #[error("broken checkpoint chain for {checkpoint_id}: missing {missing}")]
    BrokenChain {
        checkpoint_id: String,
        missing: String,
    },

    /// Snapshot creation failed after some chunks were written
    #[error("checkpoint {checkpoint_id} failed after {uploaded_chunks} chunks: {message}")]
    PartialUploadFailure {
        checkpoint_id: String,
        uploaded_chunks: usize,
        message: String,
    },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("storage error on {key}: {message}")]
    Storage { key: String, message: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// An optimizer notification could not be delivered
    #[error("notification failed: {0}")]
    Notification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    /// Stable snake_case tag used in structured logs and event records
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::ProviderUnavailable { .. } => "provider_unavailable",
            FleetError::ProviderRejected { .. } => "provider_rejected",
            FleetError::InvalidStateTransition { .. } => "invalid_state_transition",
            FleetError::UnknownMachine(_) => "unknown_machine",
            FleetError::UnknownProvider(_) => "unknown_provider",
            FleetError::NoStandby(_) => "no_standby",
            FleetError::ChecksumMismatch { .. } => "checksum_mismatch",
            FleetError::BrokenChain { .. } => "broken_chain",
            FleetError::PartialUploadFailure { .. } => "partial_upload_failure",
            FleetError::CheckpointNotFound(_) => "checkpoint_not_found",
            FleetError::Storage { .. } => "storage",
            FleetError::Codec(_) => "codec",
            FleetError::Timeout { .. } => "timeout",
            FleetError::Config(_) => "config",
            FleetError::Notification(_) => "notification",
            FleetError::Io(_) => "io",
            FleetError::Serialization(_) => "serialization",
        }
    }

    /// Whether a single chunk transfer may be retried after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Storage { .. }
                | FleetError::Timeout { .. }
                | FleetError::ProviderUnavailable { .. }
                | FleetError::Io(_)
        )
    }

    pub(crate) fn storage(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        FleetError::Storage {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Run an external call under a deadline, mapping expiry to [`FleetError::Timeout`]
pub async fn with_timeout<T, F>(operation: impl Into<String>, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(FleetError::Timeout {
            operation: operation.into(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        let err = FleetError::BrokenChain {
            checkpoint_id: "c2".to_string(),
            missing: "c1".to_string(),
        };
        assert_eq!(err.kind(), "broken_chain");
        assert!(err.to_string().contains("missing c1"));
        assert!(!err.is_transient());

        let err = FleetError::storage("snapshots/x/chunk_000", "connection reset");
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let result: Result<()> = with_timeout("provider.pause", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        match result {
            Err(FleetError::Timeout { operation, after }) => {
                assert_eq!(operation, "provider.pause");
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
