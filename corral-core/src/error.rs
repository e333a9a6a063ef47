//! Error types for the topology core.

use thiserror::Error;

use crate::instance::InstanceKey;

/// Result type alias using the topology [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by topology operations.
///
/// Every message names the affected instance so that audit trails and
/// operator-facing logs stay actionable without extra context.
#[derive(Error, Debug)]
pub enum Error {
    /// Repository miss: no cached record for the instance.
    #[error("instance not found: {0}")]
    NotFound(InstanceKey),

    /// The driver could not contact the instance.
    #[error("instance unreachable: {0}")]
    Unreachable(InstanceKey),

    /// A predicate check failed before any side effect was issued.
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// Position correlation found no match, or matched zero events.
    #[error("position mismatch: {0}")]
    PositionMismatch(String),

    /// Neither the global-identifier nor the pseudo-identifier strategy applies.
    #[error("identity modes incompatible: {0}")]
    IdentityModeIncompatible(String),

    /// The driver reached the instance but the operation failed remotely.
    #[error("remote operation failed on {key}: {message}")]
    RemoteOperationFailed {
        /// Instance the driver was talking to.
        key: InstanceKey,
        /// Remote failure detail.
        message: String,
    },

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Sentinel distinguishing an expected idle state from a failure.
    #[error("replication not running on {0}")]
    ReplicationNotRunning(InstanceKey),
}

impl Error {
    /// Create a precondition-violated error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolated(msg.into())
    }

    /// Create a position-mismatch error.
    pub fn position_mismatch(msg: impl Into<String>) -> Self {
        Self::PositionMismatch(msg.into())
    }

    /// Create an identity-mode-incompatible error.
    pub fn identity_mode(msg: impl Into<String>) -> Self {
        Self::IdentityModeIncompatible(msg.into())
    }

    /// Create a remote-operation-failed error for the given instance.
    pub fn remote(key: &InstanceKey, msg: impl Into<String>) -> Self {
        Self::RemoteOperationFailed {
            key: key.clone(),
            message: msg.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether this error marks the expected replication-idle state
    /// rather than an actual failure.
    pub fn is_replication_not_running(&self) -> bool {
        matches!(self, Self::ReplicationNotRunning(_))
    }
}
