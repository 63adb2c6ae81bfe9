//! Error taxonomy for connector indexing.
//!
//! [`ConnectorError`] is what a connector (or the permission sync adapter)
//! returns. The worker maps it onto a [`FailureReason`], which is what gets
//! persisted on a failed run so an operator can tell a bad credential from a
//! corrupt checkpoint from a crashed worker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised at the connector boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Credentials are invalid or expired. Fatal, never retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A persisted checkpoint blob could not be deserialized.
    #[error("malformed checkpoint: {0}")]
    MalformedCheckpoint(String),

    /// A document reached the permission-sync path without access info.
    #[error("permission contract violated: {0}")]
    PermissionContract(String),

    /// The connector does not implement the requested capability.
    #[error("connector '{connector}' does not support {capability}")]
    Unsupported {
        connector: String,
        capability: &'static str,
    },

    /// The caller asked the operation to stop (cancellation observed).
    #[error("stop signal detected: {0}")]
    Stopped(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    /// The failure reason recorded on a run that dies from this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ConnectorError::Auth(_) => FailureReason::Auth,
            ConnectorError::MalformedCheckpoint(_) => FailureReason::MalformedCheckpoint,
            ConnectorError::PermissionContract(_) => FailureReason::PermissionContract,
            ConnectorError::Unsupported { .. }
            | ConnectorError::Stopped(_)
            | ConnectorError::Other(_) => FailureReason::Unhandled,
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unhandled,
    Auth,
    MalformedCheckpoint,
    PermissionContract,
    /// Worker alive but no batch completed within the stall window.
    Stalled,
    /// Heartbeat stopped advancing.
    LivenessLost,
}

impl FailureReason {
    pub const ALL: [FailureReason; 6] = [
        FailureReason::Unhandled,
        FailureReason::Auth,
        FailureReason::MalformedCheckpoint,
        FailureReason::PermissionContract,
        FailureReason::Stalled,
        FailureReason::LivenessLost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Unhandled => "unhandled",
            FailureReason::Auth => "auth",
            FailureReason::MalformedCheckpoint => "malformed_checkpoint",
            FailureReason::PermissionContract => "permission_contract",
            FailureReason::Stalled => "stalled",
            FailureReason::LivenessLost => "liveness_lost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown failure reason: '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_errors_map_to_reasons() {
        assert_eq!(
            ConnectorError::Auth("expired".into()).failure_reason(),
            FailureReason::Auth
        );
        assert_eq!(
            ConnectorError::MalformedCheckpoint("bad json".into()).failure_reason(),
            FailureReason::MalformedCheckpoint
        );
        assert_eq!(
            ConnectorError::PermissionContract("doc-1".into()).failure_reason(),
            FailureReason::PermissionContract
        );
        assert_eq!(
            ConnectorError::Other(anyhow::anyhow!("boom")).failure_reason(),
            FailureReason::Unhandled
        );
    }

    #[test]
    fn reason_strings_roundtrip() {
        for reason in FailureReason::ALL {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
    }
}
