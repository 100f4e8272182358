// Error taxonomy for the sync engine and relay.
//
// Nothing here is fatal: every variant is logged and the engine continues,
// relying on a later `sendFile` resync to repair divergence.

use thiserror::Error;

use crate::types::LineId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// A line identity could not be resolved against the local table.
    #[error("unknown line identity {id}")]
    UnknownIdentity { id: LineId },

    /// The editor refused a text replacement (e.g. the document changed
    /// underneath the edit).
    #[error("text replacement rejected: {reason}")]
    ApplyRejected { reason: String },

    /// The relay connection dropped.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// An inbound frame could not be decoded into a known operation.
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
}

impl SyncError {
    pub fn unknown_identity(id: &LineId) -> Self {
        Self::UnknownIdentity { id: id.clone() }
    }

    pub fn apply_rejected(reason: impl Into<String>) -> Self {
        Self::ApplyRejected { reason: reason.into() }
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost { reason: reason.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage { reason: reason.into() }
    }

    /// Stable machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownIdentity { .. } => "SYNC_UNKNOWN_IDENTITY",
            Self::ApplyRejected { .. } => "SYNC_APPLY_REJECTED",
            Self::ConnectionLost { .. } => "SYNC_CONNECTION_LOST",
            Self::MalformedMessage { .. } => "SYNC_MALFORMED_MESSAGE",
        }
    }

    /// Whether retrying the failed step can succeed. Malformed messages are
    /// dropped; everything else is retried (re-queue, reconnect).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::MalformedMessage { .. })
    }
}
