//! Error types for the synchronization core.

use pyrite_core::error::WireError;
use pyrite_core::types::PeerId;
use thiserror::Error;

/// Failures inside the synchronization core.
///
/// Only `AlreadyRunning` escapes to callers of
/// [`Syncer::start`](crate::Syncer::start). The remaining variants drive
/// control flow inside the event loop: `AbortSync` and `LoaderDisconnected`
/// are benign sentinels that end an episode without demoting anyone; the
/// rest demote the loader before the loop returns to idle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// `start()` was called while the syncer was not stopped.
    #[error("syncer is already running")]
    AlreadyRunning,

    /// Internal cancellation sentinel. Never surfaced outside the core and
    /// never counted against a peer.
    #[error("sync aborted")]
    AbortSync,

    /// The loader vanished mid-episode. Benign; the next tick re-elects.
    #[error("loader disconnected")]
    LoaderDisconnected,

    /// The peer returned malformed or contradictory data.
    #[error("peer {peer} violated protocol: {reason}")]
    ProtocolViolation {
        /// The offending peer.
        peer: PeerId,
        /// Punishment reason, from the misbehavior table.
        reason: &'static str,
    },

    /// The chain store rejected a block served by the loader.
    #[error("peer {peer} sent an invalid block: {reason}")]
    ValidatorRejection {
        /// The offending peer.
        peer: PeerId,
        /// Validator-assigned misbehavior score.
        score: u16,
        /// Validator-supplied rejection reason.
        reason: String,
    },

    /// A wire request failed or timed out.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl SyncError {
    /// Whether this error is internal control flow rather than a peer fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::AbortSync | SyncError::LoaderDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_benign() {
        assert!(SyncError::AbortSync.is_benign());
        assert!(SyncError::LoaderDisconnected.is_benign());
        assert!(!SyncError::AlreadyRunning.is_benign());
        assert!(
            !SyncError::ProtocolViolation {
                peer: PeerId([0; 32]),
                reason: "out of sequence",
            }
            .is_benign()
        );
    }

    #[test]
    fn wire_errors_convert() {
        let err: SyncError = WireError::Timeout.into();
        assert!(matches!(err, SyncError::Wire(WireError::Timeout)));
        assert!(!err.is_benign());
    }
}
