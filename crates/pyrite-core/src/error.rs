//! Error types for the Pyrite protocol.
use thiserror::Error;

/// Failures raised by the wire-protocol adapter.
///
/// Request timeouts are the adapter's responsibility; they surface here and
/// callers treat every variant as a failure of the requesting peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("request timed out")] Timeout,
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("request failed: {0}")] RequestFailed(String),
}
