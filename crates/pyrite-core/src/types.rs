//! Core protocol types: hashes, headers, blocks, and peer snapshots.
//!
//! The synchronization core treats block payloads as opaque — consensus
//! validation owns their contents. Headers carry only the fields the sync
//! protocol reasons about.

use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Cumulative proof-of-work behind a header.
///
/// Strictly increasing along any chain; comparisons between chains decide
/// which tip is better.
pub type Work = U256;

/// A 32-byte hash value.
///
/// Identifies blocks and headers. The hashing algorithm is the validator's
/// business; the sync core only compares and forwards these.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque identifier of a remote peer, assigned by the peer manager.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create a PeerId from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a random identifier.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    /// Abbreviated form: the first eight bytes in hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Connection state of a peer as reported by the peer manager.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete; requests may be sent.
    Connected,
    /// Dialing or mid-handshake.
    Connecting,
    /// Gone; the handle is stale.
    Disconnected,
}

/// Feature bits a peer advertised during the handshake.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PeerFeatures {
    /// Whether the peer serves header and block requests.
    pub supports_syncing: bool,
}

/// A chain tip: `(hash, sequence, cumulative work)`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainTip {
    /// Hash of the tip block.
    pub hash: Hash256,
    /// Sequence of the tip block. Genesis is sequence 1.
    pub sequence: u32,
    /// Cumulative work up to and including the tip.
    pub work: Work,
}

/// A block header as seen by the synchronization protocol.
///
/// Equality and hashing are by `hash` alone: two headers with the same hash
/// are the same header regardless of the remaining fields. Validator-owned
/// fields (timestamps, merkle commitments, …) live in the block payload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct BlockHeader {
    /// Hash of this header.
    pub hash: Hash256,
    /// Hash of the parent header. Zero for genesis.
    pub previous_hash: Hash256,
    /// Position in the chain. Genesis is sequence 1.
    pub sequence: u32,
    /// Cumulative work up to and including this block.
    pub work: Work,
}

impl PartialEq for BlockHeader {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockHeader {}

impl std::hash::Hash for BlockHeader {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl BlockHeader {
    /// This header viewed as a chain tip.
    pub fn tip(&self) -> ChainTip {
        ChainTip {
            hash: self.hash,
            sequence: self.sequence,
            work: self.work,
        }
    }
}

/// A full block: a header plus an opaque payload owned by the validator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// Serialized block body. Never inspected by the sync core.
    pub payload: Vec<u8>,
}

/// Snapshot of a peer as owned by the peer manager.
///
/// The sync core holds these only transiently: it re-fetches by identifier
/// before acting and tolerates the peer disappearing between ticks.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// Stable identifier, valid for the lifetime of the connection.
    pub id: PeerId,
    /// Human-readable name for logs and the peer allowlist.
    pub display_name: String,
    /// Connection state at snapshot time.
    pub state: ConnectionState,
    /// The best tip the peer has advertised, if any.
    pub chain_tip: Option<ChainTip>,
    /// Advertised feature set. Absent until the handshake completes.
    pub features: Option<PeerFeatures>,
    /// Accumulated misbehavior score.
    pub ban_score: u16,
}

impl PeerHandle {
    /// Whether the peer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the peer may serve as a sync loader.
    ///
    /// Peers that never advertised a feature set are gossip sources only.
    pub fn supports_syncing(&self) -> bool {
        self.features.is_some_and(|f| f.supports_syncing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(hash: u8, prev: u8, sequence: u32) -> BlockHeader {
        BlockHeader {
            hash: Hash256([hash; 32]),
            previous_hash: Hash256([prev; 32]),
            sequence,
            work: Work::from(sequence),
        }
    }

    #[test]
    fn hash_display_is_lower_hex() {
        let h = Hash256([0xAB; 32]);
        assert_eq!(h.to_string(), "ab".repeat(32));
    }

    #[test]
    fn zero_hash_detection() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn peer_id_display_is_abbreviated() {
        let id = PeerId([0xCD; 32]);
        assert_eq!(id.to_string(), "cd".repeat(8));
    }

    #[test]
    fn random_peer_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn header_equality_is_by_hash_only() {
        let a = header(1, 0, 5);
        let mut b = a;
        b.sequence = 99;
        b.work = Work::from(1000u64);
        assert_eq!(a, b, "headers with the same hash must compare equal");

        let c = header(2, 0, 5);
        assert_ne!(a, c);
    }

    #[test]
    fn header_hashing_follows_equality() {
        use std::collections::HashSet;
        let a = header(1, 0, 5);
        let mut b = a;
        b.sequence = 42;

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn header_tip_projection() {
        let h = header(7, 6, 8);
        let tip = h.tip();
        assert_eq!(tip.hash, h.hash);
        assert_eq!(tip.sequence, 8);
        assert_eq!(tip.work, Work::from(8u64));
    }

    #[test]
    fn peer_without_features_is_not_a_loader_candidate() {
        let peer = PeerHandle {
            id: PeerId::random(),
            display_name: "node-a".to_string(),
            state: ConnectionState::Connected,
            chain_tip: None,
            features: None,
            ban_score: 0,
        };
        assert!(peer.is_connected());
        assert!(!peer.supports_syncing());
    }

    #[test]
    fn peer_with_syncing_feature() {
        let peer = PeerHandle {
            id: PeerId::random(),
            display_name: "node-b".to_string(),
            state: ConnectionState::Disconnected,
            chain_tip: None,
            features: Some(PeerFeatures {
                supports_syncing: true,
            }),
            ban_score: 0,
        };
        assert!(!peer.is_connected());
        assert!(peer.supports_syncing());
    }
}
