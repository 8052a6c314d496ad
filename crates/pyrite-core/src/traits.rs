//! Trait interfaces between the synchronization core and its collaborators.
//!
//! These traits define the contracts at the crate seams:
//! - [`ChainStore`] — block validation and main-chain state (the node's
//!   chain component implements)
//! - [`PeerManager`] — the peer table, scoring, and connection lifecycle
//!   (the P2P layer implements)
//! - [`WireProtocol`] — header and block requests to a specific peer
//!   (the P2P layer implements)
//!
//! All three are object-safe and consumed as `Arc<dyn …>` by the syncer.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::WireError;
use crate::types::{Block, BlockHeader, ChainTip, ConnectionState, Hash256, PeerHandle, PeerId};

/// Outcome of handing a block to the chain store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddBlockOutcome {
    /// The block extended the main chain (possibly via a reorganization).
    Added,
    /// The block's parent is unknown; nothing was stored.
    Orphan,
    /// The block is already present.
    Duplicate,
    /// Consensus validation rejected the block.
    Invalid {
        /// Misbehavior score to record against the sending peer.
        score: u16,
        /// Validator-supplied rejection reason.
        reason: String,
    },
}

/// Response to a header-by-sequence request.
#[derive(Clone, Debug)]
pub struct HeadersResponse {
    /// The requested headers, lowest sequence first.
    pub headers: Vec<BlockHeader>,
    /// Round-trip time of the request.
    pub elapsed: Duration,
}

/// Response to a blocks-from-hash request.
#[derive(Clone, Debug)]
pub struct BlocksResponse {
    /// The returned blocks. The first one is the anchor at the requested hash.
    pub blocks: Vec<Block>,
    /// Round-trip time of the request.
    pub elapsed: Duration,
    /// True iff the peer filled the requested limit. A non-full batch means
    /// the remote had no more blocks past the tail.
    pub is_full: bool,
}

/// Event published by the peer manager when a peer's connection state changes.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// A peer moved to a new connection state.
    StateChanged {
        /// The peer whose state changed.
        peer: PeerId,
        /// The new state.
        state: ConnectionState,
    },
}

/// Block validation and main-chain state.
///
/// The chain store owns the tip. The syncer reads freely and mutates only
/// through [`add_block`](Self::add_block); validation is entirely the
/// store's business.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// The genesis header. Always present.
    fn genesis(&self) -> BlockHeader;

    /// The current tip of the local main chain.
    fn head(&self) -> BlockHeader;

    /// Look up a header by hash, on any known chain.
    fn get_header(&self, hash: &Hash256) -> Option<BlockHeader>;

    /// Main-chain block hashes for the sequence range `start..=end`,
    /// clamped to the chain.
    fn iterate(&self, start: u32, end: u32) -> Vec<Hash256>;

    /// Whether the header lies on the local main chain.
    ///
    /// Default implementation compares against [`iterate`](Self::iterate)
    /// at the header's own sequence.
    fn is_on_main_chain(&self, header: &BlockHeader) -> bool {
        self.iterate(header.sequence, header.sequence)
            .first()
            .is_some_and(|hash| *hash == header.hash)
    }

    /// Hand a block to consensus validation and storage.
    async fn add_block(&self, block: Block) -> AddBlockOutcome;
}

/// The peer table, misbehavior scoring, and connection lifecycle.
///
/// Peers are owned by the manager; the syncer holds identifiers and
/// re-fetches snapshots before acting on one.
pub trait PeerManager: Send + Sync {
    /// Snapshot of all currently connected peers.
    fn connected_peers(&self) -> Vec<PeerHandle>;

    /// Look up one peer by identifier. `None` once the peer is gone.
    fn get_peer(&self, id: &PeerId) -> Option<PeerHandle>;

    /// Record a misbehavior score against a peer.
    ///
    /// Scores accumulate; crossing the ban threshold disconnects the peer.
    /// Scores reset on disconnect.
    fn punish(&self, id: &PeerId, score: u16, reason: &str);

    /// Close the connection to a peer, optionally with a reason.
    fn close(&self, id: &PeerId, reason: Option<&str>);

    /// Record a newer advertised chain tip for a peer.
    fn update_chain_tip(&self, id: &PeerId, tip: ChainTip);

    /// Subscribe to connection state changes.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Header and block requests addressed to a specific peer.
///
/// Both calls may fail; the caller treats any failure as a failure of that
/// peer. Timeouts are enforced inside the adapter and surface as
/// [`WireError::Timeout`].
#[async_trait]
pub trait WireProtocol: Send + Sync {
    /// Request `count` headers starting at `start_sequence`.
    async fn get_block_headers(
        &self,
        peer: &PeerId,
        start_sequence: u32,
        count: u32,
    ) -> Result<HeadersResponse, WireError>;

    /// Request up to `limit` blocks starting at a known hash.
    ///
    /// The first returned block is the anchor at `start_hash` itself.
    async fn get_blocks(
        &self,
        peer: &PeerId,
        start_hash: &Hash256,
        limit: u32,
    ) -> Result<BlocksResponse, WireError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENESIS_SEQUENCE;
    use crate::types::Work;

    // ------------------------------------------------------------------
    // Mock: ChainStore backed by a vector of headers
    // ------------------------------------------------------------------

    struct MockChainStore {
        chain: Vec<BlockHeader>,
    }

    impl MockChainStore {
        fn linear(len: u32) -> Self {
            let chain = (0..len)
                .map(|i| BlockHeader {
                    hash: Hash256([i as u8 + 1; 32]),
                    previous_hash: if i == 0 {
                        Hash256::ZERO
                    } else {
                        Hash256([i as u8; 32])
                    },
                    sequence: GENESIS_SEQUENCE + i,
                    work: Work::from(i + 1),
                })
                .collect();
            Self { chain }
        }
    }

    #[async_trait]
    impl ChainStore for MockChainStore {
        fn genesis(&self) -> BlockHeader {
            self.chain[0]
        }

        fn head(&self) -> BlockHeader {
            *self.chain.last().expect("non-empty chain")
        }

        fn get_header(&self, hash: &Hash256) -> Option<BlockHeader> {
            self.chain.iter().find(|h| h.hash == *hash).copied()
        }

        fn iterate(&self, start: u32, end: u32) -> Vec<Hash256> {
            self.chain
                .iter()
                .filter(|h| h.sequence >= start && h.sequence <= end)
                .map(|h| h.hash)
                .collect()
        }

        async fn add_block(&self, _block: Block) -> AddBlockOutcome {
            AddBlockOutcome::Duplicate
        }
    }

    // ------------------------------------------------------------------
    // Mock: WireProtocol that always times out
    // ------------------------------------------------------------------

    struct DeadWire;

    #[async_trait]
    impl WireProtocol for DeadWire {
        async fn get_block_headers(
            &self,
            _peer: &PeerId,
            _start_sequence: u32,
            _count: u32,
        ) -> Result<HeadersResponse, WireError> {
            Err(WireError::Timeout)
        }

        async fn get_blocks(
            &self,
            _peer: &PeerId,
            _start_hash: &Hash256,
            _limit: u32,
        ) -> Result<BlocksResponse, WireError> {
            Err(WireError::Timeout)
        }
    }

    // ------------------------------------------------------------------
    // Object safety: verify each trait is dyn-compatible
    // ------------------------------------------------------------------

    fn _assert_chain_store_object_safe(cs: &dyn ChainStore) {
        let _ = cs.head();
    }

    fn _assert_wire_protocol_object_safe(_wp: &dyn WireProtocol) {}

    fn _assert_peer_manager_object_safe(pm: &dyn PeerManager) {
        let _ = pm.connected_peers();
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn is_on_main_chain_default_impl() {
        let store = MockChainStore::linear(5);
        let head = store.head();
        assert!(store.is_on_main_chain(&head));

        // Same hash, wrong claimed sequence: not on the main chain at that
        // position.
        let mut displaced = head;
        displaced.sequence = GENESIS_SEQUENCE;
        assert!(!store.is_on_main_chain(&displaced));

        let unknown = BlockHeader {
            hash: Hash256([0xFF; 32]),
            previous_hash: Hash256::ZERO,
            sequence: 2,
            work: Work::from(2u64),
        };
        assert!(!store.is_on_main_chain(&unknown));
    }

    #[test]
    fn iterate_clamps_to_chain() {
        let store = MockChainStore::linear(3);
        assert_eq!(store.iterate(1, 3).len(), 3);
        assert_eq!(store.iterate(2, 100).len(), 2);
        assert!(store.iterate(10, 20).is_empty());
    }

    #[test]
    fn genesis_and_head() {
        let store = MockChainStore::linear(4);
        assert_eq!(store.genesis().sequence, GENESIS_SEQUENCE);
        assert_eq!(store.head().sequence, 4);
    }

    #[tokio::test]
    async fn add_block_through_dyn() {
        let store = MockChainStore::linear(2);
        let dyn_store: &dyn ChainStore = &store;
        let block = Block {
            header: store.head(),
            payload: vec![],
        };
        assert_eq!(dyn_store.add_block(block).await, AddBlockOutcome::Duplicate);
    }

    #[tokio::test]
    async fn dead_wire_surfaces_timeout() {
        let wire = DeadWire;
        let peer = PeerId::random();
        let err = wire
            .get_block_headers(&peer, GENESIS_SEQUENCE, 1)
            .await
            .unwrap_err();
        assert_eq!(err, WireError::Timeout);

        let err = wire.get_blocks(&peer, &Hash256::ZERO, 21).await.unwrap_err();
        assert_eq!(err, WireError::Timeout);
    }
}
