//! Shared test helpers: deterministic chains and mock collaborators.
//!
//! The mocks mirror the adapter traits one-to-one: an in-memory chain store
//! with naive best-work reorgs, a static peer table that records every
//! punishment and close, and a wire mock serving scripted per-peer chains
//! with fault injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};

use pyrite_core::error::WireError;
use pyrite_core::traits::{
    AddBlockOutcome, BlocksResponse, ChainStore, HeadersResponse, PeerEvent, PeerManager,
    WireProtocol,
};
use pyrite_core::types::{
    Block, BlockHeader, ChainTip, ConnectionState, Hash256, PeerFeatures, PeerHandle, PeerId, Work,
};

// ---------------------------------------------------------------------------
// Deterministic chains
// ---------------------------------------------------------------------------

/// Deterministic dummy hash derived from `n`.
///
/// Carries a marker byte so `h(0)` is distinct from `Hash256::ZERO`.
pub fn h(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    bytes[31] = 0xA5;
    Hash256(bytes)
}

/// Deterministic hash for fork blocks, disjoint from [`h`].
pub fn hf(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    bytes[31] = 0x5A;
    Hash256(bytes)
}

/// Header `H(n)`: hash `h(n)`, parent `h(n - 1)`, sequence `n + 1`,
/// work `n + 1`.
pub fn header(n: u64) -> BlockHeader {
    BlockHeader {
        hash: h(n),
        previous_hash: if n == 0 { Hash256::ZERO } else { h(n - 1) },
        sequence: (n + 1) as u32,
        work: Work::from(n + 1),
    }
}

/// The linear chain `H(0) ..= H(len - 1)`.
pub fn linear_chain(len: u64) -> Vec<BlockHeader> {
    (0..len).map(header).collect()
}

/// A chain sharing `H(0) ..= H(shared - 1)` with [`linear_chain`], then
/// continuing with fork blocks up to `len` headers total, each carrying
/// `work_bonus` extra work.
pub fn forked_chain(shared: u64, len: u64, work_bonus: u64) -> Vec<BlockHeader> {
    let mut headers = linear_chain(shared);
    for n in shared..len {
        let previous_hash = headers.last().map(|h| h.hash).unwrap_or(Hash256::ZERO);
        headers.push(BlockHeader {
            hash: hf(n),
            previous_hash,
            sequence: (n + 1) as u32,
            work: Work::from(n + 1 + work_bonus),
        });
    }
    headers
}

/// Wrap headers into blocks with empty payloads.
pub fn blocks(headers: &[BlockHeader]) -> Vec<Block> {
    headers
        .iter()
        .map(|&header| Block {
            header,
            payload: Vec::new(),
        })
        .collect()
}

/// The tip of a header chain as a [`ChainTip`].
pub fn tip_of(headers: &[BlockHeader]) -> ChainTip {
    headers.last().expect("non-empty chain").tip()
}

// ---------------------------------------------------------------------------
// Mock: ChainStore
// ---------------------------------------------------------------------------

struct StoreInner {
    /// Main chain, genesis first.
    main: Vec<BlockHeader>,
    /// Every header ever connected, by hash.
    known: HashMap<Hash256, BlockHeader>,
    /// Scripted validator rejections by block hash.
    rejects: HashMap<Hash256, (u16, String)>,
    /// Sequences in the order they were applied.
    applied: Vec<u32>,
    /// Number of `add_block` calls observed.
    add_calls: usize,
}

/// In-memory chain store with naive best-work reorg handling.
///
/// Accepts a block whose parent lies anywhere on the main chain by
/// truncating to the parent and appending; anything else is an orphan.
pub struct MemoryChainStore {
    inner: Mutex<StoreInner>,
    /// When present, one permit is consumed per `add_block`, letting tests
    /// hold the store mid-episode.
    gate: Option<Arc<Semaphore>>,
}

impl MemoryChainStore {
    /// A store whose main chain is exactly `headers`.
    pub fn with_chain(headers: Vec<BlockHeader>) -> Self {
        let known = headers.iter().map(|h| (h.hash, *h)).collect();
        Self {
            inner: Mutex::new(StoreInner {
                main: headers,
                known,
                rejects: HashMap::new(),
                applied: Vec::new(),
                add_calls: 0,
            }),
            gate: None,
        }
    }

    /// Like [`with_chain`](Self::with_chain), but every apply first takes a
    /// permit from `gate`.
    pub fn gated(headers: Vec<BlockHeader>, gate: Arc<Semaphore>) -> Self {
        let mut store = Self::with_chain(headers);
        store.gate = Some(gate);
        store
    }

    /// Script a validator rejection for the block with the given hash.
    pub fn reject(&self, hash: Hash256, score: u16, reason: &str) {
        self.inner
            .lock()
            .rejects
            .insert(hash, (score, reason.to_string()));
    }

    /// Sequence of the current main-chain head.
    pub fn head_sequence(&self) -> u32 {
        self.head().sequence
    }

    /// Hash of the current main-chain head.
    pub fn head_hash(&self) -> Hash256 {
        self.head().hash
    }

    /// Sequences applied so far, in order.
    pub fn applied_sequences(&self) -> Vec<u32> {
        self.inner.lock().applied.clone()
    }

    /// Number of `add_block` calls observed.
    pub fn add_calls(&self) -> usize {
        self.inner.lock().add_calls
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    fn genesis(&self) -> BlockHeader {
        self.inner.lock().main[0]
    }

    fn head(&self) -> BlockHeader {
        *self.inner.lock().main.last().expect("non-empty chain")
    }

    fn get_header(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.inner.lock().known.get(hash).copied()
    }

    fn iterate(&self, start: u32, end: u32) -> Vec<Hash256> {
        self.inner
            .lock()
            .main
            .iter()
            .filter(|h| h.sequence >= start && h.sequence <= end)
            .map(|h| h.hash)
            .collect()
    }

    async fn add_block(&self, block: Block) -> AddBlockOutcome {
        self.inner.lock().add_calls += 1;
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        let mut inner = self.inner.lock();
        let header = block.header;
        if let Some((score, reason)) = inner.rejects.get(&header.hash).cloned() {
            return AddBlockOutcome::Invalid { score, reason };
        }
        if inner.known.contains_key(&header.hash) {
            return AddBlockOutcome::Duplicate;
        }
        let Some(parent) = inner
            .main
            .iter()
            .position(|h| h.hash == header.previous_hash)
        else {
            return AddBlockOutcome::Orphan;
        };
        inner.main.truncate(parent + 1);
        inner.main.push(header);
        inner.known.insert(header.hash, header);
        inner.applied.push(header.sequence);
        AddBlockOutcome::Added
    }
}

// ---------------------------------------------------------------------------
// Mock: PeerManager
// ---------------------------------------------------------------------------

/// What the peer manager was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// A misbehavior score was recorded.
    Punish {
        peer: PeerId,
        score: u16,
        reason: String,
    },
    /// The connection was closed.
    Close { peer: PeerId },
}

/// Static peer table recording every punishment and close.
pub struct StaticPeerManager {
    table: Mutex<HashMap<PeerId, PeerHandle>>,
    actions: Mutex<Vec<PeerAction>>,
    events: broadcast::Sender<PeerEvent>,
}

impl StaticPeerManager {
    /// An empty table.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            table: Mutex::new(HashMap::new()),
            actions: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Register a peer snapshot.
    pub fn add_peer(&self, handle: PeerHandle) {
        self.table.lock().insert(handle.id, handle);
    }

    /// Register a connected, sync-capable peer advertising `tip`.
    pub fn add_sync_peer(&self, name: &str, tip: ChainTip) -> PeerId {
        let id = PeerId::random();
        self.add_peer(PeerHandle {
            id,
            display_name: name.to_string(),
            state: ConnectionState::Connected,
            chain_tip: Some(tip),
            features: Some(PeerFeatures {
                supports_syncing: true,
            }),
            ban_score: 0,
        });
        id
    }

    /// Mark a peer disconnected and publish the state change.
    pub fn disconnect(&self, id: &PeerId) {
        if let Some(handle) = self.table.lock().get_mut(id) {
            handle.state = ConnectionState::Disconnected;
        }
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: *id,
            state: ConnectionState::Disconnected,
        });
    }

    /// Everything the core asked of the manager, in order.
    pub fn actions(&self) -> Vec<PeerAction> {
        self.actions.lock().clone()
    }

    /// Recorded punishments as `(peer, score, reason)`.
    pub fn punishments(&self) -> Vec<(PeerId, u16, String)> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                PeerAction::Punish {
                    peer,
                    score,
                    reason,
                } => Some((peer, score, reason)),
                PeerAction::Close { .. } => None,
            })
            .collect()
    }

    /// Peers the core asked to close, in order.
    pub fn closed(&self) -> Vec<PeerId> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                PeerAction::Close { peer } => Some(peer),
                PeerAction::Punish { .. } => None,
            })
            .collect()
    }

    /// Advertised tip of a peer, if known.
    pub fn chain_tip(&self, id: &PeerId) -> Option<ChainTip> {
        self.table.lock().get(id).and_then(|h| h.chain_tip)
    }
}

impl Default for StaticPeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager for StaticPeerManager {
    fn connected_peers(&self) -> Vec<PeerHandle> {
        self.table
            .lock()
            .values()
            .filter(|h| h.state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    fn get_peer(&self, id: &PeerId) -> Option<PeerHandle> {
        self.table.lock().get(id).cloned()
    }

    fn punish(&self, id: &PeerId, score: u16, reason: &str) {
        if let Some(handle) = self.table.lock().get_mut(id) {
            handle.ban_score = handle.ban_score.saturating_add(score);
        }
        self.actions.lock().push(PeerAction::Punish {
            peer: *id,
            score,
            reason: reason.to_string(),
        });
    }

    fn close(&self, id: &PeerId, _reason: Option<&str>) {
        self.actions.lock().push(PeerAction::Close { peer: *id });
        if let Some(handle) = self.table.lock().get_mut(id) {
            handle.state = ConnectionState::Disconnected;
        }
        let _ = self.events.send(PeerEvent::StateChanged {
            peer: *id,
            state: ConnectionState::Disconnected,
        });
    }

    fn update_chain_tip(&self, id: &PeerId, tip: ChainTip) {
        if let Some(handle) = self.table.lock().get_mut(id) {
            handle.chain_tip = Some(tip);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

/// Assert that every maximum-score punishment was followed by a close of
/// the same peer.
pub fn assert_max_punish_closes(actions: &[PeerAction]) {
    for (index, action) in actions.iter().enumerate() {
        if let PeerAction::Punish { peer, score, .. } = action {
            if *score >= pyrite_sync::MAX_PUNISH_SCORE {
                let closed_later = actions[index + 1..]
                    .iter()
                    .any(|a| matches!(a, PeerAction::Close { peer: p } if p == peer));
                assert!(
                    closed_later,
                    "max punishment of {peer} was not followed by a close"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock: WireProtocol
// ---------------------------------------------------------------------------

/// A request observed by the wire mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    /// `get_block_headers(peer, start, count)`.
    Headers {
        peer: PeerId,
        start: u32,
        count: u32,
    },
    /// `get_blocks(peer, start, limit)`.
    Blocks {
        peer: PeerId,
        start: Hash256,
        limit: u32,
    },
}

struct RemotePeer {
    /// The peer's chain, genesis first.
    headers: Vec<BlockHeader>,
    /// Reported round-trip time.
    rtt: Duration,
    /// Scripted header responses by requested sequence.
    header_overrides: HashMap<u32, Vec<BlockHeader>>,
    /// Scripted block batches by anchor hash.
    batch_overrides: HashMap<Hash256, Vec<Block>>,
    /// Fail every request.
    unreachable: bool,
    /// Fail block requests only.
    fail_blocks: bool,
}

impl RemotePeer {
    fn new() -> Self {
        Self {
            headers: Vec::new(),
            rtt: Duration::from_millis(5),
            header_overrides: HashMap::new(),
            batch_overrides: HashMap::new(),
            unreachable: false,
            fail_blocks: false,
        }
    }
}

/// Wire mock serving scripted per-peer chains, with a request ledger.
pub struct ScriptedWire {
    remotes: Mutex<HashMap<PeerId, RemotePeer>>,
    log: Mutex<Vec<WireRequest>>,
}

impl ScriptedWire {
    /// An empty wire: every peer is unknown until scripted.
    pub fn new() -> Self {
        Self {
            remotes: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    fn remote_mut<R>(&self, peer: PeerId, f: impl FnOnce(&mut RemotePeer) -> R) -> R {
        let mut remotes = self.remotes.lock();
        f(remotes.entry(peer).or_insert_with(RemotePeer::new))
    }

    /// Script the peer's full chain.
    pub fn set_chain(&self, peer: PeerId, headers: Vec<BlockHeader>) {
        self.remote_mut(peer, |remote| remote.headers = headers);
    }

    /// Script the peer's reported round-trip time.
    pub fn set_rtt(&self, peer: PeerId, rtt: Duration) {
        self.remote_mut(peer, |remote| remote.rtt = rtt);
    }

    /// Make every request to the peer fail.
    pub fn set_unreachable(&self, peer: PeerId) {
        self.remote_mut(peer, |remote| remote.unreachable = true);
    }

    /// Make block requests to the peer fail; headers keep working.
    pub fn set_fail_blocks(&self, peer: PeerId) {
        self.remote_mut(peer, |remote| remote.fail_blocks = true);
    }

    /// Replace the response to a header request at `sequence`.
    pub fn override_headers(&self, peer: PeerId, sequence: u32, headers: Vec<BlockHeader>) {
        self.remote_mut(peer, |remote| {
            remote.header_overrides.insert(sequence, headers);
        });
    }

    /// Replace the batch served for the given anchor.
    pub fn override_batch(&self, peer: PeerId, anchor: Hash256, batch: Vec<Block>) {
        self.remote_mut(peer, |remote| {
            remote.batch_overrides.insert(anchor, batch);
        });
    }

    /// Every request observed, in order.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.log.lock().clone()
    }

    /// Number of header requests observed.
    pub fn header_request_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, WireRequest::Headers { .. }))
            .count()
    }

    /// Number of block requests observed.
    pub fn block_request_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, WireRequest::Blocks { .. }))
            .count()
    }

    /// Peers in the order their header requests arrived.
    pub fn probe_order(&self) -> Vec<PeerId> {
        self.requests()
            .iter()
            .filter_map(|r| match r {
                WireRequest::Headers { peer, .. } => Some(*peer),
                WireRequest::Blocks { .. } => None,
            })
            .collect()
    }
}

impl Default for ScriptedWire {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WireProtocol for ScriptedWire {
    async fn get_block_headers(
        &self,
        peer: &PeerId,
        start_sequence: u32,
        count: u32,
    ) -> Result<HeadersResponse, WireError> {
        self.log.lock().push(WireRequest::Headers {
            peer: *peer,
            start: start_sequence,
            count,
        });
        let remotes = self.remotes.lock();
        let Some(remote) = remotes.get(peer) else {
            return Err(WireError::PeerDisconnected("unknown peer".to_string()));
        };
        if remote.unreachable {
            return Err(WireError::Timeout);
        }
        if let Some(scripted) = remote.header_overrides.get(&start_sequence) {
            return Ok(HeadersResponse {
                headers: scripted.clone(),
                elapsed: remote.rtt,
            });
        }
        let headers = remote
            .headers
            .iter()
            .filter(|h| h.sequence >= start_sequence)
            .take(count as usize)
            .copied()
            .collect();
        Ok(HeadersResponse {
            headers,
            elapsed: remote.rtt,
        })
    }

    async fn get_blocks(
        &self,
        peer: &PeerId,
        start_hash: &Hash256,
        limit: u32,
    ) -> Result<BlocksResponse, WireError> {
        self.log.lock().push(WireRequest::Blocks {
            peer: *peer,
            start: *start_hash,
            limit,
        });
        let remotes = self.remotes.lock();
        let Some(remote) = remotes.get(peer) else {
            return Err(WireError::PeerDisconnected("unknown peer".to_string()));
        };
        if remote.unreachable || remote.fail_blocks {
            return Err(WireError::Timeout);
        }
        if let Some(scripted) = remote.batch_overrides.get(start_hash) {
            return Ok(BlocksResponse {
                blocks: scripted.clone(),
                elapsed: remote.rtt,
                is_full: scripted.len() == limit as usize,
            });
        }
        let Some(position) = remote.headers.iter().position(|h| h.hash == *start_hash) else {
            return Ok(BlocksResponse {
                blocks: Vec::new(),
                elapsed: remote.rtt,
                is_full: false,
            });
        };
        let batch: Vec<Block> = remote.headers[position..]
            .iter()
            .take(limit as usize)
            .map(|&header| Block {
                header,
                payload: Vec::new(),
            })
            .collect();
        let is_full = batch.len() == limit as usize;
        Ok(BlocksResponse {
            blocks: batch,
            elapsed: remote.rtt,
            is_full,
        })
    }
}
