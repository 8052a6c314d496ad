//! Common-ancestor discovery against the elected loader.
//!
//! Finds the highest block shared by the local main chain and the remote
//! peer's chain: a few linear probes just below the lower of the two tips
//! (most peers fork near the tip, if at all), then a binary search over the
//! remote's whole sequence range. Every probe asks the peer for a single
//! header by sequence and checks the returned hash against the local main
//! chain, so a lying peer is caught the moment its answers contradict its
//! own chain.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use pyrite_core::constants::GENESIS_SEQUENCE;
use pyrite_core::traits::{ChainStore, PeerManager, WireProtocol};
use pyrite_core::types::{BlockHeader, ChainTip, Hash256, PeerId};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::misbehavior::{Misbehavior, report_violation};

/// The highest block known to sit on both chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ancestor {
    /// Hash of the ancestor block.
    pub hash: Hash256,
    /// Sequence of the ancestor block.
    pub sequence: u32,
    /// Header requests spent finding it.
    pub requests: u32,
}

/// Locates the common ancestor between the local chain and a remote peer.
pub struct AncestorFinder {
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    wire: Arc<dyn WireProtocol>,
    linear_window: u32,
}

impl AncestorFinder {
    /// A finder over the given collaborators.
    pub fn new(
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        wire: Arc<dyn WireProtocol>,
        cfg: &SyncConfig,
    ) -> Self {
        Self {
            chain,
            peers,
            wire,
            linear_window: cfg.linear_ancestor_window,
        }
    }

    /// Find a common ancestor with `loader`, whose tip is `remote`.
    ///
    /// A linear hit lands within the probe stride of the fork point; once
    /// the search falls through to the binary phase the result is the
    /// maximum common height. Either way the total spend is at most
    /// `linear_window + ⌈log2(remote.sequence + 1)⌉` probes. A peer whose
    /// answers contradict the sequence they were requested at — or that
    /// cannot even produce our genesis — is punished and the search aborts.
    pub async fn find(
        &self,
        loader: &PeerId,
        remote: &ChainTip,
        stop: &watch::Receiver<bool>,
    ) -> Result<Ancestor, SyncError> {
        let head = self.chain.head();
        let genesis = self.chain.genesis();
        if head.hash == genesis.hash {
            debug!("sync: local chain is at genesis, skipping ancestor search");
            return Ok(Ancestor {
                hash: genesis.hash,
                sequence: genesis.sequence,
                requests: 0,
            });
        }

        let mut requests = 0u32;

        // Linear phase over recent history.
        let base = head.sequence.min(remote.sequence);
        for i in 0..self.linear_window {
            let needle = base.saturating_sub(2 * i).max(GENESIS_SEQUENCE);
            self.ensure_active(loader, stop)?;
            let probed = self.probe(loader, needle).await?;
            requests += 1;
            let Some(remote_header) = probed else {
                continue;
            };
            if let Some(local) = self.local_match(&remote_header) {
                if local.sequence != needle {
                    return Err(report_violation(
                        self.peers.as_ref(),
                        loader,
                        Misbehavior::HeaderNotMatchSequence,
                    ));
                }
                debug!(sequence = needle, requests, "sync: ancestor via linear probe");
                return Ok(Ancestor {
                    hash: local.hash,
                    sequence: needle,
                    requests,
                });
            }
            if needle == GENESIS_SEQUENCE {
                // Nothing lower left to probe linearly.
                break;
            }
        }

        // Binary phase over the remote's full range.
        let mut lower = GENESIS_SEQUENCE;
        let mut upper = remote.sequence;
        let mut best: Option<(Hash256, u32)> = None;
        while lower <= upper {
            let needle = lower + (upper - lower) / 2;
            self.ensure_active(loader, stop)?;
            let probed = self.probe(loader, needle).await?;
            requests += 1;
            match probed.and_then(|remote_header| self.local_match(&remote_header)) {
                None => {
                    if needle == GENESIS_SEQUENCE {
                        return Err(report_violation(
                            self.peers.as_ref(),
                            loader,
                            Misbehavior::InvalidGenesisBlock,
                        ));
                    }
                    upper = needle - 1;
                }
                Some(local) if local.sequence != needle => {
                    return Err(report_violation(
                        self.peers.as_ref(),
                        loader,
                        Misbehavior::HeaderNotMatchSequence,
                    ));
                }
                Some(local) => {
                    best = Some((local.hash, needle));
                    lower = needle + 1;
                }
            }
        }

        match best {
            Some((hash, sequence)) => {
                debug!(sequence, requests, "sync: ancestor via binary search");
                Ok(Ancestor {
                    hash,
                    sequence,
                    requests,
                })
            }
            // Only reachable when the remote advertised a tip below genesis;
            // the genesis probe above catches every honest divergence.
            None => Err(report_violation(
                self.peers.as_ref(),
                loader,
                Misbehavior::InvalidGenesisBlock,
            )),
        }
    }

    /// Ask the loader for the single header at `needle`.
    async fn probe(
        &self,
        loader: &PeerId,
        needle: u32,
    ) -> Result<Option<BlockHeader>, SyncError> {
        let response = self.wire.get_block_headers(loader, needle, 1).await?;
        Ok(response.headers.first().copied())
    }

    /// The local main-chain header matching a remote header's hash, if any.
    fn local_match(&self, remote: &BlockHeader) -> Option<BlockHeader> {
        self.chain
            .get_header(&remote.hash)
            .filter(|local| self.chain.is_on_main_chain(local))
    }

    fn ensure_active(
        &self,
        loader: &PeerId,
        stop: &watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        if *stop.borrow() {
            return Err(SyncError::AbortSync);
        }
        match self.peers.get_peer(loader) {
            Some(peer) if peer.is_connected() => Ok(()),
            _ => Err(SyncError::LoaderDisconnected),
        }
    }
}
