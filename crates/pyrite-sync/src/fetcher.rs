//! Windowed, pipelined block download from the elected loader.
//!
//! Each request asks for one more than the window size: the first returned
//! block is the anchor the request was addressed at (already applied
//! locally) and the rest are new. While a full batch is being applied the
//! next request is already in flight, anchored at the batch's tail, so the
//! wire and the validator overlap. At most one request is outstanding;
//! validation throughput therefore sets the request rate.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use pyrite_core::error::WireError;
use pyrite_core::traits::{AddBlockOutcome, BlocksResponse, ChainStore, PeerManager, WireProtocol};
use pyrite_core::types::{BlockHeader, Hash256, PeerId};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::misbehavior::{MAX_PUNISH_SCORE, Misbehavior, report_violation};
use crate::speed::SyncMetrics;

/// Live bookkeeping for one download episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    /// Hash the episode is anchored at (the common ancestor).
    pub start_hash: Hash256,
    /// Sequence of the anchor.
    pub start_sequence: u32,
    /// Whether a block request is currently in flight.
    pub outstanding_request: bool,
    /// Blocks applied so far this episode.
    pub applied_count: u64,
    /// Blocks skipped as duplicates this episode.
    pub skipped_count: u64,
}

impl FetchWindow {
    /// A fresh window anchored at the episode's common ancestor.
    pub fn anchored_at(hash: Hash256, sequence: u32) -> Self {
        Self {
            start_hash: hash,
            start_sequence: sequence,
            outstanding_request: false,
            applied_count: 0,
            skipped_count: 0,
        }
    }
}

/// Why a download episode ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeEnd {
    /// The remote sent a non-full batch; it has nothing further for now.
    Drained,
    /// The remeasurement deadline elapsed; the caller should re-elect.
    Remeasure,
    /// A batch block's parent was unknown; the episode cannot proceed.
    Orphaned,
}

type PendingRequest = JoinHandle<Result<BlocksResponse, WireError>>;

/// Downloads and applies blocks above a known ancestor.
pub struct BlockFetcher {
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    wire: Arc<dyn WireProtocol>,
    window_size: u32,
}

impl BlockFetcher {
    /// A fetcher over the given collaborators.
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
            window_size: cfg.blocks_per_request,
        }
    }

    /// Run one download episode starting just above the window's anchor.
    ///
    /// Applies blocks strictly in order; any gap, validator rejection, or
    /// empty batch tears the episode down with the loader punished. The
    /// remeasurement `deadline` gates only the scheduling of the next
    /// request — an in-flight batch is always applied to the end. On every
    /// return path a still-outstanding request has been aborted.
    pub async fn run(
        &self,
        loader: &PeerId,
        window: &mut FetchWindow,
        deadline: Instant,
        stop: &watch::Receiver<bool>,
        metrics: &mut SyncMetrics,
    ) -> Result<EpisodeEnd, SyncError> {
        let mut current_sequence = window.start_sequence;
        let mut outstanding = Some(self.issue_request(*loader, window.start_hash, window));
        let mut end = EpisodeEnd::Drained;

        while let Some(request) = outstanding.take() {
            let response = match request.await {
                Ok(result) => {
                    window.outstanding_request = false;
                    result?
                }
                Err(join_error) => {
                    window.outstanding_request = false;
                    return Err(WireError::RequestFailed(join_error.to_string()).into());
                }
            };
            self.ensure_active(loader, stop)?;
            metrics.record_download(response.blocks.len(), response.elapsed);

            if response.blocks.is_empty() {
                return Err(report_violation(
                    self.peers.as_ref(),
                    loader,
                    Misbehavior::EmptyBlockBatch,
                ));
            }

            // Line the next batch up behind this one before applying,
            // unless the remote is drained or it is time to re-elect.
            if response.is_full {
                if Instant::now() < deadline {
                    let tail = response.blocks[response.blocks.len() - 1].header.hash;
                    outstanding = Some(self.issue_request(*loader, tail, window));
                } else {
                    end = EpisodeEnd::Remeasure;
                }
            } else {
                end = EpisodeEnd::Drained;
            }

            // The first block is the anchor we already hold.
            for block in response.blocks.into_iter().skip(1) {
                if let Err(error) = self.ensure_active(loader, stop) {
                    Self::abort_outstanding(&mut outstanding, window);
                    return Err(error);
                }
                if block.header.sequence != current_sequence + 1 {
                    Self::abort_outstanding(&mut outstanding, window);
                    return Err(report_violation(
                        self.peers.as_ref(),
                        loader,
                        Misbehavior::OutOfSequenceBlock,
                    ));
                }
                let header = block.header;
                match self.chain.add_block(block).await {
                    AddBlockOutcome::Added => {
                        window.applied_count += 1;
                        metrics.record_apply(Instant::now());
                        current_sequence = header.sequence;
                        self.raise_peer_tip(loader, &header);
                    }
                    AddBlockOutcome::Duplicate => {
                        window.skipped_count += 1;
                        current_sequence = header.sequence;
                    }
                    AddBlockOutcome::Orphan => {
                        warn!(%loader, block = %header.hash, "sync: loader sent an orphan, ending episode");
                        Self::abort_outstanding(&mut outstanding, window);
                        return Ok(EpisodeEnd::Orphaned);
                    }
                    AddBlockOutcome::Invalid { score, reason } => {
                        Self::abort_outstanding(&mut outstanding, window);
                        warn!(%loader, score, reason = %reason, "sync: validator rejected block");
                        self.peers.punish(loader, score, &reason);
                        if score >= MAX_PUNISH_SCORE {
                            self.peers.close(loader, Some(&reason));
                        }
                        return Err(SyncError::ValidatorRejection {
                            peer: *loader,
                            score,
                            reason,
                        });
                    }
                }
            }
            debug!(
                %loader,
                applied = window.applied_count,
                skipped = window.skipped_count,
                tip = current_sequence,
                "sync: batch applied"
            );
        }

        Ok(end)
    }

    /// Fire a block request on its own task so it progresses while the
    /// current batch is being applied.
    fn issue_request(
        &self,
        loader: PeerId,
        anchor: Hash256,
        window: &mut FetchWindow,
    ) -> PendingRequest {
        let wire = Arc::clone(&self.wire);
        let limit = self.window_size + 1;
        window.outstanding_request = true;
        debug!(%loader, anchor = %anchor, limit, "sync: requesting block batch");
        tokio::spawn(async move { wire.get_blocks(&loader, &anchor, limit).await })
    }

    fn abort_outstanding(outstanding: &mut Option<PendingRequest>, window: &mut FetchWindow) {
        if let Some(request) = outstanding.take() {
            request.abort();
            window.outstanding_request = false;
        }
    }

    /// Credit the loader with a tip at least as good as the block it served.
    fn raise_peer_tip(&self, loader: &PeerId, header: &BlockHeader) {
        if let Some(peer) = self.peers.get_peer(loader) {
            let known = peer.chain_tip.map(|tip| tip.work).unwrap_or_default();
            if header.work > known {
                self.peers.update_chain_tip(loader, header.tip());
            }
        }
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
