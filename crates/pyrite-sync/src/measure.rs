//! Loader election: probe candidate peers and rank by round-trip time.
//!
//! A measurement phase filters the peer table down to peers that can
//! actually serve a sync (connected, advertising the syncing feature, and
//! claiming strictly more work than the local head), probes each with a
//! one-header genesis request, and elects the fastest responder.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info};

use pyrite_core::constants::GENESIS_SEQUENCE;
use pyrite_core::traits::{ChainStore, PeerManager, WireProtocol};
use pyrite_core::types::{PeerHandle, PeerId};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::misbehavior::{Misbehavior, punish_and_close};

/// A probed candidate: identity plus round-trip time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    /// The probed peer.
    pub peer: PeerId,
    /// Round-trip time of the probe.
    pub rtt: Duration,
}

/// Probes sync candidates and elects the fastest as loader.
pub struct PeerMeasurer {
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    wire: Arc<dyn WireProtocol>,
    cfg: SyncConfig,
}

impl PeerMeasurer {
    /// A measurer over the given collaborators.
    pub fn new(
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        wire: Arc<dyn WireProtocol>,
        cfg: SyncConfig,
    ) -> Self {
        Self {
            chain,
            peers,
            wire,
            cfg,
        }
    }

    /// Peers eligible to serve as loader right now.
    fn candidates(&self) -> Vec<PeerHandle> {
        let local_work = self.chain.head().work;
        self.peers
            .connected_peers()
            .into_iter()
            .filter(|p| p.is_connected())
            .filter(|p| p.supports_syncing())
            .filter(|p| self.cfg.allows_peer(&p.display_name))
            .filter(|p| p.chain_tip.is_some_and(|tip| tip.work > local_work))
            .collect()
    }

    /// Run one measurement phase and return the elected loader, if any.
    ///
    /// A lone candidate is elected without probing. Otherwise candidates are
    /// probed in shuffled order — with a still-qualifying previous loader
    /// moved to the front, so it wins round-trip ties and keeps its seat
    /// across remeasurements — until `candidates_per_measurement` probes
    /// succeed. Probes that return anything but our genesis header punish
    /// the peer; errors and departed peers are skipped.
    pub async fn measure(
        &self,
        previous: Option<PeerId>,
        rng: &mut impl Rng,
        stop: &watch::Receiver<bool>,
    ) -> Result<Option<PeerId>, SyncError> {
        let mut candidates = self.candidates();
        if candidates.is_empty() {
            debug!("sync: no loader candidates");
            return Ok(None);
        }
        if candidates.len() == 1 {
            let only = candidates[0].id;
            debug!(peer = %only, "sync: single candidate, electing without probes");
            return Ok(Some(only));
        }

        candidates.shuffle(rng);
        if let Some(previous) = previous {
            if let Some(position) = candidates.iter().position(|p| p.id == previous) {
                let seeded = candidates.remove(position);
                candidates.insert(0, seeded);
            }
        }

        let genesis = self.chain.genesis();
        let mut results: Vec<Measurement> = Vec::new();
        for candidate in &candidates {
            if results.len() >= self.cfg.candidates_per_measurement {
                break;
            }
            if *stop.borrow() {
                return Err(SyncError::AbortSync);
            }
            // The peer table may have moved on since the snapshot.
            match self.peers.get_peer(&candidate.id) {
                Some(current) if current.is_connected() => {}
                _ => {
                    debug!(peer = %candidate.id, "sync: candidate left before probe");
                    continue;
                }
            }
            match self
                .wire
                .get_block_headers(&candidate.id, GENESIS_SEQUENCE, 1)
                .await
            {
                Err(error) => {
                    debug!(peer = %candidate.id, %error, "sync: measurement probe failed");
                }
                Ok(response) => {
                    if response.headers.len() != 1 || response.headers[0].hash != genesis.hash {
                        punish_and_close(
                            self.peers.as_ref(),
                            &candidate.id,
                            Misbehavior::InvalidMeasurementResponse,
                        );
                        continue;
                    }
                    debug!(
                        peer = %candidate.id,
                        rtt_ms = response.elapsed.as_millis() as u64,
                        "sync: measurement probe ok"
                    );
                    results.push(Measurement {
                        peer: candidate.id,
                        rtt: response.elapsed,
                    });
                }
            }
        }

        // Smallest round-trip wins; ties resolve to the earlier probe.
        let elected = results
            .iter()
            .enumerate()
            .min_by_key(|(index, m)| (m.rtt, *index))
            .map(|(_, m)| m.peer);
        match elected {
            Some(peer) => info!(%peer, probed = results.len(), "sync: elected loader"),
            None => debug!("sync: no candidate survived probing"),
        }
        Ok(elected)
    }
}
