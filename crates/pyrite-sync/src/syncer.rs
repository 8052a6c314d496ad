//! The synchronization state machine and its event loop.
//!
//! Uses a handle/background-task architecture: [`Syncer::start`] spawns one
//! tokio task that owns every piece of sync state, and the handle only
//! carries channels and a status snapshot. All state transitions happen on
//! that single task — on a tick boundary or as continuations of its own
//! wire calls — so no lock is ever held across a suspension point.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use pyrite_core::traits::{AddBlockOutcome, ChainStore, PeerEvent, PeerManager, WireProtocol};
use pyrite_core::types::{Block, BlockHeader, ChainTip, ConnectionState, PeerId};

use crate::ancestor::AncestorFinder;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetcher::{BlockFetcher, EpisodeEnd, FetchWindow};
use crate::measure::PeerMeasurer;
use crate::misbehavior::MAX_PUNISH_SCORE;
use crate::speed::SyncMetrics;

/// The syncer's lifecycle state.
///
/// A loader exists exactly while the state is `Syncing`, and there is never
/// more than one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncerState {
    /// Not running.
    Stopped,
    /// Running; the next tick will look for work.
    Idle,
    /// Probing candidates to elect a loader.
    Measuring {
        /// Loader of the previous episode, probed first if it still
        /// qualifies.
        previous_loader: Option<PeerId>,
    },
    /// Downloading blocks from the elected loader.
    Syncing {
        /// The one peer currently serving blocks.
        loader: PeerId,
        /// Episode bookkeeping.
        window: FetchWindow,
    },
    /// Shutdown requested; the event loop is winding down.
    Stopping,
}

impl SyncerState {
    /// The current loader, populated iff syncing.
    pub fn loader(&self) -> Option<PeerId> {
        match self {
            SyncerState::Syncing { loader, .. } => Some(*loader),
            _ => None,
        }
    }

    /// This state collapsed to its phase, without episode data.
    pub fn phase(&self) -> SyncPhase {
        match self {
            SyncerState::Stopped => SyncPhase::Stopped,
            SyncerState::Idle => SyncPhase::Idle,
            SyncerState::Measuring { .. } => SyncPhase::Measuring,
            SyncerState::Syncing { .. } => SyncPhase::Syncing,
            SyncerState::Stopping => SyncPhase::Stopping,
        }
    }
}

/// [`SyncerState`] without per-episode data, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Not running.
    Stopped,
    /// Running, no work in progress.
    Idle,
    /// Electing a loader.
    Measuring,
    /// Downloading blocks.
    Syncing,
    /// Winding down.
    Stopping,
}

/// Read-only snapshot of the syncer, for operators and RPC.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Current phase.
    pub phase: SyncPhase,
    /// Display name of the loader, when syncing.
    pub loader: Option<String>,
    /// Rolling average download speed, blocks per second.
    pub download_rate: f64,
    /// One-minute smoothed apply speed, blocks per second.
    pub apply_rate: f64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Stopped,
            loader: None,
            download_rate: 0.0,
            apply_rate: 0.0,
        }
    }
}

/// Commands accepted by the event loop.
enum Command {
    /// A gossiped block arrived from a peer.
    GossipBlock { peer: PeerId, block: Block },
}

/// How an episode resolved, from the cycle loop's point of view.
enum EpisodeOutcome {
    /// Re-elect immediately, seeding the previous loader.
    Remeasure,
    /// Back to idle until the next tick.
    Finished,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    command_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Handle to the block synchronization core.
///
/// Construct with [`Syncer::new`], then [`start`](Syncer::start) it.
/// Dropping the handle without stopping leaves the event loop running until
/// its command channel closes.
pub struct Syncer {
    cfg: SyncConfig,
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    wire: Arc<dyn WireProtocol>,
    status: Arc<RwLock<SyncStatus>>,
    running: Option<Running>,
}

impl Syncer {
    /// A stopped syncer over the given collaborators.
    pub fn new(
        cfg: SyncConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        wire: Arc<dyn WireProtocol>,
    ) -> Self {
        Self {
            cfg,
            chain,
            peers,
            wire,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            running: None,
        }
    }

    /// Launch the event loop and schedule the first tick.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadyRunning`] if the syncer is not stopped.
    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = SyncEngine::new(
            self.cfg.clone(),
            Arc::clone(&self.chain),
            Arc::clone(&self.peers),
            Arc::clone(&self.wire),
            stop_rx,
            Arc::clone(&self.status),
        );
        let task = tokio::spawn(engine.run(command_rx));
        self.running = Some(Running {
            stop_tx,
            command_tx,
            task,
        });
        info!("sync: started");
        Ok(())
    }

    /// Stop the event loop and wait for it to wind down.
    ///
    /// Any in-flight wire request is cancelled; an in-flight block apply
    /// completes first. Idempotent: returns immediately when already
    /// stopped.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.status.write().phase = SyncPhase::Stopping;
        let _ = running.stop_tx.send(true);
        if running.task.await.is_err() {
            warn!("sync: event loop task panicked during shutdown");
        }
        let mut status = self.status.write();
        status.phase = SyncPhase::Stopped;
        status.loader = None;
        drop(status);
        info!("sync: stopped");
    }

    /// Feed a gossiped block into the state machine.
    ///
    /// While idle, the block is applied — and if it turns out to be an
    /// orphan, a sync from the gossiping peer may start. In any other state
    /// this is a no-op.
    pub fn on_gossip_block(&self, peer: PeerId, block: Block) {
        if let Some(running) = &self.running {
            let _ = running.command_tx.send(Command::GossipBlock { peer, block });
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Whether the event loop is running.
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }
}

/// The event loop's state, owned by exactly one task.
struct SyncEngine {
    cfg: SyncConfig,
    chain: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerManager>,
    measurer: PeerMeasurer,
    finder: AncestorFinder,
    fetcher: BlockFetcher,
    state: SyncerState,
    /// Completed measurement phases since start. Drives the remeasurement
    /// backoff; never reset while running.
    measurement_phases: u32,
    /// Loader of the most recent episode, seeded into the next election.
    previous_loader: Option<PeerId>,
    metrics: SyncMetrics,
    rng: StdRng,
    stop_rx: watch::Receiver<bool>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncEngine {
    fn new(
        cfg: SyncConfig,
        chain: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerManager>,
        wire: Arc<dyn WireProtocol>,
        stop_rx: watch::Receiver<bool>,
        status: Arc<RwLock<SyncStatus>>,
    ) -> Self {
        let measurer = PeerMeasurer::new(
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&wire),
            cfg.clone(),
        );
        let finder = AncestorFinder::new(
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&wire),
            &cfg,
        );
        let fetcher = BlockFetcher::new(
            Arc::clone(&chain),
            Arc::clone(&peers),
            Arc::clone(&wire),
            &cfg,
        );
        Self {
            cfg,
            chain,
            peers,
            measurer,
            finder,
            fetcher,
            state: SyncerState::Stopped,
            measurement_phases: 0,
            previous_loader: None,
            metrics: SyncMetrics::new(),
            rng: StdRng::from_entropy(),
            stop_rx,
            status,
        }
    }

    /// The event loop. Exactly one logical tick runs at a time; commands
    /// and peer events are handled between ticks.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = interval(self.cfg.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut peer_events = self.peers.subscribe();
        let mut peer_events_open = true;
        let mut stop_rx = self.stop_rx.clone();
        self.set_state(SyncerState::Idle);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    match self.on_tick().await {
                        Ok(()) => {}
                        Err(SyncError::AbortSync) => break,
                        Err(error) => warn!(%error, "sync: tick failed, retrying next tick"),
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::GossipBlock { peer, block }) => {
                        match self.on_gossip_block(peer, block).await {
                            Ok(()) => {}
                            Err(SyncError::AbortSync) => break,
                            Err(error) => warn!(%error, "sync: gossip handling failed"),
                        }
                    }
                    None => break,
                },
                event = peer_events.recv(), if peer_events_open => {
                    self.on_peer_event(event, &mut peer_events_open);
                }
            }
        }

        self.set_state(SyncerState::Stopped);
        debug!("sync: event loop exited");
    }

    /// One scheduler tick.
    async fn on_tick(&mut self) -> Result<(), SyncError> {
        if self.stopping() {
            return Err(SyncError::AbortSync);
        }
        if !matches!(self.state, SyncerState::Idle) {
            return Ok(());
        }
        self.sync_cycle(None).await
    }

    /// Measure, sync, and remeasure until there is nothing further to do.
    ///
    /// `first` skips the initial election and syncs straight from that peer
    /// (the orphan-gossip entry point).
    async fn sync_cycle(&mut self, mut first: Option<PeerId>) -> Result<(), SyncError> {
        let mut seed = self.previous_loader;
        loop {
            let elected = match first.take() {
                Some(peer) => Some(peer),
                None => self.run_measurement(seed).await?,
            };
            let Some(loader) = elected else { break };
            match self.run_episode(loader).await? {
                EpisodeOutcome::Remeasure => seed = Some(loader),
                EpisodeOutcome::Finished => break,
            }
        }
        self.set_state(SyncerState::Idle);
        Ok(())
    }

    /// One measurement phase.
    async fn run_measurement(
        &mut self,
        previous: Option<PeerId>,
    ) -> Result<Option<PeerId>, SyncError> {
        self.set_state(SyncerState::Measuring {
            previous_loader: previous,
        });
        let elected = self
            .measurer
            .measure(previous, &mut self.rng, &self.stop_rx)
            .await?;
        self.measurement_phases += 1;
        Ok(elected)
    }

    /// One contiguous syncing interval with a single loader.
    async fn run_episode(&mut self, loader: PeerId) -> Result<EpisodeOutcome, SyncError> {
        let Some(handle) = self.peers.get_peer(&loader) else {
            return Ok(EpisodeOutcome::Finished);
        };
        let Some(remote) = handle.chain_tip else {
            debug!(%loader, "sync: elected loader has no advertised tip");
            return Ok(EpisodeOutcome::Finished);
        };
        let deadline = Instant::now() + self.cfg.measurement_backoff(self.measurement_phases);
        let head = self.chain.head();
        self.set_state(SyncerState::Syncing {
            loader,
            window: FetchWindow::anchored_at(head.hash, head.sequence),
        });
        info!(
            %loader,
            peer = %handle.display_name,
            remote_sequence = remote.sequence,
            "sync: episode started"
        );

        let result = self.drive_episode(&loader, remote, deadline).await;
        match result {
            Ok(end) => {
                self.previous_loader = Some(loader);
                let (applied, skipped) = self.window_counts();
                info!(%loader, applied, skipped, end = ?end, "sync: episode ended");
                Ok(match end {
                    EpisodeEnd::Remeasure => EpisodeOutcome::Remeasure,
                    EpisodeEnd::Drained | EpisodeEnd::Orphaned => EpisodeOutcome::Finished,
                })
            }
            Err(SyncError::AbortSync) => Err(SyncError::AbortSync),
            Err(SyncError::LoaderDisconnected) => {
                debug!(%loader, "sync: loader disconnected mid-episode");
                Ok(EpisodeOutcome::Finished)
            }
            Err(
                error @ (SyncError::ProtocolViolation { .. }
                | SyncError::ValidatorRejection { .. }),
            ) => {
                // Punished and closed at the point of detection.
                warn!(%loader, %error, "sync: episode torn down");
                Ok(EpisodeOutcome::Finished)
            }
            Err(SyncError::Wire(error)) => {
                warn!(%loader, %error, "sync: wire failure, demoting loader");
                self.peers.close(&loader, Some("sync request failed"));
                Ok(EpisodeOutcome::Finished)
            }
            Err(error) => {
                warn!(%loader, %error, "sync: episode failed");
                Ok(EpisodeOutcome::Finished)
            }
        }
    }

    /// Ancestor search plus the block download, against one loader.
    ///
    /// `deadline` is when the next remeasurement is due; set on entering
    /// the syncing state, checked before each follow-up request.
    async fn drive_episode(
        &mut self,
        loader: &PeerId,
        remote: ChainTip,
        deadline: Instant,
    ) -> Result<EpisodeEnd, SyncError> {
        let ancestor = self.finder.find(loader, &remote, &self.stop_rx).await?;
        debug!(
            %loader,
            sequence = ancestor.sequence,
            requests = ancestor.requests,
            "sync: common ancestor found"
        );
        if ancestor.sequence == remote.sequence {
            debug!(%loader, "sync: already in sync with loader");
            return Ok(EpisodeEnd::Drained);
        }

        let mut window = FetchWindow::anchored_at(ancestor.hash, ancestor.sequence);
        self.set_state(SyncerState::Syncing {
            loader: *loader,
            window: window.clone(),
        });
        let result = self
            .fetcher
            .run(loader, &mut window, deadline, &self.stop_rx, &mut self.metrics)
            .await;
        if let SyncerState::Syncing {
            window: state_window,
            ..
        } = &mut self.state
        {
            *state_window = window;
        }
        self.publish_status();
        result
    }

    /// Second entry point: a block pushed at us by gossip rather than
    /// pulled by the fetcher.
    async fn on_gossip_block(&mut self, peer: PeerId, block: Block) -> Result<(), SyncError> {
        if self.stopping() {
            return Err(SyncError::AbortSync);
        }
        if !matches!(self.state, SyncerState::Idle) {
            debug!(%peer, "sync: dropping gossiped block, busy");
            return Ok(());
        }
        let header = block.header;
        match self.chain.add_block(block).await {
            AddBlockOutcome::Added => {
                debug!(
                    %peer,
                    block = %header.hash,
                    sequence = header.sequence,
                    "sync: gossiped block applied"
                );
                self.metrics.record_apply(Instant::now());
                self.raise_peer_tip(&peer, &header);
                self.publish_status();
                Ok(())
            }
            AddBlockOutcome::Duplicate => {
                debug!(%peer, block = %header.hash, "sync: duplicate gossiped block");
                Ok(())
            }
            AddBlockOutcome::Orphan => {
                let Some(handle) = self.peers.get_peer(&peer) else {
                    return Ok(());
                };
                if !handle.supports_syncing() {
                    debug!(%peer, "sync: orphan from a non-syncing peer, ignoring");
                    return Ok(());
                }
                // The gossiper knows a chain we do not. Its advertised tip
                // is the sync target; the orphan itself is the fallback.
                if handle.chain_tip.is_none_or(|tip| tip.work < header.work) {
                    self.peers.update_chain_tip(&peer, header.tip());
                }
                info!(%peer, block = %header.hash, "sync: gossiped orphan, syncing from sender");
                self.sync_cycle(Some(peer)).await
            }
            AddBlockOutcome::Invalid { score, reason } => {
                warn!(%peer, score, reason = %reason, "sync: invalid gossiped block");
                self.peers.punish(&peer, score, &reason);
                if score >= MAX_PUNISH_SCORE {
                    self.peers.close(&peer, Some(&reason));
                }
                Ok(())
            }
        }
    }

    fn on_peer_event(
        &mut self,
        event: Result<PeerEvent, broadcast::error::RecvError>,
        open: &mut bool,
    ) {
        match event {
            Ok(PeerEvent::StateChanged {
                peer,
                state: ConnectionState::Disconnected,
            }) => {
                if self.previous_loader == Some(peer) {
                    debug!(%peer, "sync: previous loader disconnected, forgetting it");
                    self.previous_loader = None;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "sync: missed peer events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Manager stopped publishing; ticks still observe peers
                // through get_peer.
                *open = false;
            }
        }
    }

    fn raise_peer_tip(&self, peer: &PeerId, header: &BlockHeader) {
        if let Some(handle) = self.peers.get_peer(peer) {
            let known = handle.chain_tip.map(|tip| tip.work).unwrap_or_default();
            if header.work > known {
                self.peers.update_chain_tip(peer, header.tip());
            }
        }
    }

    fn window_counts(&self) -> (u64, u64) {
        match &self.state {
            SyncerState::Syncing { window, .. } => (window.applied_count, window.skipped_count),
            _ => (0, 0),
        }
    }

    fn stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&mut self, state: SyncerState) {
        if self.state.phase() != state.phase() {
            debug!(from = ?self.state.phase(), to = ?state.phase(), "sync: state transition");
        }
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let loader = self
            .state
            .loader()
            .and_then(|id| self.peers.get_peer(&id))
            .map(|peer| peer.display_name);
        let mut status = self.status.write();
        status.phase = self.state.phase();
        status.loader = loader;
        status.download_rate = self.metrics.download_rate();
        status.apply_rate = self.metrics.apply_rate();
    }
}
