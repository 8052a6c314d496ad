//! # pyrite-sync — block synchronization core.
//!
//! Brings the local chain up to date with the best chain the peer-to-peer
//! network knows about. A single event-loop task owns the state machine: on
//! each tick it elects the fastest qualifying peer as *loader*
//! (measurement), finds the highest block shared with it (ancestor search),
//! and downloads forward from there in pipelined windows until the loader
//! runs dry, misbehaves, or a remeasurement is due.
//!
//! The main entry point is [`Syncer::start`]; collaborators are injected
//! through the `pyrite-core` adapter traits.

pub mod ancestor;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod measure;
pub mod misbehavior;
pub mod speed;
pub mod syncer;

pub use ancestor::{Ancestor, AncestorFinder};
pub use config::SyncConfig;
pub use error::SyncError;
pub use fetcher::{BlockFetcher, EpisodeEnd, FetchWindow};
pub use measure::{Measurement, PeerMeasurer};
pub use misbehavior::{BAN_SCORE_THRESHOLD, MAX_PUNISH_SCORE, Misbehavior};
pub use speed::{Ewma, RollingAverage, SyncMetrics};
pub use syncer::{SyncPhase, SyncStatus, Syncer, SyncerState};
