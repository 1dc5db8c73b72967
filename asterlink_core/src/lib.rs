//! AsterLink Core - Multi-Night Asteroid Track Linking
//!
//! Assembles short same-night observation pairs ("tracklets") into longer
//! multi-night candidate tracks consistent with bounded-acceleration sky
//! motion. Three subsystems carry the search:
//! 1. **Phase-space indexing**: weighted KD-trees over tracklet state
//!    (time, position, velocity, brightness) with conservative pruning and
//!    exact leaf acceptance.
//! 2. **Multi-hypothesis tracking**: a beam-limited, bidirectional search
//!    that extends every seed tracklet through the catalog's time steps.
//! 3. **Consolidation**: trust ordering, subset removal, and overlap
//!    merging over the raw candidate set.
//!
//! File parsing, same-night pairing, and evaluation live outside this
//! crate; the engine consumes a populated [`DetectionArray`] and
//! [`TrackletArray`] and returns consolidated tracks.

pub mod consolidate;
pub mod detection;
pub mod kinematics;
pub mod metrics;
pub mod mht;
pub mod phase_tree;
pub mod rdvv_tree;
pub mod tracklet;

// Re-export key types for convenience
pub use detection::{Detection, DetectionArray};
pub use kinematics::{AxisFit, FitError, MotionFit};
pub use metrics::SearchStats;
pub use mht::{link_tracklets, link_tracklets_with_stats, Direction, LinkError, MhtSearcher, SearchParams};
pub use phase_tree::{Axis, AxisMap, PhaseTree};
pub use rdvv_tree::{all_pairs_matches, AllPairsParams, RdvvTree};
pub use tracklet::{Tracklet, TrackletArray, TrackletError};
