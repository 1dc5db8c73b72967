//! The beam-limited multi-hypothesis linking search.
//!
//! Every tracklet seeds its own search. The seed's hypothesis set walks the
//! catalog's start-time axis one step at a time; at each step every
//! hypothesis queries the phase tree for extension candidates, the
//! survivors are combined and fit-tested, and the beam is trimmed back to
//! its width. Hypotheses big enough at the end of a pass become candidates
//! for consolidation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consolidate;
use crate::detection::DetectionArray;
use crate::metrics::SearchStats;
use crate::phase_tree::{AxisMap, PhaseTree};
use crate::tracklet::{Tracklet, TrackletArray};

/// Leaf size of the phase tree backing the search.
pub const TREE_LEAF_SIZE: usize = 25;

/// Half-width of the time window used to pin a midpoint query to one step
/// of the start-time axis.
const STEP_WINDOW: f64 = 1e-6;

/// Arcs shorter than this (days) are still too bendy to trust a forced
/// projection, so they extend through midpoint queries instead.
const SHORT_ARC: f64 = 0.5;

/// Two start times within this distance are the same step.
const TIME_TOL: f64 = 1e-8;

/// Errors surfaced at the linking entry point.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("invalid parameter {name}: {value} ({expected})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
}

/// Tuning for one linking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Max mean-square residual of an accepted combined track, degrees
    /// squared.
    pub fit_rd: f64,
    /// Position tolerance of the midpoint query, degrees.
    pub mid_rd: f64,
    /// Position tolerance of the near-point query, degrees.
    pub quad_rd: f64,
    /// Per-seed beam width.
    pub max_hyp: usize,
    /// Candidate cap per hypothesis per step.
    pub indiv_max_hyp: usize,
    /// Minimum detections for an emitted track.
    pub min_obs: usize,
    /// Also run every seed backward in time.
    pub bidirectional: bool,
    /// Permit merging tracks that disagree at a shared epoch.
    pub allow_conflicts: bool,
    /// Overlap-merge significance threshold in [0, 1].
    pub min_overlap: f64,
    /// Kinematic acceleration cap used in pruning, degrees per day
    /// squared.
    pub max_accel: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            fit_rd: 1e-4,
            mid_rd: 0.15,
            quad_rd: 0.10,
            max_hyp: 500,
            indiv_max_hyp: 500,
            min_obs: 7,
            bidirectional: true,
            allow_conflicts: false,
            min_overlap: 0.5,
            max_accel: 0.3,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), LinkError> {
        let bad = |name: &'static str, value: f64, expected: &'static str| {
            Err(LinkError::InvalidParameter {
                name,
                value,
                expected,
            })
        };

        if !(self.fit_rd >= 0.0) {
            return bad("fit_rd", self.fit_rd, "finite and >= 0");
        }
        if !(self.mid_rd >= 0.0) {
            return bad("mid_rd", self.mid_rd, "finite and >= 0");
        }
        if !(self.quad_rd >= 0.0) {
            return bad("quad_rd", self.quad_rd, "finite and >= 0");
        }
        if self.max_hyp < 1 {
            return bad("max_hyp", self.max_hyp as f64, ">= 1");
        }
        if self.indiv_max_hyp < 1 {
            return bad("indiv_max_hyp", self.indiv_max_hyp as f64, ">= 1");
        }
        if self.min_obs < 2 {
            return bad("min_obs", self.min_obs as f64, ">= 2");
        }
        if !(self.min_overlap >= 0.0 && self.min_overlap <= 1.0) {
            return bad("min_overlap", self.min_overlap, "within [0, 1]");
        }
        if !(self.max_accel >= 0.0) {
            return bad("max_accel", self.max_accel, "finite and >= 0");
        }
        Ok(())
    }
}

/// Which way a seed pass walks the start-time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn step(self) -> isize {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// One linking run: the tracklet array, its phase tree, the start-time
/// axis, and the derived query tolerances. Read-only after construction
/// apart from the statistics counters.
pub struct MhtSearcher<'a> {
    arr: TrackletArray,
    obs: &'a DetectionArray,
    tree: PhaseTree,
    times: Vec<f64>,
    params: SearchParams,
    mid_thresh: AxisMap,
    near_thresh: AxisMap,
    accel: AxisMap,
    stats: SearchStats,
}

impl<'a> MhtSearcher<'a> {
    pub fn new(
        mut arr: TrackletArray,
        obs: &'a DetectionArray,
        params: &SearchParams,
    ) -> Result<Self, LinkError> {
        params.validate()?;

        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), TREE_LEAF_SIZE);
        let times = start_times(&arr);

        Ok(Self {
            arr,
            obs,
            tree,
            times,
            params: params.clone(),
            mid_thresh: AxisMap::position_threshold(params.mid_rd),
            near_thresh: AxisMap::position_threshold(params.quad_rd),
            accel: AxisMap::accel_caps(params.max_accel),
            stats: SearchStats::new(),
        })
    }

    pub fn tracklets(&self) -> &TrackletArray {
        &self.arr
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    pub fn into_stats(self) -> SearchStats {
        self.stats
    }

    /// Runs one beam pass from the given seed. The returned set always
    /// carries the seed first and keeps shorter hypotheses alongside their
    /// extensions; the caller filters by size.
    pub fn search_seed(&mut self, seed: usize, direction: Direction) -> Vec<Tracklet> {
        let seed_trk = self.arr[seed].clone();
        let start = self
            .times
            .iter()
            .position(|&t| (t - seed_trk.epoch()).abs() < TIME_TOL)
            .expect("seed start time missing from the time axis");

        let mut hyps = vec![seed_trk];
        let step = direction.step();
        let mut i = start as isize + step;

        while i >= 0 && (i as usize) < self.times.len() {
            let time = self.times[i as usize];
            let mut next = hyps.clone();

            for (h, hyp) in hyps.iter_mut().enumerate() {
                let candidates = self.extension_candidates(hyp, time);
                let candidates = self.rank_and_cap(hyp, h, candidates);

                for b in candidates {
                    let other = &self.arr[b];
                    if hyp.overlaps_in_time(other) {
                        continue;
                    }
                    // A degenerate combination is skipped, not fatal.
                    if let Ok(combined) = hyp.combine(other, self.obs) {
                        if combined.mean_sq_residual(self.obs) < self.params.fit_rd {
                            self.stats.hypotheses_formed += 1;
                            next.push(combined);
                        }
                    }
                }
            }

            if next.len() > self.params.max_hyp {
                next = self.trim_beam(next);
            }
            hyps = next;
            i += step;
        }

        hyps
    }

    /// Tree query for one hypothesis at one time step. Short arcs use the
    /// midpoint query; longer arcs are forced to the step epoch for a
    /// near-point query and restored afterwards.
    fn extension_candidates(&mut self, hyp: &mut Tracklet, time: f64) -> Vec<usize> {
        if hyp.time_length() < SHORT_ARC {
            self.stats.midpoint_queries += 1;
            self.tree.midpoint(
                &self.arr,
                hyp,
                time - STEP_WINDOW,
                time + STEP_WINDOW,
                &self.mid_thresh,
                &self.accel,
                &mut self.stats,
            )
        } else {
            self.stats.near_point_queries += 1;
            hyp.force_epoch(time);
            let found = self
                .tree
                .near_point(&self.arr, hyp, &self.near_thresh, &mut self.stats);
            hyp.force_epoch_first();
            found
        }
    }

    /// Caps an oversized candidate set, best first: by model agreement for
    /// grown hypotheses, by midpoint distance for the bare seed. Stable,
    /// with the tracklet index as the final tie-break.
    fn rank_and_cap(&self, hyp: &Tracklet, hyp_index: usize, candidates: Vec<usize>) -> Vec<usize> {
        let cap = self.params.indiv_max_hyp;
        if candidates.len() <= cap {
            return candidates;
        }

        let scores: Vec<f64> = candidates
            .iter()
            .map(|&b| {
                let other = &self.arr[b];
                if hyp_index > 0 {
                    hyp.mean_sq_second_residual(other, self.obs)
                } else {
                    hyp.midpoint_distance(other)
                }
            })
            .collect();

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&x, &y| scores[x].total_cmp(&scores[y]).then(candidates[x].cmp(&candidates[y])));
        order.truncate(cap);
        order.into_iter().map(|x| candidates[x]).collect()
    }

    /// Shrinks an overflowing beam to the seed plus the trust-best
    /// `max_hyp - 1` other hypotheses.
    fn trim_beam(&self, beam: Vec<Tracklet>) -> Vec<Tracklet> {
        let mut iter = beam.into_iter();
        let seed = iter.next().expect("beam always carries its seed");
        let rest = consolidate::order_by_trust(iter.collect(), self.obs);

        let mut out = Vec::with_capacity(self.params.max_hyp);
        out.push(seed);
        out.extend(rest.into_iter().take(self.params.max_hyp - 1));
        out
    }
}

/// Ascending, de-duplicated tracklet start times.
fn start_times(arr: &TrackletArray) -> Vec<f64> {
    let mut times: Vec<f64> = arr.iter().map(Tracklet::first_time).collect();
    times.sort_by(f64::total_cmp);
    times.dedup_by(|a, b| (*a - *b).abs() <= TIME_TOL);
    times
}

/// Links tracklets into consolidated candidate tracks.
///
/// Runs the beam search from every seed (both directions when
/// `bidirectional`), keeps hypotheses of at least `min_obs` detections,
/// and consolidates. The output is in final trust order and identical
/// between runs on equal input.
pub fn link_tracklets(
    tracklets: TrackletArray,
    detections: &DetectionArray,
    params: &SearchParams,
) -> Result<TrackletArray, LinkError> {
    link_tracklets_with_stats(tracklets, detections, params).map(|(tracks, _)| tracks)
}

/// [`link_tracklets`], also reporting the work counters.
pub fn link_tracklets_with_stats(
    tracklets: TrackletArray,
    detections: &DetectionArray,
    params: &SearchParams,
) -> Result<(TrackletArray, SearchStats), LinkError> {
    let mut searcher = MhtSearcher::new(tracklets, detections, params)?;
    let mut candidates: Vec<Tracklet> = Vec::new();

    for seed in 0..searcher.tracklets().len() {
        let mut passes = vec![searcher.search_seed(seed, Direction::Forward)];
        if params.bidirectional {
            passes.push(searcher.search_seed(seed, Direction::Backward));
        }
        for pass in passes {
            for hyp in pass {
                if hyp.num_obs() >= params.min_obs {
                    searcher.stats.candidates_emitted += 1;
                    candidates.push(hyp);
                }
            }
        }
    }

    let tracks = consolidate::consolidate(
        candidates,
        detections,
        params.allow_conflicts,
        params.min_overlap,
        params.fit_rd,
    );

    Ok((TrackletArray::from_vec(tracks), searcher.into_stats()))
}
