//! Candidate-track consolidation: trust ordering, subset removal, overlap
//! merging.
//!
//! The search emits candidates greedily, so the raw set is full of
//! duplicates, contained fragments, and partially overlapping views of the
//! same body. Consolidation whittles that down in four sequential passes;
//! each acceptance mutates the overlap index read by the next one, so the
//! passes stay strictly ordered.

use crate::detection::DetectionArray;
use crate::tracklet::Tracklet;

/// Inverse index from detection index to the accepted tracks containing
/// it. Entries are kept as sorted unique sequences.
#[derive(Debug, Clone, Default)]
pub struct OverlapIndex {
    entries: Vec<Vec<usize>>,
}

impl OverlapIndex {
    pub fn new(num_detections: usize) -> Self {
        Self {
            entries: vec![Vec::new(); num_detections],
        }
    }

    /// Tracks sharing at least one of the given detections (set union).
    pub fn overlapping(&self, members: &[usize]) -> Vec<usize> {
        let mut out: Vec<usize> = Vec::new();
        for &m in members {
            for &t in &self.entries[m] {
                if let Err(pos) = out.binary_search(&t) {
                    out.insert(pos, t);
                }
            }
        }
        out
    }

    /// Tracks containing every one of the given detections (set
    /// intersection).
    pub fn containing_all(&self, members: &[usize]) -> Vec<usize> {
        let Some((&first, rest)) = members.split_first() else {
            return Vec::new();
        };
        let mut out = self.entries[first].clone();
        for &m in rest {
            let entry = &self.entries[m];
            out.retain(|t| entry.binary_search(t).is_ok());
            if out.is_empty() {
                break;
            }
        }
        out
    }

    /// Records a track under each of its detections.
    pub fn insert(&mut self, members: &[usize], track: usize) {
        for &m in members {
            let entry = &mut self.entries[m];
            if let Err(pos) = entry.binary_search(&track) {
                entry.insert(pos, track);
            }
        }
    }
}

/// Stable sort by `(-num_obs, mean_sq_residual)`: the most-observed,
/// best-fitting tracks first, array position breaking exact ties.
pub fn order_by_trust(tracks: Vec<Tracklet>, obs: &DetectionArray) -> Vec<Tracklet> {
    if tracks.len() <= 1 {
        return tracks;
    }

    let residuals: Vec<f64> = tracks.iter().map(|t| t.mean_sq_residual(obs)).collect();
    let mut order: Vec<usize> = (0..tracks.len()).collect();
    order.sort_by(|&i, &j| {
        tracks[j]
            .num_obs()
            .cmp(&tracks[i].num_obs())
            .then(residuals[i].total_cmp(&residuals[j]))
            .then(i.cmp(&j))
    });

    let mut slots: Vec<Option<Tracklet>> = tracks.into_iter().map(Some).collect();
    order.into_iter().map(|i| slots[i].take().unwrap()).collect()
}

/// Drops every track whose detections are all contained in an
/// already-accepted track. Larger tracks are seated first so a fragment
/// can never shadow the track that subsumes it.
pub fn remove_subsets(tracks: Vec<Tracklet>, obs: &DetectionArray) -> Vec<Tracklet> {
    let mut order: Vec<usize> = (0..tracks.len()).collect();
    order.sort_by(|&i, &j| tracks[j].num_obs().cmp(&tracks[i].num_obs()).then(i.cmp(&j)));

    let mut index = OverlapIndex::new(obs.len());
    let mut accepted: Vec<Tracklet> = Vec::new();
    let mut slots: Vec<Option<Tracklet>> = tracks.into_iter().map(Some).collect();

    for i in order {
        let track = slots[i].take().unwrap();
        if index.containing_all(track.members()).is_empty() {
            index.insert(track.members(), accepted.len());
            accepted.push(track);
        }
    }

    accepted
}

/// Merges significantly overlapping tracks in trust order.
///
/// For a candidate A against an accepted B sharing `o` detections, the
/// overlap is significant iff `2 o / (|A| + |B|) >= min_overlap`. A
/// significant pair merges unless it asserts two different detections at
/// one epoch while conflicts are disallowed; the merged track only
/// replaces B when its combined fit stays below `fit_thresh`. A candidate
/// with no significant partner and no superset among the accepted tracks
/// is added as new.
pub fn remove_overlaps(
    tracks: Vec<Tracklet>,
    obs: &DetectionArray,
    allow_conflicts: bool,
    min_overlap: f64,
    fit_thresh: f64,
) -> Vec<Tracklet> {
    let tracks = order_by_trust(tracks, obs);

    let mut index = OverlapIndex::new(obs.len());
    let mut accepted: Vec<Tracklet> = Vec::new();

    for a in tracks {
        let hits = index.overlapping(a.members());
        let mut found = false;
        let mut subset_of_any = false;

        for &j in &hits {
            let b = &accepted[j];
            let o = a.overlap_size(b, obs);
            let is_subset = a.is_subset_of(b, obs);
            subset_of_any = subset_of_any || is_subset;

            let mut valid = 2.0 * o as f64 / (a.num_obs() + b.num_obs()) as f64 >= min_overlap;
            if !allow_conflicts && valid && !is_subset {
                valid = a.valid_overlap(b, obs);
            }
            found = found || valid;

            if valid && !is_subset {
                if let Ok(c) = a.combine(b, obs) {
                    if c.mean_sq_residual(obs) < fit_thresh {
                        index.insert(c.members(), j);
                        accepted[j] = c;
                    }
                }
            }
        }

        if !found && !subset_of_any {
            index.insert(a.members(), accepted.len());
            accepted.push(a);
        }
    }

    accepted
}

/// The full pipeline: trust order, subset removal, overlap merging, final
/// trust re-order.
pub fn consolidate(
    candidates: Vec<Tracklet>,
    obs: &DetectionArray,
    allow_conflicts: bool,
    min_overlap: f64,
    fit_thresh: f64,
) -> Vec<Tracklet> {
    let ordered = order_by_trust(candidates, obs);
    let unique = remove_subsets(ordered, obs);
    let merged = remove_overlaps(unique, obs, allow_conflicts, min_overlap, fit_thresh);
    order_by_trust(merged, obs)
}
