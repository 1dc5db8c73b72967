//! The secondary (time, RA, Dec, vRA, vDec) tree and the dual-tree
//! all-pairs search.
//!
//! This index drops the brightness axis and is built unweighted, optionally
//! pinning time as the first split. On top of it sits a whole-catalog
//! pairing search: a frontier of subtrees is subdivided while per-axis
//! acceleration windows stay feasible, and every all-leaf frontier of
//! time-ordered singletons is fitted exactly. Same discipline as the phase
//! tree: conservative pruning, exact leaf acceptance.

use serde::{Deserialize, Serialize};

use crate::detection::DetectionArray;
use crate::metrics::SearchStats;
use crate::phase_tree::{accel_bounds, reachable_interval};
use crate::tracklet::{ra_wrap, Tracklet, TrackletArray};

pub const NUM_AXES: usize = 5;

const T: usize = 0;
const R: usize = 1;
const D: usize = 2;
const VR: usize = 3;
const VD: usize = 4;

/// Fixed acceleration cap for the secondary search, degrees per day
/// squared.
pub const MAX_ACCEL: f64 = 0.15;

/// Default leaf size when the tree backs plain midpoint queries.
pub const MAX_LEAF: usize = 25;

fn dim_value(x: &Tracklet, dim: usize) -> f64 {
    match dim {
        T => x.epoch(),
        R => x.ra(),
        D => x.dec(),
        VR => x.v_ra(),
        _ => x.v_dec(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    num_points: usize,
    split_dim: Option<usize>,
    split_val: f64,
    lo: [f64; NUM_AXES],
    hi: [f64; NUM_AXES],
    mid: [f64; NUM_AXES],
    rad: [f64; NUM_AXES],
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    members: Vec<usize>,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.split_dim.is_none()
    }
}

fn bounds_over(arr: &TrackletArray, inds: &[usize]) -> ([f64; NUM_AXES], [f64; NUM_AXES]) {
    let mut lo = [0.0; NUM_AXES];
    let mut hi = [0.0; NUM_AXES];
    for (n, &i) in inds.iter().enumerate() {
        for d in 0..NUM_AXES {
            let v = dim_value(&arr[i], d);
            if n == 0 || v < lo[d] {
                lo[d] = v;
            }
            if n == 0 || v > hi[d] {
                hi[d] = v;
            }
        }
    }
    (lo, hi)
}

fn build_node(arr: &TrackletArray, inds: Vec<usize>, widths: &[f64; NUM_AXES], max_leaf: usize) -> Node {
    let (lo, hi) = bounds_over(arr, &inds);
    let mut mid = [0.0; NUM_AXES];
    let mut rad = [0.0; NUM_AXES];
    for d in 0..NUM_AXES {
        mid[d] = 0.5 * (lo[d] + hi[d]);
        rad[d] = 0.5 * (hi[d] - lo[d]);
    }
    let num_points = inds.len();

    let leaf = |members: Vec<usize>| Node {
        num_points,
        split_dim: None,
        split_val: 0.0,
        lo,
        hi,
        mid,
        rad,
        left: None,
        right: None,
        members,
    };

    if num_points <= max_leaf {
        return leaf(inds);
    }

    let mut sd = 0;
    let mut best = f64::NEG_INFINITY;
    for d in 0..NUM_AXES {
        let score = rad[d] / widths[d];
        if score > best {
            best = score;
            sd = d;
        }
    }
    let split_val = mid[sd];

    let mut left_inds = Vec::new();
    let mut right_inds = Vec::new();
    for &i in &inds {
        if dim_value(&arr[i], sd) < split_val {
            left_inds.push(i);
        } else {
            right_inds.push(i);
        }
    }
    if left_inds.is_empty() || right_inds.is_empty() {
        return leaf(inds);
    }

    Node {
        num_points,
        split_dim: Some(sd),
        split_val,
        lo,
        hi,
        mid,
        rad,
        left: Some(Box::new(build_node(arr, left_inds, widths, max_leaf))),
        right: Some(Box::new(build_node(arr, right_inds, widths, max_leaf))),
        members: Vec::new(),
    }
}

/// The 5-D secondary tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdvvTree {
    root: Node,
}

impl RdvvTree {
    /// Builds the index; tracklets are forced to their earliest member
    /// epoch first. With `favor_time` the time width is pinned tiny so the
    /// normalized time spread dominates every split while any remains.
    pub fn build(arr: &mut TrackletArray, max_leaf: usize, favor_time: bool) -> Self {
        arr.force_all_to_first();

        let inds: Vec<usize> = (0..arr.len()).collect();
        let (lo, hi) = bounds_over(arr, &inds);
        let mut widths = [0.0; NUM_AXES];
        for d in 0..NUM_AXES {
            widths[d] = (0.5 * (hi[d] - lo[d])).max(1e-20);
        }
        if favor_time {
            widths[T] = 1e-20;
        }

        Self {
            root: build_node(arr, inds, &widths, max_leaf.max(1)),
        }
    }

    pub fn num_points(&self) -> usize {
        self.root.num_points
    }

    /// Split dimension of the root, if internal; 0 is the time dimension.
    pub fn root_split_dim(&self) -> Option<usize> {
        self.root.split_dim
    }

    /// All tracklets with `t_start < t < t_end` whose midpoint projection
    /// against the query closes within `thresh` degrees.
    pub fn find_midpoint(
        &self,
        arr: &TrackletArray,
        query: &Tracklet,
        t_start: f64,
        t_end: f64,
        thresh: f64,
        stats: &mut SearchStats,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        midpoint_recurse(&self.root, arr, query, t_start, t_end, thresh, stats, &mut out);
        out
    }
}

/// Linear-scan form of [`RdvvTree::find_midpoint`]: candidates inside the
/// window whose midpoint projection closes within `thresh` and whose
/// velocity difference stays under the acceleration cap.
pub fn find_midpoint_scan(
    arr: &TrackletArray,
    inds: Option<&[usize]>,
    query: &Tracklet,
    t_start: f64,
    t_end: f64,
    thresh: f64,
    stats: &mut SearchStats,
) -> Vec<usize> {
    let tq = query.epoch();
    let n = inds.map_or(arr.len(), <[usize]>::len);
    let mut out = Vec::new();

    for k in 0..n {
        let ind = inds.map_or(k, |s| s[k]);
        let y = &arr[ind];
        stats.tracklets_tested += 1;

        let tb = y.epoch();
        let td = (tq - tb).abs();
        if tb >= t_end || tb <= t_start || td <= 1e-10 {
            continue;
        }
        let accel_ok = ((y.v_ra() - query.v_ra()) / td).abs() <= MAX_ACCEL
            && ((y.v_dec() - query.v_dec()) / td).abs() <= MAX_ACCEL;
        if accel_ok && query.midpoint_distance(y) < thresh {
            out.push(ind);
        }
    }

    out
}

fn midpoint_recurse(
    node: &Node,
    arr: &TrackletArray,
    query: &Tracklet,
    t_start: f64,
    t_end: f64,
    thresh: f64,
    stats: &mut SearchStats,
    out: &mut Vec<usize>,
) {
    stats.nodes_visited += 1;

    let mut prune = node.lo[T] > t_end || node.hi[T] < t_start;
    let ts = t_start.max(node.lo[T]);
    let te = t_end.min(node.hi[T]);
    let tq = query.epoch();

    // A window collapsed onto the query's own epoch holds nothing usable.
    if !prune && te - ts <= 1e-10 {
        prune = (ts - tq).abs() < 1e-10;
    }

    // Velocity-based bounds only apply from outside the node's window.
    if !prune && (tq < ts || tq > te) {
        let (amin, amax) = accel_bounds(query.v_ra(), node.lo[VR], node.hi[VR], ts - tq, te - tq, MAX_ACCEL);
        let (r_min, r_max) = reachable_interval(query.ra(), query.v_ra(), ts - tq, te - tq, amin, amax);
        let dist = ra_wrap(0.5 * (r_min + r_max) - node.mid[R]);
        prune = dist - 0.5 * (r_max - r_min) - node.rad[R] > thresh;
    }

    if !prune && (tq < ts || tq > te) {
        let (amin, amax) = accel_bounds(query.v_dec(), node.lo[VD], node.hi[VD], ts - tq, te - tq, MAX_ACCEL);
        let (d_min, d_max) = reachable_interval(query.dec(), query.v_dec(), ts - tq, te - tq, amin, amax);
        let dist = (0.5 * (d_min + d_max) - node.mid[D]).abs();
        prune = dist - 0.5 * (d_max - d_min) - node.rad[D] > thresh;
    }

    if prune {
        return;
    }

    if node.is_leaf() {
        out.extend(find_midpoint_scan(arr, Some(&node.members), query, t_start, t_end, thresh, stats));
    } else {
        midpoint_recurse(node.left.as_ref().unwrap(), arr, query, t_start, t_end, thresh, stats, out);
        midpoint_recurse(node.right.as_ref().unwrap(), arr, query, t_start, t_end, thresh, stats, out);
    }
}

// ============================================================================
// DUAL-TREE ALL-PAIRS SEARCH
// ============================================================================

/// Tuning for the whole-catalog pairing search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllPairsParams {
    /// Position tolerance for the acceleration windows, degrees.
    pub pos_thresh: f64,
    /// Mean-square residual bound on an accepted combined track.
    pub fit_thresh: f64,
    /// Midpoint-projection tolerance, degrees.
    pub mid_thresh: f64,
    /// Smallest number of tracklets that may extend a query.
    pub k_min: usize,
    /// Branch-factor cap on the subtree frontier.
    pub k_max: usize,
    /// Acceleration cap, degrees per day squared.
    pub max_accel: f64,
}

/// Per-axis interval of accelerations that could carry a query into a
/// subtree's box. Empty means the subtree is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelWindow {
    pub ra_lo: f64,
    pub ra_hi: f64,
    pub dec_lo: f64,
    pub dec_hi: f64,
}

impl AccelWindow {
    pub fn empty() -> Self {
        Self {
            ra_lo: 1.0,
            ra_hi: 0.0,
            dec_lo: 1.0,
            dec_hi: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ra_lo > self.ra_hi || self.dec_lo > self.dec_hi
    }

    pub fn intersect(&self, other: &AccelWindow) -> AccelWindow {
        AccelWindow {
            ra_lo: self.ra_lo.max(other.ra_lo),
            ra_hi: self.ra_hi.min(other.ra_hi),
            dec_lo: self.dec_lo.max(other.dec_lo),
            dec_hi: self.dec_hi.min(other.dec_hi),
        }
    }
}

/// True when the node could still meet the query under the midpoint rule:
/// the reachable position interval of the query over the node's (future)
/// time window touches the node's box within `thresh` on both axes.
fn midpoint_feasible(node: &Node, query: &Tracklet, thresh: f64, max_accel: f64) -> bool {
    let tq = query.epoch();
    let ts = (tq + 1e-5).max(node.lo[T]);
    let te = node.hi[T];
    if ts > te {
        return false;
    }

    let (amin, amax) = accel_bounds(query.v_ra(), node.lo[VR], node.hi[VR], ts - tq, te - tq, max_accel);
    let (r_min, r_max) = reachable_interval(query.ra(), query.v_ra(), ts - tq, te - tq, amin, amax);
    let dist = ra_wrap(0.5 * (r_min + r_max) - node.mid[R]);
    if dist - 0.5 * (r_max - r_min) - node.rad[R] > thresh {
        return false;
    }

    let (amin, amax) = accel_bounds(query.v_dec(), node.lo[VD], node.hi[VD], ts - tq, te - tq, max_accel);
    let (d_min, d_max) = reachable_interval(query.dec(), query.v_dec(), ts - tq, te - tq, amin, amax);
    let dist = (0.5 * (d_min + d_max) - node.mid[D]).abs();
    dist - 0.5 * (d_max - d_min) - node.rad[D] <= thresh
}

/// Accelerations needed on one axis to carry the query's position and
/// velocity into a box, each padded by the position tolerance.
#[allow(clippy::too_many_arguments)]
fn axis_accel_window(
    x: f64,
    v: f64,
    lo_x: f64,
    hi_x: f64,
    lo_v: f64,
    hi_v: f64,
    tb_lo: f64,
    tb_hi: f64,
    t_dt: f64,
    thresh: f64,
    cap: f64,
) -> (f64, f64) {
    let v_pad = 2.0 * thresh / t_dt;
    let mut min_v = f64::INFINITY;
    let mut max_v = f64::NEG_INFINITY;
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;

    for &tb in &[tb_lo, tb_hi] {
        for &vq in &[v - v_pad, v + v_pad] {
            for &vb in &[lo_v - v_pad, hi_v + v_pad] {
                let a = (vb - vq) / tb;
                min_v = min_v.min(a);
                max_v = max_v.max(a);
            }
            for &xb in &[lo_x - thresh, hi_x + thresh] {
                for &xq in &[x - thresh, x + thresh] {
                    let a = 2.0 * (xb - xq - vq * tb) / (tb * tb);
                    min_x = min_x.min(a);
                    max_x = max_x.max(a);
                }
            }
        }
    }

    (min_v.max(min_x).max(-cap), max_v.min(max_x).min(cap))
}

fn feasible_accel(query: &Tracklet, node: &Node, params: &AllPairsParams) -> AccelWindow {
    let ts_q = query.first_time();
    let te_q = query.last_time();
    let t_dt = (te_q - ts_q).max(1e-5);

    // The box must start at least a beat after the query ends.
    let mut ts_b = node.lo[T];
    let te_b = node.hi[T];
    if ts_b < te_q + 1e-5 {
        ts_b = te_q + 1e-5;
    }
    if !midpoint_feasible(node, query, params.mid_thresh, params.max_accel) || ts_b > te_b {
        return AccelWindow::empty();
    }

    let (dec_lo, dec_hi) = axis_accel_window(
        query.dec(),
        query.v_dec(),
        node.lo[D],
        node.hi[D],
        node.lo[VD],
        node.hi[VD],
        ts_b - ts_q,
        te_b - ts_q,
        t_dt,
        params.pos_thresh,
        params.max_accel,
    );
    if dec_lo > dec_hi {
        return AccelWindow::empty();
    }

    let (ra_lo, ra_hi) = axis_accel_window(
        query.ra(),
        query.v_ra(),
        node.lo[R],
        node.hi[R],
        node.lo[VR],
        node.hi[VR],
        ts_b - ts_q,
        te_b - ts_q,
        t_dt,
        params.pos_thresh,
        params.max_accel,
    );

    AccelWindow {
        ra_lo,
        ra_hi,
        dec_lo,
        dec_hi,
    }
}

fn check_leaves(
    arr: &TrackletArray,
    obs: &DetectionArray,
    query: &Tracklet,
    frontier: &[&Node],
    params: &AllPairsParams,
    out: &mut Vec<Tracklet>,
    stats: &mut SearchStats,
) {
    if frontier.len() < params.k_min || frontier.len() > params.k_max {
        return;
    }

    let t0 = query.epoch();
    let mut members = query.members().to_vec();
    for node in frontier {
        let trk = node.members[0];
        if arr[trk].epoch() <= t0 {
            return;
        }
        members.extend_from_slice(arr[trk].members());
    }

    stats.tracklets_tested += 1;
    if let Ok(combined) = Tracklet::from_members(obs, members) {
        if combined.mean_sq_residual(obs) < params.fit_thresh {
            out.push(combined);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn frontier_recurse<'t>(
    arr: &TrackletArray,
    obs: &DetectionArray,
    query: &Tracklet,
    frontier: &mut Vec<&'t Node>,
    params: &AllPairsParams,
    window: AccelWindow,
    out: &mut Vec<Tracklet>,
    stats: &mut SearchStats,
) {
    stats.nodes_visited += 1;

    let mut all_leaves = true;
    let mut no_time = true;
    let mut total = 0;
    let mut widest = 0;
    let mut widest_ind = None;
    for (i, node) in frontier.iter().enumerate() {
        let leaf = node.is_leaf();
        no_time = no_time && node.split_dim != Some(T);
        total += node.num_points;
        all_leaves = all_leaves && leaf;
        if !leaf && node.num_points > widest {
            widest = node.num_points;
            widest_ind = Some(i);
        }
    }

    if all_leaves && total >= params.k_min {
        check_leaves(arr, obs, query, frontier, params, out, stats);
        return;
    }

    let Some(mi) = widest_ind else { return };
    if total < params.k_min || (no_time && frontier.len() < params.k_min) {
        return;
    }

    let curr = frontier[mi];
    let right = curr.right.as_deref().unwrap();
    let left = curr.left.as_deref().unwrap();
    let w_right = feasible_accel(query, right, params);
    let w_left = feasible_accel(query, left, params);

    // A time split separates future tracklets: both halves can extend the
    // track, so the frontier may keep both while the branch cap allows.
    let both = window.intersect(&w_right).intersect(&w_left);
    if frontier.len() < params.k_max && curr.split_dim == Some(T) && !both.is_empty() {
        let mut next: Vec<&Node> = frontier.clone();
        next[mi] = right;
        next.push(left);
        frontier_recurse(arr, obs, query, &mut next, params, both, out, stats);
    }

    let w = window.intersect(&w_right);
    if !w.is_empty() {
        frontier[mi] = right;
        frontier_recurse(arr, obs, query, frontier, params, w, out, stats);
    }

    let w = window.intersect(&w_left);
    if !w.is_empty() {
        frontier[mi] = left;
        frontier_recurse(arr, obs, query, frontier, params, w, out, stats);
    }

    frontier[mi] = curr;
}

/// Whole-catalog pairing: for every tracklet, reports each feasible set of
/// `k_min..=k_max` strictly later tracklets whose combined fit beats the
/// threshold.
pub fn all_pairs_matches(
    arr: &mut TrackletArray,
    obs: &DetectionArray,
    params: &AllPairsParams,
    stats: &mut SearchStats,
) -> Vec<Tracklet> {
    let tree = RdvvTree::build(arr, 1, true);
    let arr = &*arr;
    let mut out = Vec::new();

    for i in 0..arr.len() {
        let query = &arr[i];
        let window = feasible_accel(query, &tree.root, params);
        let mut frontier = vec![&tree.root];
        frontier_recurse(arr, obs, query, &mut frontier, params, window, &mut out, stats);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_population(seed: u64, n: usize) -> (DetectionArray, TrackletArray) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut obs = DetectionArray::new();
        let mut groups = Vec::new();

        for k in 0..n {
            let t = rng.gen_range(0.0..6.0);
            let ra = rng.gen_range(0.0..360.0);
            let dec = rng.gen_range(-40.0..40.0);
            let v_ra = rng.gen_range(-0.5..0.5);
            let v_dec = rng.gen_range(-0.5..0.5);

            let a = obs.push(Detection::new(format!("r{k}a"), t, ra, dec, 21.0));
            let b = obs.push(Detection::new(
                format!("r{k}b"),
                t + 0.02,
                ra + 0.02 * v_ra,
                dec + 0.02 * v_dec,
                21.0,
            ));
            groups.push(vec![a, b]);
        }

        let arr = TrackletArray::from_groups(&obs, &groups).unwrap();
        (obs, arr)
    }

    /// One body on exact linear motion, one tracklet per night.
    fn linear_chain(nights: usize) -> (DetectionArray, TrackletArray) {
        let mut obs = DetectionArray::new();
        let mut groups = Vec::new();
        for k in 0..nights {
            let t = k as f64;
            let a = obs.push(Detection::new(
                format!("c{k}a"),
                t,
                40.0 + 0.05 * t,
                -5.0 + 0.08 * t,
                20.0,
            ));
            let b = obs.push(Detection::new(
                format!("c{k}b"),
                t + 0.02,
                40.0 + 0.05 * (t + 0.02),
                -5.0 + 0.08 * (t + 0.02),
                20.0,
            ));
            groups.push(vec![a, b]);
        }
        let arr = TrackletArray::from_groups(&obs, &groups).unwrap();
        (obs, arr)
    }

    #[test]
    fn test_favor_time_splits_time_first() {
        let (_, mut arr) = random_population(21, 60);
        let tree = RdvvTree::build(&mut arr, 1, true);

        assert_eq!(tree.num_points(), 60);
        assert_eq!(tree.root_split_dim(), Some(T));
    }

    #[test]
    fn test_find_midpoint_matches_scan() {
        let (_, mut arr) = random_population(22, 130);
        let tree = RdvvTree::build(&mut arr, MAX_LEAF, false);

        for q in 0..arr.len() {
            let query = arr[q].clone();
            let t0 = query.epoch();
            let mut tree_stats = SearchStats::new();
            let mut scan_stats = SearchStats::new();

            let mut fast =
                tree.find_midpoint(&arr, &query, t0 - 5.0, t0 + 5.0, 1.5, &mut tree_stats);
            let mut slow =
                find_midpoint_scan(&arr, None, &query, t0 - 5.0, t0 + 5.0, 1.5, &mut scan_stats);
            fast.sort_unstable();
            slow.sort_unstable();

            assert_eq!(fast, slow, "midpoint mismatch for query {q}");
        }
    }

    #[test]
    fn test_all_pairs_finds_linear_chain() {
        let (obs, mut arr) = linear_chain(3);
        let params = AllPairsParams {
            pos_thresh: 0.5,
            fit_thresh: 1e-6,
            mid_thresh: 0.5,
            k_min: 2,
            k_max: 8,
            max_accel: 0.15,
        };
        let mut stats = SearchStats::new();
        let found = all_pairs_matches(&mut arr, &obs, &params, &mut stats);

        assert!(
            found.iter().any(|t| t.num_obs() == 6),
            "expected the full six-detection chain, found sizes {:?}",
            found.iter().map(Tracklet::num_obs).collect::<Vec<_>>()
        );
        // Every reported track extends its query strictly forward in time
        // and fits below the threshold.
        for t in &found {
            assert!(t.mean_sq_residual(&obs) < params.fit_thresh);
        }
    }

    #[test]
    fn test_all_pairs_rejects_inconsistent_third() {
        let (mut obs, _) = linear_chain(2);
        // A third-night tracklet far off the chain's motion.
        let a = obs.push(Detection::new("x0", 2.0, 90.0, 30.0, 20.0));
        let b = obs.push(Detection::new("x1", 2.02, 90.0, 30.0, 20.0));
        let groups = vec![vec![0, 1], vec![2, 3], vec![a, b]];
        let mut arr = TrackletArray::from_groups(&obs, &groups).unwrap();

        let params = AllPairsParams {
            pos_thresh: 0.5,
            fit_thresh: 1e-6,
            mid_thresh: 0.5,
            k_min: 2,
            k_max: 8,
            max_accel: 0.15,
        };
        let mut stats = SearchStats::new();
        let found = all_pairs_matches(&mut arr, &obs, &params, &mut stats);

        assert!(
            found.iter().all(|t| t
                .members()
                .iter()
                .all(|&m| obs[m].id() != "x0" && obs[m].id() != "x1")),
            "the off-chain tracklet must not join any track"
        );
    }
}
