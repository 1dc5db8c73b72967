//! The weighted 6-D phase-space index over tracklets.
//!
//! Splits {time, RA, Dec, vRA, vDec, brightness} with per-axis build
//! weights, and answers the two query shapes the linking search needs:
//!
//! - **near-point**: coordinate-wise range search around a query tracklet;
//! - **midpoint**: find tracklets in a time window whose model meets the
//!   query's model at their common temporal midpoint, under a per-axis
//!   acceleration cap.
//!
//! Both queries prune subtrees with conservative interval bounds and
//! re-check every surviving leaf tracklet exactly, so the result set always
//! equals the one a linear scan produces. The linear scans are public for
//! exactly that comparison.

use serde::{Deserialize, Serialize};

use crate::metrics::SearchStats;
use crate::tracklet::{ra_wrap, Tracklet, TrackletArray};

pub const NUM_AXES: usize = 6;

/// Axes of the indexed phase space, in split order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    Time,
    Ra,
    Dec,
    VRa,
    VDec,
    Bright,
}

impl Axis {
    pub const ALL: [Axis; NUM_AXES] = [
        Axis::Time,
        Axis::Ra,
        Axis::Dec,
        Axis::VRa,
        Axis::VDec,
        Axis::Bright,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One scalar per axis; serves as build weights, query thresholds, and
/// acceleration caps depending on the constructor.
///
/// As a threshold map, a negative entry disables that axis. As a weight
/// map, zero suppresses an axis and infinity forces it to split first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisMap {
    pub time: f64,
    pub ra: f64,
    pub dec: f64,
    pub v_ra: f64,
    pub v_dec: f64,
    pub brightness: f64,
}

impl AxisMap {
    pub const fn new(time: f64, ra: f64, dec: f64, v_ra: f64, v_dec: f64, brightness: f64) -> Self {
        Self {
            time,
            ra,
            dec,
            v_ra,
            v_dec,
            brightness,
        }
    }

    pub const fn splat(value: f64) -> Self {
        Self::new(value, value, value, value, value, value)
    }

    /// Build weights for the linking search: kinematic axes equal,
    /// brightness ignored.
    pub const fn sky_weights() -> Self {
        Self::new(1.0, 1.0, 1.0, 1.0, 1.0, 0.0)
    }

    /// Sky weights with an infinite time weight, so the tree keeps
    /// splitting on time while any time spread remains.
    pub const fn time_first() -> Self {
        Self::new(f64::INFINITY, 1.0, 1.0, 1.0, 1.0, 0.0)
    }

    /// Thresholds enabling only the two position axes, at an equal
    /// tolerance in degrees.
    pub const fn position_threshold(tolerance: f64) -> Self {
        Self::new(-1.0, tolerance, tolerance, -1.0, -1.0, -1.0)
    }

    /// Thresholds with every axis disabled.
    pub const fn ignore_all() -> Self {
        Self::splat(-1.0)
    }

    /// Acceleration caps on the position axes, degrees per day squared.
    pub const fn accel_caps(max_accel: f64) -> Self {
        Self::new(0.0, max_accel, max_accel, 0.0, 0.0, 0.0)
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Time => self.time,
            Axis::Ra => self.ra,
            Axis::Dec => self.dec,
            Axis::VRa => self.v_ra,
            Axis::VDec => self.v_dec,
            Axis::Bright => self.brightness,
        }
    }
}

// ============================================================================
// AXIS ACCESS
// ============================================================================

/// A tracklet's coordinate on the given axis (the model at its reference
/// epoch).
pub fn axis_value(x: &Tracklet, axis: Axis) -> f64 {
    match axis {
        Axis::Time => x.epoch(),
        Axis::Ra => x.ra(),
        Axis::Dec => x.dec(),
        Axis::VRa => x.v_ra(),
        Axis::VDec => x.v_dec(),
        Axis::Bright => x.brightness(),
    }
}

/// Rate of change of the axis coordinate: time advances at unit rate, the
/// position axes move at the fitted velocity, the velocity axes at the
/// fitted acceleration, brightness holds still.
pub fn axis_velocity(x: &Tracklet, axis: Axis) -> f64 {
    match axis {
        Axis::Time => 1.0,
        Axis::Ra => x.v_ra(),
        Axis::Dec => x.v_dec(),
        Axis::VRa => x.a_ra(),
        Axis::VDec => x.a_dec(),
        Axis::Bright => 0.0,
    }
}

/// The axis coordinate predicted at an absolute epoch.
pub fn axis_predicted(x: &Tracklet, axis: Axis, t: f64) -> f64 {
    match axis {
        Axis::Time => t,
        Axis::Ra => x.position_at(t).0,
        Axis::Dec => x.position_at(t).1,
        Axis::VRa => x.velocity_at(t).0,
        Axis::VDec => x.velocity_at(t).1,
        Axis::Bright => x.brightness(),
    }
}

/// A near-point query always constrains time: a disabled time threshold
/// still pins candidates to the query's reference epoch.
fn effective_threshold(axis: Axis, thresh: &AxisMap) -> f64 {
    let t = thresh.get(axis);
    if axis == Axis::Time && t < 1e-6 {
        1e-6
    } else {
        t
    }
}

// ============================================================================
// INTERVAL BOUNDS
// ============================================================================

/// Acceleration interval implied by reaching velocities in
/// `[lo_vel, hi_vel]` from `v` after a signed delay in `[tqs, tqe]`,
/// intersected with `[-cap, cap]` when a cap is set.
pub(crate) fn accel_bounds(
    v: f64,
    lo_vel: f64,
    hi_vel: f64,
    tqs: f64,
    tqe: f64,
    cap: f64,
) -> (f64, f64) {
    let mut amin = f64::INFINITY;
    let mut amax = f64::NEG_INFINITY;
    for &vb in &[lo_vel, hi_vel] {
        for &t in &[tqs, tqe] {
            let a = (vb - v) / t;
            amin = amin.min(a);
            amax = amax.max(a);
        }
    }
    if cap > 0.0 {
        amin = amin.max(-cap);
        amax = amax.min(cap);
    }
    (amin, amax)
}

/// Interval of positions `x + t v + a t^2 / 2` can reach for `t` in
/// `[tqs, tqe]` and `a` in `[amin, amax]`.
///
/// Linear in `a`, quadratic in `t`: the extremes sit at the four corners or
/// at the parabola's turning point when it falls inside the window. NaN
/// corners (degenerate accel bounds at a zero-width window) drop out of the
/// min/max folds.
pub(crate) fn reachable_interval(
    x: f64,
    v: f64,
    tqs: f64,
    tqe: f64,
    amin: f64,
    amax: f64,
) -> (f64, f64) {
    let eval = |t: f64, a: f64| x + t * v + 0.5 * t * t * a;
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &a in &[amin, amax] {
        for &t in &[tqs, tqe] {
            let p = eval(t, a);
            lo = lo.min(p);
            hi = hi.max(p);
        }
        if a != 0.0 {
            let turn = -v / a;
            if turn > tqs.min(tqe) && turn < tqs.max(tqe) {
                let p = eval(turn, a);
                lo = lo.min(p);
                hi = hi.max(p);
            }
        }
    }
    (lo, hi)
}

// ============================================================================
// TREE STRUCTURE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    num_points: usize,
    /// Split axis and value; `None` marks a leaf.
    split: Option<(Axis, f64)>,
    lo: [f64; NUM_AXES],
    hi: [f64; NUM_AXES],
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    /// Tracklet indices, leaves only.
    members: Vec<usize>,
}

impl Node {
    #[inline]
    fn mid(&self, axis: Axis) -> f64 {
        0.5 * (self.lo[axis.index()] + self.hi[axis.index()])
    }

    #[inline]
    fn rad(&self, axis: Axis) -> f64 {
        0.5 * (self.hi[axis.index()] - self.lo[axis.index()])
    }

    fn is_leaf(&self) -> bool {
        self.split.is_none()
    }

    /// Lower bound on the rate of change of the axis coordinate over the
    /// node's tracklets.
    fn lo_velocity(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Time => -1.0,
            Axis::Ra => self.lo[Axis::VRa.index()],
            Axis::Dec => self.lo[Axis::VDec.index()],
            _ => 0.0,
        }
    }

    fn hi_velocity(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Time => 1.0,
            Axis::Ra => self.hi[Axis::VRa.index()],
            Axis::Dec => self.hi[Axis::VDec.index()],
            _ => 0.0,
        }
    }
}

fn bounds_over(arr: &TrackletArray, inds: &[usize]) -> ([f64; NUM_AXES], [f64; NUM_AXES]) {
    let mut lo = [0.0; NUM_AXES];
    let mut hi = [0.0; NUM_AXES];
    for (n, &i) in inds.iter().enumerate() {
        for axis in Axis::ALL {
            let v = axis_value(&arr[i], axis);
            if n == 0 || v < lo[axis.index()] {
                lo[axis.index()] = v;
            }
            if n == 0 || v > hi[axis.index()] {
                hi[axis.index()] = v;
            }
        }
    }
    (lo, hi)
}

/// The phase-space KD-tree over a tracklet array.
///
/// Leaves hold indices into the array the tree was built from; the array is
/// read-only for the tree's lifetime and must not be reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTree {
    root: Node,
}

impl PhaseTree {
    /// Builds the index. Every tracklet is first forced to its earliest
    /// member epoch so the time axis holds start times.
    pub fn build(arr: &mut TrackletArray, weights: &AxisMap, max_leaf: usize) -> Self {
        arr.force_all_to_first();

        let inds: Vec<usize> = (0..arr.len()).collect();
        let (lo, hi) = bounds_over(arr, &inds);
        let mut widths = [0.0; NUM_AXES];
        for d in 0..NUM_AXES {
            widths[d] = (0.5 * (hi[d] - lo[d])).max(1e-20);
        }

        Self {
            root: build_node(arr, inds, &widths, weights, max_leaf.max(1)),
        }
    }

    pub fn num_points(&self) -> usize {
        self.root.num_points
    }

    /// Split axis of the root, if the root is internal.
    pub fn root_split_axis(&self) -> Option<Axis> {
        self.root.split.map(|(axis, _)| axis)
    }

    /// All tracklets whose phase-space coordinates lie within the
    /// thresholds of the query's, coordinate-wise. RA differences fold
    /// around the circle.
    pub fn near_point(
        &self,
        arr: &TrackletArray,
        query: &Tracklet,
        thresh: &AxisMap,
        stats: &mut SearchStats,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        near_point_recurse(&self.root, arr, query, thresh, stats, &mut out);
        out
    }

    /// All tracklets starting in `[t_start, t_end]` (and not at the query's
    /// own epoch) whose model meets the query's at their common temporal
    /// midpoint within the position thresholds, with the implied
    /// acceleration inside the caps.
    pub fn midpoint(
        &self,
        arr: &TrackletArray,
        query: &Tracklet,
        t_start: f64,
        t_end: f64,
        thresh: &AxisMap,
        accel: &AxisMap,
        stats: &mut SearchStats,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        midpoint_recurse(&self.root, arr, query, t_start, t_end, thresh, accel, stats, &mut out);
        out
    }

    /// Walks the tree and panics if any reachable tracklet escapes a
    /// node's bounds or a count disagrees. Programmer-error check for
    /// debugging and tests.
    pub fn validate(&self, arr: &TrackletArray) {
        validate_node(&self.root, arr);
    }
}

fn build_node(
    arr: &TrackletArray,
    inds: Vec<usize>,
    widths: &[f64; NUM_AXES],
    weights: &AxisMap,
    max_leaf: usize,
) -> Node {
    let (lo, hi) = bounds_over(arr, &inds);
    let num_points = inds.len();

    let leaf = |members: Vec<usize>| Node {
        num_points,
        split: None,
        lo,
        hi,
        left: None,
        right: None,
        members,
    };

    if num_points <= max_leaf {
        return leaf(inds);
    }

    // Widest weighted axis, normalized by the global axis widths.
    let mut split_axis = Axis::Time;
    let mut best = f64::NEG_INFINITY;
    for axis in Axis::ALL {
        let rad = 0.5 * (hi[axis.index()] - lo[axis.index()]);
        let w = weights.get(axis);
        let score = if w.is_infinite() {
            if rad > 1e-20 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            rad / widths[axis.index()] * w
        };
        if score > best {
            best = score;
            split_axis = axis;
        }
    }

    let split_val = 0.5 * (lo[split_axis.index()] + hi[split_axis.index()]);
    let mut left_inds = Vec::new();
    let mut right_inds = Vec::new();
    for &i in &inds {
        if axis_value(&arr[i], split_axis) < split_val {
            left_inds.push(i);
        } else {
            right_inds.push(i);
        }
    }

    // Coincident points on every weighted axis cannot be separated.
    if left_inds.is_empty() || right_inds.is_empty() {
        return leaf(inds);
    }

    Node {
        num_points,
        split: Some((split_axis, split_val)),
        lo,
        hi,
        left: Some(Box::new(build_node(arr, left_inds, widths, weights, max_leaf))),
        right: Some(Box::new(build_node(arr, right_inds, widths, weights, max_leaf))),
        members: Vec::new(),
    }
}

// ============================================================================
// NEAR-POINT QUERY
// ============================================================================

/// Linear-scan form of the near-point query, over `inds` or the whole
/// array. The tree's leaf acceptance and the faithfulness tests both use
/// this.
pub fn near_point_scan(
    arr: &TrackletArray,
    inds: Option<&[usize]>,
    query: &Tracklet,
    thresh: &AxisMap,
    stats: &mut SearchStats,
) -> Vec<usize> {
    let n = inds.map_or(arr.len(), <[usize]>::len);
    let mut out = Vec::new();

    for k in 0..n {
        let ind = inds.map_or(k, |s| s[k]);
        let x = &arr[ind];
        stats.tracklets_tested += 1;

        let mut prune = false;
        for axis in Axis::ALL {
            let th = effective_threshold(axis, thresh);
            if th > 1e-20 {
                let mut diff = (axis_value(x, axis) - axis_value(query, axis)).abs();
                if axis == Axis::Ra {
                    diff = ra_wrap(diff);
                }
                if diff > th {
                    prune = true;
                    break;
                }
            }
        }
        if !prune {
            out.push(ind);
        }
    }

    out
}

fn near_point_recurse(
    node: &Node,
    arr: &TrackletArray,
    query: &Tracklet,
    thresh: &AxisMap,
    stats: &mut SearchStats,
    out: &mut Vec<usize>,
) {
    stats.nodes_visited += 1;

    for axis in Axis::ALL {
        let th = effective_threshold(axis, thresh);
        if th > 1e-20 {
            let mut diff = (node.mid(axis) - axis_value(query, axis)).abs();
            if axis == Axis::Ra {
                diff = ra_wrap(diff);
            }
            if diff > th + node.rad(axis) {
                return;
            }
        }
    }

    if node.is_leaf() {
        out.extend(near_point_scan(arr, Some(&node.members), query, thresh, stats));
    } else {
        near_point_recurse(node.left.as_ref().unwrap(), arr, query, thresh, stats, out);
        near_point_recurse(node.right.as_ref().unwrap(), arr, query, thresh, stats, out);
    }
}

// ============================================================================
// MIDPOINT QUERY
// ============================================================================

/// Linear-scan form of the midpoint query.
pub fn midpoint_scan(
    arr: &TrackletArray,
    inds: Option<&[usize]>,
    query: &Tracklet,
    t_start: f64,
    t_end: f64,
    thresh: &AxisMap,
    accel: &AxisMap,
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
        let tm = 0.5 * (tq + tb);
        let mut prune = tb > t_end || tb < t_start || td < 1e-10;

        for axis in Axis::ALL {
            if prune {
                break;
            }
            let th = if axis == Axis::Time { -1.0 } else { thresh.get(axis) };
            if th > 1e-20 {
                let mut diff = (axis_predicted(y, axis, tm) - axis_predicted(query, axis, tm)).abs();
                if axis == Axis::Ra {
                    diff = ra_wrap(diff);
                }
                prune = diff > th;

                let cap = accel.get(axis);
                if !prune && cap > 0.0 {
                    let acc = ((axis_velocity(y, axis) - axis_velocity(query, axis)) / td).abs();
                    prune = acc > cap;
                }
            }
        }

        if !prune {
            out.push(ind);
        }
    }

    out
}

#[allow(clippy::too_many_arguments)]
fn midpoint_recurse(
    node: &Node,
    arr: &TrackletArray,
    query: &Tracklet,
    t_start: f64,
    t_end: f64,
    thresh: &AxisMap,
    accel: &AxisMap,
    stats: &mut SearchStats,
    out: &mut Vec<usize>,
) {
    stats.nodes_visited += 1;

    let ts = t_start.max(node.lo[Axis::Time.index()]);
    let te = t_end.min(node.hi[Axis::Time.index()]);
    let tq = query.epoch();
    let tqs = ts - tq;
    let tqe = te - tq;
    let mut prune = ts > te || (te - ts <= 1e-10 && (ts - tq).abs() < 1e-10);

    for axis in Axis::ALL {
        if prune {
            break;
        }
        let th = if axis == Axis::Time { -1.0 } else { thresh.get(axis) };
        if th > 1e-20 {
            let v = axis_velocity(query, axis);
            let x = axis_value(query, axis);

            let (amin, amax) = accel_bounds(
                v,
                node.lo_velocity(axis),
                node.hi_velocity(axis),
                tqs,
                tqe,
                accel.get(axis),
            );
            let (mut xmin, mut xmax) = reachable_interval(x, v, tqs, tqe, amin, amax);

            // A query inside the window could sit anywhere in the node's
            // own box, so the box must not be pruned against itself.
            if tq >= ts && tq <= te {
                xmin = xmin.min(node.lo[axis.index()]);
                xmax = xmax.max(node.hi[axis.index()]);
            }

            let mut dist = (0.5 * (xmin + xmax) - node.mid(axis)).abs();
            if axis == Axis::Ra {
                dist = ra_wrap(dist);
            }
            prune = dist - 0.5 * (xmax - xmin) - node.rad(axis) > th;
        }
    }

    if prune {
        return;
    }

    if node.is_leaf() {
        out.extend(midpoint_scan(
            arr,
            Some(&node.members),
            query,
            t_start,
            t_end,
            thresh,
            accel,
            stats,
        ));
    } else {
        midpoint_recurse(node.left.as_ref().unwrap(), arr, query, t_start, t_end, thresh, accel, stats, out);
        midpoint_recurse(node.right.as_ref().unwrap(), arr, query, t_start, t_end, thresh, accel, stats, out);
    }
}

// ============================================================================
// STRUCTURAL CHECKS
// ============================================================================

fn validate_node(node: &Node, arr: &TrackletArray) {
    if node.is_leaf() {
        if node.num_points != node.members.len() {
            panic!(
                "phase tree leaf count mismatch: {} recorded, {} stored",
                node.num_points,
                node.members.len()
            );
        }
        for &m in &node.members {
            for axis in Axis::ALL {
                let v = axis_value(&arr[m], axis);
                if v < node.lo[axis.index()] || v > node.hi[axis.index()] {
                    panic!(
                        "phase tree bounds violated: tracklet {m} {axis:?} = {v} outside [{}, {}]",
                        node.lo[axis.index()],
                        node.hi[axis.index()]
                    );
                }
            }
        }
    } else {
        let left = node.left.as_ref().unwrap();
        let right = node.right.as_ref().unwrap();
        if node.num_points != left.num_points + right.num_points {
            panic!(
                "phase tree count mismatch: {} != {} + {}",
                node.num_points, left.num_points, right.num_points
            );
        }
        for child in [left, right] {
            for d in 0..NUM_AXES {
                if child.lo[d] < node.lo[d] || child.hi[d] > node.hi[d] {
                    panic!("phase tree child box escapes its parent on axis {d}");
                }
            }
            validate_node(child, arr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, DetectionArray};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random two-detection tracklets spread over a few nights.
    fn random_population(seed: u64, n: usize) -> (DetectionArray, TrackletArray) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut obs = DetectionArray::new();
        let mut groups = Vec::new();

        for k in 0..n {
            let t = rng.gen_range(0.0..5.0);
            let ra = rng.gen_range(0.0..360.0);
            let dec = rng.gen_range(-40.0..40.0);
            let v_ra = rng.gen_range(-1.0..1.0);
            let v_dec = rng.gen_range(-1.0..1.0);
            let mag = rng.gen_range(19.0..23.0);

            let a = obs.push(Detection::new(format!("s{k}a"), t, ra, dec, mag));
            let b = obs.push(Detection::new(
                format!("s{k}b"),
                t + 0.02,
                ra + 0.02 * v_ra,
                dec + 0.02 * v_dec,
                mag,
            ));
            groups.push(vec![a, b]);
        }

        let arr = TrackletArray::from_groups(&obs, &groups).unwrap();
        (obs, arr)
    }

    #[test]
    fn test_build_respects_invariants() {
        let (_, mut arr) = random_population(11, 150);
        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), 8);

        assert_eq!(tree.num_points(), 150);
        tree.validate(&arr);
    }

    #[test]
    fn test_time_first_weights_split_time() {
        let (_, mut arr) = random_population(12, 60);
        let tree = PhaseTree::build(&mut arr, &AxisMap::time_first(), 4);

        assert_eq!(tree.root_split_axis(), Some(Axis::Time));
        tree.validate(&arr);
    }

    #[test]
    fn test_near_point_matches_scan() {
        let (_, mut arr) = random_population(13, 160);
        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), 6);
        let thresholds = [
            // Wide time gate, loose boxes in every other axis.
            AxisMap::new(10.0, 4.0, 4.0, 0.5, 0.5, 2.0),
            // Disabled time still pins candidates to the query epoch.
            AxisMap::new(-1.0, 4.0, 4.0, 0.5, 0.5, -1.0),
            AxisMap::ignore_all(),
        ];

        for thresh in &thresholds {
            for q in 0..arr.len() {
                let query = arr[q].clone();
                let mut tree_stats = SearchStats::new();
                let mut scan_stats = SearchStats::new();

                let mut fast = tree.near_point(&arr, &query, thresh, &mut tree_stats);
                let mut slow = near_point_scan(&arr, None, &query, thresh, &mut scan_stats);
                fast.sort_unstable();
                slow.sort_unstable();

                assert_eq!(fast, slow, "near-point mismatch for query {q}");
                assert!(fast.contains(&q), "a query always matches itself");
                assert!(tree_stats.tracklets_tested <= scan_stats.tracklets_tested);
            }
        }
    }

    #[test]
    fn test_near_point_wraps_ra() {
        let mut obs = DetectionArray::new();
        let mut groups = Vec::new();
        for (k, ra) in [359.9_f64, 0.1, 180.0].iter().enumerate() {
            let a = obs.push(Detection::new(format!("w{k}a"), 1.0, *ra, 5.0, 20.0));
            let b = obs.push(Detection::new(format!("w{k}b"), 1.02, *ra, 5.0, 20.0));
            groups.push(vec![a, b]);
        }
        let mut arr = TrackletArray::from_groups(&obs, &groups).unwrap();
        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), 1);

        let query = arr[0].clone();
        let mut stats = SearchStats::new();
        let mut hits = tree.near_point(&arr, &query, &AxisMap::position_threshold(0.5), &mut stats);
        hits.sort_unstable();

        // 359.9 and 0.1 are 0.2 degrees apart around the circle.
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn test_midpoint_matches_scan() {
        let (_, mut arr) = random_population(14, 140);
        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), 6);
        let thresh = AxisMap::position_threshold(2.0);
        let accel = AxisMap::accel_caps(1.5);

        for q in 0..arr.len() {
            let query = arr[q].clone();
            let t0 = query.epoch();
            for (t_start, t_end) in [(t0 + 0.3, t0 + 5.0), (t0 - 5.0, t0 - 0.3), (t0 - 1.0, t0 + 1.0)] {
                let mut tree_stats = SearchStats::new();
                let mut scan_stats = SearchStats::new();

                let mut fast =
                    tree.midpoint(&arr, &query, t_start, t_end, &thresh, &accel, &mut tree_stats);
                let mut slow = midpoint_scan(
                    &arr, None, &query, t_start, t_end, &thresh, &accel, &mut scan_stats,
                );
                fast.sort_unstable();
                slow.sort_unstable();

                assert_eq!(fast, slow, "midpoint mismatch for query {q} window {t_start}..{t_end}");
            }
        }
    }

    #[test]
    fn test_midpoint_excludes_query_epoch() {
        let (_, mut arr) = random_population(15, 40);
        let tree = PhaseTree::build(&mut arr, &AxisMap::sky_weights(), 4);

        let query = arr[0].clone();
        let t0 = query.epoch();
        let mut stats = SearchStats::new();
        let hits = tree.midpoint(
            &arr,
            &query,
            t0 - 1e-6,
            t0 + 1e-6,
            &AxisMap::position_threshold(400.0),
            &AxisMap::accel_caps(0.0),
            &mut stats,
        );

        assert!(!hits.contains(&0));
    }

    #[test]
    fn test_reachable_interval_covers_turning_point() {
        // v = 1, a = -1: the parabola peaks at t = 1, above both window
        // ends.
        let (lo, hi) = reachable_interval(0.0, 1.0, 0.0, 2.0, -1.0, -1.0);
        assert!(hi >= 0.5 - 1e-12);
        assert!(lo <= 0.0 + 1e-12);
    }
}
