//! Tracklets: quadratic sky-motion models over ordered detection sets.
//!
//! A tracklet is the unit the whole search indexes and combines: two or more
//! detections of one moving object, an RA/Dec motion model fitted through
//! them, and the ordered list of member detections. Candidate tracks built
//! during linking are tracklets too, just with members from several nights.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::DetectionArray;
use crate::kinematics::{fit_motion, FitError, MotionFit};

/// Folds an RA difference onto the short way around the 360 degree circle.
#[inline]
pub(crate) fn ra_wrap(diff: f64) -> f64 {
    let mut d = diff.abs();
    while d > 180.0 {
        d = (d - 360.0).abs();
    }
    d
}

/// Folds an RA difference into (-180, 180], keeping its direction.
#[inline]
fn ra_wrap_signed(diff: f64) -> f64 {
    let mut d = diff % 360.0;
    if d > 180.0 {
        d -= 360.0;
    } else if d <= -180.0 {
        d += 360.0;
    }
    d
}

/// Errors from building or combining tracklets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrackletError {
    /// A tracklet models motion; a single detection cannot.
    #[error("a tracklet needs at least two detections, got {0}")]
    TooFewDetections(usize),
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// A fitted arc over two or more detections of one presumed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracklet {
    fit: MotionFit,
    /// Mean brightness over the members.
    brightness: f64,
    /// Detection indices, ordered by (epoch, index).
    members: Vec<usize>,
    first_time: f64,
    last_time: f64,
}

impl Tracklet {
    /// Fits a tracklet through the given detections at the earliest member
    /// epoch. Members are sorted by epoch and de-duplicated by index.
    pub fn from_members(obs: &DetectionArray, mut members: Vec<usize>) -> Result<Self, TrackletError> {
        members.sort_by(|&i, &j| obs[i].epoch().total_cmp(&obs[j].epoch()).then(i.cmp(&j)));
        members.dedup();
        if members.len() < 2 {
            return Err(TrackletError::TooFewDetections(members.len()));
        }

        let epochs: Vec<f64> = members.iter().map(|&i| obs[i].epoch()).collect();
        let mut ras: Vec<f64> = members.iter().map(|&i| obs[i].ra()).collect();
        let decs: Vec<f64> = members.iter().map(|&i| obs[i].dec()).collect();
        let t0 = epochs[0];

        // Unwrap RA onto the first member's branch so a path crossing the
        // 0/360 seam stays continuous through the fit.
        for k in 1..ras.len() {
            ras[k] = ras[0] + ra_wrap_signed(ras[k] - ras[0]);
        }

        let fit = fit_motion(t0, &epochs, &ras, &decs)?;
        let brightness =
            members.iter().map(|&i| obs[i].brightness()).sum::<f64>() / members.len() as f64;

        Ok(Self {
            fit,
            brightness,
            first_time: epochs[0],
            last_time: *epochs.last().unwrap(),
            members,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Reference epoch of the current model.
    #[inline]
    pub fn epoch(&self) -> f64 {
        self.fit.t0
    }

    #[inline]
    pub fn ra(&self) -> f64 {
        self.fit.ra.x0
    }

    #[inline]
    pub fn dec(&self) -> f64 {
        self.fit.dec.x0
    }

    #[inline]
    pub fn v_ra(&self) -> f64 {
        self.fit.ra.v
    }

    #[inline]
    pub fn v_dec(&self) -> f64 {
        self.fit.dec.v
    }

    #[inline]
    pub fn a_ra(&self) -> f64 {
        self.fit.ra.a
    }

    #[inline]
    pub fn a_dec(&self) -> f64 {
        self.fit.dec.a
    }

    #[inline]
    pub fn brightness(&self) -> f64 {
        self.brightness
    }

    pub fn fit(&self) -> &MotionFit {
        &self.fit
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn num_obs(&self) -> usize {
        self.members.len()
    }

    /// Epoch of the earliest member detection.
    #[inline]
    pub fn first_time(&self) -> f64 {
        self.first_time
    }

    /// Epoch of the latest member detection.
    #[inline]
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    pub fn time_length(&self) -> f64 {
        self.last_time - self.first_time
    }

    pub fn mid_time(&self) -> f64 {
        0.5 * (self.first_time + self.last_time)
    }

    // ========================================================================
    // MODEL EVALUATION
    // ========================================================================

    /// (RA, Dec) predicted at absolute epoch `t`. RA stays on the model's
    /// continuous branch and may fall outside [0, 360); every comparison
    /// in the crate folds the difference, never the value.
    pub fn position_at(&self, t: f64) -> (f64, f64) {
        self.fit.position_at(t)
    }

    /// (vRA, vDec) predicted at absolute epoch `t`.
    pub fn velocity_at(&self, t: f64) -> (f64, f64) {
        self.fit.velocity_at(t)
    }

    /// Re-expresses the model about a new reference epoch. The trajectory
    /// and the member set are unchanged; forcing back to the original epoch
    /// restores the original coefficients.
    pub fn force_epoch(&mut self, t0: f64) {
        self.fit.shift_to(t0);
    }

    /// Restores the canonical reference epoch (the earliest member's).
    pub fn force_epoch_first(&mut self) {
        self.fit.shift_to(self.first_time);
    }

    // ========================================================================
    // SET OPERATIONS
    // ========================================================================

    /// Fits a new tracklet through the union of both member sets, ordered by
    /// epoch, at the earliest member epoch.
    pub fn combine(&self, other: &Tracklet, obs: &DetectionArray) -> Result<Tracklet, TrackletError> {
        let mut members = self.members.clone();
        members.extend_from_slice(&other.members);
        Tracklet::from_members(obs, members)
    }

    /// True when the two observation windows genuinely intersect; windows
    /// that only touch at an endpoint do not count.
    pub fn overlaps_in_time(&self, other: &Tracklet) -> bool {
        self.first_time < other.last_time && other.first_time < self.last_time
    }

    /// Number of detections shared by both tracklets, compared by detection
    /// id rather than array position.
    pub fn overlap_size(&self, other: &Tracklet, obs: &DetectionArray) -> usize {
        self.members
            .iter()
            .filter(|&&i| other.members.iter().any(|&j| obs[i].id() == obs[j].id()))
            .count()
    }

    /// True iff every pair of members sharing an epoch is the same
    /// detection. Two tracks that place different detections at one instant
    /// are claiming the body was in two places at once and may not merge.
    pub fn valid_overlap(&self, other: &Tracklet, obs: &DetectionArray) -> bool {
        for &i in &self.members {
            for &j in &other.members {
                if obs[i].epoch() == obs[j].epoch() && obs[i].id() != obs[j].id() {
                    return false;
                }
            }
        }
        true
    }

    /// True iff every detection id of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &Tracklet, obs: &DetectionArray) -> bool {
        self.members
            .iter()
            .all(|&i| other.members.iter().any(|&j| obs[i].id() == obs[j].id()))
    }

    // ========================================================================
    // RESIDUALS
    // ========================================================================

    /// Angular distance between the two models projected to the midpoint of
    /// their reference epochs.
    pub fn midpoint_distance(&self, other: &Tracklet) -> f64 {
        let tm = 0.5 * (self.epoch() + other.epoch());
        let (ra_a, dec_a) = self.position_at(tm);
        let (ra_b, dec_b) = other.position_at(tm);
        let dr = ra_wrap(ra_a - ra_b);
        let dd = dec_a - dec_b;
        (dr * dr + dd * dd).sqrt()
    }

    /// Mean of the squared per-axis position errors over every member
    /// detection (both axes weighted equally, degrees). RA errors fold
    /// around the circle, so a model branch past 360 still scores against
    /// a detection just past 0.
    pub fn mean_sq_residual(&self, obs: &DetectionArray) -> f64 {
        let mut sum = 0.0;
        for &i in &self.members {
            let det = &obs[i];
            let (ra, dec) = self.position_at(det.epoch());
            let dr = ra_wrap(ra - det.ra());
            let dd = dec - det.dec();
            sum += dr * dr + dd * dd;
        }
        sum / (2.0 * self.members.len() as f64)
    }

    /// Largest squared per-axis position error over every member detection.
    pub fn max_sq_residual(&self, obs: &DetectionArray) -> f64 {
        let mut max = 0.0_f64;
        for &i in &self.members {
            let det = &obs[i];
            let (ra, dec) = self.position_at(det.epoch());
            let dr = ra_wrap(ra - det.ra());
            let dd = dec - det.dec();
            max = max.max(dr * dr).max(dd * dd);
        }
        max
    }

    /// Mean squared difference between the two models, each evaluated at the
    /// other's member epochs, RA folded around the circle.
    pub fn mean_sq_second_residual(&self, other: &Tracklet, obs: &DetectionArray) -> f64 {
        let mut sum = 0.0;
        for &i in self.members.iter().chain(other.members.iter()) {
            let t = obs[i].epoch();
            let (ra_a, dec_a) = self.position_at(t);
            let (ra_b, dec_b) = other.position_at(t);
            let dr = ra_wrap(ra_a - ra_b);
            let dd = dec_a - dec_b;
            sum += dr * dr + dd * dd;
        }
        sum / (2.0 * (self.members.len() + other.members.len()) as f64)
    }
}

/// The global, index-addressable tracklet store the search runs over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackletArray {
    items: Vec<Tracklet>,
}

impl TrackletArray {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_vec(items: Vec<Tracklet>) -> Self {
        Self { items }
    }

    /// Builds the array from a pairer's output: groups of detection indices,
    /// one tracklet per group.
    pub fn from_groups(obs: &DetectionArray, groups: &[Vec<usize>]) -> Result<Self, TrackletError> {
        let mut items = Vec::with_capacity(groups.len());
        for group in groups {
            items.push(Tracklet::from_members(obs, group.clone())?);
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, tracklet: Tracklet) -> usize {
        self.items.push(tracklet);
        self.items.len() - 1
    }

    pub fn get(&self, index: usize) -> &Tracklet {
        &self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracklet> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Tracklet> {
        self.items
    }

    /// Re-expresses every tracklet about its earliest member epoch, the
    /// canonical form the trees index.
    pub fn force_all_to_first(&mut self) {
        for t in &mut self.items {
            t.force_epoch_first();
        }
    }
}

impl std::ops::Index<usize> for TrackletArray {
    type Output = Tracklet;

    fn index(&self, index: usize) -> &Tracklet {
        &self.items[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use approx::assert_relative_eq;

    /// Detections of one body moving linearly: ra = 10 + 0.05 t,
    /// dec = 20 + 0.1 t, sampled at the given epochs.
    fn linear_catalog(epochs: &[f64]) -> DetectionArray {
        epochs
            .iter()
            .enumerate()
            .map(|(i, &t)| Detection::new(format!("d{i}"), t, 10.0 + 0.05 * t, 20.0 + 0.1 * t, 21.0))
            .collect()
    }

    #[test]
    fn test_members_sorted_by_epoch() {
        let obs = linear_catalog(&[3.0, 0.0, 1.5]);
        let trk = Tracklet::from_members(&obs, vec![0, 1, 2]).unwrap();

        assert_eq!(trk.members(), &[1, 2, 0]);
        assert_eq!(trk.first_time(), 0.0);
        assert_eq!(trk.last_time(), 3.0);
        assert_relative_eq!(trk.epoch(), 0.0);
    }

    #[test]
    fn test_single_detection_rejected() {
        let obs = linear_catalog(&[0.0]);
        assert_eq!(
            Tracklet::from_members(&obs, vec![0]),
            Err(TrackletError::TooFewDetections(1))
        );
    }

    #[test]
    fn test_fit_matches_linear_motion() {
        let obs = linear_catalog(&[0.0, 0.02]);
        let trk = Tracklet::from_members(&obs, vec![0, 1]).unwrap();

        assert_relative_eq!(trk.ra(), 10.0, epsilon = 1e-10);
        assert_relative_eq!(trk.v_ra(), 0.05, epsilon = 1e-10);
        assert_relative_eq!(trk.v_dec(), 0.1, epsilon = 1e-10);
        assert_eq!(trk.a_ra(), 0.0);
        assert!(trk.mean_sq_residual(&obs) < 1e-20);
    }

    #[test]
    fn test_force_epoch_round_trip() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 2.5]);
        let original = Tracklet::from_members(&obs, vec![0, 1, 2, 3]).unwrap();

        let mut shifted = original.clone();
        shifted.force_epoch(17.5);
        shifted.force_epoch(-3.0);
        shifted.force_epoch(original.epoch());

        assert_relative_eq!(shifted.ra(), original.ra(), epsilon = 1e-10);
        assert_relative_eq!(shifted.v_ra(), original.v_ra(), epsilon = 1e-10);
        assert_relative_eq!(shifted.a_ra(), original.a_ra(), epsilon = 1e-10);
        assert_relative_eq!(shifted.dec(), original.dec(), epsilon = 1e-10);
        assert_relative_eq!(shifted.v_dec(), original.v_dec(), epsilon = 1e-10);
        assert_relative_eq!(shifted.a_dec(), original.a_dec(), epsilon = 1e-10);
    }

    #[test]
    fn test_combine_unions_members() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02]);
        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();

        let c = a.combine(&b, &obs).unwrap();
        assert_eq!(c.members(), &[0, 1, 2, 3]);
        assert_relative_eq!(c.epoch(), 0.0);
        assert!(c.mean_sq_residual(&obs) < 1e-18);
    }

    #[test]
    fn test_combine_associative_over_detection_sets() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02, 2.0, 2.02]);
        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();
        let c = Tracklet::from_members(&obs, vec![4, 5]).unwrap();

        let left = a.combine(&b, &obs).unwrap().combine(&c, &obs).unwrap();
        let right = a.combine(&b.combine(&c, &obs).unwrap(), &obs).unwrap();
        assert_eq!(left.members(), right.members());
    }

    #[test]
    fn test_time_overlap_is_strict() {
        let obs = linear_catalog(&[0.0, 1.0, 1.0, 2.0, 0.5, 1.5]);
        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();
        let c = Tracklet::from_members(&obs, vec![4, 5]).unwrap();

        // Touching at an endpoint is not an overlap; interleaving is.
        assert!(!a.overlaps_in_time(&b));
        assert!(!b.overlaps_in_time(&a));
        assert!(a.overlaps_in_time(&c));
        assert!(c.overlaps_in_time(&b));
    }

    #[test]
    fn test_conflicting_same_epoch_detections() {
        let mut obs = DetectionArray::new();
        obs.push(Detection::new("p1", 0.0, 10.0, 20.0, 21.0));
        obs.push(Detection::new("p2", 3.0, 10.15, 20.3, 21.0));
        obs.push(Detection::new("q1", 0.5, 10.02, 20.05, 21.0));
        // Same epoch as p2, different detection.
        obs.push(Detection::new("q2", 3.0, 10.16, 20.31, 21.0));

        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();

        assert!(!a.valid_overlap(&b, &obs));
        assert!(!b.valid_overlap(&a, &obs));
        // Sharing the actual detection is fine.
        let c = Tracklet::from_members(&obs, vec![0, 2]).unwrap();
        assert!(a.valid_overlap(&c, &obs));
    }

    #[test]
    fn test_subset_idempotence() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02]);
        let small = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let big = Tracklet::from_members(&obs, vec![0, 1, 2, 3]).unwrap();

        assert!(small.is_subset_of(&small, &obs));
        assert!(small.is_subset_of(&big, &obs));
        assert!(!big.is_subset_of(&small, &obs));

        let same = Tracklet::from_members(&obs, vec![1, 0]).unwrap();
        assert!(small.is_subset_of(&same, &obs) && same.is_subset_of(&small, &obs));
    }

    #[test]
    fn test_overlap_size_by_id() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02]);
        let a = Tracklet::from_members(&obs, vec![0, 1, 2]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();

        assert_eq!(a.overlap_size(&b, &obs), 1);
        assert_eq!(b.overlap_size(&a, &obs), 1);
        assert_eq!(a.overlap_size(&a, &obs), 3);
    }

    #[test]
    fn test_midpoint_distance_of_consistent_arcs() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02]);
        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();

        // Same body, same linear motion: the projections meet.
        assert!(a.midpoint_distance(&b) < 1e-10);
    }

    #[test]
    fn test_max_residual_tracks_the_outlier() {
        let mut obs = DetectionArray::new();
        obs.push(Detection::new("o0", 0.0, 10.0, 20.0, 21.0));
        obs.push(Detection::new("o1", 1.0, 10.05, 20.1, 21.0));
        obs.push(Detection::new("o2", 2.0, 10.1, 20.2, 21.0));
        obs.push(Detection::new("o3", 4.0, 10.2, 21.0, 21.0));

        let trk = Tracklet::from_members(&obs, vec![0, 1, 2, 3]).unwrap();
        assert_relative_eq!(trk.mid_time(), 2.0);

        let mean = trk.mean_sq_residual(&obs);
        let max = trk.max_sq_residual(&obs);
        assert!(max > mean, "one bent axis dominates the pointwise maximum");
        assert!(max > 0.0);
    }

    #[test]
    fn test_second_residual_symmetry() {
        let obs = linear_catalog(&[0.0, 0.02, 1.0, 1.02]);
        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let mut obs2 = obs.clone();
        obs2.push(Detection::new("e0", 1.0, 11.0, 20.0, 21.0));
        obs2.push(Detection::new("e1", 1.02, 11.0, 20.0, 21.0));
        let b = Tracklet::from_members(&obs2, vec![4, 5]).unwrap();

        let ab = a.mean_sq_second_residual(&b, &obs2);
        let ba = b.mean_sq_second_residual(&a, &obs2);
        assert_relative_eq!(ab, ba, epsilon = 1e-12);
        assert!(ab > 0.0);
    }

    #[test]
    fn test_ra_wrap() {
        assert_relative_eq!(ra_wrap(359.9 - 0.1), 0.2, epsilon = 1e-12);
        assert_relative_eq!(ra_wrap(-359.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(ra_wrap(90.0), 90.0);
        assert_relative_eq!(ra_wrap(180.0), 180.0);

        assert_relative_eq!(ra_wrap_signed(359.9), -0.1, epsilon = 1e-12);
        assert_relative_eq!(ra_wrap_signed(-359.9), 0.1, epsilon = 1e-12);
        assert_relative_eq!(ra_wrap_signed(-90.0), -90.0);
        assert_relative_eq!(ra_wrap_signed(180.0), 180.0);
    }

    #[test]
    fn test_fit_crossing_the_ra_seam() {
        let mut obs = DetectionArray::new();
        obs.push(Detection::new("s0", 0.0, 359.95, 20.0, 21.0));
        obs.push(Detection::new("s1", 0.02, 359.951, 20.002, 21.0));
        obs.push(Detection::new("s2", 3.0, 0.1, 20.3, 21.0));

        let trk = Tracklet::from_members(&obs, vec![0, 1, 2]).unwrap();

        // 0.1 deg past the seam is 0.15 deg of real motion, not -359.85.
        assert_relative_eq!(trk.v_ra(), 0.05, epsilon = 1e-9);
        assert!(trk.mean_sq_residual(&obs) < 1e-18);
        assert!(trk.max_sq_residual(&obs) < 1e-18);

        // The model's branch runs past 360; folding lands on the detection.
        let (ra, _) = trk.position_at(3.0);
        assert_relative_eq!(ra_wrap(ra - 0.1), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_residuals_wrap_across_branches() {
        // Same body, one arc fit just below 360, the other just above 0.
        let mut obs = DetectionArray::new();
        obs.push(Detection::new("b0", 0.0, 359.9, 20.0, 21.0));
        obs.push(Detection::new("b1", 0.02, 359.901, 20.002, 21.0));
        obs.push(Detection::new("b2", 3.0, 0.05, 20.3, 21.0));
        obs.push(Detection::new("b3", 3.02, 0.051, 20.302, 21.0));

        let a = Tracklet::from_members(&obs, vec![0, 1]).unwrap();
        let b = Tracklet::from_members(&obs, vec![2, 3]).unwrap();

        // A's model reaches ~360.05 where B sits at ~0.05.
        assert!(a.mean_sq_second_residual(&b, &obs) < 1e-12);
        assert!(a.midpoint_distance(&b) < 1e-6);

        // Their union still fits cleanly on one branch.
        let c = a.combine(&b, &obs).unwrap();
        assert!(c.mean_sq_residual(&obs) < 1e-12);
    }
}
