//! Per-axis quadratic least-squares motion fits.
//!
//! Every tracklet and candidate track carries one of these models per sky
//! axis: `x(t) = x0 + v dt + a/2 dt^2` about a reference epoch. Two samples
//! give an exact linear solution, three or more give an unweighted
//! least-squares quadratic.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from fitting a motion model to timed samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FitError {
    /// Every sample shares one epoch; there is no time baseline to fit
    /// against.
    #[error("fit is ill-conditioned: all samples share the same epoch")]
    IllConditioned,
}

/// Coefficients of `x(t) = x0 + v dt + a/2 dt^2` about a reference epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisFit {
    /// Position at the reference epoch.
    pub x0: f64,
    /// Velocity at the reference epoch, units per day.
    pub v: f64,
    /// Acceleration, units per day squared. Zero for two-sample fits.
    pub a: f64,
}

impl AxisFit {
    /// Position `dt` days from the reference epoch.
    #[inline]
    pub fn position_at(&self, dt: f64) -> f64 {
        self.x0 + dt * (self.v + 0.5 * dt * self.a)
    }

    /// Velocity `dt` days from the reference epoch.
    #[inline]
    pub fn velocity_at(&self, dt: f64) -> f64 {
        self.v + dt * self.a
    }

    /// The same trajectory expressed about a reference epoch `dt` days
    /// later. Exact, and the inverse shift restores the original
    /// coefficients up to floating-point associativity.
    pub fn shifted(&self, dt: f64) -> AxisFit {
        AxisFit {
            x0: self.position_at(dt),
            v: self.velocity_at(dt),
            a: self.a,
        }
    }
}

/// Joint RA/Dec model about a shared reference epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionFit {
    /// Reference epoch, MJD.
    pub t0: f64,
    pub ra: AxisFit,
    pub dec: AxisFit,
}

impl MotionFit {
    /// (RA, Dec) at absolute epoch `t`.
    pub fn position_at(&self, t: f64) -> (f64, f64) {
        let dt = t - self.t0;
        (self.ra.position_at(dt), self.dec.position_at(dt))
    }

    /// (vRA, vDec) at absolute epoch `t`.
    pub fn velocity_at(&self, t: f64) -> (f64, f64) {
        let dt = t - self.t0;
        (self.ra.velocity_at(dt), self.dec.velocity_at(dt))
    }

    /// Re-expresses the model about a new reference epoch without changing
    /// the trajectory.
    pub fn shift_to(&mut self, t0: f64) {
        let dt = t0 - self.t0;
        self.ra = self.ra.shifted(dt);
        self.dec = self.dec.shifted(dt);
        self.t0 = t0;
    }
}

/// Fits both sky axes at the reference epoch `t0`.
///
/// `epochs`, `ras` and `decs` run in parallel and must be non-empty and of
/// equal length; tracklet construction guarantees at least two samples.
pub fn fit_motion(t0: f64, epochs: &[f64], ras: &[f64], decs: &[f64]) -> Result<MotionFit, FitError> {
    debug_assert_eq!(epochs.len(), ras.len());
    debug_assert_eq!(epochs.len(), decs.len());

    Ok(MotionFit {
        t0,
        ra: fit_axis(t0, epochs, ras)?,
        dec: fit_axis(t0, epochs, decs)?,
    })
}

/// Fits one axis at the reference epoch `t0`.
///
/// Two distinct epochs give the exact linear model (`a = 0`); three or more
/// give the unweighted least-squares quadratic. When three or more samples
/// collapse onto only two distinct epochs the quadratic system is singular,
/// so the fit degrades to the linear model rather than failing.
pub fn fit_axis(t0: f64, epochs: &[f64], values: &[f64]) -> Result<AxisFit, FitError> {
    let n = epochs.len();
    let distinct = distinct_epochs(epochs);
    if distinct <= 1 {
        return Err(FitError::IllConditioned);
    }

    if n == 2 {
        let v = (values[1] - values[0]) / (epochs[1] - epochs[0]);
        return Ok(AxisFit {
            x0: values[0] + v * (t0 - epochs[0]),
            v,
            a: 0.0,
        });
    }

    let order = if distinct == 2 { 2 } else { 3 };
    let design = DMatrix::from_fn(n, order, |r, c| {
        let dt = epochs[r] - t0;
        match c {
            0 => 1.0,
            1 => dt,
            _ => 0.5 * dt * dt,
        }
    });
    let rhs = DVector::from_column_slice(values);

    let svd = design.svd(true, true);
    let coef = svd.solve(&rhs, 1e-14).map_err(|_| FitError::IllConditioned)?;

    Ok(AxisFit {
        x0: coef[0],
        v: coef[1],
        a: if order == 3 { coef[2] } else { 0.0 },
    })
}

fn distinct_epochs(epochs: &[f64]) -> usize {
    let mut sorted: Vec<f64> = epochs.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut count = usize::from(!sorted.is_empty());
    for w in sorted.windows(2) {
        if w[1] > w[0] {
            count += 1;
        }
    }
    count
}
