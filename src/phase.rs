//! Phase unwrapping with removal of the low-frequency phase offset.

use crate::config::PipelineConfig;
use crate::error::ShapeError;
use crate::math_tools::{find_nearest, linear_fit};
use ndarray::{s, Array1, ArrayView1};
use std::f64::consts::PI;

/// Removes 2π jumps from `phase` in place.
///
/// Walking from the second sample on, a forward difference above π shifts the
/// remainder of the array (from the current index to the end) down by 2π, a difference
/// below -π shifts it up by 2π. Every crossing shifts the whole tail, so repeated
/// crossings accumulate. A single step is corrected by exactly one period, even if it
/// exceeds 3π.
pub fn unwrap_tail_shift(phase: &mut Array1<f64>) {
    for m in 1..phase.len() {
        let diff = phase[m] - phase[m - 1];
        if diff > PI {
            phase.slice_mut(s![m..]).mapv_inplace(|p| p - 2.0 * PI);
        } else if diff < -PI {
            phase.slice_mut(s![m..]).mapv_inplace(|p| p + 2.0 * PI);
        }
    }
}

/// Unwrapped phase, truncated at the lower anchor frequency and freed of its offset.
#[derive(Debug, Clone)]
pub struct AnchoredPhase {
    pub phase: Array1<f64>,
    pub freq: Array1<f64>,
    /// Intercept of the anchor band fit, already subtracted from `phase`.
    pub offset: f64,
}

/// Unwraps a phase and removes the offset of a linear fit over the anchor band.
#[derive(Debug, Clone, Copy)]
pub struct PhaseUnwrapper {
    anchor_band: [f64; 2],
}

impl PhaseUnwrapper {
    pub fn new(config: &PipelineConfig) -> Self {
        PhaseUnwrapper {
            anchor_band: config.anchor_band,
        }
    }

    /// Unwraps one row.
    ///
    /// # Arguments
    /// - `phase`: The wrapped phase.
    /// - `freq`: Frequencies of `phase`, same length.
    ///
    /// # Returns
    /// The unwrapped phase minus the intercept of a least-squares line fitted over the
    /// bins from the one nearest the lower anchor frequency (inclusive) to the one nearest
    /// the upper anchor frequency (exclusive). Both outputs start at the lower anchor bin.
    pub fn unwrap(
        &self,
        phase: ArrayView1<f64>,
        freq: ArrayView1<f64>,
    ) -> Result<AnchoredPhase, ShapeError> {
        if phase.len() != freq.len() {
            return Err(ShapeError::LengthMismatch {
                what: "phase and frequency",
                sample: phase.len(),
                reference: freq.len(),
            });
        }
        let empty_band = ShapeError::EmptyAnchorBand {
            low: self.anchor_band[0],
            high: self.anchor_band[1],
        };
        let (x0, x1) = match (
            find_nearest(freq, self.anchor_band[0]),
            find_nearest(freq, self.anchor_band[1]),
        ) {
            (Some((x0, _)), Some((x1, _))) if x1 > x0 => (x0, x1),
            _ => return Err(empty_band),
        };

        let mut unwrapped = phase.to_owned();
        unwrap_tail_shift(&mut unwrapped);

        let (_, offset) = linear_fit(freq.slice(s![x0..x1]), unwrapped.slice(s![x0..x1]))
            .ok_or(empty_band)?;

        Ok(AnchoredPhase {
            phase: unwrapped.slice(s![x0..]).mapv(|p| p - offset),
            freq: freq.slice(s![x0..]).to_owned(),
            offset,
        })
    }
}
