//! Conversion of a time-domain waveform into its windowed, zero-padded spectrum.

use crate::config::PipelineConfig;
use crate::data_container::{FrequencyRecord, RawMeasurement};
use crate::error::ShapeError;
use crate::math_tools::{apply_tukey, find_nearest};
use ndarray::{s, Array1};
use num_complex::Complex64;
use realfft::{RealFftPlanner, RealToComplex};
use std::f64::consts::PI;
use std::sync::Arc;

/// Forward transform with a fixed working length.
///
/// The FFT plan is built once and shared, so one instance can serve all rows of a
/// dataset from several threads.
#[derive(Clone)]
pub struct SpectralTransform {
    working_length: usize,
    tukey_alpha: f64,
    phase_band: [f64; 2],
    r2c: Arc<dyn RealToComplex<f64>>,
}

impl SpectralTransform {
    pub fn new(config: &PipelineConfig) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        SpectralTransform {
            working_length: config.working_length,
            tukey_alpha: config.tukey_alpha,
            phase_band: config.phase_band,
            r2c: planner.plan_fft_forward(config.working_length),
        }
    }

    pub fn working_length(&self) -> usize {
        self.working_length
    }

    /// Frequency axis of the retained half-spectrum for a sample interval `dt`.
    ///
    /// Bin `k` sits at `k / (L * dt)`; bins run from zero up to, but excluding, the
    /// Nyquist bin.
    pub fn frequencies(&self, dt: f64) -> Array1<f64> {
        let df = 1.0 / (self.working_length as f64 * dt);
        Array1::from_shape_fn(self.working_length / 2, |k| k as f64 * df)
    }

    /// Computes the spectrum of one measurement.
    ///
    /// The Tukey window covers the observed samples only; the zero padding up to the
    /// working length stays untouched. The transform is scaled by `2 / L`.
    ///
    /// # Errors
    /// - [`ShapeError::TooFewSamples`] for fewer than two samples,
    /// - [`ShapeError::SizeViolation`] if the waveform is longer than the working length,
    /// - [`ShapeError::InvalidSampling`] if the first time step is not positive.
    pub fn transform(&self, raw: &RawMeasurement) -> Result<FrequencyRecord, ShapeError> {
        let n = raw.amplitude.len();
        if n < 2 || raw.time.len() < 2 {
            return Err(ShapeError::TooFewSamples { samples: n });
        }
        if n > self.working_length {
            return Err(ShapeError::SizeViolation {
                samples: n,
                working_length: self.working_length,
            });
        }
        let dt = raw.time[1] - raw.time[0];
        if !(dt.is_finite() && dt > 0.0) {
            return Err(ShapeError::InvalidSampling { interval: dt });
        }

        let mut windowed = raw.amplitude.clone();
        apply_tukey(&mut windowed, self.tukey_alpha);

        let mut input = self.r2c.make_input_vec();
        input[..n]
            .iter_mut()
            .zip(windowed.iter())
            .for_each(|(dst, src)| *dst = *src);
        let mut spectrum = self.r2c.make_output_vec();
        self.r2c
            .process(&mut input, &mut spectrum)
            .map_err(|err| ShapeError::FftBuffer {
                reason: err.to_string(),
            })?;

        let scale = 2.0 / self.working_length as f64;
        let half = self.working_length / 2;
        let fft: Array1<Complex64> = spectrum.iter().take(half).map(|c| *c * scale).collect();
        let freq = self.frequencies(dt);
        let magnitude = fft.mapv(|c| c.norm());

        let start = find_nearest(freq.view(), self.phase_band[0]).map_or(0, |(i, _)| i);
        let stop = find_nearest(freq.view(), self.phase_band[1])
            .map_or(0, |(i, _)| i)
            .max(start);
        let sliced_fft = fft.slice(s![start..stop]).to_owned();
        // atan2 yields -π for a negative real part with an imaginary part of -0.0
        let phase = sliced_fft.mapv(|c| {
            let p = c.im.atan2(c.re);
            if p == -PI {
                PI
            } else {
                p
            }
        });
        let p_freq = freq.slice(s![start..stop]).to_owned();

        Ok(FrequencyRecord {
            freq,
            fft,
            magnitude,
            p_freq,
            phase,
            sliced_fft,
        })
    }
}
