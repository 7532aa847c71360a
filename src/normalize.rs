//! Normalization of a sample phi scan against a reference phi scan.
//!
//! For every phi row the sample spectrum is compared to the reference spectrum of the
//! same row: phase difference on the phase sub-band, magnitude ratio and complex ratio
//! on the full half-spectrum. The phase difference is then unwrapped, anchored and
//! finally pinned to zero at the bias frequency.

use crate::config::{NumericPolicy, PipelineConfig};
use crate::data_container::{Dataset, FrequencyRecord, NormalizedRecord};
use crate::error::ShapeError;
use crate::math_tools::{divide_complex, divide_magnitudes, find_nearest};
use crate::phase::PhaseUnwrapper;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct ReferenceNormalizer {
    unwrapper: PhaseUnwrapper,
    bias_frequency: f64,
    policy: NumericPolicy,
}

fn check_len(what: &'static str, sample: usize, reference: usize) -> Result<(), ShapeError> {
    if sample == reference {
        Ok(())
    } else {
        Err(ShapeError::LengthMismatch {
            what,
            sample,
            reference,
        })
    }
}

impl ReferenceNormalizer {
    pub fn new(config: &PipelineConfig) -> Self {
        ReferenceNormalizer {
            unwrapper: PhaseUnwrapper::new(config),
            bias_frequency: config.bias_frequency,
            policy: config.numeric_policy,
        }
    }

    pub fn with_policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> NumericPolicy {
        self.policy
    }

    /// Normalizes one phi row of a sample against the same row of the reference.
    pub fn normalize_row(
        &self,
        sample: &FrequencyRecord,
        reference: &FrequencyRecord,
    ) -> Result<NormalizedRecord, ShapeError> {
        check_len("phase", sample.phase.len(), reference.phase.len())?;
        check_len("magnitude", sample.magnitude.len(), reference.magnitude.len())?;
        check_len("fft", sample.fft.len(), reference.fft.len())?;

        let pd = &sample.phase - &reference.phase;
        let (tr, mut flagged_bins) =
            divide_magnitudes(sample.magnitude.view(), reference.magnitude.view(), self.policy);
        let (c_tr, flagged_complex) =
            divide_complex(sample.fft.view(), reference.fft.view(), self.policy);
        flagged_bins.extend(flagged_complex);
        flagged_bins.sort_unstable();
        flagged_bins.dedup();

        let anchored = self.unwrapper.unwrap(pd.view(), sample.p_freq.view())?;
        let mut pd = anchored.phase;
        if let Some((bias_index, _)) = find_nearest(anchored.freq.view(), self.bias_frequency) {
            let bias = pd[bias_index];
            pd.mapv_inplace(|p| p - bias);
        }

        Ok(NormalizedRecord {
            pd,
            pd_freq: anchored.freq,
            tr,
            c_tr,
            anchor_offset: anchored.offset,
            flagged_bins,
        })
    }

    /// Normalizes every row of `sample` against `reference`.
    ///
    /// Rows are processed independently and in parallel.
    ///
    /// # Errors
    /// [`ShapeError::RowCountMismatch`] if the datasets differ in length, or the first
    /// shape error of any row.
    pub fn normalize(
        &self,
        sample: &Dataset,
        reference: &Dataset,
    ) -> Result<Vec<NormalizedRecord>, ShapeError> {
        if sample.len() != reference.len() {
            return Err(ShapeError::RowCountMismatch {
                sample: sample.len(),
                reference: reference.len(),
            });
        }
        let records = sample
            .rows
            .par_iter()
            .zip(reference.rows.par_iter())
            .map(|(s, r)| self.normalize_row(&s.spectrum, &r.spectrum))
            .collect::<Result<Vec<_>, _>>()?;

        let flagged: usize = records.iter().map(|r| r.flagged_bins.len()).sum();
        if flagged > 0 {
            log::warn!(
                "{}: {flagged} transmission bins flagged against reference {} ({})",
                sample.key,
                reference.key,
                self.policy
            );
        }
        Ok(records)
    }
}
