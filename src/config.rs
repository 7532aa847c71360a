//! Pipeline settings and the command channel between the caller and the data thread.

use crate::data_container::DatasetTable;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// How divisions by (near) zero reference bins are treated when computing transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NumericPolicy {
    /// Divide as is, NaN and infinity propagate into the result.
    Propagate,
    /// Denominators smaller than `epsilon` in magnitude are raised to `epsilon`.
    Clamp { epsilon: f64 },
    /// Divide as is, but record bins with a denominator below `epsilon` or a
    /// non-finite result.
    Flag { epsilon: f64 },
}

impl Display for NumericPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NumericPolicy::Propagate => write!(f, "propagate"),
            NumericPolicy::Clamp { epsilon } => write!(f, "clamp (eps = {epsilon:e})"),
            NumericPolicy::Flag { epsilon } => write!(f, "flag (eps = {epsilon:e})"),
        }
    }
}

/// All tunable constants of the pipeline.
///
/// Persisted with `preferences`, frequencies are in THz, times in ps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of leading lines skipped before the data columns start.
    pub header_lines: usize,
    /// First character of comment lines that may hold the `Timestamp` tag.
    pub comment_marker: char,
    /// Zero-padded length of the FFT input.
    pub working_length: usize,
    /// Shape parameter of the Tukey window.
    pub tukey_alpha: f64,
    /// Sub-band kept for phase analysis.
    pub phase_band: [f64; 2],
    /// Band used to fit and remove the linear phase offset.
    pub anchor_band: [f64; 2],
    /// Frequency at which the phase difference is forced to zero.
    pub bias_frequency: f64,
    /// First and last phi angle in degrees.
    pub phi_range: [f64; 2],
    /// Expected number of rows per dataset.
    pub phi_steps: usize,
    pub numeric_policy: NumericPolicy,
    /// Substrings of a dataset key that mark it as a reference.
    pub reference_markers: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            header_lines: 5,
            comment_marker: '#',
            working_length: 16384,
            tukey_alpha: 0.1,
            phase_band: [0.2, 2.0],
            anchor_band: [0.1, 0.3],
            bias_frequency: 0.2,
            phi_range: [90.0, -90.0],
            phi_steps: 360,
            numeric_policy: NumericPolicy::Propagate,
            reference_markers: vec!["Ref".to_string(), "ref".to_string()],
        }
    }
}

impl PipelineConfig {
    /// Returns `true` if the dataset key names a reference measurement.
    pub fn is_reference_key(&self, key: &str) -> bool {
        self.reference_markers
            .iter()
            .any(|marker| key.contains(marker.as_str()))
    }
}

/// Commands understood by the data thread.
pub enum ConfigCommand {
    /// Ingest and transform the given files as one dataset under `key`.
    LoadDataset { key: String, files: Vec<PathBuf> },
    /// Change the division policy and renormalize all samples.
    SetNumericPolicy(NumericPolicy),
    /// Drop a dataset. Removing the bound reference also drops all normalizations.
    RemoveDataset(String),
    /// Stop the data thread once all previous commands are done.
    Quit,
}

/// Outcome of one `LoadDataset` command, sent back to the caller.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub key: String,
    pub rows: usize,
    pub is_reference: bool,
    /// Files that were rejected, with the reason.
    pub failures: Vec<(PathBuf, String)>,
    /// Set if the whole dataset could not be built.
    pub error: Option<String>,
    /// Datasets that could not be normalized by this load, with the reason.
    ///
    /// For a sample this is at most the sample itself; binding a reference lists every
    /// sample that failed to normalize against it.
    pub normalization_errors: Vec<(String, String)>,
}

/// Shared handles between the caller and the data thread.
#[derive(Clone)]
pub struct ThreadCommunication {
    pub config: PipelineConfig,
    pub tables_lock: Arc<RwLock<BTreeMap<String, DatasetTable>>>,
    pub reference_key_lock: Arc<RwLock<Option<String>>>,
    pub config_tx: Sender<ConfigCommand>,
    pub config_rx: Receiver<ConfigCommand>,
    pub report_tx: Sender<LoadReport>,
    pub report_rx: Receiver<LoadReport>,
}

impl ThreadCommunication {
    pub fn new(config: PipelineConfig) -> Self {
        let (config_tx, config_rx) = crossbeam_channel::unbounded();
        let (report_tx, report_rx) = crossbeam_channel::unbounded();
        ThreadCommunication {
            config,
            tables_lock: Arc::new(RwLock::new(BTreeMap::new())),
            reference_key_lock: Arc::new(RwLock::new(None)),
            config_tx,
            config_rx,
            report_tx,
            report_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_markers_match_substrings() {
        let config = PipelineConfig::default();
        assert!(config.is_reference_key("Reference"));
        assert!(config.is_reference_key("F1ref"));
        assert!(!config.is_reference_key("F1"));
        assert!(!config.is_reference_key("REFERENCE"));
    }
}
