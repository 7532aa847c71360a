//! This module defines the records that flow through the pipeline: raw time-domain
//! measurements, their frequency-domain counterparts, per-row normalization results and
//! the phi-indexed dataset table handed to viewers.

use crate::math_tools::find_nearest;
use chrono::NaiveDateTime;
use ndarray::{Array1, ArrayView1};
use num_complex::Complex64;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// Metadata encoded in a measurement file's base name.
///
/// The base name (file name without extension) is split on `_`:
/// - token 0 without its last character is the design id,
/// - the last character of token 0 is the sensor id,
/// - token 1 is the phi angle as written in the name.
///
/// `DESIGN1A_30_scan.txt` thus yields design `DESIGN1`, sensor `A` and angle `30`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileNameMeta {
    pub design: String,
    pub sensor_id: String,
    pub angle: String,
}

impl FileNameMeta {
    /// Splits a base name according to the naming convention.
    ///
    /// Returns `None` if there is no angle token or the first token is empty.
    pub fn from_base_name(base_name: &str) -> Option<Self> {
        let mut tokens = base_name.split('_');
        let chip = tokens.next().filter(|t| !t.is_empty())?;
        let angle = tokens.next()?;
        let (sensor_start, _) = chip.char_indices().last()?;
        Some(FileNameMeta {
            design: chip[..sensor_start].to_string(),
            sensor_id: chip[sensor_start..].to_string(),
            angle: angle.to_string(),
        })
    }
}

/// One time-domain waveform as read from disk.
///
/// # Fields
/// - `path`: The source file.
/// - `time`: Sample times in ps, shifted so that the first sample is at zero.
/// - `amplitude`: Unscaled detector signal, same length as `time`.
/// - `meta`: Design, sensor and angle from the file name.
/// - `timestamp`: Acquisition time, `None` if absent or unparsable.
#[derive(Debug, Clone)]
pub struct RawMeasurement {
    pub path: PathBuf,
    pub time: Array1<f64>,
    pub amplitude: Array1<f64>,
    pub meta: FileNameMeta,
    pub timestamp: Option<NaiveDateTime>,
}

impl RawMeasurement {
    /// The angle token parsed as degrees, if it is numeric.
    pub fn angle_degrees(&self) -> Option<f64> {
        self.meta.angle.parse().ok()
    }
}

/// The spectrum of one `RawMeasurement`.
///
/// # Fields
/// - `freq`: Non-negative half-spectrum frequency axis in THz.
/// - `fft`: Complex spectrum on `freq`, scaled by `2 / L`.
/// - `magnitude`: `|fft|`.
/// - `p_freq`: Frequencies of the phase analysis sub-band.
/// - `phase`: Wrapped phase on `p_freq`, in (-π, π].
/// - `sliced_fft`: `fft` restricted to `p_freq`.
#[derive(Debug, Clone, Default)]
pub struct FrequencyRecord {
    pub freq: Array1<f64>,
    pub fft: Array1<Complex64>,
    pub magnitude: Array1<f64>,
    pub p_freq: Array1<f64>,
    pub phase: Array1<f64>,
    pub sliced_fft: Array1<Complex64>,
}

/// Sample-versus-reference quantities of one phi row.
///
/// `pd` lives on `pd_freq` (the sub-band, truncated at the lower anchor frequency),
/// `tr` and `c_tr` on the full half-spectrum axis.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRecord {
    pub pd: Array1<f64>,
    pub pd_freq: Array1<f64>,
    pub tr: Array1<f64>,
    pub c_tr: Array1<Complex64>,
    /// Intercept removed by the anchor fit.
    pub anchor_offset: f64,
    /// Bins flagged by the numeric policy in `tr` or `c_tr`.
    pub flagged_bins: Vec<usize>,
}

/// A single phi step of a dataset.
#[derive(Debug, Clone)]
pub struct PhiScanRow {
    pub phi: f64,
    pub raw: RawMeasurement,
    pub spectrum: FrequencyRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetRole {
    Reference,
    Sample,
}

impl Display for DatasetRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetRole::Reference => write!(f, "Reference"),
            DatasetRole::Sample => write!(f, "Sample"),
        }
    }
}

/// A complete phi scan: one row per phi step, ordered by row index.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub key: String,
    pub role: DatasetRole,
    pub rows: Vec<PhiScanRow>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The phi value of every row.
    pub fn phi(&self) -> Array1<f64> {
        self.rows.iter().map(|r| r.phi).collect()
    }

    /// Index of the row whose phi is closest to `phi`.
    pub fn row_nearest_phi(&self, phi: f64) -> Option<usize> {
        let phis = self.phi();
        find_nearest(phis.view(), phi).map(|(i, _)| i)
    }
}

/// A dataset together with its normalization against the current reference.
///
/// This is the table handed to viewers; `normalized` is `None` for references and for
/// samples loaded while no reference is bound.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    pub dataset: Arc<Dataset>,
    pub normalized: Option<Arc<Vec<NormalizedRecord>>>,
}

impl DatasetTable {
    pub fn new(dataset: Arc<Dataset>) -> Self {
        DatasetTable {
            dataset,
            normalized: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.dataset.key
    }

    /// Borrowed view of row `index`, `None` if out of range.
    pub fn row(&self, index: usize) -> Option<TableRow<'_>> {
        let row = self.dataset.rows.get(index)?;
        let normalized = self.normalized.as_ref().and_then(|n| n.get(index));
        Some(TableRow {
            index,
            row,
            normalized,
        })
    }
}

/// One row of a `DatasetTable` with column access by name.
pub struct TableRow<'a> {
    pub index: usize,
    pub row: &'a PhiScanRow,
    pub normalized: Option<&'a NormalizedRecord>,
}

impl<'a> TableRow<'a> {
    /// Looks up a real-valued array column.
    ///
    /// Known names are `time`, `amp`, `freq`, `FFT`, `p_freq`, `phase` and, for normalized
    /// rows, `TR`, `PD` and `pd_freq`.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'a, f64>> {
        let spectrum = &self.row.spectrum;
        match name {
            "time" => Some(self.row.raw.time.view()),
            "amp" => Some(self.row.raw.amplitude.view()),
            "freq" => Some(spectrum.freq.view()),
            "FFT" => Some(spectrum.magnitude.view()),
            "p_freq" => Some(spectrum.p_freq.view()),
            "phase" => Some(spectrum.phase.view()),
            "TR" => self.normalized.map(|n| n.tr.view()),
            "PD" => self.normalized.map(|n| n.pd.view()),
            "pd_freq" => self.normalized.map(|n| n.pd_freq.view()),
            _ => None,
        }
    }

    /// Looks up a complex array column: `c_FFT`, `sliced_FFT` or `c_tr`.
    pub fn complex_column(&self, name: &str) -> Option<ArrayView1<'a, Complex64>> {
        match name {
            "c_FFT" => Some(self.row.spectrum.fft.view()),
            "sliced_FFT" => Some(self.row.spectrum.sliced_fft.view()),
            "c_tr" => self.normalized.map(|n| n.c_tr.view()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_convention() {
        let meta = FileNameMeta::from_base_name("DESIGN1A_30_scan").unwrap();
        assert_eq!(meta.design, "DESIGN1");
        assert_eq!(meta.sensor_id, "A");
        assert_eq!(meta.angle, "30");

        let meta = FileNameMeta::from_base_name("B_-45").unwrap();
        assert_eq!(meta.design, "");
        assert_eq!(meta.sensor_id, "B");
        assert_eq!(meta.angle, "-45");

        assert_eq!(FileNameMeta::from_base_name("DESIGN1A"), None);
        assert_eq!(FileNameMeta::from_base_name("_30"), None);
    }

    fn row(phi: f64) -> PhiScanRow {
        PhiScanRow {
            phi,
            raw: RawMeasurement {
                path: PathBuf::from(format!("X1_{phi}.txt")),
                time: Array1::zeros(4),
                amplitude: Array1::zeros(4),
                meta: FileNameMeta::default(),
                timestamp: None,
            },
            spectrum: FrequencyRecord::default(),
        }
    }

    #[test]
    fn nearest_phi_and_columns() {
        let dataset = Arc::new(Dataset {
            key: "X1".to_string(),
            role: DatasetRole::Sample,
            rows: vec![row(90.0), row(0.0), row(-90.0)],
        });
        assert_eq!(dataset.row_nearest_phi(-80.0), Some(2));
        assert_eq!(dataset.row_nearest_phi(10.0), Some(1));

        let table = DatasetTable::new(dataset);
        let r = table.row(0).unwrap();
        assert_eq!(r.column("time").map(|c| c.len()), Some(4));
        assert!(r.column("TR").is_none());
        assert!(r.complex_column("c_tr").is_none());
        assert!(table.row(3).is_none());
    }
}
