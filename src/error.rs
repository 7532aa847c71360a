//! Error types of the phi-scan pipeline.
//!
//! Errors are split by the stage that raises them: ingestion of a single measurement
//! file, parsing of an acquisition timestamp, and shape violations between arrays or
//! datasets. `PipelineError` collects all of them for callers that drive a whole load.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn one measurement file into a `RawMeasurement`.
///
/// These are fatal for the affected file only; a batch load reports them and
/// carries on with the remaining files.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?}, line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{path:?} contains no data rows")]
    EmptyWaveform { path: PathBuf },
    #[error("{path:?} does not follow the <design><sensor>_<angle>_... naming convention")]
    FileName { path: PathBuf },
}

/// A `Timestamp` comment line that could not be parsed in its dialect.
///
/// Recovered during ingestion: the measurement simply carries no timestamp.
#[derive(Debug, Error)]
#[error("unparsable {dialect} timestamp {text:?}")]
pub struct TimestampFormatError {
    pub dialect: &'static str,
    pub text: String,
}

/// Array or dataset dimensions that the pipeline cannot work with.
#[derive(Debug, Error, PartialEq)]
pub enum ShapeError {
    #[error("waveform has {samples} samples, more than the working length {working_length}")]
    SizeViolation {
        samples: usize,
        working_length: usize,
    },
    #[error("waveform has {samples} samples, at least 2 are needed to derive the sample interval")]
    TooFewSamples { samples: usize },
    #[error("sample interval {interval} is not a positive finite number")]
    InvalidSampling { interval: f64 },
    #[error("fft buffers rejected: {reason}")]
    FftBuffer { reason: String },
    #[error("{what}: sample has {sample} bins, reference has {reference}")]
    LengthMismatch {
        what: &'static str,
        sample: usize,
        reference: usize,
    },
    #[error("sample dataset has {sample} rows, reference has {reference}")]
    RowCountMismatch { sample: usize, reference: usize },
    #[error("{what}: row {row} has {found} bins, expected {expected}")]
    RaggedRows {
        what: &'static str,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{what}: cannot stack rows into a matrix: {reason}")]
    Layout { what: &'static str, reason: String },
    #[error("anchor band [{low}, {high}] THz contains no frequency bins")]
    EmptyAnchorBand { low: f64, high: f64 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("dataset {key:?} has no usable measurement files")]
    EmptyDataset { key: String },
    #[error("export to {path:?} failed: {reason}")]
    Export { path: PathBuf, reason: String },
}
