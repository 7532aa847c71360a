//! Reading raw measurement files and writing the dataset tables.
//!
//! A measurement file is plain text: a fixed number of header lines, some of them
//! comments carrying a `Timestamp` tag, followed by two tab separated columns
//! (time in ps, amplitude).

use crate::config::PipelineConfig;
use crate::data_container::{DatasetTable, FileNameMeta, RawMeasurement};
use crate::error::{IngestError, PipelineError, ShapeError, TimestampFormatError};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_npy::NpzWriter;
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

const TIMESTAMP_TAG: &str = "Timestamp";
const WAFER_TAG: &str = "wafer";
const TIMESTAMP_FORMAT_SHORT_YEAR: &str = "%y-%m-%dT%H:%M:%S";
const TIMESTAMP_FORMAT_FULL_YEAR: &str = "%Y-%m-%dT%H:%M:%S";

/// The two textual layouts of the `Timestamp` comment line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampDialect {
    /// `# Timestamp: 21-05-03T10:15:00`
    Standard,
    /// `# Timestamp: 2021-05-03T10:15:00, wafer ...`, the date carries two extra
    /// leading characters and is terminated by a comma.
    Wafer,
}

impl TimestampDialect {
    /// Selects the dialect of a timestamp line.
    pub fn of_line(line: &str) -> Self {
        if line.contains(WAFER_TAG) {
            TimestampDialect::Wafer
        } else {
            TimestampDialect::Standard
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimestampDialect::Standard => "standard",
            TimestampDialect::Wafer => "wafer",
        }
    }

    /// Parses the date-time following the `Timestamp` tag of `line`.
    pub fn parse(&self, line: &str) -> Result<NaiveDateTime, TimestampFormatError> {
        let value = line
            .split_once(TIMESTAMP_TAG)
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let value = value.trim_start_matches([':', '=']).trim();
        let error = || TimestampFormatError {
            dialect: self.name(),
            text: value.to_string(),
        };

        match self {
            TimestampDialect::Standard => {
                NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT_SHORT_YEAR)
                    .or_else(|_| NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT_FULL_YEAR))
                    .map_err(|_| error())
            }
            TimestampDialect::Wafer => {
                let field = value.split(',').next().unwrap_or_default().trim();
                let stripped: String = field.chars().skip(2).collect();
                NaiveDateTime::parse_from_str(&stripped, TIMESTAMP_FORMAT_SHORT_YEAR)
                    .map_err(|_| error())
            }
        }
    }
}

/// Scans all comment lines of `contents` for the first parsable timestamp.
///
/// Unparsable timestamps are logged and skipped.
pub fn find_timestamp(contents: &str, comment_marker: char) -> Option<NaiveDateTime> {
    contents
        .lines()
        .filter(|line| line.starts_with(comment_marker) && line.contains(TIMESTAMP_TAG))
        .find_map(|line| match TimestampDialect::of_line(line).parse(line) {
            Ok(timestamp) => Some(timestamp),
            Err(err) => {
                log::warn!("{err} in line {line:?}");
                None
            }
        })
}

/// Returns the base name of a path (file name without extension).
fn base_name(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

/// Key of a dataset source: its base name up to the first `_`.
pub fn dataset_key(path: &Path) -> String {
    base_name(path)
        .and_then(|name| name.split('_').next())
        .unwrap_or_default()
        .to_string()
}

/// Parses the data columns of a measurement file.
///
/// # Arguments
/// - `path`: Only used for error messages.
/// - `contents`: The complete file contents.
/// - `header_lines`: Number of leading lines to skip.
///
/// # Returns
/// Time and amplitude columns; time is not yet shifted.
fn parse_columns(
    path: &Path,
    contents: &str,
    header_lines: usize,
) -> Result<(Vec<f64>, Vec<f64>), IngestError> {
    let body_start = if header_lines == 0 {
        0
    } else {
        contents
            .match_indices('\n')
            .nth(header_lines - 1)
            .map(|(i, _)| i + 1)
            .unwrap_or(contents.len())
    };

    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .trim(Trim::All)
        .from_reader(contents[body_start..].as_bytes());

    let mut time = vec![];
    let mut amplitude = vec![];
    for result in rdr.records() {
        let row = result.map_err(|err| IngestError::Parse {
            path: path.to_path_buf(),
            line: err.position().map_or(0, |p| p.line() as usize) + header_lines,
            reason: err.to_string(),
        })?;
        let line = row.position().map_or(0, |p| p.line() as usize) + header_lines;
        let parse_error = |reason: String| IngestError::Parse {
            path: path.to_path_buf(),
            line,
            reason,
        };

        // rows separated by blanks instead of tabs arrive as a single field
        let fields: Vec<&str> = if row.len() == 1 {
            row[0].split_whitespace().collect()
        } else {
            row.iter().collect()
        };
        if fields.len() < 2 {
            return Err(parse_error(format!(
                "expected 2 columns, found {}",
                fields.len()
            )));
        }
        let t = fields[0]
            .parse::<f64>()
            .map_err(|_| parse_error(format!("time {:?} is not a number", fields[0])))?;
        let a = fields[1]
            .parse::<f64>()
            .map_err(|_| parse_error(format!("amplitude {:?} is not a number", fields[1])))?;
        time.push(t);
        amplitude.push(a);
    }
    Ok((time, amplitude))
}

/// Reads one measurement file.
///
/// The time axis is shifted so that it starts at zero; the amplitude is left as is.
/// Metadata comes from the file name, see [`FileNameMeta`].
pub fn open_measurement(
    path: &Path,
    config: &PipelineConfig,
) -> Result<RawMeasurement, IngestError> {
    log::debug!("opening {path:?}");
    let meta = base_name(path)
        .and_then(FileNameMeta::from_base_name)
        .ok_or_else(|| IngestError::FileName {
            path: path.to_path_buf(),
        })?;
    let contents = std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let timestamp = find_timestamp(&contents, config.comment_marker);
    let (time, amplitude) = parse_columns(path, &contents, config.header_lines)?;
    if time.is_empty() {
        return Err(IngestError::EmptyWaveform {
            path: path.to_path_buf(),
        });
    }

    let t0 = time[0];
    Ok(RawMeasurement {
        path: path.to_path_buf(),
        time: Array1::from_vec(time) - t0,
        amplitude: Array1::from_vec(amplitude),
        meta,
        timestamp,
    })
}

/// Result of a batch load: accepted measurements in input order and rejected files.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub measurements: Vec<RawMeasurement>,
    pub failures: Vec<(PathBuf, IngestError)>,
}

/// Reads a batch of measurement files in parallel.
///
/// A failing file does not abort the batch, it ends up in `failures`.
pub fn open_measurements(paths: &[PathBuf], config: &PipelineConfig) -> IngestReport {
    let results: Vec<_> = paths
        .par_iter()
        .map(|path| (path, open_measurement(path, config)))
        .collect();

    let mut report = IngestReport::default();
    for (path, result) in results {
        match result {
            Ok(measurement) => report.measurements.push(measurement),
            Err(err) => {
                log::warn!("skipping {path:?}: {err}");
                report.failures.push((path.clone(), err));
            }
        }
    }
    report
}

fn is_measurement_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    name.ends_with(".txt")
        && !name.contains("fft")
        && !name.contains("README")
        && !name.contains(".yml")
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if is_measurement_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Lists the measurement files of a dataset source.
///
/// A file is returned as is, a directory is searched recursively for `.txt` files that
/// are neither FFT exports nor READMEs. The result is sorted by path.
pub fn discover_measurement_files(source: &Path) -> std::io::Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    let mut files = vec![];
    collect_files(source, &mut files)?;
    files.sort();
    Ok(files)
}

fn export_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Export {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn write_csv(path: &Path, header: &[&str], rows: Vec<Vec<String>>) -> Result<(), PipelineError> {
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| export_error(path, e))?;
    wtr.write_record(header).map_err(|e| export_error(path, e))?;
    for row in rows {
        wtr.write_record(&row).map_err(|e| export_error(path, e))?;
    }
    wtr.flush().map_err(|e| export_error(path, e))?;
    Ok(())
}

/// Writes the csv representation of a table into `dir`.
///
/// # Returns
/// The paths of the written files: `<key>_table.csv`, `<key>_spectra.csv` and, for
/// normalized samples, `<key>_pd.csv` and `<key>_tr.csv`.
pub fn save_table_to_csv(table: &DatasetTable, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let key = table.key();
    let dataset = &table.dataset;
    let mut written = vec![];

    let path = dir.join(format!("{key}_table.csv"));
    let rows = dataset
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let flagged = table
                .normalized
                .as_ref()
                .and_then(|n| n.get(i))
                .map_or(0, |n| n.flagged_bins.len());
            vec![
                i.to_string(),
                row.phi.to_string(),
                row.raw.meta.design.clone(),
                row.raw.meta.sensor_id.clone(),
                row.raw.meta.angle.clone(),
                row.raw
                    .timestamp
                    .map(|t| t.format(TIMESTAMP_FORMAT_FULL_YEAR).to_string())
                    .unwrap_or_default(),
                row.raw.time.len().to_string(),
                flagged.to_string(),
            ]
        })
        .collect();
    write_csv(
        &path,
        &[
            "row",
            "phi",
            "design",
            "sensor_id",
            "angle",
            "datetime",
            "samples",
            "flagged_bins",
        ],
        rows,
    )?;
    written.push(path);

    let path = dir.join(format!("{key}_spectra.csv"));
    let mut rows = vec![];
    for (i, row) in dataset.rows.iter().enumerate() {
        let s = &row.spectrum;
        for k in 0..s.p_freq.len() {
            rows.push(vec![
                i.to_string(),
                row.phi.to_string(),
                s.p_freq[k].to_string(),
                s.phase[k].to_string(),
                s.sliced_fft[k].re.to_string(),
                s.sliced_fft[k].im.to_string(),
            ]);
        }
    }
    write_csv(
        &path,
        &["row", "phi", "p_freq", "phase", "sliced_fft_re", "sliced_fft_im"],
        rows,
    )?;
    written.push(path);

    if let Some(normalized) = &table.normalized {
        let path = dir.join(format!("{key}_pd.csv"));
        let mut rows = vec![];
        for (i, (row, n)) in dataset.rows.iter().zip(normalized.iter()).enumerate() {
            for (f, pd) in n.pd_freq.iter().zip(n.pd.iter()) {
                rows.push(vec![
                    i.to_string(),
                    row.phi.to_string(),
                    f.to_string(),
                    pd.to_string(),
                ]);
            }
        }
        write_csv(&path, &["row", "phi", "pd_freq", "pd"], rows)?;
        written.push(path);

        let path = dir.join(format!("{key}_tr.csv"));
        let mut rows = vec![];
        for (i, (row, n)) in dataset.rows.iter().zip(normalized.iter()).enumerate() {
            for k in 0..n.tr.len() {
                rows.push(vec![
                    i.to_string(),
                    row.phi.to_string(),
                    row.spectrum.freq[k].to_string(),
                    n.tr[k].to_string(),
                    n.c_tr[k].re.to_string(),
                    n.c_tr[k].im.to_string(),
                ]);
            }
        }
        write_csv(&path, &["row", "phi", "freq", "tr", "c_tr_re", "c_tr_im"], rows)?;
        written.push(path);
    }

    Ok(written)
}

/// Stacks per-row arrays into a `rows x bins` matrix.
fn stack_rows<'a>(
    what: &'static str,
    rows: impl Iterator<Item = ArrayView1<'a, f64>>,
) -> Result<Array2<f64>, ShapeError> {
    let mut data = vec![];
    let mut expected = None;
    let mut count = 0;
    for (i, row) in rows.enumerate() {
        let bins = *expected.get_or_insert(row.len());
        if row.len() != bins {
            return Err(ShapeError::RaggedRows {
                what,
                row: i,
                expected: bins,
                found: row.len(),
            });
        }
        data.extend(row.iter().copied());
        count += 1;
    }
    let bins = expected.unwrap_or(0);
    Array2::from_shape_vec((count, bins), data).map_err(|err| ShapeError::Layout {
        what,
        reason: err.to_string(),
    })
}

/// Writes the table's arrays as a numpy `.npz` archive, one `rows x bins` matrix per column.
pub fn save_table_to_npz(table: &DatasetTable, path: &Path) -> Result<(), PipelineError> {
    let rows = &table.dataset.rows;
    let mut arrays: Vec<(&str, Array2<f64>)> = vec![
        ("freq", stack_rows("freq", rows.iter().map(|r| r.spectrum.freq.view()))?),
        (
            "magnitude",
            stack_rows("magnitude", rows.iter().map(|r| r.spectrum.magnitude.view()))?,
        ),
        ("p_freq", stack_rows("p_freq", rows.iter().map(|r| r.spectrum.p_freq.view()))?),
        ("phase", stack_rows("phase", rows.iter().map(|r| r.spectrum.phase.view()))?),
    ];
    let fft_re: Vec<Array1<f64>> = rows.iter().map(|r| r.spectrum.fft.mapv(|c| c.re)).collect();
    let fft_im: Vec<Array1<f64>> = rows.iter().map(|r| r.spectrum.fft.mapv(|c| c.im)).collect();
    arrays.push(("fft_re", stack_rows("fft", fft_re.iter().map(|a| a.view()))?));
    arrays.push(("fft_im", stack_rows("fft", fft_im.iter().map(|a| a.view()))?));

    if let Some(normalized) = &table.normalized {
        arrays.push(("pd", stack_rows("pd", normalized.iter().map(|n| n.pd.view()))?));
        arrays.push((
            "pd_freq",
            stack_rows("pd_freq", normalized.iter().map(|n| n.pd_freq.view()))?,
        ));
        arrays.push(("tr", stack_rows("tr", normalized.iter().map(|n| n.tr.view()))?));
        let c_tr_re: Vec<Array1<f64>> = normalized.iter().map(|n| n.c_tr.mapv(|c| c.re)).collect();
        let c_tr_im: Vec<Array1<f64>> = normalized.iter().map(|n| n.c_tr.mapv(|c| c.im)).collect();
        arrays.push(("c_tr_re", stack_rows("c_tr", c_tr_re.iter().map(|a| a.view()))?));
        arrays.push(("c_tr_im", stack_rows("c_tr", c_tr_im.iter().map(|a| a.view()))?));
    }

    let file = File::create(path).map_err(|e| export_error(path, e))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("phi", &table.dataset.phi())
        .map_err(|e| export_error(path, e))?;
    for (name, array) in &arrays {
        npz.add_array(*name, array).map_err(|e| export_error(path, e))?;
    }
    npz.finish().map_err(|e| export_error(path, e))?;
    Ok(())
}
