//! The analysis session and the thread that drives it.
//!
//! `Analyser` owns every loaded dataset table and the single reference binding. A
//! dataset is bound as reference only after it has been completely ingested and
//! transformed; samples are normalized against the bound reference. `main_thread`
//! runs an `Analyser` behind the command channel of `ThreadCommunication`, so binding
//! and normalization always happen on the same thread.

use crate::config::{
    ConfigCommand, LoadReport, NumericPolicy, PipelineConfig, ThreadCommunication,
};
use crate::data_container::{Dataset, DatasetRole, DatasetTable, PhiScanRow};
use crate::error::{PipelineError, ShapeError};
use crate::io::open_measurements;
use crate::math_tools::linspace;
use crate::normalize::ReferenceNormalizer;
use crate::spectral::SpectralTransform;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub struct Analyser {
    config: PipelineConfig,
    transform: SpectralTransform,
    normalizer: ReferenceNormalizer,
    tables: BTreeMap<String, DatasetTable>,
    reference: Option<Arc<Dataset>>,
}

impl Analyser {
    pub fn new(config: PipelineConfig) -> Self {
        Analyser {
            transform: SpectralTransform::new(&config),
            normalizer: ReferenceNormalizer::new(&config),
            config,
            tables: BTreeMap::new(),
            reference: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tables(&self) -> &BTreeMap<String, DatasetTable> {
        &self.tables
    }

    pub fn table(&self, key: &str) -> Option<&DatasetTable> {
        self.tables.get(key)
    }

    /// Key of the dataset currently bound as reference.
    pub fn reference_key(&self) -> Option<&str> {
        self.reference.as_ref().map(|r| r.key.as_str())
    }

    /// Ingests and transforms `files` into a dataset.
    ///
    /// Files that cannot be read or transformed are skipped and returned alongside the
    /// dataset, as are files whose spectrum does not share the frequency grid of the
    /// first accepted file (a different sample interval). Row `i` of `n` accepted files
    /// gets the `i`-th value of `linspace(phi_range[0], phi_range[1], n)`.
    pub fn build_dataset(
        &self,
        key: &str,
        files: &[PathBuf],
    ) -> Result<(Dataset, Vec<(PathBuf, String)>), PipelineError> {
        let report = open_measurements(files, &self.config);
        let mut failures: Vec<(PathBuf, String)> = report
            .failures
            .into_iter()
            .map(|(path, err)| (path, err.to_string()))
            .collect();

        let transformed: Vec<_> = report
            .measurements
            .into_par_iter()
            .map(|raw| {
                let spectrum = self.transform.transform(&raw);
                (raw, spectrum)
            })
            .collect();

        let mut accepted = vec![];
        for (raw, spectrum) in transformed {
            match spectrum {
                Ok(spectrum) => accepted.push((raw, spectrum)),
                Err(err) => {
                    log::warn!("skipping {:?}: {err}", raw.path);
                    failures.push((raw.path, err.to_string()));
                }
            }
        }
        let Some((_, first)) = accepted.first() else {
            return Err(PipelineError::EmptyDataset {
                key: key.to_string(),
            });
        };

        // the first accepted row defines the frequency grid of the dataset
        let (grid_len, band_len) = (first.freq.len(), first.p_freq.len());
        let mut on_grid = Vec::with_capacity(accepted.len());
        for (row, (raw, spectrum)) in accepted.into_iter().enumerate() {
            let ragged = [
                ("freq", grid_len, spectrum.freq.len()),
                ("p_freq", band_len, spectrum.p_freq.len()),
            ]
            .into_iter()
            .find(|(_, expected, found)| expected != found);
            match ragged {
                Some((what, expected, found)) => {
                    let err = ShapeError::RaggedRows {
                        what,
                        row,
                        expected,
                        found,
                    };
                    log::warn!("skipping {:?}: {err}", raw.path);
                    failures.push((raw.path, err.to_string()));
                }
                None => on_grid.push((raw, spectrum)),
            }
        }
        let accepted = on_grid;
        if accepted.len() != self.config.phi_steps {
            log::warn!(
                "{key}: {} rows, expected {} phi steps",
                accepted.len(),
                self.config.phi_steps
            );
        }

        let phi = linspace(
            self.config.phi_range[0],
            self.config.phi_range[1],
            accepted.len(),
        );
        let rows = accepted
            .into_iter()
            .zip(phi.iter())
            .map(|((raw, spectrum), phi)| PhiScanRow {
                phi: *phi,
                raw,
                spectrum,
            })
            .collect();

        let role = if self.config.is_reference_key(key) {
            DatasetRole::Reference
        } else {
            DatasetRole::Sample
        };
        Ok((
            Dataset {
                key: key.to_string(),
                role,
                rows,
            },
            failures,
        ))
    }

    /// Normalizes the table `key` against the bound reference, if there is one.
    fn normalize_table(&mut self, key: &str) -> Result<(), PipelineError> {
        let Some(reference) = self.reference.clone() else {
            return Ok(());
        };
        let Some(table) = self.tables.get_mut(key) else {
            return Ok(());
        };
        table.normalized = None;
        if table.dataset.role == DatasetRole::Reference {
            return Ok(());
        }
        let records = self.normalizer.normalize(&table.dataset, &reference)?;
        table.normalized = Some(Arc::new(records));
        Ok(())
    }

    /// Normalizes all sample tables again.
    ///
    /// # Returns
    /// The key and error of every table that could not be normalized.
    fn normalize_all(&mut self) -> Vec<(String, String)> {
        let keys: Vec<String> = self.tables.keys().cloned().collect();
        let mut errors = vec![];
        for key in keys {
            if let Err(err) = self.normalize_table(&key) {
                log::error!("cannot normalize {key}: {err}");
                errors.push((key, err.to_string()));
            }
        }
        errors
    }

    /// Loads a dataset and updates all normalizations it affects.
    ///
    /// A reference dataset replaces the current reference binding and every sample is
    /// normalized against it again. A sample is normalized against the current reference.
    /// Loading an existing key replaces that dataset.
    pub fn load_dataset(&mut self, key: &str, files: &[PathBuf]) -> LoadReport {
        let start = Instant::now();
        let mut report = LoadReport {
            key: key.to_string(),
            rows: 0,
            is_reference: false,
            failures: vec![],
            error: None,
            normalization_errors: vec![],
        };

        let (dataset, failures) = match self.build_dataset(key, files) {
            Ok(built) => built,
            Err(err) => {
                log::error!("{err}");
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.rows = dataset.len();
        report.failures = failures;
        report.is_reference = dataset.role == DatasetRole::Reference;

        let dataset = Arc::new(dataset);
        self.tables
            .insert(key.to_string(), DatasetTable::new(dataset.clone()));

        if report.is_reference {
            log::info!("{key} is the reference now");
            self.reference = Some(dataset);
            report.normalization_errors = self.normalize_all();
        } else if let Err(err) = self.normalize_table(key) {
            log::error!("cannot normalize {key}: {err}");
            report.normalization_errors.push((key.to_string(), err.to_string()));
        }

        log::info!(
            "loaded {key} ({} rows, {} rejected files) in {:?}",
            report.rows,
            report.failures.len(),
            start.elapsed()
        );
        report
    }

    /// Switches the division policy and renormalizes all samples.
    pub fn set_numeric_policy(&mut self, policy: NumericPolicy) {
        self.config.numeric_policy = policy;
        self.normalizer = self.normalizer.with_policy(policy);
        for (key, err) in self.normalize_all() {
            log::warn!("{key} stays unnormalized under the {policy} policy: {err}");
        }
    }

    /// Drops a dataset. Dropping the bound reference clears every normalization.
    pub fn remove_dataset(&mut self, key: &str) -> Option<DatasetTable> {
        let removed = self.tables.remove(key)?;
        if self.reference_key() == Some(key) {
            log::info!("reference {key} removed");
            self.reference = None;
            for table in self.tables.values_mut() {
                table.normalized = None;
            }
        }
        Some(removed)
    }
}

fn publish(analyser: &Analyser, thread_communication: &ThreadCommunication) {
    if let Ok(mut write_guard) = thread_communication.tables_lock.write() {
        *write_guard = analyser.tables().clone();
    }
    if let Ok(mut write_guard) = thread_communication.reference_key_lock.write() {
        *write_guard = analyser.reference_key().map(str::to_string);
    }
}

/// Processes commands until `Quit` arrives or all senders are gone.
///
/// After every command the tables and the reference key are published to the locks in
/// `thread_communication`; load reports are sent over its report channel.
pub fn main_thread(thread_communication: ThreadCommunication) {
    let mut analyser = Analyser::new(thread_communication.config.clone());

    while let Ok(command) = thread_communication.config_rx.recv() {
        match command {
            ConfigCommand::LoadDataset { key, files } => {
                let report = analyser.load_dataset(&key, &files);
                publish(&analyser, &thread_communication);
                if let Err(err) = thread_communication.report_tx.send(report) {
                    log::error!("error in sending load report: {err:?}");
                }
            }
            ConfigCommand::SetNumericPolicy(policy) => {
                log::info!("numeric policy: {policy}");
                analyser.set_numeric_policy(policy);
                publish(&analyser, &thread_communication);
            }
            ConfigCommand::RemoveDataset(key) => {
                if analyser.remove_dataset(&key).is_none() {
                    log::warn!("no dataset {key} to remove");
                }
                publish(&analyser, &thread_communication);
            }
            ConfigCommand::Quit => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::thread;

    const DT: f64 = 0.05;
    const SAMPLES: usize = 400;

    fn test_config(phi_steps: usize) -> PipelineConfig {
        PipelineConfig {
            working_length: 1024,
            phi_steps,
            ..PipelineConfig::default()
        }
    }

    /// A THz-like pulse: a Gaussian-windowed cosine, delayed by `delay` ps.
    fn pulse(t: f64, delay: f64, scale: f64) -> f64 {
        let x = t - 5.0 - delay;
        scale * (-(x / 0.4).powi(2)).exp() * (2.0 * PI * 0.8 * x).cos()
    }

    fn write_measurement(path: &Path, dt: f64, delay: f64, scale: f64) {
        let mut file = File::create(path).unwrap();
        writeln!(file, "# TeraSmart export").unwrap();
        writeln!(file, "# Timestamp: 22-03-14T09:26:00").unwrap();
        writeln!(file, "# Averaging: 1").unwrap();
        writeln!(file, "# Unit: ps, nA").unwrap();
        writeln!(file, "# time\tsignal").unwrap();
        for i in 0..SAMPLES {
            let t = 1000.0 + i as f64 * dt;
            writeln!(file, "{t}\t{}", pulse(t - 1000.0, delay, scale)).unwrap();
        }
    }

    fn write_scan(dir: &Path, key: &str, steps: usize, delay: f64, scale: f64) -> Vec<PathBuf> {
        let scan_dir = dir.join(key);
        std::fs::create_dir_all(&scan_dir).unwrap();
        (0..steps)
            .map(|step| {
                let path = scan_dir.join(format!("CHIP7A_{step:03}_{key}.txt"));
                write_measurement(&path, DT, delay, scale);
                path
            })
            .collect()
    }

    #[test]
    fn sample_is_normalized_once_the_reference_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let steps = 12;
        let sample_files = write_scan(dir.path(), "S1", steps, 0.0, 0.5);
        let reference_files = write_scan(dir.path(), "Ref", steps, 0.0, 1.0);

        let mut analyser = Analyser::new(test_config(steps));
        let report = analyser.load_dataset("S1", &sample_files);
        assert_eq!(report.rows, steps);
        assert!(!report.is_reference);
        assert!(analyser.table("S1").unwrap().normalized.is_none());
        assert_eq!(analyser.reference_key(), None);

        let report = analyser.load_dataset("Ref", &reference_files);
        assert!(report.is_reference);
        assert_eq!(analyser.reference_key(), Some("Ref"));
        assert!(analyser.table("Ref").unwrap().normalized.is_none());

        let table = analyser.table("S1").unwrap();
        let normalized = table.normalized.as_ref().unwrap();
        assert_eq!(normalized.len(), steps);

        let row = table.row(0).unwrap();
        assert_eq!(row.row.phi, 90.0);
        assert_eq!(row.row.raw.meta.design, "CHIP7");
        assert_eq!(row.row.raw.meta.sensor_id, "A");
        assert!(row.row.raw.timestamp.is_some());
        assert_eq!(table.row(steps - 1).unwrap().row.phi, -90.0);

        // same pulse at half the amplitude: flat transmission, no phase difference
        let record = &normalized[3];
        let freq = &table.dataset.rows[3].spectrum.freq;
        for (tr, f) in record.tr.iter().zip(freq.iter()) {
            if (0.3..1.5).contains(f) {
                assert_abs_diff_eq!(*tr, 0.5, epsilon = 1e-9);
            }
        }
        for pd in record.pd.iter() {
            assert_abs_diff_eq!(*pd, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn delayed_pulse_gives_linear_phase_pinned_at_bias_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let steps = 4;
        let reference_files = write_scan(dir.path(), "Ref", steps, 0.0, 1.0);
        let sample_files = write_scan(dir.path(), "S2", steps, 0.1, 1.0);

        let mut analyser = Analyser::new(test_config(steps));
        analyser.load_dataset("Ref", &reference_files);
        analyser.load_dataset("S2", &sample_files);

        let table = analyser.table("S2").unwrap();
        for record in table.normalized.as_ref().unwrap().iter() {
            let (bias_index, _) =
                crate::math_tools::find_nearest(record.pd_freq.view(), 0.2).unwrap();
            assert_abs_diff_eq!(record.pd[bias_index], 0.0, epsilon = 1e-12);
            // a delay of 0.1 ps is a phase slope of -2π · 0.1 rad/THz
            let k = record.pd_freq.iter().position(|f| *f > 1.0).unwrap();
            let expected = -2.0 * PI * 0.1 * (record.pd_freq[k] - record.pd_freq[bias_index]);
            assert_abs_diff_eq!(record.pd[k], expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn last_loaded_reference_wins_and_row_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_scan(dir.path(), "RefA", 4, 0.0, 1.0);
        let second = write_scan(dir.path(), "RefB", 3, 0.0, 2.0);
        let sample = write_scan(dir.path(), "S3", 4, 0.0, 1.0);

        let mut analyser = Analyser::new(test_config(4));
        analyser.load_dataset("RefA", &first);
        let report = analyser.load_dataset("S3", &sample);
        assert!(report.normalization_errors.is_empty());
        assert!(analyser.table("S3").unwrap().normalized.is_some());

        // 4 sample rows against 3 reference rows cannot be normalized
        let report = analyser.load_dataset("RefB", &second);
        assert_eq!(analyser.reference_key(), Some("RefB"));
        assert!(analyser.table("S3").unwrap().normalized.is_none());
        assert_eq!(report.normalization_errors.len(), 1);
        assert_eq!(report.normalization_errors[0].0, "S3");
        assert!(report.normalization_errors[0].1.contains("rows"));

        let report = analyser.load_dataset("S3", &sample);
        assert_eq!(report.normalization_errors.len(), 1);
        assert!(report.normalization_errors[0].1.contains("rows"));

        analyser.remove_dataset("RefB");
        assert_eq!(analyser.reference_key(), None);
        assert!(analyser.remove_dataset("RefB").is_none());
    }

    #[test]
    fn reference_loaded_last_reports_the_samples_it_cannot_normalize() {
        let dir = tempfile::tempdir().unwrap();
        let sample = write_scan(dir.path(), "S7", 4, 0.0, 1.0);
        let other = write_scan(dir.path(), "S8", 3, 0.0, 1.0);
        let reference = write_scan(dir.path(), "Ref", 3, 0.0, 1.0);

        let mut analyser = Analyser::new(test_config(3));
        assert!(analyser.load_dataset("S7", &sample).normalization_errors.is_empty());
        assert!(analyser.load_dataset("S8", &other).normalization_errors.is_empty());

        let report = analyser.load_dataset("Ref", &reference);
        assert!(report.is_reference);
        assert_eq!(report.normalization_errors.len(), 1);
        let (key, reason) = &report.normalization_errors[0];
        assert_eq!(key, "S7");
        assert!(reason.contains("4 rows"));
        assert!(analyser.table("S7").unwrap().normalized.is_none());
        assert!(analyser.table("S8").unwrap().normalized.is_some());
    }

    #[test]
    fn rows_off_the_first_frequency_grid_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fine = dir.path().join("X1A_0.txt");
        let coarse = dir.path().join("X1A_1.txt");
        let fine_again = dir.path().join("X1A_2.txt");
        write_measurement(&fine, DT, 0.0, 1.0);
        write_measurement(&coarse, 2.0 * DT, 0.0, 1.0);
        write_measurement(&fine_again, DT, 0.0, 1.0);

        let mut analyser = Analyser::new(test_config(2));
        let report = analyser.load_dataset("X1", &[fine, coarse.clone(), fine_again]);
        assert!(report.error.is_none());
        assert_eq!(report.rows, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, coarse);
        assert!(report.failures[0].1.contains("p_freq"));

        let dataset = &analyser.table("X1").unwrap().dataset;
        assert_eq!(dataset.rows[0].phi, 90.0);
        assert_eq!(dataset.rows[1].phi, -90.0);
        assert_eq!(
            dataset.rows[0].spectrum.p_freq.len(),
            dataset.rows[1].spectrum.p_freq.len()
        );
    }

    #[test]
    fn failing_files_do_not_abort_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = write_scan(dir.path(), "S4", 3, 0.0, 1.0);
        let broken = dir.path().join("CHIP7A_999_S4.txt");
        std::fs::write(&broken, "h\nh\nh\nh\nh\n0.0\tx\n").unwrap();
        files.push(broken.clone());

        let mut analyser = Analyser::new(test_config(3));
        let report = analyser.load_dataset("S4", &files);
        assert_eq!(report.rows, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, broken);

        let report = analyser.load_dataset("S5", &[broken]);
        assert!(report.error.is_some());
        assert!(analyser.table("S5").is_none());
    }

    #[test]
    fn main_thread_publishes_tables() {
        let dir = tempfile::tempdir().unwrap();
        let reference = write_scan(dir.path(), "Ref", 3, 0.0, 1.0);
        let sample = write_scan(dir.path(), "S6", 3, 0.0, 1.0);

        let thread_communication = ThreadCommunication::new(test_config(3));
        let worker = {
            let thread_communication = thread_communication.clone();
            thread::spawn(move || main_thread(thread_communication))
        };
        let tx = &thread_communication.config_tx;
        tx.send(ConfigCommand::LoadDataset {
            key: "S6".to_string(),
            files: sample,
        })
        .unwrap();
        tx.send(ConfigCommand::LoadDataset {
            key: "Ref".to_string(),
            files: reference,
        })
        .unwrap();
        tx.send(ConfigCommand::SetNumericPolicy(NumericPolicy::Flag { epsilon: 1e-30 }))
            .unwrap();
        tx.send(ConfigCommand::Quit).unwrap();
        worker.join().unwrap();

        let reports: Vec<_> = thread_communication.report_rx.try_iter().collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(
            thread_communication.reference_key_lock.read().unwrap().as_deref(),
            Some("Ref")
        );
        let tables = thread_communication.tables_lock.read().unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables["S6"].normalized.is_some());
    }
}
