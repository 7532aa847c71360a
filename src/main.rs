use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use preferences::{AppInfo, Preferences};
use std::path::{Path, PathBuf};
use std::thread;
use thz_phi_scan::config::{ConfigCommand, NumericPolicy, PipelineConfig, ThreadCommunication};
use thz_phi_scan::data_container::DatasetTable;
use thz_phi_scan::data_thread::main_thread;
use thz_phi_scan::io::{
    dataset_key, discover_measurement_files, save_table_to_csv, save_table_to_npz,
};

const APP_INFO: AppInfo = AppInfo {
    name: "THz Phi Scan",
    author: "Linus Leo Stöckli",
};

const PREFS_KEY: &str = "config/pipeline";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Propagate,
    Clamp,
    Flag,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Spectral analysis of THz TDS phi scans",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  thz-phi-scan data/F1Ref_scan data/F1_scan\n  thz-phi-scan --policy flag --epsilon 1e-9 --output out data/*\n"
)]
struct Args {
    /// Dataset sources: directories of measurement files or single files
    #[arg(required = true)]
    datasets: Vec<PathBuf>,

    /// Directory the tables are written to
    #[arg(long, short, default_value = ".")]
    output: PathBuf,

    /// Treatment of (near) zero reference bins in the transmission
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Threshold used by the clamp and flag policies
    #[arg(long, default_value_t = 1e-12)]
    epsilon: f64,

    /// Shape parameter of the Tukey window
    #[arg(long)]
    tukey_alpha: Option<f64>,

    /// Only report, do not write any tables
    #[arg(long)]
    no_export: bool,

    /// Store the effective settings as the new defaults
    #[arg(long)]
    save_config: bool,
}

fn load_config() -> PipelineConfig {
    match PipelineConfig::load(&APP_INFO, PREFS_KEY) {
        Ok(config) => config,
        Err(_) => {
            // save default settings
            let config = PipelineConfig::default();
            if let Err(err) = config.save(&APP_INFO, PREFS_KEY) {
                log::error!("error in saving default config: {err:?}");
            }
            config
        }
    }
}

fn apply_args(config: &mut PipelineConfig, args: &Args) {
    if let Some(policy) = args.policy {
        config.numeric_policy = match policy {
            PolicyArg::Propagate => NumericPolicy::Propagate,
            PolicyArg::Clamp => NumericPolicy::Clamp {
                epsilon: args.epsilon,
            },
            PolicyArg::Flag => NumericPolicy::Flag {
                epsilon: args.epsilon,
            },
        };
    }
    if let Some(alpha) = args.tukey_alpha {
        config.tukey_alpha = alpha;
    }
}

fn export_table(output: &Path, key: &str, table: &DatasetTable) -> Result<()> {
    let written =
        save_table_to_csv(table, output).with_context(|| format!("exporting {key} as csv"))?;
    for path in written {
        log::info!("wrote {path:?}");
    }
    let npz = output.join(format!("{key}.npz"));
    save_table_to_npz(table, &npz).with_context(|| format!("exporting {key} as npz"))?;
    log::info!("wrote {npz:?}");
    Ok(())
}

/// Writes every loaded table; a table that fails to export does not stop the others.
fn export(output: &Path, thread_communication: &ThreadCommunication) -> Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("cannot create output directory {output:?}"))?;
    let tables = match thread_communication.tables_lock.read() {
        Ok(tables) => tables.clone(),
        Err(err) => bail!("dataset tables are poisoned: {err}"),
    };
    for (key, table) in &tables {
        if let Err(err) = export_table(output, key, table) {
            log::error!("{err:#}");
            println!("{key}: export failed: {err:#}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = load_config();
    apply_args(&mut config, &args);
    if args.save_config {
        config
            .save(&APP_INFO, PREFS_KEY)
            .context("cannot save the configuration")?;
    }
    log::info!("numeric policy: {}", config.numeric_policy);

    let thread_communication = ThreadCommunication::new(config);
    let data_thread = {
        let thread_communication = thread_communication.clone();
        thread::spawn(move || main_thread(thread_communication))
    };

    for source in &args.datasets {
        let files = match discover_measurement_files(source) {
            Ok(files) => files,
            Err(err) => {
                log::error!("cannot list {source:?}: {err}");
                continue;
            }
        };
        let key = dataset_key(source);
        thread_communication
            .config_tx
            .send(ConfigCommand::LoadDataset { key, files })
            .context("data thread stopped")?;
    }
    thread_communication
        .config_tx
        .send(ConfigCommand::Quit)
        .context("data thread stopped")?;

    if data_thread.join().is_err() {
        bail!("data thread panicked");
    }

    let mut loaded = 0;
    for report in thread_communication.report_rx.try_iter() {
        if let Some(err) = &report.error {
            println!("{}: {err}", report.key);
            continue;
        }
        loaded += 1;
        let role = if report.is_reference { "reference" } else { "sample" };
        println!("{}: {} rows ({role})", report.key, report.rows);
        for (path, reason) in &report.failures {
            println!("  skipped {}: {reason}", path.display());
        }
        for (key, err) in &report.normalization_errors {
            println!("  {key} not normalized: {err}");
        }
    }

    if loaded == 0 {
        bail!("no dataset could be loaded");
    }
    if !args.no_export {
        export(&args.output, &thread_communication)?;
    }
    Ok(())
}
