//! scan_cal command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::Serialized;
use scan_cal::config::DEFAULT_CONFIG_FILE;
use scan_cal::runner;
use scan_cal::storage::format_decimal;
use scan_cal::Settings;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "scan_cal",
    about = "Shunt linearity calibration: current sweep, synchronized reference and scanner readings",
    version
)]
struct Cli {
    /// Settings file (TOML); missing files fall back to defaults
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log every instrument command
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the calibration sweep and write the result table
    Run {
        /// Measure only `sweep.test_value`
        #[arg(long)]
        test: bool,
        /// Result table path (overrides `output.path`)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Integration time in power-line cycles (overrides `measurement.nplc`)
        #[arg(long)]
        nplc: Option<u32>,
    },
    /// Print the planned sweep without touching any instrument
    Plan {
        /// Show the test-mode sweep
        #[arg(long)]
        test: bool,
    },
    /// Sample reference and scanner front panel together and log the difference
    SyncCheck {
        /// Number of synchronized samples
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Initial fixed range on both meters
        #[arg(long, default_value_t = 10.0)]
        range: f64,
    },
    /// Print the effective settings as TOML
    ShowConfig,
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut figment = Settings::figment(&cli.config);
    if let Command::Run { output, nplc, .. } = &cli.command {
        if let Some(path) = output {
            figment = figment.merge(Serialized::default("output.path", path));
        }
        if let Some(nplc) = nplc {
            figment = figment.merge(Serialized::default("measurement.nplc", nplc));
        }
    }
    Settings::from_figment(figment)
        .with_context(|| format!("Failed to load settings from '{}'", cli.config.display()))
}

fn init_logging(settings: &Settings, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&settings, cli.verbose);

    match cli.command {
        Command::Run { test, .. } => {
            let sweep = settings.planned_sweep(test);
            let rows = runner::calibrate(&settings, &sweep)
                .await
                .context("Calibration run failed")?;
            info!(
                "Wrote {} rows to '{}'",
                rows,
                settings.output.path.display()
            );
        }
        Command::Plan { test } => {
            let sweep = settings.planned_sweep(test);
            for (index, value) in sweep.iter().enumerate() {
                println!("{:3}: {}", index, format_decimal(value));
            }
            println!("{} values", sweep.len());
        }
        Command::SyncCheck { count, range } => {
            runner::run_sync_check(&settings, count, range)
                .await
                .context("Sync check failed")?;
        }
        Command::ShowConfig => {
            let text = toml::to_string_pretty(&settings).context("Failed to render settings")?;
            print!("{}", text);
        }
    }

    Ok(())
}
