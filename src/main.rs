use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

use subscriber_pipeline::config::PipelineConfig;
use subscriber_pipeline::logging;
use subscriber_pipeline::metrics;
use subscriber_pipeline::pipeline::{Pipeline, RunOutcome};
use subscriber_pipeline::state::RunStateStore;
use subscriber_pipeline::PipelineError;

#[derive(Parser)]
#[command(name = "subscriber_pipeline")]
#[command(about = "Clean, merge and publish the subscriber snapshot")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (defaults to ./pipeline.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run even if the source has not changed since the last successful run
    #[arg(long)]
    force: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = match logging::init_logging(&config.paths.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging in {}: {}", config.paths.log_dir.display(), e);
            return ExitCode::FAILURE;
        }
    };
    metrics::init_metrics();

    let code = match run(config.clone(), cli.force, cli.json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.downcast_ref::<PipelineError>().map_or("internal", PipelineError::kind);
            error!(kind, "Pipeline failed: {:#}", e);
            ExitCode::FAILURE
        }
    };

    if let Some(path) = &config.paths.metrics_file {
        match metrics::write_textfile(path) {
            Ok(true) => info!(path = %path.display(), "metrics snapshot written"),
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write metrics snapshot"),
        }
    }
    code
}

fn run(config: PipelineConfig, force: bool, json: bool) -> anyhow::Result<()> {
    let state = RunStateStore::open(&config.paths.state_db)?;
    let source_key = config.paths.source.display().to_string();
    let last_seen = state.last_modified(&source_key)?;

    let pipeline = Pipeline::new(config);
    let outcome = pipeline.run(last_seen, force)?;

    if let Some(watermark) = outcome.watermark() {
        state.record_success(&source_key, watermark)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match &outcome {
            RunOutcome::Skipped { modified } => {
                println!("No update needed: source unchanged since {}", modified);
            }
            RunOutcome::Completed(summary) => {
                println!("Pipeline run {} completed", summary.run_id);
                println!("   Rows written: {}", summary.snapshot.rows);
                println!("   New rows: {}", summary.changelog.new_rows);
                println!("   Malformed cells: {}", summary.malformed.values().sum::<usize>());
                println!("   Output: {} ({})", summary.snapshot.database.display(), summary.snapshot.table);
                println!("   CSV export: {}", summary.snapshot.csv.display());
            }
        }
    }
    Ok(())
}
